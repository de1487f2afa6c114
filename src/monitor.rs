use std::collections::HashMap;
use std::fs::{create_dir_all, remove_dir_all, remove_file, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, Pid};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::{
    build_id_maps, creation_hint, ignore_kind, read_pid, spawn_peer, write_record, CgroupBackend,
    Error, MasterConfiguration, Request, Response, RpcRequest, User, UserKind, WrapperParameters,
    MASTER_RUNNER_ID,
};

/// Grace given to a runner to exit on its own before `kill_runner` sends
/// SIGKILL. The master asks runners to stop cooperatively first; this
/// window converts a cooperative stop into a forced kill without racing
/// the normal exit path.
pub const KILL_RUNNER_GRACE: Duration = Duration::from_millis(500);

/// How long shutdown waits for the master to quiesce after `stop_runner`
/// before sweeping every runner with SIGKILL.
pub const MASTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const WRAPPER_BINARY: &str = "oci-wrapper";
const MASTER_PIPE_NAME: &str = "oci_master";
const MASTER_CGROUP: &str = "master";
const MASTER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Id allocation for the master sandbox: container root, a 1000-id root
/// range, and one unprivileged user.
const MASTER_ID_DESC: &[(UserKind, u32)] = &[
    (UserKind::Superroot, 1),
    (UserKind::Root, 1000),
    (UserKind::User, 1),
];

/// Monitor-wide configuration, immutable after startup.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub current_user: User,
    pub first_user_mapped: User,
    /// The monitor's writable working directory (`--oci-data`).
    pub oci_data: PathBuf,
    /// Directories searched for the wrapper/master/runner binaries.
    pub binaries: Vec<PathBuf>,
    /// Basename of the master binary.
    pub master: String,
    pub identity_file: Option<PathBuf>,
    pub keep_runner_rootfs: bool,
    /// Root cgroup under which per-runner cgroups are created.
    pub cgroup: Option<String>,
    /// Maximum simultaneous workers, forwarded to the master.
    pub workers: usize,
    /// Hyperthread-sibling groups; the first is the master's, the rest are
    /// the runner pool.
    pub cpu_groups: Vec<Vec<u32>>,
    pub cpuset_available: bool,
}

/// One live wrapper/runner pair.
#[derive(Clone, Debug)]
struct ProcessRecord {
    wrapped_pid: i32,
    /// Resolves once with the wrapper's exit status; observable by the
    /// per-runner handler, `kill_runner` and the shutdown sweep without
    /// double-waiting the OS child.
    wait: watch::Receiver<Option<ExitStatus>>,
}

#[derive(Clone)]
struct MasterLink {
    client: crate::RpcClient,
    done: watch::Receiver<bool>,
}

/// Outcome of racing a fifo handshake step against wrapper termination.
enum Raced<T> {
    Done(T),
    WrapperExited(Option<ExitStatus>),
}

/// The long-lived supervisor. Constructed once at startup and passed
/// explicitly into every handler.
pub struct Monitor {
    conf: MonitorConfig,
    wrappers_dir: PathBuf,
    oci_wrapper: PathBuf,
    cgroups: Arc<dyn CgroupBackend>,
    running: Mutex<HashMap<i32, ProcessRecord>>,
    next_wrapper_id: AtomicU64,
    shutting_down: AtomicBool,
    master: Mutex<Option<MasterLink>>,
}

impl Monitor {
    /// Validates the environment and builds the monitor: recreates the
    /// wrappers directory, resolves the wrapper binary and bootstraps the
    /// root cgroup.
    pub fn new(conf: MonitorConfig, cgroups: Arc<dyn CgroupBackend>) -> Result<Arc<Self>, Error> {
        let wrappers_dir = conf.oci_data.join("wrappers");
        ignore_kind(remove_dir_all(&wrappers_dir), ErrorKind::NotFound)
            .map_err(|v| Error::config(format!("cannot clear {wrappers_dir:?}: {v}")))?;
        create_dir_all(&wrappers_dir)
            .map_err(|v| Error::config(format!("cannot create {wrappers_dir:?}: {v}")))?;
        let oci_wrapper = find_binary(&conf.binaries, WRAPPER_BINARY).ok_or_else(|| {
            Error::config(format!(
                "cannot find {WRAPPER_BINARY} in {:?}",
                conf.binaries
            ))
        })?;
        if let Some(cgroup) = &conf.cgroup {
            let name = Path::new(cgroup);
            cgroups
                .create(name)
                .map_err(|v| Error::config(format!("{v}; {}", creation_hint(name))))?;
        }
        Ok(Arc::new(Self {
            conf,
            wrappers_dir,
            oci_wrapper,
            cgroups,
            running: Mutex::new(HashMap::new()),
            next_wrapper_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            master: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.conf
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether a runner currently has a live entry in the process table.
    pub fn is_running(&self, runner_id: i32) -> bool {
        self.running.lock().unwrap().contains_key(&runner_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Serves one sandbox launch: resolves the per-runner cgroup, spawns
    /// the wrapper over a fresh fifo pair, races the pid handshake against
    /// wrapper death, tracks the runner until the wrapper is reaped and
    /// translates its exit status. Both fifos are unlinked before this
    /// returns, on every path.
    pub async fn exec_in_namespace(&self, mut params: WrapperParameters) -> Result<(), Error> {
        if !self.conf.cpuset_available {
            params.initial_cpuset = None;
        }
        let resolved = match (&self.conf.cgroup, &params.cgroup) {
            (Some(root), Some(child)) => {
                let name = Path::new(root).join(child);
                self.cgroups.create(&name)?;
                if let Some(cpus) = &params.initial_cpuset {
                    self.cgroups.set_cpus(&name, cpus)?;
                }
                Some(self.cgroups.path(&name))
            }
            _ => None,
        };
        params.cgroup = resolved;
        if params.cgroup.is_none() {
            params.initial_cpuset = None;
        }
        let runner_id = params.runner_id;
        let wrapper_id = self.next_wrapper_id.fetch_add(1, Ordering::SeqCst);
        let base = self.wrappers_dir.join(format!("wrappers{wrapper_id}"));
        let pipe_in = PathBuf::from(format!("{}.in", base.display()));
        let pipe_out = PathBuf::from(format!("{}.out", base.display()));
        mkfifo(&pipe_in, Mode::S_IRUSR | Mode::S_IWUSR)?;
        mkfifo(&pipe_out, Mode::S_IRUSR | Mode::S_IWUSR)?;
        let unlink = scopeguard::guard((pipe_in.clone(), pipe_out.clone()), |(a, b)| {
            let _ = remove_file(a);
            let _ = remove_file(b);
        });

        let mut child = Command::new(&self.oci_wrapper)
            .arg(&base)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take().expect("wrapper stdout is piped");
        let stderr = child.stderr.take().expect("wrapper stderr is piped");
        let tee_out = tokio::spawn(tee_stream(stdout, runner_id));
        let tee_err = tokio::spawn(tee_stream(stderr, runner_id));
        let (status_tx, status_rx) = watch::channel(None);
        tokio::spawn(async move {
            // Drain the teed streams first so everything the wrapper said
            // is out before its termination is reported.
            let _ = tee_out.await;
            let _ = tee_err.await;
            match child.wait().await {
                Ok(status) => {
                    let _ = status_tx.send(Some(status));
                }
                Err(err) => warn!("cannot wait wrapper: {err}"),
            }
        });
        let mut wait = status_rx.clone();

        let mut write_task = tokio::task::spawn_blocking({
            let pipe_in = pipe_in.clone();
            let params = params.clone();
            move || -> Result<(), Error> {
                let tx = OpenOptions::new().write(true).open(&pipe_in)?;
                write_record(&tx, &params)
            }
        });
        let raced = tokio::select! {
            biased;
            res = &mut write_task => Raced::Done(flatten_join(res)),
            status = wait_resolved(&mut wait) => Raced::WrapperExited(status),
        };
        match raced {
            Raced::Done(Ok(())) => {}
            Raced::Done(Err(err)) => {
                debug!("cannot send wrapper parameters: {err}");
                let status = wait_resolved(&mut wait).await;
                return Err(wrapper_startup_error(status, &params));
            }
            Raced::WrapperExited(status) => {
                // Release the writer blocked in open() before reporting.
                let _reader = open_nonblocking(&pipe_in, false);
                let _ = write_task.await;
                return Err(wrapper_startup_error(status, &params));
            }
        }
        let _ = remove_file(&pipe_in);

        let mut read_task = tokio::task::spawn_blocking({
            let pipe_out = pipe_out.clone();
            move || -> Result<i32, Error> { read_pid(File::open(&pipe_out)?) }
        });
        let raced = tokio::select! {
            biased;
            res = &mut read_task => Raced::Done(flatten_join(res)),
            status = wait_resolved(&mut wait) => Raced::WrapperExited(status),
        };
        let wrapped_pid = match raced {
            Raced::Done(Ok(pid)) => pid,
            Raced::Done(Err(err)) => {
                debug!("pid handshake failed for runner {runner_id}: {err}");
                return Err(Error::WrapperPidEof);
            }
            Raced::WrapperExited(status) => {
                unblock_fifo_reader(&pipe_out).await;
                let _ = read_task.await;
                return Err(wrapper_startup_error(status, &params));
            }
        };
        // Both ends of both fifos are attached; the rendezvous is over.
        drop(unlink);

        let record = ProcessRecord {
            wrapped_pid,
            wait: status_rx.clone(),
        };
        let prev = self.running.lock().unwrap().insert(runner_id, record);
        assert!(prev.is_none(), "duplicate runner id {runner_id}");
        debug!("runner {runner_id} started as pid {wrapped_pid}");
        if self.is_shutting_down() {
            // The shutdown sweep may have run before this entry existed.
            kill_ignore_esrch(wrapped_pid);
        }

        let status = wait_resolved(&mut wait).await;
        self.running.lock().unwrap().remove(&runner_id);
        let status = match status {
            Some(v) => v,
            None => return Err(Error::RunnerFailed("wrapper status unobservable".into())),
        };
        match classify_wrapper_exit(status, self.is_shutting_down()) {
            Ok(()) => {
                debug!("runner {runner_id} finished");
                Ok(())
            }
            Err(Error::Shutdown) => Err(Error::Shutdown),
            Err(err) => {
                error!("runner {runner_id} failed: {err}; parameters: {params:?}");
                Err(err)
            }
        }
    }

    /// Waits up to [`KILL_RUNNER_GRACE`] for the runner to exit on its
    /// own, then SIGKILLs the wrapped process. Unknown or already-reaped
    /// ids are a silent success.
    pub async fn kill_runner(&self, runner_id: i32) {
        let record = self.running.lock().unwrap().get(&runner_id).cloned();
        let Some(record) = record else {
            return;
        };
        let mut wait = record.wait;
        if timeout(KILL_RUNNER_GRACE, wait_resolved(&mut wait))
            .await
            .is_err()
        {
            debug!("killing runner {runner_id} (pid {})", record.wrapped_pid);
            kill_ignore_esrch(record.wrapped_pid);
            let _ = wait_resolved(&mut wait).await;
        }
    }

    /// Updates `cpuset.cpus` of a per-runner cgroup. A no-op success when
    /// cpusets or the root cgroup are unavailable.
    pub fn set_cpuset(&self, cgroup: &str, cpus: &[u32]) -> Result<(), Error> {
        match &self.conf.cgroup {
            Some(root) if self.conf.cpuset_available => {
                self.cgroups.set_cpus(&Path::new(root).join(cgroup), cpus)
            }
            _ => Ok(()),
        }
    }

    /// The data handed to the master on `get_configuration`. The identity
    /// file is reloaded from disk on every request.
    pub fn master_configuration(&self) -> Result<MasterConfiguration, Error> {
        let identity = match &self.conf.identity_file {
            Some(path) => Some(std::fs::read_to_string(path)?),
            None => None,
        };
        Ok(MasterConfiguration {
            identity,
            keep_runner_rootfs: self.conf.keep_runner_rootfs,
            workers: self.conf.workers,
            cpu_groups: self.conf.cpu_groups.clone(),
            first_user_mapped: self.conf.first_user_mapped,
        })
    }

    /// Spawns the master as the distinguished runner `-1` and connects the
    /// reverse RPC channel serving its requests.
    pub async fn start_master(self: Arc<Self>) -> Result<(), Error> {
        let master_bin = find_binary(&self.conf.binaries, &self.conf.master).ok_or_else(|| {
            Error::config(format!(
                "cannot find master binary {} in {:?}",
                self.conf.master, self.conf.binaries
            ))
        })?;
        if self.conf.cpu_groups.len() < 2 {
            return Err(Error::config(format!(
                "need at least 2 CPU groups (one for the master), got {}",
                self.conf.cpu_groups.len()
            )));
        }
        let base = self.conf.oci_data.join(MASTER_PIPE_NAME);
        let pipe_in = PathBuf::from(format!("{}.in", base.display()));
        let pipe_out = PathBuf::from(format!("{}.out", base.display()));
        let _ = remove_file(&pipe_in);
        let _ = remove_file(&pipe_out);
        mkfifo(&pipe_in, Mode::S_IRUSR | Mode::S_IWUSR)?;
        mkfifo(&pipe_out, Mode::S_IRUSR | Mode::S_IWUSR)?;

        let (uid_map, gid_map) = build_id_maps(
            MASTER_ID_DESC,
            self.conf.current_user,
            self.conf.first_user_mapped,
        );
        let params = WrapperParameters {
            rootfs: "/".into(),
            uid_map,
            gid_map,
            command: master_bin.clone(),
            argv: vec![
                master_bin.display().to_string(),
                base.display().to_string(),
            ],
            env: vec![("PATH".into(), MASTER_PATH.into())],
            runuid: 0,
            rungid: 0,
            bind_system_mount: false,
            prepare_network: false,
            workdir: None,
            cgroup: Some(MASTER_CGROUP.into()),
            initial_cpuset: Some(self.conf.cpu_groups[0].clone()),
            runner_id: MASTER_RUNNER_ID,
        };
        let (done_tx, done_rx) = watch::channel(false);
        let monitor = self.clone();
        tokio::spawn(async move {
            match monitor.exec_in_namespace(params).await {
                Ok(()) => info!("master exited"),
                Err(Error::Shutdown) => info!("master stopped by shutdown"),
                Err(err) => error!("master failed: {err}"),
            }
            let _ = done_tx.send(true);
        });

        let mut open_task = tokio::task::spawn_blocking({
            let pipe_in = pipe_in.clone();
            let pipe_out = pipe_out.clone();
            move || -> Result<(File, File), Error> {
                let tx = OpenOptions::new().write(true).open(&pipe_in)?;
                let rx = File::open(&pipe_out)?;
                Ok((tx, rx))
            }
        });
        let mut done = done_rx.clone();
        let raced = tokio::select! {
            biased;
            res = &mut open_task => Raced::Done(flatten_join(res)),
            _ = wait_true(&mut done) => Raced::WrapperExited(None),
        };
        let (tx, rx) = match raced {
            Raced::Done(files) => {
                let _ = remove_file(&pipe_in);
                let _ = remove_file(&pipe_out);
                files?
            }
            Raced::WrapperExited(_) => {
                let _reader = open_nonblocking(&pipe_in, false);
                unblock_fifo_reader(&pipe_out).await;
                let _ = open_task.await;
                let _ = remove_file(&pipe_in);
                let _ = remove_file(&pipe_out);
                return Err(Error::config(
                    "master stopped before attaching its control pipes",
                ));
            }
        };
        let (client, mut requests) = spawn_peer(
            tokio::fs::File::from_std(rx),
            tokio::fs::File::from_std(tx),
        );
        *self.master.lock().unwrap() = Some(MasterLink {
            client,
            done: done_rx,
        });
        let monitor = self.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let monitor = monitor.clone();
                tokio::spawn(async move { monitor.handle_master_request(request).await });
            }
            debug!("master request stream closed");
        });
        info!("master started");
        Ok(())
    }

    async fn handle_master_request(&self, request: RpcRequest) {
        match request.body.clone() {
            Request::GetConfiguration => request.respond(match self.master_configuration() {
                Ok(conf) => Response::Configuration(Box::new(conf)),
                Err(err) => Response::Failed(err.to_string()),
            }),
            Request::ExecInNamespace(params) => {
                let response = match self.exec_in_namespace(*params).await {
                    Ok(()) => Response::Ok,
                    Err(Error::Shutdown) => Response::Shutdown,
                    Err(err) => Response::Failed(err.to_string()),
                };
                request.respond(response);
            }
            Request::KillRunner { runner_id } => {
                self.kill_runner(runner_id).await;
                request.respond(Response::Ok);
            }
            Request::SetCpuset { cgroup, cpuset } => {
                request.respond(match self.set_cpuset(&cgroup, &cpuset) {
                    Ok(()) => Response::Ok,
                    Err(err) => Response::Failed(err.to_string()),
                });
            }
            Request::StopRunner => {
                request.respond(Response::Failed("not served by the monitor".into()));
            }
        }
    }

    fn master_done(&self) -> Option<watch::Receiver<bool>> {
        self.master.lock().unwrap().as_ref().map(|v| v.done.clone())
    }

    /// Starts the shutdown procedure once; later signals only log.
    fn begin_shutdown(self: Arc<Self>, done: &Arc<watch::Sender<bool>>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("shutdown already in progress");
            return;
        }
        info!("shutting down");
        let monitor = self;
        let done = done.clone();
        tokio::spawn(async move {
            monitor.shutdown().await;
            let _ = done.send(true);
        });
    }

    async fn shutdown(&self) {
        let link = self.master.lock().unwrap().clone();
        if let Some(link) = link {
            let mut done = link.done;
            let drain = async {
                let _ = link.client.call(Request::StopRunner).await;
                wait_true(&mut done).await;
            };
            if timeout(MASTER_DRAIN_TIMEOUT, drain).await.is_err() {
                warn!("master did not stop within {MASTER_DRAIN_TIMEOUT:?}");
            }
        }
        self.kill_all_running().await;
    }

    /// SIGKILLs every live wrapped process and awaits all wrapper
    /// termination futures.
    pub async fn kill_all_running(&self) {
        let records: Vec<ProcessRecord> = self.running.lock().unwrap().values().cloned().collect();
        for record in &records {
            if record.wait.borrow().is_none() {
                kill_ignore_esrch(record.wrapped_pid);
            }
        }
        let waits = records.into_iter().map(|mut record| async move {
            let _ = wait_resolved(&mut record.wait).await;
        });
        futures::future::join_all(waits).await;
    }

    /// The monitor's main future: starts the master, then serves until a
    /// terminating signal completes shutdown or the master dies. Returns
    /// the process exit code.
    pub async fn run(self: Arc<Self>) -> Result<i32, Error> {
        self.clone().start_master().await?;
        let mut master_done = self.master_done().expect("master link exists after start");
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let (done_tx, mut done_rx) = watch::channel(false);
        let done_tx = Arc::new(done_tx);
        let mut master_exited = false;
        loop {
            tokio::select! {
                _ = sigterm.recv() => self.clone().begin_shutdown(&done_tx),
                _ = sigint.recv() => self.clone().begin_shutdown(&done_tx),
                _ = sighup.recv() => self.clone().begin_shutdown(&done_tx),
                _ = sigquit.recv() => self.clone().begin_shutdown(&done_tx),
                _ = wait_true(&mut done_rx) => return Ok(0),
                _ = wait_true(&mut master_done), if !master_exited => {
                    master_exited = true;
                    if !self.is_shutting_down() {
                        error!("master terminated, tearing down");
                        self.shutting_down.store(true, Ordering::SeqCst);
                        self.kill_all_running().await;
                        return Ok(1);
                    }
                }
            }
        }
    }
}

/// Resolves a binary basename against the configured search directories;
/// the first hit wins.
pub fn find_binary(binaries: &[PathBuf], name: &str) -> Option<PathBuf> {
    binaries
        .iter()
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

/// Translates a reaped wrapper status: clean exit is success, SIGKILL
/// under shutdown is the distinguished [`Error::Shutdown`], anything else
/// is a runner failure.
pub fn classify_wrapper_exit(status: ExitStatus, shutting_down: bool) -> Result<(), Error> {
    if status.success() {
        return Ok(());
    }
    let killed =
        status.signal() == Some(libc::SIGKILL) || status.code() == Some(128 + libc::SIGKILL);
    if shutting_down && killed {
        return Err(Error::Shutdown);
    }
    Err(Error::RunnerFailed(describe_status(status)))
}

pub fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        (None, None) => format!("{status:?}"),
    }
}

fn wrapper_startup_error(status: Option<ExitStatus>, params: &WrapperParameters) -> Error {
    Error::WrapperStartup {
        status: status
            .map(describe_status)
            .unwrap_or_else(|| "status unobservable".into()),
        params: format!("{params:?}"),
    }
}

fn kill_ignore_esrch(pid: i32) {
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!("cannot kill pid {pid}: {err}"),
    }
}

async fn tee_stream(stream: impl AsyncRead + Unpin, runner_id: i32) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        eprintln!("[R{runner_id}] {line}");
    }
}

async fn wait_resolved(rx: &mut watch::Receiver<Option<ExitStatus>>) -> Option<ExitStatus> {
    match rx.wait_for(|v| v.is_some()).await {
        Ok(v) => *v,
        Err(_) => None,
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

fn flatten_join<T>(res: Result<Result<T, Error>, tokio::task::JoinError>) -> Result<T, Error> {
    res.map_err(|v| Error::RunnerFailed(format!("fifo task panicked: {v}")))?
}

fn open_nonblocking(path: &Path, write: bool) -> std::io::Result<File> {
    OpenOptions::new()
        .read(!write)
        .write(write)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

/// Opens the write end of a fifo so a reader blocked in `open()` can
/// proceed; retries while no reader is attached yet.
async fn unblock_fifo_reader(path: &Path) {
    for _ in 0..200 {
        match open_nonblocking(path, true) {
            Ok(_) => return,
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(_) => return,
        }
    }
}
