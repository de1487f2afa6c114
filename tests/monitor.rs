use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use oci::{
    classify_wrapper_exit, CgroupBackend, Error, MemCgroups, Monitor, MonitorConfig,
    WrapperParameters, User,
};

mod common;

use common::{write_script, TempDir};

/// A stand-in wrapper: consumes the parameter frame, reports pid 1337
/// (little-endian 0x39 0x05 0x00 0x00) and lingers like a supervised
/// runner would.
const HAPPY_WRAPPER: &str = "#!/bin/sh
cat \"$1.in\" > /dev/null
printf '\\071\\005\\000\\000' > \"$1.out\"
sleep 0.5
";

/// Reports the pid and exits immediately: a runner finishing right away.
const FAST_WRAPPER: &str = "#!/bin/sh
cat \"$1.in\" > /dev/null
printf '\\071\\005\\000\\000' > \"$1.out\"
";

/// Fails after reading parameters, before the pid handshake.
const FAILING_WRAPPER: &str = "#!/bin/sh
cat \"$1.in\" > /dev/null
exit 3
";

/// Dies without ever attaching the fifos.
const ABSENT_WRAPPER: &str = "#!/bin/sh
exit 7
";

fn test_config(tmpdir: &TempDir) -> MonitorConfig {
    MonitorConfig {
        current_user: User::current(),
        first_user_mapped: User {
            uid: 100000,
            gid: 100000,
        },
        oci_data: tmpdir.join("data"),
        binaries: vec![tmpdir.join("bin")],
        master: "oci-default-master".into(),
        identity_file: None,
        keep_runner_rootfs: true,
        cgroup: Some("oci".into()),
        workers: 4,
        cpu_groups: vec![vec![0], vec![1], vec![2], vec![3]],
        cpuset_available: true,
    }
}

fn setup(tmpdir: &TempDir, wrapper: &str) -> (Arc<Monitor>, Arc<MemCgroups>) {
    setup_with(tmpdir, wrapper, test_config(tmpdir))
}

fn setup_with(
    tmpdir: &TempDir,
    wrapper: &str,
    conf: MonitorConfig,
) -> (Arc<Monitor>, Arc<MemCgroups>) {
    let bin = tmpdir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_script(&bin.join("oci-wrapper"), wrapper).unwrap();
    let cgroups = Arc::new(MemCgroups::new());
    let backend: Arc<dyn CgroupBackend> = cgroups.clone();
    let monitor = Monitor::new(conf, backend).unwrap();
    (monitor, cgroups)
}

fn runner_params(runner_id: i32) -> WrapperParameters {
    WrapperParameters {
        rootfs: "/".into(),
        uid_map: vec![],
        gid_map: vec![],
        command: "/bin/true".into(),
        argv: vec!["/bin/true".into()],
        env: vec![],
        runuid: 0,
        rungid: 0,
        bind_system_mount: false,
        prepare_network: false,
        workdir: None,
        cgroup: None,
        initial_cpuset: None,
        runner_id,
    }
}

fn assert_no_fifos(tmpdir: &TempDir) {
    let entries: Vec<_> = std::fs::read_dir(tmpdir.join("data/wrappers"))
        .unwrap()
        .collect();
    assert!(entries.is_empty(), "leftover fifos: {entries:?}");
}

#[tokio::test]
async fn test_exec_single_runner() {
    let tmpdir = TempDir::new().unwrap();
    let (monitor, cgroups) = setup(&tmpdir, HAPPY_WRAPPER);
    let mut params = runner_params(7);
    params.cgroup = Some("r7".into());
    params.initial_cpuset = Some(vec![2, 3]);
    let task = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.exec_in_namespace(params).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(monitor.is_running(7));
    task.await.unwrap().unwrap();
    assert!(!monitor.is_running(7));
    assert!(cgroups.contains(Path::new("oci/r7")));
    assert_eq!(cgroups.cpus(Path::new("oci/r7")), Some("2-3".into()));
    assert_no_fifos(&tmpdir);
}

#[tokio::test]
async fn test_exec_without_root_cgroup() {
    let tmpdir = TempDir::new().unwrap();
    let mut conf = test_config(&tmpdir);
    conf.cgroup = None;
    let (monitor, cgroups) = setup_with(&tmpdir, FAST_WRAPPER, conf);
    let mut params = runner_params(3);
    params.cgroup = Some("r3".into());
    params.initial_cpuset = Some(vec![1]);
    monitor.exec_in_namespace(params).await.unwrap();
    assert!(!cgroups.contains(Path::new("r3")));
    assert_no_fifos(&tmpdir);
}

#[tokio::test]
async fn test_wrapper_exits_before_pid() {
    let tmpdir = TempDir::new().unwrap();
    let (monitor, _cgroups) = setup(&tmpdir, FAILING_WRAPPER);
    let err = monitor
        .exec_in_namespace(runner_params(7))
        .await
        .unwrap_err();
    match &err {
        Error::WrapperStartup { status, params } => {
            assert!(status.contains('3'), "{status}");
            assert!(params.contains("runner_id: 7"), "{params}");
        }
        v => panic!("expected wrapper startup error, got {v:?}"),
    }
    assert!(err
        .to_string()
        .starts_with("oci-wrapper stopped before sending wrapped pid"));
    assert!(!monitor.is_running(7));
    assert_no_fifos(&tmpdir);
}

#[tokio::test]
async fn test_wrapper_never_attaches() {
    let tmpdir = TempDir::new().unwrap();
    let (monitor, _cgroups) = setup(&tmpdir, ABSENT_WRAPPER);
    let err = monitor
        .exec_in_namespace(runner_params(8))
        .await
        .unwrap_err();
    match &err {
        Error::WrapperStartup { status, .. } => assert!(status.contains('7'), "{status}"),
        v => panic!("expected wrapper startup error, got {v:?}"),
    }
    assert!(!monitor.is_running(8));
    assert_no_fifos(&tmpdir);
}

#[tokio::test]
async fn test_kill_runner_unknown_id() {
    let tmpdir = TempDir::new().unwrap();
    let (monitor, _cgroups) = setup(&tmpdir, FAST_WRAPPER);
    monitor.kill_runner(42).await;
    assert!(!monitor.is_running(42));
}

#[tokio::test]
async fn test_kill_runner_after_natural_exit() {
    let tmpdir = TempDir::new().unwrap();
    let (monitor, _cgroups) = setup(&tmpdir, FAST_WRAPPER);
    monitor.exec_in_namespace(runner_params(5)).await.unwrap();
    // Already reaped: no grace wait, no signal, silent success.
    monitor.kill_runner(5).await;
    assert!(!monitor.is_running(5));
}

#[tokio::test]
async fn test_kill_all_running_with_empty_table() {
    let tmpdir = TempDir::new().unwrap();
    let (monitor, _cgroups) = setup(&tmpdir, FAST_WRAPPER);
    monitor.kill_all_running().await;
    assert_eq!(monitor.running_count(), 0);
}

#[test]
fn test_set_cpuset_writes_through() {
    let tmpdir = TempDir::new().unwrap();
    let (monitor, cgroups) = setup(&tmpdir, FAST_WRAPPER);
    cgroups.create(Path::new("oci/r9")).unwrap();
    monitor.set_cpuset("r9", &[1, 3]).unwrap();
    assert_eq!(cgroups.cpus(Path::new("oci/r9")), Some("1,3".into()));
}

#[test]
fn test_set_cpuset_noop_without_cpuset() {
    let tmpdir = TempDir::new().unwrap();
    let mut conf = test_config(&tmpdir);
    conf.cpuset_available = false;
    let (monitor, cgroups) = setup_with(&tmpdir, FAST_WRAPPER, conf);
    monitor.set_cpuset("r9", &[1, 3]).unwrap();
    assert!(!cgroups.contains(Path::new("oci/r9")));
}

#[test]
fn test_set_cpuset_failure_propagates() {
    let tmpdir = TempDir::new().unwrap();
    let (monitor, _cgroups) = setup(&tmpdir, FAST_WRAPPER);
    // "oci" exists, "oci/r9" was never created.
    assert!(monitor.set_cpuset("r9", &[1]).is_err());
}

#[test]
fn test_missing_wrapper_binary() {
    let tmpdir = TempDir::new().unwrap();
    let conf = test_config(&tmpdir);
    let backend: Arc<dyn CgroupBackend> = Arc::new(MemCgroups::new());
    match Monitor::new(conf, backend) {
        Err(Error::Config(msg)) => assert!(msg.contains("oci-wrapper"), "{msg}"),
        v => panic!("expected config error, got {:?}", v.map(|_| ())),
    }
}

#[test]
fn test_classify_wrapper_exit() {
    let clean = ExitStatus::from_raw(0);
    assert!(classify_wrapper_exit(clean, false).is_ok());
    assert!(classify_wrapper_exit(clean, true).is_ok());

    let sigkilled = ExitStatus::from_raw(libc::SIGKILL);
    assert!(matches!(
        classify_wrapper_exit(sigkilled, true),
        Err(Error::Shutdown)
    ));
    assert!(matches!(
        classify_wrapper_exit(sigkilled, false),
        Err(Error::RunnerFailed(_))
    ));

    // The wrapper maps a SIGKILLed child to exit code 137.
    let kill_code = ExitStatus::from_raw(137 << 8);
    assert!(matches!(
        classify_wrapper_exit(kill_code, true),
        Err(Error::Shutdown)
    ));

    match classify_wrapper_exit(ExitStatus::from_raw(3 << 8), false) {
        Err(Error::RunnerFailed(msg)) => assert_eq!(msg, "exited with code 3"),
        v => panic!("expected runner failure, got {v:?}"),
    }
}
