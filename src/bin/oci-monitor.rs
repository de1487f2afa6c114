use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::{ArgAction, Parser, ValueEnum};
use tracing::error;

use oci::{
    first_user_mapped, parse_cpu_list, partition_cpus, singleton_layout, CpuInfo, FsCgroups,
    Monitor, MonitorConfig, User,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Verbosity {
    Debug,
    Info,
    Error,
}

/// Supervisor for sandboxed CI runners.
#[derive(Debug, Parser)]
#[command(name = "oci-monitor")]
struct Args {
    /// Basename of the master binary, looked up in --binaries.
    #[arg(long, default_value = "oci-default-master")]
    master: String,

    /// Search path for master/wrapper/runner binaries (repeatable).
    #[arg(long = "binaries", default_value = "/usr/local/lib/oci/bin")]
    binaries: Vec<PathBuf>,

    /// The monitor's working directory; must be writable.
    #[arg(long = "oci-data", default_value = "/var/lib/oci")]
    oci_data: PathBuf,

    /// Forwarded to the master via get_configuration.
    #[arg(long = "identity-file")]
    identity_file: Option<PathBuf>,

    #[arg(long, value_enum, ignore_case = true, default_value = "info")]
    verbose: Verbosity,

    /// Ask the master to delete each runner rootfs after its job.
    #[arg(long = "keep-runner-rootfs", action = ArgAction::SetFalse)]
    keep_runner_rootfs: bool,

    /// Root cgroup under which per-runner cgroups are made.
    #[arg(long)]
    cgroup: Option<String>,

    /// Max simultaneous workers.
    #[arg(long = "proc")]
    workers: Option<usize>,

    /// Comma list of CPU indices or a-b intervals, e.g. 1,3,2,7,8-12,15.
    #[arg(long)]
    cpus: Option<String>,

    /// Parse /proc/cpuinfo for hyperthread topology.
    #[arg(long)]
    cpuinfo: bool,
}

fn build_config(args: &Args) -> anyhow::Result<MonitorConfig> {
    std::fs::create_dir_all(&args.oci_data)
        .map_err(|v| anyhow::anyhow!("oci-data {:?} is not writable: {v}", args.oci_data))?;
    let current_user = User::current();
    let first_user_mapped = first_user_mapped()?;
    let (cpu_groups, workers, cpuset_available) = if args.cpuinfo {
        let cpuinfo = CpuInfo::load()?;
        let cpus = match &args.cpus {
            Some(list) => parse_cpu_list(list)?,
            None => cpuinfo.processors(),
        };
        let workers = args.workers.unwrap_or_else(|| cpuinfo.nb_cpus());
        (partition_cpus(&cpuinfo, &cpus), workers, true)
    } else {
        let workers = args.workers.unwrap_or(4);
        let cpus = match &args.cpus {
            Some(list) => parse_cpu_list(list)?,
            None => (0..workers as u32).collect(),
        };
        (singleton_layout(&cpus), workers, false)
    };
    Ok(MonitorConfig {
        current_user,
        first_user_mapped,
        oci_data: args.oci_data.clone(),
        binaries: args.binaries.clone(),
        master: args.master.clone(),
        identity_file: args.identity_file.clone(),
        keep_runner_rootfs: args.keep_runner_rootfs,
        cgroup: args.cgroup.clone(),
        workers,
        cpu_groups,
        cpuset_available,
    })
}

fn run(args: &Args) -> anyhow::Result<i32> {
    let conf = build_config(args)?;
    let monitor = Monitor::new(conf, Arc::new(FsCgroups::default()))?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(monitor.run())?)
}

fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        Verbosity::Debug => tracing::Level::DEBUG,
        Verbosity::Info => tracing::Level::INFO,
        Verbosity::Error => tracing::Level::ERROR,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
    match run(&args) {
        Ok(code) => exit(code),
        Err(err) => {
            error!("{err:#}");
            exit(1);
        }
    }
}
