use std::fs::File;

use nix::unistd::{fork, ForkResult};

use crate::{
    enter_cgroup, enter_namespaces, exec_sandboxed, pivot_rootfs, prepare_rootfs, read_record,
    setup_loopback, wait_exit_code, write_cpuset, write_pid, Error, WrapperParameters,
};

/// Runs the wrapper protocol for one runner: read the parameter frame from
/// `<base>.in`, construct the sandbox, fork the target, report its pid on
/// `<base>.out` and wait for it. Returns the exit code to terminate with.
///
/// The reply fifo is opened before the mount tree changes; the descriptor
/// stays valid across pivot_root, so the pid write after the fork does not
/// depend on host paths still being visible.
pub fn run_wrapper(pipe_base: &str) -> Result<i32, Error> {
    let params: WrapperParameters = read_record(File::open(format!("{pipe_base}.in"))?)?;
    let reply = File::options()
        .write(true)
        .open(format!("{pipe_base}.out"))?;
    enter_namespaces(&params.uid_map, &params.gid_map)?;
    prepare_rootfs(&params.rootfs, params.bind_system_mount)?;
    // The cgroup path points into the host sysfs, so join before pivoting.
    if let Some(cgroup) = &params.cgroup {
        enter_cgroup(cgroup)?;
        if let Some(cpus) = &params.initial_cpuset {
            write_cpuset(cgroup, cpus)?;
        }
    }
    pivot_rootfs(&params.rootfs)?;
    if params.prepare_network {
        setup_loopback()?;
    }
    match unsafe { fork() }? {
        ForkResult::Child => {
            drop(reply);
            if let Err(err) = exec_sandboxed(&params) {
                eprintln!("cannot start runner: {err}");
            }
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => {
            write_pid(&reply, child.as_raw())?;
            drop(reply);
            wait_exit_code(child)
        }
    }
}
