use std::convert::Infallible;
use std::ffi::CString;
use std::fs::create_dir;
use std::io::ErrorKind;
use std::path::Path;

use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, close, execve, fchdir, setresgid, setresuid, Gid, Pid, Uid};

use crate::{ignore_kind, write_id_maps, Error, IdMapEntry, WrapperParameters};

/// Host trees bound into the rootfs when `bind_system_mount` is set.
const SYSTEM_MOUNTS: &[&str] = &["/proc", "/sys", "/dev"];

/// Detaches from the parent namespaces and installs the id maps. The user
/// namespace comes first in the flag set so the remaining namespaces are
/// created with the capabilities it grants.
pub fn enter_namespaces(uid_map: &[IdMapEntry], gid_map: &[IdMapEntry]) -> Result<(), Error> {
    unshare(
        CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWNET,
    )
    .map_err(|v| Error::config(format!("cannot unshare namespaces: {v}")))?;
    write_id_maps(uid_map, gid_map)
}

/// Prepares the rootfs mount tree: makes mount changes private to this
/// namespace, binds the rootfs onto itself so it becomes a mount point,
/// and binds the host system trees into it when requested.
pub fn prepare_rootfs(rootfs: &Path, bind_system_mount: bool) -> Result<(), Error> {
    remount_private_root(rootfs).map_err(|v| Error::config(format!("cannot prepare rootfs: {v}")))?;
    if bind_system_mount {
        for source in SYSTEM_MOUNTS {
            bind_system_tree(rootfs, source)
                .map_err(|v| Error::config(format!("cannot bind {source}: {v}")))?;
        }
    }
    Ok(())
}

fn remount_private_root(path: &Path) -> Result<(), Error> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    Ok(mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?)
}

fn bind_system_tree(rootfs: &Path, source: &str) -> Result<(), Error> {
    let target = rootfs.join(source.trim_start_matches('/'));
    ignore_kind(create_dir(&target), ErrorKind::AlreadyExists)?;
    Ok(mount(
        Some(source),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?)
}

/// Makes `path` the new root. Uses pivot_root with the old root stacked on
/// the same path; falls back to chroot when the rootfs cannot host the old
/// root (the master runs on rootfs `/`).
pub fn pivot_rootfs(path: &Path) -> Result<(), Error> {
    let new_root = open(
        path,
        OFlag::O_DIRECTORY | OFlag::O_RDONLY,
        nix::sys::stat::Mode::empty(),
    )?;
    if nix::unistd::pivot_root(path, path).is_err() {
        let _ = close(new_root);
        chroot(path)?;
        return Ok(chdir("/")?);
    }
    // Make the old root rslave so the unmount does not propagate back.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    umount2("/", MntFlags::MNT_DETACH)?;
    Ok(fchdir(new_root)?)
}

/// Brings `lo` up inside the current (new) net namespace.
pub fn setup_loopback() -> Result<(), Error> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let result = loopback_up(sock);
    unsafe { libc::close(sock) };
    result
}

fn loopback_up(sock: libc::c_int) -> Result<(), Error> {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(b"lo\0") {
        *dst = *src as libc::c_char;
    }
    if unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS, &mut ifr) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    unsafe {
        ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    if unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS, &ifr) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Final child-side steps: drop to the run user, move to the work
/// directory and exec the target. Only returns on error.
pub fn exec_sandboxed(params: &WrapperParameters) -> Result<Infallible, Error> {
    let rungid = Gid::from_raw(params.rungid);
    setresgid(rungid, rungid, rungid).map_err(|v| Error::config(format!("cannot set gid: {v}")))?;
    let runuid = Uid::from_raw(params.runuid);
    setresuid(runuid, runuid, runuid).map_err(|v| Error::config(format!("cannot set uid: {v}")))?;
    match &params.workdir {
        Some(dir) => chdir(dir.as_path()),
        None => chdir("/"),
    }
    .map_err(|v| Error::config(format!("cannot change directory: {v}")))?;
    let filename = CString::new(params.command.as_os_str().as_encoded_bytes())?;
    let argv = Result::<Vec<_>, _>::from_iter(
        params.argv.iter().map(|v| CString::new(v.as_bytes())),
    )?;
    let envp = Result::<Vec<_>, _>::from_iter(
        params
            .env
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}"))),
    )?;
    Ok(execve(&filename, &argv, &envp)?)
}

/// Waits for the wrapped child and maps its status to the wrapper's own
/// exit code: the child's code for clean exits, `128 + signum` for signal
/// deaths.
pub fn wait_exit_code(pid: Pid) -> Result<i32, Error> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Exited(_, code) => return Ok(code),
            WaitStatus::Signaled(_, signal, _) => return Ok(128 + signal as i32),
            _ => continue,
        }
    }
}
