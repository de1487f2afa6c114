use std::fs::File;
use std::io::{BufRead, BufReader, Write as _};
use std::path::Path;
use std::str::FromStr;

use nix::unistd::{getgid, getuid};
use serde::{Deserialize, Serialize};

use crate::Error;

/// A host uid/gid pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

impl User {
    /// The uid/gid the calling process runs as.
    pub fn current() -> Self {
        Self {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        }
    }
}

/// Semantic roles for id allocation inside the sandbox.
///
/// `Superroot` is container id 0 and maps to the monitor's own host user;
/// the other kinds draw consecutive ids from the subuid/subgid block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserKind {
    Superroot,
    Root,
    User,
}

/// One `uid_map`/`gid_map` line: container range start, host range start,
/// amount of mapped ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapEntry {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Consecutive sub-ids required of `/etc/subuid` and `/etc/subgid`: enough
/// for the master description (one superroot, 1000 root-range ids, one
/// unprivileged user).
pub const MIN_SUBID_COUNT: u32 = 1001;

/// Finds the first `name:start:length` range for `name` in a subuid-format
/// file. Lines with too few fields or non-integer fields are skipped.
pub fn find_subid_range(path: impl AsRef<Path>, name: &str) -> Result<Option<(u32, u32)>, Error> {
    let file = BufReader::new(File::open(path)?);
    for line in file.lines() {
        let line = line?;
        let parts: Vec<_> = line.split(':').collect();
        if parts.len() < 3 || parts[0] != name {
            continue;
        }
        match (u32::from_str(parts[1]), u32::from_str(parts[2])) {
            (Ok(start), Ok(size)) => return Ok(Some((start, size))),
            _ => continue,
        }
    }
    Ok(None)
}

/// Resolves the first unprivileged id mapped for the current user from
/// `/etc/subuid` and `/etc/subgid`, requiring [`MIN_SUBID_COUNT`]
/// consecutive ids in each.
pub fn first_user_mapped() -> Result<User, Error> {
    let uid = getuid();
    let user = nix::unistd::User::from_uid(uid)
        .map_err(|v| Error::config(format!("cannot resolve user {uid}: {v}")))?
        .ok_or_else(|| Error::config(format!("unknown user: {uid}")))?;
    let sub_uid = find_subid_range("/etc/subuid", &user.name)?;
    let sub_gid = find_subid_range("/etc/subgid", &user.name)?;
    match (sub_uid, sub_gid) {
        (Some((uid_start, uid_size)), Some((gid_start, gid_size)))
            if uid_size >= MIN_SUBID_COUNT && gid_size >= MIN_SUBID_COUNT =>
        {
            Ok(User {
                uid: uid_start,
                gid: gid_start,
            })
        }
        _ => Err(Error::config(format!(
            "not enough subuid or subgid configured ({MIN_SUBID_COUNT} needed)"
        ))),
    }
}

/// Expands a `[(kind, count)]` description into uid and gid map entries.
///
/// Container ids are assigned consecutively from 0 in description order.
/// `Superroot` ranges map to `current`; everything else allocates
/// consecutively from `first_mapped`.
pub fn build_id_maps(
    desc: &[(UserKind, u32)],
    current: User,
    first_mapped: User,
) -> (Vec<IdMapEntry>, Vec<IdMapEntry>) {
    let mut uid_map = Vec::with_capacity(desc.len());
    let mut gid_map = Vec::with_capacity(desc.len());
    let mut container_id = 0;
    let mut host_uid = first_mapped.uid;
    let mut host_gid = first_mapped.gid;
    for &(kind, size) in desc {
        match kind {
            UserKind::Superroot => {
                uid_map.push(IdMapEntry {
                    container_id,
                    host_id: current.uid,
                    size,
                });
                gid_map.push(IdMapEntry {
                    container_id,
                    host_id: current.gid,
                    size,
                });
            }
            UserKind::Root | UserKind::User => {
                uid_map.push(IdMapEntry {
                    container_id,
                    host_id: host_uid,
                    size,
                });
                gid_map.push(IdMapEntry {
                    container_id,
                    host_id: host_gid,
                    size,
                });
                host_uid += size;
                host_gid += size;
            }
        }
        container_id += size;
    }
    (uid_map, gid_map)
}

fn format_id_map(entries: &[IdMapEntry]) -> String {
    let mut out = String::new();
    for v in entries {
        out.push_str(&format!("{} {} {}\n", v.container_id, v.host_id, v.size));
    }
    out
}

/// Writes the uid and gid maps of the calling process, which must already
/// be in its new user namespace. The kernel rejects unprivileged gid maps
/// unless `setgroups` is denied first.
pub fn write_id_maps(uid_map: &[IdMapEntry], gid_map: &[IdMapEntry]) -> Result<(), Error> {
    write_proc_file("/proc/self/setgroups", "deny")
        .map_err(|v| Error::config(format!("cannot deny setgroups: {v}")))?;
    write_proc_file("/proc/self/gid_map", &format_id_map(gid_map))
        .map_err(|v| Error::config(format!("cannot write gid_map: {v}")))?;
    write_proc_file("/proc/self/uid_map", &format_id_map(uid_map))
        .map_err(|v| Error::config(format!("cannot write uid_map: {v}")))?;
    Ok(())
}

fn write_proc_file(path: &str, data: &str) -> std::io::Result<()> {
    File::options()
        .write(true)
        .open(path)?
        .write_all(data.as_bytes())
}
