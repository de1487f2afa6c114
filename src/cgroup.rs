use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{format_cpu_list, Error};

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const CGROUP_PROCS: &str = "cgroup.procs";
const CPUSET_CPUS: &str = "cpuset.cpus";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";

/// Cgroup manipulation as the monitor sees it: creation of per-runner
/// groups and cpuset updates. The production implementation writes the
/// cgroup-v2 sysfs directly; tests use the in-memory fake.
pub trait CgroupBackend: Send + Sync + Debug {
    /// Full host path of the named cgroup, as handed to the wrapper.
    fn path(&self, name: &Path) -> PathBuf;

    /// Creates the named cgroup, parents included.
    fn create(&self, name: &Path) -> Result<(), Error>;

    /// Updates `cpuset.cpus` of an existing cgroup.
    fn set_cpus(&self, name: &Path, cpus: &[u32]) -> Result<(), Error>;
}

/// Cgroup-v2 sysfs backend rooted at a mount path.
#[derive(Clone, Debug)]
pub struct FsCgroups {
    mount_path: PathBuf,
}

impl FsCgroups {
    pub fn new(mount_path: impl Into<PathBuf>) -> Self {
        Self {
            mount_path: mount_path.into(),
        }
    }

    fn enable_cpuset(&self, name: &Path) -> Result<(), Error> {
        // Children can only use the cpuset controller if every ancestor
        // delegates it through cgroup.subtree_control.
        let mut dir = self.mount_path.clone();
        for part in name.iter() {
            let control = dir.join(SUBTREE_CONTROL);
            fs::write(&control, "+cpuset")
                .map_err(|v| Error::cgroup(format!("cannot enable cpuset in {dir:?}: {v}")))?;
            dir.push(part);
        }
        Ok(())
    }
}

impl Default for FsCgroups {
    fn default() -> Self {
        Self::new(CGROUP_MOUNT)
    }
}

impl CgroupBackend for FsCgroups {
    fn path(&self, name: &Path) -> PathBuf {
        self.mount_path.join(name)
    }

    fn create(&self, name: &Path) -> Result<(), Error> {
        let path = self.path(name);
        fs::create_dir_all(&path)
            .map_err(|v| Error::cgroup(format!("cannot create cgroup {path:?}: {v}")))?;
        self.enable_cpuset(name)
    }

    fn set_cpus(&self, name: &Path, cpus: &[u32]) -> Result<(), Error> {
        let path = self.path(name).join(CPUSET_CPUS);
        fs::write(&path, format_cpu_list(cpus))
            .map_err(|v| Error::cgroup(format!("cannot write {path:?}: {v}")))
    }
}

/// Places the calling process in a cgroup by full host path. Used on the
/// wrapper side, which receives the resolved path on the wire.
pub fn enter_cgroup(path: &Path) -> Result<(), Error> {
    let procs = path.join(CGROUP_PROCS);
    fs::write(&procs, std::process::id().to_string())
        .map_err(|v| Error::cgroup(format!("cannot join cgroup {path:?}: {v}")))
}

/// Writes an initial cpuset by full host cgroup path, wrapper side.
pub fn write_cpuset(path: &Path, cpus: &[u32]) -> Result<(), Error> {
    let file = path.join(CPUSET_CPUS);
    fs::write(&file, format_cpu_list(cpus))
        .map_err(|v| Error::cgroup(format!("cannot write {file:?}: {v}")))
}

/// Hint printed when the root cgroup cannot be bootstrapped.
pub fn creation_hint(name: &Path) -> String {
    let path = Path::new(CGROUP_MOUNT).join(name);
    format!(
        "create it manually, e.g.: sudo mkdir -p {} && sudo chown -R $(id -u):$(id -g) {}",
        path.display(),
        path.display(),
    )
}

/// In-memory backend recording creations and cpuset writes.
#[derive(Debug, Default)]
pub struct MemCgroups {
    state: Mutex<BTreeMap<PathBuf, Option<String>>>,
}

impl MemCgroups {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, name: &Path) -> bool {
        self.state.lock().unwrap().contains_key(name)
    }

    /// The last cpuset written to a cgroup, in `cpuset.cpus` format.
    pub fn cpus(&self, name: &Path) -> Option<String> {
        self.state.lock().unwrap().get(name).cloned().flatten()
    }
}

impl CgroupBackend for MemCgroups {
    fn path(&self, name: &Path) -> PathBuf {
        Path::new(CGROUP_MOUNT).join(name)
    }

    fn create(&self, name: &Path) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let mut path = PathBuf::new();
        for part in name.iter() {
            path.push(part);
            state.entry(path.clone()).or_insert(None);
        }
        Ok(())
    }

    fn set_cpus(&self, name: &Path, cpus: &[u32]) -> Result<(), Error> {
        match self.state.lock().unwrap().get_mut(name) {
            Some(v) => {
                *v = Some(format_cpu_list(cpus));
                Ok(())
            }
            None => Err(Error::cgroup(format!("no such cgroup: {name:?}"))),
        }
    }
}

pub(crate) fn ignore_kind(result: std::io::Result<()>, kind: ErrorKind) -> std::io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == kind => Ok(()),
        Err(err) => Err(err),
    }
}
