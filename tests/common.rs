use std::{
    io::ErrorKind,
    ops::Deref,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use oci::Error;
use rand::distributions::{Alphanumeric, DistString as _};

pub struct TempDir(PathBuf);

impl TempDir {
    #[allow(unused)]
    pub fn new() -> Result<Self, Error> {
        let tmpdir = Path::new(env!("CARGO_TARGET_TMPDIR"));
        let path = loop {
            let path = tmpdir.join(format!("test-{}", rand_string(32)));
            match std::fs::metadata(&path) {
                Ok(_) => continue,
                Err(v) if v.kind() == ErrorKind::NotFound => break path,
                Err(v) => return Err(v.into()),
            }
        };
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    #[allow(unused)]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.0.join(path)
    }

    #[allow(unused)]
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Deref for TempDir {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        self.0.as_path()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[allow(unused)]
pub fn rand_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

#[allow(unused)]
pub fn write_script(path: &Path, body: &str) -> Result<(), Error> {
    std::fs::write(path, body)?;
    let mut perm = std::fs::metadata(path)?.permissions();
    perm.set_mode(0o755);
    std::fs::set_permissions(path, perm)?;
    Ok(())
}
