use std::io::{Read, Write};
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, IdMapEntry, User};

/// Runner id reserved for the master instance.
pub const MASTER_RUNNER_ID: i32 = -1;

/// The parameter block sent to the wrapper over its input fifo, as one
/// length-prefixed frame. Monitor and wrapper are versioned together; the
/// encoding carries no compatibility promise.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WrapperParameters {
    /// Absolute host path pivoted to as the new root.
    pub rootfs: PathBuf,
    pub uid_map: Vec<IdMapEntry>,
    pub gid_map: Vec<IdMapEntry>,
    pub command: PathBuf,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Final setresuid/setresgid before exec.
    pub runuid: u32,
    pub rungid: u32,
    /// Bind-mount `/proc`, `/sys` and `/dev` from the host into the rootfs.
    pub bind_system_mount: bool,
    /// Bring `lo` up inside the new net namespace. The namespace is created
    /// either way; without this it is left unconfigured.
    pub prepare_network: bool,
    pub workdir: Option<PathBuf>,
    /// Full host cgroup path the child is placed in before exec.
    pub cgroup: Option<PathBuf>,
    pub initial_cpuset: Option<Vec<u32>>,
    pub runner_id: i32,
}

/// Configuration handed to the master on `get_configuration`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfiguration {
    /// Contents of the identity file, reloaded from disk per request.
    pub identity: Option<String>,
    pub keep_runner_rootfs: bool,
    /// Maximum simultaneous workers.
    pub workers: usize,
    /// Hyperthread-sibling groups the master draws runner cpusets from.
    pub cpu_groups: Vec<Vec<u32>>,
    pub first_user_mapped: User,
}

/// Requests crossing the master channel, in either direction. The monitor
/// serves everything except `StopRunner`, which it originates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    GetConfiguration,
    ExecInNamespace(Box<WrapperParameters>),
    KillRunner { runner_id: i32 },
    SetCpuset { cgroup: String, cpuset: Vec<u32> },
    StopRunner,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Configuration(Box<MasterConfiguration>),
    Failed(String),
    /// The runner died in the monitor's shutdown sweep, not on its own.
    Shutdown,
}

/// Envelope multiplexing both directions of an RPC channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    Request { id: u64, body: Request },
    Response { id: u64, body: Response },
}

/// Writes one length-prefixed record.
pub fn write_record<T: Serialize>(mut tx: impl Write, value: &T) -> Result<(), Error> {
    let data = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
    tx.write_all(&(data.len() as u32).to_le_bytes())?;
    tx.write_all(&data)?;
    Ok(())
}

/// Reads one length-prefixed record.
pub fn read_record<T: DeserializeOwned>(mut rx: impl Read) -> Result<T, Error> {
    let mut len = [0; 4];
    rx.read_exact(&mut len)?;
    let mut buf = vec![0; u32::from_le_bytes(len) as usize];
    rx.read_exact(&mut buf)?;
    let (value, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())?;
    Ok(value)
}

pub async fn write_record_async<T: Serialize>(
    tx: &mut (impl AsyncWrite + Unpin),
    value: &T,
) -> Result<(), Error> {
    let data = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
    tx.write_all(&(data.len() as u32).to_le_bytes()).await?;
    tx.write_all(&data).await?;
    tx.flush().await?;
    Ok(())
}

pub async fn read_record_async<T: DeserializeOwned>(
    rx: &mut (impl AsyncRead + Unpin),
) -> Result<T, Error> {
    let mut len = [0; 4];
    rx.read_exact(&mut len).await?;
    let mut buf = vec![0; u32::from_le_bytes(len) as usize];
    rx.read_exact(&mut buf).await?;
    let (value, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())?;
    Ok(value)
}

/// Writes the wrapped pid to the reply fifo: a single 32-bit LE value, the
/// only datum crossing in that direction.
pub fn write_pid(mut tx: impl Write, pid: i32) -> Result<(), Error> {
    Ok(tx.write_all(&pid.to_le_bytes())?)
}

pub fn read_pid(mut rx: impl Read) -> Result<i32, Error> {
    let mut buf = [0; 4];
    rx.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}
