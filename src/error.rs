use std::io;

/// Errors surfaced by the supervision core.
///
/// Per-runner failures are reported to the master and never tear down the
/// monitor; only [`Error::Config`] is fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Startup validation failure: missing binary, insufficient
    /// subuid/subgid, too few CPU groups, cgroup bootstrap failure.
    #[error("{0}")]
    Config(String),

    /// The wrapper exited (or its reply fifo hit EOF) before reporting the
    /// wrapped pid, so no runner was ever started.
    #[error("oci-wrapper stopped before sending wrapped pid: {status}, parameters: {params}")]
    WrapperStartup { status: String, params: String },

    /// The wrapper attached its reply fifo but the pid never arrived.
    #[error("cannot read wrapped pid")]
    WrapperPidEof,

    /// The wrapped process exited non-zero or died on a signal.
    #[error("runner failed: {0}")]
    RunnerFailed(String),

    /// The runner died in the shutdown kill sweep. Distinguished so the
    /// master can keep it out of failure accounting.
    #[error("runner killed by shutdown")]
    Shutdown,

    /// A cgroup filesystem operation failed.
    #[error("cgroup operation failed: {0}")]
    Cgroup(String),

    /// The master RPC channel broke down.
    #[error("master connection lost")]
    MasterGone,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Sys(#[from] nix::errno::Errno),

    #[error("argument contains a nul byte")]
    Nul(#[from] std::ffi::NulError),

    #[error("cannot encode frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("cannot decode frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn cgroup(msg: impl Into<String>) -> Self {
        Self::Cgroup(msg.into())
    }
}
