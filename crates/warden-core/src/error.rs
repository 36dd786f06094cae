//! Error types for warden-core

use thiserror::Error;

/// Stage of sandboxee setup that failed. Carried in
/// [`ExecutionResult`](crate::ExecutionResult) when the final status is
/// `SetupError`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFailure {
    #[error("unsupported architecture")]
    UnsupportedArch,
    #[error("setting up timers failed")]
    Timers,
    #[error("setting up signal handling failed")]
    Signals,
    #[error("creating the sandboxee subprocess failed")]
    Subprocess,
    #[error("the start-up notify callback rejected the sandboxee")]
    Notify,
    #[error("connecting to the sandboxee failed")]
    Connection,
    #[error("waiting for the sandboxee failed")]
    Wait,
    #[error("namespace setup failed")]
    Namespaces,
    #[error("ptrace attach failed")]
    Ptrace,
    #[error("transferring IPC descriptors failed")]
    Ipc,
    #[error("applying resource limits failed")]
    Limits,
    #[error("the configured working directory does not exist")]
    Cwd,
    #[error("sending the policy failed")]
    Policy,
    #[error("the monitor failed before the sandboxee became usable")]
    Monitor,
}

/// Failure of the monitor itself, after setup completed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalFailure {
    #[error("storing registers failed")]
    Store,
    #[error("fetching registers failed")]
    Fetch,
    #[error("fetching a ptrace event message failed")]
    GetEvent,
    #[error("monitor invariant broken")]
    Monitor,
    #[error("killing the sandboxee failed")]
    Kill,
    #[error("interrupting the sandboxee failed")]
    Interrupt,
    #[error("inspected-syscall bookkeeping lost")]
    Inspect,
    #[error("child vanished without an exit event")]
    Child,
    #[error("seccomp user-notify operation failed")]
    Notify,
}

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("policy error: {0}")]
    Policy(String),

    #[error("bpf program error: {0}")]
    Bpf(String),

    #[error("comms error: {0}")]
    Comms(String),

    #[error("mount tree error: {0}")]
    Mount(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("fork server error: {0}")]
    ForkServer(String),

    #[error("sandbox setup failed: {0}")]
    Setup(SetupFailure),

    #[error("monitor internal error: {0}")]
    Internal(InternalFailure),

    #[error("stack trace collection failed: {0}")]
    StackTrace(String),

    #[error("sandbox did not finish within the timeout")]
    ResultTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl WardenError {
    /// True when the underlying cause is the traced process having already
    /// exited, which monitors treat as benign.
    #[must_use]
    pub const fn is_process_gone(&self) -> bool {
        matches!(self, Self::Nix(nix::errno::Errno::ESRCH))
    }
}
