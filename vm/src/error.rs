use thiserror::Error;

use haven_service::ServiceError;

use crate::fs::FsError;

/// Every fallible operation in this crate fails with this one kind.
///
/// The first group are usage errors (caller bugs, surfaced synchronously and
/// never retried); the rest wrap resource or remote failures and carry the
/// underlying cause.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid virtual machine name '{0}'")]
    InvalidName(String),

    #[error("virtual machine '{0}' already exists")]
    AlreadyExists(String),

    #[error("no virtual machine named '{0}'")]
    NotFound(String),

    #[error("virtual machine has been deleted")]
    Deleted,

    #[error("virtual machine is not in stopped state")]
    NotStopped,

    #[error("virtual machine is not running")]
    NotRunning,

    #[error("incompatible config")]
    IncompatibleConfig,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config version {found} is newer than supported version {supported}")]
    ConfigVersionTooNew { found: u32, supported: u32 },

    #[error("cannot parse persisted config: {0}")]
    ConfigFormat(#[from] serde_json::Error),

    #[error("persisted state is corrupt: {0}")]
    CorruptState(String),

    #[error("descriptor is closed")]
    DescriptorClosed,

    #[error("cannot duplicate descriptor handle: {0}")]
    DescriptorHandle(#[source] std::io::Error),

    #[error("vsock port {0} out of range")]
    InvalidVsockPort(u64),

    #[error("vm output capture is not enabled")]
    OutputNotCaptured,

    #[error("cannot create output pipe: {0}")]
    Pipe(#[source] std::io::Error),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}
