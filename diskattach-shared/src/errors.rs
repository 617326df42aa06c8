//! Error taxonomy for the disk attachment manager.
//!
//! Every variant is terminal for the current invocation. Nothing here is
//! retried automatically; retry policy belongs to the init system.

use thiserror::Error;

pub type DiskResult<T> = Result<T, DiskError>;

#[derive(Debug, Error)]
pub enum DiskError {
    /// The image could not be exported over the local NBD endpoint.
    #[error("export unavailable: {0}")]
    ExportUnavailable(String),

    /// No kernel NBD device could be bound to the export.
    #[error("attach failed: {0}")]
    AttachFailed(String),

    #[error("partitioning failed: {0}")]
    PartitionFailed(String),

    /// The device carries a layout the automation must not touch.
    /// Fail-closed: never followed by repartitioning or reformatting.
    #[error("ambiguous device state on {device}: {reason}")]
    AmbiguousDeviceState { device: String, reason: String },

    /// The partition already carries a different filesystem. Fail-closed.
    #[error("{partition} already carries a {found} filesystem, refusing to format as {requested}")]
    FilesystemTypeConflict {
        partition: String,
        found: String,
        requested: String,
    },

    #[error("volume group extension failed: {0}")]
    ExtendFailed(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("applying permissions failed: {0}")]
    PermissionApplyFailed(String),

    /// Device is still in use (mounted) and cannot be released.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DiskError {
    /// Whether this error signals a state that must be resolved by an operator.
    pub fn is_fail_closed(&self) -> bool {
        matches!(
            self,
            DiskError::AmbiguousDeviceState { .. } | DiskError::FilesystemTypeConflict { .. }
        )
    }
}
