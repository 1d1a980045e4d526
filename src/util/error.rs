use crate::transport::TransportError;
use crate::wire::{FileId, RequestKind, Status, WireError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures of the real (on-disk or in-memory) file underneath the driver.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("access [{address}, {address}+{size}) beyond end of allocated space {eoa}")]
    BeyondEoa { address: u64, size: u64, eoa: u64 },
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced to callers of the client library and the file driver.
#[derive(Debug, Error)]
pub enum SapError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{op} on file {file_id} failed with status {status}")]
    Status {
        op: RequestKind,
        file_id: FileId,
        status: Status,
    },
    #[error("file {file_id} is in an unrecoverable state; it must be re-opened")]
    Catastrophic { file_id: FileId },
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl SapError {
    /// Maps a non-success reply status onto the caller-facing error.
    pub fn from_status(op: RequestKind, file_id: FileId, status: Status) -> Self {
        if status == Status::Catastrophic {
            SapError::Catastrophic { file_id }
        } else {
            SapError::Status {
                op,
                file_id,
                status,
            }
        }
    }

    /// The reply status behind this error, when the server produced one.
    pub fn status(&self) -> Option<Status> {
        match self {
            SapError::Status { status, .. } => Some(*status),
            SapError::Catastrophic { .. } => Some(Status::Catastrophic),
            _ => None,
        }
    }

    pub fn is_catastrophic(&self) -> bool {
        matches!(self, SapError::Catastrophic { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catastrophic_status_maps_to_dedicated_variant() {
        let err = SapError::from_status(RequestKind::Lock, 3, Status::Catastrophic);
        assert!(err.is_catastrophic());
        assert_eq!(err.status(), Some(Status::Catastrophic));
        let err = SapError::from_status(RequestKind::LockEnd, 3, Status::LockFailed);
        assert_eq!(err.status(), Some(Status::LockFailed));
        assert!(err.to_string().contains("LOCK_FAILED"));
    }
}
