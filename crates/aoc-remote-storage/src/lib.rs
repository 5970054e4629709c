pub mod message_log;
pub mod project_store;

use std::path::PathBuf;
use thiserror::Error;

pub use message_log::{MessageLog, RotationPolicy};
pub use project_store::{LoadReport, ProjectStore, RecoveryStrategy, RECOVERY_ORDER};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt metadata at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("recovery failed for project {id}")]
    RecoveryFailed { id: String },
    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),
}
