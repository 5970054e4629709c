use crate::engine::EngineError;
use aoc_remote_core::protocol::{ErrorCode, ProtocolError};
use aoc_remote_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("{message}")]
    Validation { code: ErrorCode, message: String },
    #[error("{message}")]
    NotFound { code: ErrorCode, message: String },
    #[error("{message}")]
    Conflict { code: ErrorCode, message: String },
    #[error("{message}")]
    ResourceLimit { code: ErrorCode, message: String },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("process: {0}")]
    Process(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    pub fn invalid(message: impl Into<String>) -> Self {
        HubError::Validation {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        HubError::Validation {
            code: ErrorCode::InvalidPath,
            message: message.into(),
        }
    }

    pub fn project_not_found(id: &str) -> Self {
        HubError::NotFound {
            code: ErrorCode::ProjectNotFound,
            message: format!("project not found: {id}"),
        }
    }

    pub fn not_joined(id: &str) -> Self {
        HubError::NotFound {
            code: ErrorCode::NotJoined,
            message: format!("session has not joined project {id}"),
        }
    }

    pub fn process_active(id: &str) -> Self {
        HubError::Conflict {
            code: ErrorCode::ProcessActive,
            message: format!("process is active for project {id}"),
        }
    }

    pub fn already_executing(id: &str) -> Self {
        HubError::Conflict {
            code: ErrorCode::AlreadyExecuting,
            message: format!("project {id} is already executing"),
        }
    }

    pub fn project_limit(max: usize) -> Self {
        HubError::ResourceLimit {
            code: ErrorCode::ProjectLimit,
            message: format!("project limit reached ({max})"),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::Validation { code, .. }
            | HubError::NotFound { code, .. }
            | HubError::Conflict { code, .. }
            | HubError::ResourceLimit { code, .. } => *code,
            HubError::Process(_) => ErrorCode::ProcessError,
            HubError::Storage(_) | HubError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Text sent to clients. Storage and internal failures stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            HubError::Storage(_) | HubError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, HubError::Storage(_) | HubError::Internal(_))
    }
}

impl From<ProtocolError> for HubError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownType(kind) => HubError::Validation {
                code: ErrorCode::UnknownType,
                message: format!("unknown message type: {kind}"),
            },
            other => HubError::invalid(other.to_string()),
        }
    }
}

impl From<EngineError> for HubError {
    fn from(err: EngineError) -> Self {
        HubError::Process(err.to_string())
    }
}

impl From<tokio::task::JoinError> for HubError {
    fn from(err: tokio::task::JoinError) -> Self {
        HubError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(HubError::invalid("bad").code(), ErrorCode::InvalidRequest);
        assert_eq!(
            HubError::project_not_found("p").code(),
            ErrorCode::ProjectNotFound
        );
        assert_eq!(HubError::process_active("p").code(), ErrorCode::ProcessActive);
        assert_eq!(HubError::project_limit(1).code(), ErrorCode::ProjectLimit);
        assert_eq!(
            HubError::Process("boom".to_string()).code(),
            ErrorCode::ProcessError
        );
        assert_eq!(
            HubError::from(ProtocolError::UnknownType("x".to_string())).code(),
            ErrorCode::UnknownType
        );
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let err = HubError::Storage(StorageError::Serialization(
            "secret path /home/u/.aoc".to_string(),
        ));
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(err.client_message(), "internal server error");
        assert!(err.is_internal());

        let conflict = HubError::process_active("p-1");
        assert_eq!(conflict.client_message(), "process is active for project p-1");
    }
}
