use serde::Serialize;
use thiserror::Error;

use crate::models::{ExecutionId, ExecutionStateType, JobStateType};

/// Coarse failure category callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    InvalidVersion,
    AlreadyTerminal,
    /// A short job ID matched more than one job.
    Ambiguous,
    StorageFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::AlreadyExists => write!(f, "already_exists"),
            ErrorKind::InvalidState => write!(f, "invalid_state"),
            ErrorKind::InvalidVersion => write!(f, "invalid_version"),
            ErrorKind::AlreadyTerminal => write!(f, "already_terminal"),
            ErrorKind::Ambiguous => write!(f, "ambiguous"),
            ErrorKind::StorageFailure => write!(f, "storage_failure"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("execution already exists: {0}")]
    ExecutionAlreadyExists(ExecutionId),

    #[error("multiple jobs found for id {id}: {matches:?}")]
    MultipleJobsFound { id: String, matches: Vec<String> },

    #[error("job {job_id} is in state {actual} but expected {expected}")]
    InvalidJobState {
        job_id: String,
        actual: JobStateType,
        expected: String,
    },

    #[error("job {job_id} has version {actual} but expected {expected}")]
    InvalidJobVersion {
        job_id: String,
        actual: u64,
        expected: u64,
    },

    #[error("job {job_id} is in terminal state {state} and cannot transition to {new_state}")]
    JobAlreadyTerminal {
        job_id: String,
        state: JobStateType,
        new_state: JobStateType,
    },

    #[error("execution {id} is in state {actual} but expected {expected}")]
    InvalidExecutionState {
        id: ExecutionId,
        actual: ExecutionStateType,
        expected: String,
    },

    #[error("execution {id} has version {actual} but expected {expected}")]
    InvalidExecutionVersion {
        id: ExecutionId,
        actual: u64,
        expected: u64,
    },

    #[error(
        "execution {id} is in terminal state {state} and cannot transition to {new_state}"
    )]
    ExecutionAlreadyTerminal {
        id: ExecutionId,
        state: ExecutionStateType,
        new_state: ExecutionStateType,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::JobNotFound(_) | StoreError::ExecutionNotFound(_) => ErrorKind::NotFound,
            StoreError::JobAlreadyExists(_) | StoreError::ExecutionAlreadyExists(_) => {
                ErrorKind::AlreadyExists
            }
            StoreError::MultipleJobsFound { .. } => ErrorKind::Ambiguous,
            StoreError::InvalidJobState { .. } | StoreError::InvalidExecutionState { .. } => {
                ErrorKind::InvalidState
            }
            StoreError::InvalidJobVersion { .. } | StoreError::InvalidExecutionVersion { .. } => {
                ErrorKind::InvalidVersion
            }
            StoreError::JobAlreadyTerminal { .. } | StoreError::ExecutionAlreadyTerminal { .. } => {
                ErrorKind::AlreadyTerminal
            }
            StoreError::Database(_) | StoreError::Serialization(_) | StoreError::Internal(_) => {
                ErrorKind::StorageFailure
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_expected_and_actual() {
        let err = StoreError::InvalidJobVersion {
            job_id: "j1".to_string(),
            actual: 3,
            expected: 2,
        };
        assert_eq!(err.to_string(), "job j1 has version 3 but expected 2");
        assert_eq!(err.kind(), ErrorKind::InvalidVersion);

        let err = StoreError::JobAlreadyTerminal {
            job_id: "j1".to_string(),
            state: JobStateType::Completed,
            new_state: JobStateType::Queued,
        };
        assert_eq!(
            err.to_string(),
            "job j1 is in terminal state completed and cannot transition to queued"
        );
    }

    #[test]
    fn storage_errors_map_to_storage_failure() {
        assert_eq!(
            StoreError::Internal("boom".into()).kind(),
            ErrorKind::StorageFailure
        );
        assert_eq!(
            StoreError::Database(sqlx::Error::RowNotFound).kind(),
            ErrorKind::StorageFailure
        );
    }
}
