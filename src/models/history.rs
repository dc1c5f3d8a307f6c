use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::execution::{ExecutionId, ExecutionStateType};
use super::job::JobStateType;

/// Whether a history entry records a job or an execution transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobHistoryType {
    JobLevel,
    ExecutionLevel,
}

impl std::fmt::Display for JobHistoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobHistoryType::JobLevel => write!(f, "job"),
            JobHistoryType::ExecutionLevel => write!(f, "execution"),
        }
    }
}

/// A `previous → new` pair of lifecycle values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange<S> {
    pub previous: S,
    pub new: S,
}

impl<S> StateChange<S> {
    pub fn new(previous: S, new: S) -> Self {
        Self { previous, new }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistory {
    pub history_type: JobHistoryType,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_state: Option<StateChange<JobStateType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<StateChange<ExecutionStateType>>,
    pub new_version: u64,
    pub comment: String,
    pub time: DateTime<Utc>,
}

impl JobHistory {
    pub fn job_level(
        job_id: impl Into<String>,
        change: StateChange<JobStateType>,
        new_version: u64,
        comment: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            history_type: JobHistoryType::JobLevel,
            job_id: job_id.into(),
            node_id: None,
            execution_id: None,
            compute_reference: None,
            job_state: Some(change),
            execution_state: None,
            new_version,
            comment: comment.into(),
            time,
        }
    }

    pub fn execution_level(
        id: &ExecutionId,
        compute_reference: &str,
        change: StateChange<ExecutionStateType>,
        new_version: u64,
        comment: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            history_type: JobHistoryType::ExecutionLevel,
            job_id: id.job_id.clone(),
            node_id: Some(id.node_id.clone()),
            execution_id: Some(id.execution_id.clone()),
            compute_reference: (!compute_reference.is_empty())
                .then(|| compute_reference.to_string()),
            job_state: None,
            execution_state: Some(change),
            new_version,
            comment: comment.into(),
            time,
        }
    }

    pub fn is_job_level(&self) -> bool {
        self.history_type == JobHistoryType::JobLevel
    }
}
