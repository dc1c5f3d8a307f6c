//! The job store contract and its backends.

pub mod condition;
pub mod inmemory;
mod query;
pub mod sqlite;
mod watch;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::{
    Execution, ExecutionId, ExecutionPatch, Job, JobHistory, JobHistoryType, JobState,
    JobStateType, JobWithInfo,
};

pub use condition::{ExecutionCondition, JobCondition, UpdateCondition};
pub use inmemory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use watch::WatchFilter;

/// Buffered events per watcher before new ones are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Field used to order `get_jobs` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSortField {
    Id,
    CreatedAt,
}

impl std::str::FromStr for JobSortField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "id" => Ok(JobSortField::Id),
            "created_at" | "created" => Ok(JobSortField::CreatedAt),
            other => Err(format!("unknown sort field: {other}")),
        }
    }
}

/// Filter, sort and paging options for `get_jobs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    /// Exact or short ID. When set every other option is ignored.
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    /// Maximum number of jobs returned. Zero means no limit.
    pub limit: usize,
    pub offset: usize,
    /// Ignore `client_id` and return jobs from every client.
    pub return_all: bool,
    /// Insertion order when unset.
    pub sort_by: Option<JobSortField>,
    pub sort_reverse: bool,
}

impl JobQuery {
    pub fn for_client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self {
            return_all: true,
            ..Default::default()
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_include_tag(mut self, tag: impl Into<String>) -> Self {
        self.include_tags.push(tag.into());
        self
    }

    pub fn with_exclude_tag(mut self, tag: impl Into<String>) -> Self {
        self.exclude_tags.push(tag.into());
        self
    }

    pub fn with_sort(mut self, field: JobSortField, reverse: bool) -> Self {
        self.sort_by = Some(field);
        self.sort_reverse = reverse;
        self
    }

    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// Narrows `get_job_history` results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHistoryFilter {
    /// Inclusive lower bound on entry time.
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exclude_job_level: bool,
    #[serde(default)]
    pub exclude_execution_level: bool,
}

impl JobHistoryFilter {
    pub fn matches(&self, entry: &JobHistory) -> bool {
        if self.since.is_some_and(|since| entry.time < since) {
            return false;
        }
        match entry.history_type {
            JobHistoryType::JobLevel => !self.exclude_job_level,
            JobHistoryType::ExecutionLevel => !self.exclude_execution_level,
        }
    }
}

/// Conditional job transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJobStateRequest {
    pub job_id: String,
    #[serde(default)]
    pub condition: JobCondition,
    pub new_state: JobStateType,
    #[serde(default)]
    pub comment: String,
}

impl UpdateJobStateRequest {
    pub fn new(job_id: impl Into<String>, new_state: JobStateType) -> Self {
        Self {
            job_id: job_id.into(),
            condition: JobCondition::default(),
            new_state,
            comment: String::new(),
        }
    }

    pub fn with_condition(mut self, condition: JobCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// Conditional execution transition. `new_values` is merged onto the stored
/// record.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateExecutionRequest {
    pub execution_id: ExecutionId,
    pub condition: ExecutionCondition,
    pub new_values: ExecutionPatch,
    pub comment: String,
}

impl UpdateExecutionRequest {
    pub fn new(execution_id: ExecutionId, new_values: ExecutionPatch) -> Self {
        Self {
            execution_id,
            condition: ExecutionCondition::default(),
            new_values,
            comment: String::new(),
        }
    }

    pub fn with_condition(mut self, condition: ExecutionCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEventKind {
    Job,
    Execution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEventType {
    Created,
    Updated,
}

/// Published to watchers after a write commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub event: StoreEventType,
    pub job_id: String,
    pub execution_id: Option<ExecutionId>,
    /// Lifecycle value after the write, in its display form.
    pub state: String,
    pub version: u64,
    pub time: DateTime<Utc>,
}

impl StoreEvent {
    pub(crate) fn job(
        event: StoreEventType,
        job_id: &str,
        state: JobStateType,
        version: u64,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: StoreEventKind::Job,
            event,
            job_id: job_id.to_string(),
            execution_id: None,
            state: state.to_string(),
            version,
            time,
        }
    }

    pub(crate) fn execution(event: StoreEventType, execution: &Execution) -> Self {
        Self {
            kind: StoreEventKind::Execution,
            event,
            job_id: execution.id.job_id.clone(),
            execution_id: Some(execution.id.clone()),
            state: execution.state.to_string(),
            version: execution.version,
            time: execution.update_time,
        }
    }
}

/// Durable record of jobs, executions and their history.
///
/// Every write validates its preconditions and appends history within one
/// atomic unit. Reads accept either a full job ID or its short form; writes
/// require the full ID.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a new job in `New` at version 1. The returned job carries the
    /// creation time assigned by the store.
    async fn create_job(&self, job: Job) -> Result<Job>;

    async fn get_job(&self, id: &str) -> Result<Job>;

    async fn get_jobs(&self, query: &JobQuery) -> Result<Vec<Job>>;

    /// Number of jobs `get_jobs` would return without `limit` and `offset`.
    async fn get_jobs_count(&self, query: &JobQuery) -> Result<usize>;

    /// Current state plus the latest version of every execution.
    async fn get_job_state(&self, id: &str) -> Result<JobState>;

    /// Non-terminal jobs in creation order.
    async fn get_in_progress_jobs(&self) -> Result<Vec<JobWithInfo>>;

    /// History entries ordered by time, ties in insertion order.
    async fn get_job_history(&self, id: &str, filter: &JobHistoryFilter)
        -> Result<Vec<JobHistory>>;

    /// Returns the new version.
    async fn update_job_state(&self, request: UpdateJobStateRequest) -> Result<u64>;

    /// Stores a new execution in `New` at version 1, whatever state and
    /// version the argument carries.
    async fn create_execution(&self, execution: Execution) -> Result<Execution>;

    /// Returns the merged record.
    async fn update_execution(&self, request: UpdateExecutionRequest) -> Result<Execution>;

    /// Latest version of every execution of a job, in creation order.
    async fn get_executions(&self, job_id: &str) -> Result<Vec<Execution>>;

    /// Subscribes to committed writes selected by `filter`. Events arrive in
    /// commit order.
    fn watch(&self, filter: WatchFilter) -> mpsc::Receiver<StoreEvent>;

    async fn close(&self) -> Result<()>;
}
