use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution::Execution;

/// Number of leading characters that make up a job's short ID.
pub const SHORT_ID_LENGTH: usize = 8;

/// Returns the short form of a job ID. IDs no longer than
/// [`SHORT_ID_LENGTH`] are their own short form.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LENGTH) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Returns true if `id` has the shape of a short ID, i.e. it could be the
/// truncated form of a longer job ID.
pub fn is_short_id(id: &str) -> bool {
    id.chars().count() == SHORT_ID_LENGTH
}

/// Job lifecycle values.
///
/// `New → Queued → InProgress → {Completed | CompletedPartially | Error | Cancelled}`.
/// Any non-terminal value may move to any other value; terminal values are
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStateType {
    New,
    Queued,
    InProgress,
    Completed,
    CompletedPartially,
    Error,
    Cancelled,
}

impl JobStateType {
    pub const ALL: [JobStateType; 7] = [
        JobStateType::New,
        JobStateType::Queued,
        JobStateType::InProgress,
        JobStateType::Completed,
        JobStateType::CompletedPartially,
        JobStateType::Error,
        JobStateType::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStateType::Completed
                | JobStateType::CompletedPartially
                | JobStateType::Error
                | JobStateType::Cancelled
        )
    }

    /// Stable integer code used by the durable backend.
    pub fn code(&self) -> i64 {
        match self {
            JobStateType::New => 0,
            JobStateType::Queued => 1,
            JobStateType::InProgress => 2,
            JobStateType::Completed => 3,
            JobStateType::CompletedPartially => 4,
            JobStateType::Error => 5,
            JobStateType::Cancelled => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

impl std::fmt::Display for JobStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStateType::New => write!(f, "new"),
            JobStateType::Queued => write!(f, "queued"),
            JobStateType::InProgress => write!(f, "in_progress"),
            JobStateType::Completed => write!(f, "completed"),
            JobStateType::CompletedPartially => write!(f, "completed_partially"),
            JobStateType::Error => write!(f, "error"),
            JobStateType::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.to_string() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// What a job runs and how long it may take.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Execution engine, e.g. "docker" or "wasm".
    pub engine: String,
    /// Entrypoint and arguments handed to the engine.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Number of nodes that should run the job.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Overall timeout in seconds. Zero means no timeout.
    #[serde(default)]
    pub timeout_secs: u64,
    /// Free-form tags used by job queries.
    #[serde(default)]
    pub annotations: Vec<String>,
}

fn default_concurrency() -> u32 {
    1
}

/// Immutable job submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub client_id: String,
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(client_id: impl Into<String>, spec: JobSpec) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), client_id, spec)
    }

    pub fn with_id(id: impl Into<String>, client_id: impl Into<String>, spec: JobSpec) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            spec,
            created_at: Utc::now(),
        }
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Deadline for the job, if it has a timeout.
    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        if self.spec.timeout_secs == 0 {
            return None;
        }
        let secs = i64::try_from(self.spec.timeout_secs).ok()?;
        self.created_at
            .checked_add_signed(Duration::try_seconds(secs)?)
    }
}

/// Current lifecycle record of a job, with the latest version of every
/// execution that belongs to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub state: JobStateType,
    pub previous_state: JobStateType,
    pub version: u64,
    pub executions: Vec<Execution>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A job paired with its current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobWithInfo {
    pub job: Job,
    pub state: JobState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_job_states() {
        let terminal: Vec<_> = JobStateType::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                JobStateType::Completed,
                JobStateType::CompletedPartially,
                JobStateType::Error,
                JobStateType::Cancelled,
            ]
        );
    }

    #[test]
    fn state_codes_are_unique_and_reversible() {
        for state in JobStateType::ALL {
            assert_eq!(JobStateType::from_code(state.code()), Some(state));
        }
        assert_eq!(JobStateType::from_code(99), None);
    }

    #[test]
    fn state_parses_from_display_form() {
        for state in JobStateType::ALL {
            assert_eq!(state.to_string().parse::<JobStateType>(), Ok(state));
        }
        assert!("running".parse::<JobStateType>().is_err());
    }

    #[test]
    fn short_id_truncates_long_ids() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
        assert!(is_short_id("01234567"));
        assert!(!is_short_id("0123456789"));
    }

    #[test]
    fn timeout_at_adds_spec_timeout() {
        let mut job = Job::with_id("j1", "client", JobSpec::default());
        assert_eq!(job.timeout_at(), None);

        job.spec.timeout_secs = 30;
        assert_eq!(
            job.timeout_at(),
            Some(job.created_at + Duration::seconds(30))
        );
    }

    #[test]
    fn new_job_gets_uuid() {
        let job = Job::new("client", JobSpec::default());
        assert!(Uuid::parse_str(&job.id).is_ok());
        assert_eq!(job.short_id().len(), SHORT_ID_LENGTH);
    }
}
