use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution lifecycle values.
///
/// `New → AskForBid → {AskForBidAccepted | AskForBidRejected} → BidAccepted →
/// Running → ResultProposed → {ResultAccepted → PublishingResults → Completed |
/// ResultRejected}`, with `Failed` and `Canceled` reachable from any non-terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStateType {
    New,
    AskForBid,
    AskForBidAccepted,
    AskForBidRejected,
    BidAccepted,
    BidRejected,
    Running,
    ResultProposed,
    ResultAccepted,
    ResultRejected,
    PublishingResults,
    Completed,
    Failed,
    Canceled,
}

impl ExecutionStateType {
    pub const ALL: [ExecutionStateType; 14] = [
        ExecutionStateType::New,
        ExecutionStateType::AskForBid,
        ExecutionStateType::AskForBidAccepted,
        ExecutionStateType::AskForBidRejected,
        ExecutionStateType::BidAccepted,
        ExecutionStateType::BidRejected,
        ExecutionStateType::Running,
        ExecutionStateType::ResultProposed,
        ExecutionStateType::ResultAccepted,
        ExecutionStateType::ResultRejected,
        ExecutionStateType::PublishingResults,
        ExecutionStateType::Completed,
        ExecutionStateType::Failed,
        ExecutionStateType::Canceled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStateType::AskForBidRejected
                | ExecutionStateType::BidRejected
                | ExecutionStateType::ResultRejected
                | ExecutionStateType::Completed
                | ExecutionStateType::Failed
                | ExecutionStateType::Canceled
        )
    }

    /// Stable integer code used by the durable backend.
    pub fn code(&self) -> i64 {
        match self {
            ExecutionStateType::New => 0,
            ExecutionStateType::AskForBid => 1,
            ExecutionStateType::AskForBidAccepted => 2,
            ExecutionStateType::AskForBidRejected => 3,
            ExecutionStateType::BidAccepted => 4,
            ExecutionStateType::BidRejected => 5,
            ExecutionStateType::Running => 6,
            ExecutionStateType::ResultProposed => 7,
            ExecutionStateType::ResultAccepted => 8,
            ExecutionStateType::ResultRejected => 9,
            ExecutionStateType::PublishingResults => 10,
            ExecutionStateType::Completed => 11,
            ExecutionStateType::Failed => 12,
            ExecutionStateType::Canceled => 13,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

impl std::fmt::Display for ExecutionStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStateType::New => "new",
            ExecutionStateType::AskForBid => "ask_for_bid",
            ExecutionStateType::AskForBidAccepted => "ask_for_bid_accepted",
            ExecutionStateType::AskForBidRejected => "ask_for_bid_rejected",
            ExecutionStateType::BidAccepted => "bid_accepted",
            ExecutionStateType::BidRejected => "bid_rejected",
            ExecutionStateType::Running => "running",
            ExecutionStateType::ResultProposed => "result_proposed",
            ExecutionStateType::ResultAccepted => "result_accepted",
            ExecutionStateType::ResultRejected => "result_rejected",
            ExecutionStateType::PublishingResults => "publishing_results",
            ExecutionStateType::Completed => "completed",
            ExecutionStateType::Failed => "failed",
            ExecutionStateType::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Identifies one node's attempt at a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId {
    pub job_id: String,
    pub node_id: String,
    pub execution_id: String,
}

impl ExecutionId {
    pub fn new(
        job_id: impl Into<String>,
        node_id: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            node_id: node_id.into(),
            execution_id: execution_id.into(),
        }
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.job_id, self.node_id, self.execution_id)
    }
}

/// Output of running an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandResult {
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    pub exit_code: i32,
    pub error_msg: String,
}

/// Outcome of verifying a proposed result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub complete: bool,
    pub result: bool,
}

/// Where a published result can be fetched from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedResult {
    pub storage_type: String,
    pub name: String,
    pub location: String,
}

/// One node's attempt to run a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    /// Reference assigned by the compute node, empty until it bids.
    pub compute_reference: String,
    pub state: ExecutionStateType,
    pub previous_state: ExecutionStateType,
    pub version: u64,
    pub run_output: Option<RunCommandResult>,
    pub verification_proposal: Option<Vec<u8>>,
    pub verification_result: Option<VerificationResult>,
    pub published_result: Option<PublishedResult>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Execution {
    /// A fresh execution in `New` at version 1. The store overwrites the
    /// timestamps on insert.
    pub fn new(id: ExecutionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            compute_reference: String::new(),
            state: ExecutionStateType::New,
            previous_state: ExecutionStateType::New,
            version: 1,
            run_output: None,
            verification_proposal: None,
            verification_result: None,
            published_result: None,
            create_time: now,
            update_time: now,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.id.job_id
    }

    pub fn node_id(&self) -> &str {
        &self.id.node_id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies `patch` on top of this record and returns the next version.
    /// Fields the patch leaves unset are carried over unchanged.
    pub fn apply(&self, patch: &ExecutionPatch, update_time: DateTime<Utc>) -> Execution {
        Execution {
            id: self.id.clone(),
            compute_reference: patch
                .compute_reference
                .clone()
                .unwrap_or_else(|| self.compute_reference.clone()),
            state: patch.state.unwrap_or(self.state),
            previous_state: self.state,
            version: self.version + 1,
            run_output: patch.run_output.clone().or_else(|| self.run_output.clone()),
            verification_proposal: patch
                .verification_proposal
                .clone()
                .or_else(|| self.verification_proposal.clone()),
            verification_result: patch.verification_result.or(self.verification_result),
            published_result: patch
                .published_result
                .clone()
                .or_else(|| self.published_result.clone()),
            create_time: self.create_time,
            update_time,
        }
    }
}

/// Partial execution record. Every `Some` field replaces the stored value;
/// `None` keeps it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPatch {
    pub state: Option<ExecutionStateType>,
    pub compute_reference: Option<String>,
    pub run_output: Option<RunCommandResult>,
    pub verification_proposal: Option<Vec<u8>>,
    pub verification_result: Option<VerificationResult>,
    pub published_result: Option<PublishedResult>,
}

impl ExecutionPatch {
    pub fn state(state: ExecutionStateType) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn with_compute_reference(mut self, reference: impl Into<String>) -> Self {
        self.compute_reference = Some(reference.into());
        self
    }

    pub fn with_run_output(mut self, output: RunCommandResult) -> Self {
        self.run_output = Some(output);
        self
    }

    pub fn with_verification_proposal(mut self, proposal: Vec<u8>) -> Self {
        self.verification_proposal = Some(proposal);
        self
    }

    pub fn with_verification_result(mut self, result: VerificationResult) -> Self {
        self.verification_result = Some(result);
        self
    }

    pub fn with_published_result(mut self, result: PublishedResult) -> Self {
        self.published_result = Some(result);
        self
    }

    /// The state the execution will be in once the patch is applied.
    pub fn target_state(&self, current: ExecutionStateType) -> ExecutionStateType {
        self.state.unwrap_or(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> Execution {
        Execution::new(ExecutionId::new("job", "node", "exec"))
    }

    #[test]
    fn apply_bumps_version_and_shifts_state() {
        let exec = execution();
        let now = Utc::now();
        let next = exec.apply(&ExecutionPatch::state(ExecutionStateType::AskForBid), now);

        assert_eq!(next.version, 2);
        assert_eq!(next.state, ExecutionStateType::AskForBid);
        assert_eq!(next.previous_state, ExecutionStateType::New);
        assert_eq!(next.create_time, exec.create_time);
        assert_eq!(next.update_time, now);
    }

    #[test]
    fn apply_keeps_unset_fields() {
        let mut exec = execution();
        exec.compute_reference = "ref-1".to_string();
        exec.run_output = Some(RunCommandResult {
            stdout: "hello".to_string(),
            ..Default::default()
        });

        let patch = ExecutionPatch::default().with_verification_result(VerificationResult {
            complete: true,
            result: true,
        });
        let next = exec.apply(&patch, Utc::now());

        assert_eq!(next.state, ExecutionStateType::New);
        assert_eq!(next.compute_reference, "ref-1");
        assert_eq!(next.run_output.as_ref().unwrap().stdout, "hello");
        assert!(next.verification_result.unwrap().result);
    }

    #[test]
    fn apply_overwrites_set_fields() {
        let mut exec = execution();
        exec.compute_reference = "old".to_string();
        let next = exec.apply(
            &ExecutionPatch::state(ExecutionStateType::Running).with_compute_reference("new"),
            Utc::now(),
        );
        assert_eq!(next.compute_reference, "new");
        assert_eq!(next.state, ExecutionStateType::Running);
    }

    #[test]
    fn terminal_execution_states() {
        for state in ExecutionStateType::ALL {
            let expected = matches!(
                state,
                ExecutionStateType::AskForBidRejected
                    | ExecutionStateType::BidRejected
                    | ExecutionStateType::ResultRejected
                    | ExecutionStateType::Completed
                    | ExecutionStateType::Failed
                    | ExecutionStateType::Canceled
            );
            assert_eq!(state.is_terminal(), expected, "{state}");
            assert_eq!(ExecutionStateType::from_code(state.code()), Some(state));
        }
    }
}
