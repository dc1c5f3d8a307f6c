//! Preconditions for conditional updates.
//!
//! Evaluation is pure: it looks only at the current lifecycle value and
//! version handed in by the caller, which must have been read inside the same
//! atomic unit as the write that follows.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::models::{ExecutionId, ExecutionStateType, JobStateType};

/// A lifecycle enum with an absorbing terminal set.
pub trait Lifecycle: Copy + PartialEq + Display {
    fn is_terminal(&self) -> bool;
}

impl Lifecycle for JobStateType {
    fn is_terminal(&self) -> bool {
        JobStateType::is_terminal(self)
    }
}

impl Lifecycle for ExecutionStateType {
    fn is_terminal(&self) -> bool {
        ExecutionStateType::is_terminal(self)
    }
}

/// Caller-declared preconditions. An empty condition always passes unless
/// the record is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize", deserialize = "S: Deserialize<'de>"))]
pub struct UpdateCondition<S> {
    #[serde(default)]
    pub expected_state: Option<S>,
    /// `Some(0)` is treated the same as `None`.
    #[serde(default)]
    pub expected_version: Option<u64>,
    #[serde(default)]
    pub unexpected_states: Vec<S>,
}

impl<S> Default for UpdateCondition<S> {
    fn default() -> Self {
        Self {
            expected_state: None,
            expected_version: None,
            unexpected_states: Vec::new(),
        }
    }
}

pub type JobCondition = UpdateCondition<JobStateType>;
pub type ExecutionCondition = UpdateCondition<ExecutionStateType>;

/// Why a condition rejected a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionFailure<S> {
    AlreadyTerminal,
    StateMismatch { expected: S },
    UnexpectedState { unexpected: Vec<S> },
    VersionMismatch { expected: u64 },
}

impl<S: Lifecycle> UpdateCondition<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_state(mut self, state: S) -> Self {
        self.expected_state = Some(state);
        self
    }

    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn reject_state(mut self, state: S) -> Self {
        self.unexpected_states.push(state);
        self
    }

    /// Checks the condition against a record's current state and version.
    ///
    /// A terminal record fails with `AlreadyTerminal` whatever the condition
    /// says. Otherwise the expected state, expected version and unexpected
    /// states are checked in that order.
    pub fn evaluate(
        &self,
        current: S,
        version: u64,
    ) -> std::result::Result<(), ConditionFailure<S>> {
        if current.is_terminal() {
            return Err(ConditionFailure::AlreadyTerminal);
        }
        if let Some(expected) = self.expected_state {
            if expected != current {
                return Err(ConditionFailure::StateMismatch { expected });
            }
        }
        if let Some(expected) = self.expected_version.filter(|v| *v != 0) {
            if expected != version {
                return Err(ConditionFailure::VersionMismatch { expected });
            }
        }
        if self.unexpected_states.contains(&current) {
            return Err(ConditionFailure::UnexpectedState {
                unexpected: self.unexpected_states.clone(),
            });
        }
        Ok(())
    }
}

fn describe_unexpected<S: Display>(states: &[S]) -> String {
    let names: Vec<String> = states.iter().map(ToString::to_string).collect();
    format!("none of [{}]", names.join(", "))
}

/// Validates a job transition, mapping failures to store errors.
pub fn check_job(
    job_id: &str,
    current: JobStateType,
    version: u64,
    condition: &JobCondition,
    new_state: JobStateType,
) -> Result<()> {
    condition
        .evaluate(current, version)
        .map_err(|failure| match failure {
            ConditionFailure::AlreadyTerminal => StoreError::JobAlreadyTerminal {
                job_id: job_id.to_string(),
                state: current,
                new_state,
            },
            ConditionFailure::StateMismatch { expected } => StoreError::InvalidJobState {
                job_id: job_id.to_string(),
                actual: current,
                expected: expected.to_string(),
            },
            ConditionFailure::UnexpectedState { unexpected } => StoreError::InvalidJobState {
                job_id: job_id.to_string(),
                actual: current,
                expected: describe_unexpected(&unexpected),
            },
            ConditionFailure::VersionMismatch { expected } => StoreError::InvalidJobVersion {
                job_id: job_id.to_string(),
                actual: version,
                expected,
            },
        })
}

/// Validates an execution transition, mapping failures to store errors.
pub fn check_execution(
    id: &ExecutionId,
    current: ExecutionStateType,
    version: u64,
    condition: &ExecutionCondition,
    new_state: ExecutionStateType,
) -> Result<()> {
    condition
        .evaluate(current, version)
        .map_err(|failure| match failure {
            ConditionFailure::AlreadyTerminal => StoreError::ExecutionAlreadyTerminal {
                id: id.clone(),
                state: current,
                new_state,
            },
            ConditionFailure::StateMismatch { expected } => StoreError::InvalidExecutionState {
                id: id.clone(),
                actual: current,
                expected: expected.to_string(),
            },
            ConditionFailure::UnexpectedState { unexpected } => {
                StoreError::InvalidExecutionState {
                    id: id.clone(),
                    actual: current,
                    expected: describe_unexpected(&unexpected),
                }
            }
            ConditionFailure::VersionMismatch { expected } => {
                StoreError::InvalidExecutionVersion {
                    id: id.clone(),
                    actual: version,
                    expected,
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_condition_passes_for_non_terminal() {
        let cond = JobCondition::new();
        for state in JobStateType::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(cond.evaluate(state, 7), Ok(()));
        }
    }

    #[test]
    fn terminal_wins_over_everything() {
        let cond = JobCondition::new()
            .expect_state(JobStateType::Completed)
            .expect_version(3);
        assert_eq!(
            cond.evaluate(JobStateType::Completed, 3),
            Err(ConditionFailure::AlreadyTerminal)
        );
    }

    #[test]
    fn expected_state_mismatch() {
        let cond = JobCondition::new().expect_state(JobStateType::Queued);
        assert_eq!(
            cond.evaluate(JobStateType::New, 1),
            Err(ConditionFailure::StateMismatch {
                expected: JobStateType::Queued
            })
        );
    }

    #[test]
    fn zero_expected_version_is_ignored() {
        let cond = JobCondition::new().expect_version(0);
        assert_eq!(cond.evaluate(JobStateType::New, 5), Ok(()));

        let cond = JobCondition::new().expect_version(4);
        assert_eq!(
            cond.evaluate(JobStateType::New, 5),
            Err(ConditionFailure::VersionMismatch { expected: 4 })
        );
    }

    #[test]
    fn unexpected_states_reject_membership() {
        let cond = ExecutionCondition::new()
            .reject_state(ExecutionStateType::Running)
            .reject_state(ExecutionStateType::BidAccepted);
        assert!(cond.evaluate(ExecutionStateType::New, 1).is_ok());
        assert!(matches!(
            cond.evaluate(ExecutionStateType::Running, 1),
            Err(ConditionFailure::UnexpectedState { .. })
        ));
    }

    #[test]
    fn check_job_maps_to_error_kinds() {
        let err = check_job(
            "j1",
            JobStateType::New,
            2,
            &JobCondition::new().expect_version(1),
            JobStateType::Queued,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidVersion);

        let err = check_job(
            "j1",
            JobStateType::Cancelled,
            2,
            &JobCondition::new(),
            JobStateType::Queued,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyTerminal);

        let err = check_job(
            "j1",
            JobStateType::New,
            1,
            &JobCondition::new().reject_state(JobStateType::New),
            JobStateType::Queued,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.to_string(), "job j1 is in state new but expected none of [new]");
    }

    #[test]
    fn check_execution_maps_to_error_kinds() {
        let id = ExecutionId::new("j1", "n1", "e1");
        let err = check_execution(
            &id,
            ExecutionStateType::New,
            1,
            &ExecutionCondition::new().expect_state(ExecutionStateType::AskForBid),
            ExecutionStateType::Running,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err = check_execution(
            &id,
            ExecutionStateType::Failed,
            4,
            &ExecutionCondition::new(),
            ExecutionStateType::Running,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyTerminal);
    }
}
