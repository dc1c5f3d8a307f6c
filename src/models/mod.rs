//! Records owned by the job store.

mod execution;
mod history;
mod job;

pub use execution::{
    Execution, ExecutionId, ExecutionPatch, ExecutionStateType, PublishedResult,
    RunCommandResult, VerificationResult,
};
pub use history::{JobHistory, JobHistoryType, StateChange};
pub use job::{
    is_short_id, short_id, Job, JobSpec, JobState, JobStateType, JobWithInfo, SHORT_ID_LENGTH,
};
