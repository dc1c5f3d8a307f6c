//! Job store held entirely in process memory.
//!
//! All tables sit behind one `RwLock`. Writers hold the write half for the
//! whole read, validate, write and append sequence, so two racing
//! conditional updates can never both pass against the same version. The
//! clock is read and watchers are notified under the same hold, so version
//! order, history time order and event order agree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError};
use crate::models::{
    is_short_id, short_id, Execution, ExecutionId, ExecutionStateType, Job, JobHistory,
    JobState, JobStateType, JobWithInfo, StateChange,
};

use super::condition::{check_execution, check_job};
use super::query::{filter_history, job_matches, resolve_job_id, sort_and_page};
use super::{
    JobHistoryFilter, JobQuery, JobStore, StoreEvent, StoreEventType, UpdateExecutionRequest,
    UpdateJobStateRequest,
};
use super::watch::{WatchFilter, Watchers};

struct JobEntry {
    job: Job,
    state: JobStateType,
    previous_state: JobStateType,
    version: u64,
    update_time: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<String, JobEntry>,
    /// Job IDs in creation order.
    job_order: Vec<String>,
    executions: HashMap<ExecutionId, Execution>,
    /// Execution IDs per job in creation order.
    job_executions: HashMap<String, Vec<ExecutionId>>,
    history: HashMap<String, Vec<JobHistory>>,
    in_progress: HashSet<String>,
}

impl Tables {
    fn resolve(&self, id: &str) -> Result<String> {
        if self.jobs.contains_key(id) {
            return Ok(id.to_string());
        }
        let candidates = if is_short_id(id) {
            self.job_order
                .iter()
                .filter(|full| short_id(full) == id)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        resolve_job_id(id, candidates)
    }

    fn entry(&self, id: &str) -> Result<&JobEntry> {
        let id = self.resolve(id)?;
        self.jobs.get(&id).ok_or(StoreError::JobNotFound(id))
    }

    fn executions_of(&self, job_id: &str) -> Vec<Execution> {
        self.job_executions
            .get(job_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.executions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn job_state(&self, entry: &JobEntry) -> JobState {
        JobState {
            job_id: entry.job.id.clone(),
            state: entry.state,
            previous_state: entry.previous_state,
            version: entry.version,
            executions: self.executions_of(&entry.job.id),
            create_time: entry.job.created_at,
            update_time: entry.update_time,
            timeout_at: entry.job.timeout_at(),
        }
    }

    fn append_history(&mut self, entry: JobHistory) {
        self.history
            .entry(entry.job_id.clone())
            .or_default()
            .push(entry);
    }
}

pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    watchers: Watchers,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        tracing::info!("Created in-memory job store");
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
            watchers: Watchers::default(),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, mut job: Job) -> Result<Job> {
        {
            let mut tables = self.tables.write().await;
            if tables.jobs.contains_key(&job.id) {
                return Err(StoreError::JobAlreadyExists(job.id));
            }

            // Read under the lock so commit order and time order agree.
            let now = self.clock.now();
            job.created_at = now;

            tables.jobs.insert(
                job.id.clone(),
                JobEntry {
                    job: job.clone(),
                    state: JobStateType::New,
                    previous_state: JobStateType::New,
                    version: 1,
                    update_time: now,
                },
            );
            tables.job_order.push(job.id.clone());
            tables.in_progress.insert(job.id.clone());
            tables.append_history(JobHistory::job_level(
                &job.id,
                StateChange::new(JobStateType::New, JobStateType::New),
                1,
                "Job created",
                now,
            ));
            self.watchers.publish(&StoreEvent::job(
                StoreEventType::Created,
                &job.id,
                JobStateType::New,
                1,
                now,
            ));
        }

        tracing::debug!(job_id = %job.id, client_id = %job.client_id, "Job created");
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        let tables = self.tables.read().await;
        Ok(tables.entry(id)?.job.clone())
    }

    async fn get_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let tables = self.tables.read().await;
        if let Some(id) = query.id.as_deref().filter(|id| !id.is_empty()) {
            return Ok(vec![tables.entry(id)?.job.clone()]);
        }

        let matching: Vec<Job> = tables
            .job_order
            .iter()
            .filter_map(|id| tables.jobs.get(id))
            .filter(|entry| job_matches(query, &entry.job))
            .map(|entry| entry.job.clone())
            .collect();
        Ok(sort_and_page(matching, query))
    }

    async fn get_jobs_count(&self, query: &JobQuery) -> Result<usize> {
        let unpaged = JobQuery {
            limit: 0,
            offset: 0,
            ..query.clone()
        };
        Ok(self.get_jobs(&unpaged).await?.len())
    }

    async fn get_job_state(&self, id: &str) -> Result<JobState> {
        let tables = self.tables.read().await;
        let entry = tables.entry(id)?;
        Ok(tables.job_state(entry))
    }

    async fn get_in_progress_jobs(&self) -> Result<Vec<JobWithInfo>> {
        let tables = self.tables.read().await;
        Ok(tables
            .job_order
            .iter()
            .filter(|id| tables.in_progress.contains(*id))
            .filter_map(|id| tables.jobs.get(id))
            .map(|entry| JobWithInfo {
                job: entry.job.clone(),
                state: tables.job_state(entry),
            })
            .collect())
    }

    async fn get_job_history(
        &self,
        id: &str,
        filter: &JobHistoryFilter,
    ) -> Result<Vec<JobHistory>> {
        let tables = self.tables.read().await;
        let job_id = tables.resolve(id)?;
        let entries = tables.history.get(&job_id).cloned().unwrap_or_default();
        Ok(filter_history(entries, filter))
    }

    async fn update_job_state(&self, request: UpdateJobStateRequest) -> Result<u64> {
        let (previous, version) = {
            let mut tables = self.tables.write().await;
            let entry = tables
                .jobs
                .get_mut(&request.job_id)
                .ok_or_else(|| StoreError::JobNotFound(request.job_id.clone()))?;

            if let Err(e) = check_job(
                &request.job_id,
                entry.state,
                entry.version,
                &request.condition,
                request.new_state,
            ) {
                tracing::warn!(job_id = %request.job_id, error = %e, "Rejected job state update");
                return Err(e);
            }

            let now = self.clock.now();
            let previous = entry.state;
            entry.previous_state = previous;
            entry.state = request.new_state;
            entry.version += 1;
            entry.update_time = now;
            let version = entry.version;

            if request.new_state.is_terminal() {
                tables.in_progress.remove(&request.job_id);
            } else {
                tables.in_progress.insert(request.job_id.clone());
            }
            tables.append_history(JobHistory::job_level(
                &request.job_id,
                StateChange::new(previous, request.new_state),
                version,
                request.comment.clone(),
                now,
            ));
            self.watchers.publish(&StoreEvent::job(
                StoreEventType::Updated,
                &request.job_id,
                request.new_state,
                version,
                now,
            ));
            (previous, version)
        };

        tracing::debug!(
            job_id = %request.job_id,
            from = %previous,
            to = %request.new_state,
            version,
            "Job state updated"
        );
        Ok(version)
    }

    async fn create_execution(&self, execution: Execution) -> Result<Execution> {
        let execution = {
            let mut tables = self.tables.write().await;
            if !tables.jobs.contains_key(&execution.id.job_id) {
                return Err(StoreError::JobNotFound(execution.id.job_id.clone()));
            }
            if tables.executions.contains_key(&execution.id) {
                return Err(StoreError::ExecutionAlreadyExists(execution.id.clone()));
            }

            let now = self.clock.now();
            let execution = Execution {
                state: ExecutionStateType::New,
                previous_state: ExecutionStateType::New,
                version: 1,
                create_time: now,
                update_time: now,
                ..execution
            };

            tables
                .executions
                .insert(execution.id.clone(), execution.clone());
            tables
                .job_executions
                .entry(execution.id.job_id.clone())
                .or_default()
                .push(execution.id.clone());
            tables.append_history(JobHistory::execution_level(
                &execution.id,
                &execution.compute_reference,
                StateChange::new(ExecutionStateType::New, ExecutionStateType::New),
                1,
                "Execution created",
                now,
            ));
            self.watchers
                .publish(&StoreEvent::execution(StoreEventType::Created, &execution));
            execution
        };

        tracing::debug!(execution_id = %execution.id, "Execution created");
        Ok(execution)
    }

    async fn update_execution(&self, request: UpdateExecutionRequest) -> Result<Execution> {
        let id = &request.execution_id;

        let updated = {
            let mut tables = self.tables.write().await;
            if !tables.jobs.contains_key(&id.job_id) {
                return Err(StoreError::JobNotFound(id.job_id.clone()));
            }
            let current = tables
                .executions
                .get(id)
                .ok_or_else(|| StoreError::ExecutionNotFound(id.clone()))?;

            let new_state = request.new_values.target_state(current.state);
            if let Err(e) = check_execution(
                id,
                current.state,
                current.version,
                &request.condition,
                new_state,
            ) {
                tracing::warn!(execution_id = %id, error = %e, "Rejected execution update");
                return Err(e);
            }

            let updated = current.apply(&request.new_values, self.clock.now());
            tables.append_history(JobHistory::execution_level(
                id,
                &updated.compute_reference,
                StateChange::new(updated.previous_state, updated.state),
                updated.version,
                request.comment.clone(),
                updated.update_time,
            ));
            tables.executions.insert(id.clone(), updated.clone());
            self.watchers
                .publish(&StoreEvent::execution(StoreEventType::Updated, &updated));
            updated
        };

        tracing::debug!(
            execution_id = %id,
            from = %updated.previous_state,
            to = %updated.state,
            version = updated.version,
            "Execution updated"
        );
        Ok(updated)
    }

    async fn get_executions(&self, job_id: &str) -> Result<Vec<Execution>> {
        let tables = self.tables.read().await;
        let job_id = tables.resolve(job_id)?;
        Ok(tables.executions_of(&job_id))
    }

    fn watch(&self, filter: WatchFilter) -> mpsc::Receiver<StoreEvent> {
        self.watchers.subscribe(filter)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
