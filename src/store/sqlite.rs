//! Job store backed by SQLite through `sqlx`.
//!
//! Every write runs in a single transaction behind an in-process write gate.
//! Current state is never updated in place: each transition inserts a new
//! versioned row, and reads pick the row with the highest version.
//! Timestamps are taken and watchers notified while the gate is held.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use tokio::sync::{mpsc, Mutex};

use crate::clock::{to_nanos, Clock, SystemClock};
use crate::config::SqliteConfig;
use crate::error::{Result, StoreError};
use crate::models::{
    short_id, Execution, ExecutionId, ExecutionPatch, ExecutionStateType, Job, JobHistory,
    JobState, JobStateType, JobWithInfo, PublishedResult, RunCommandResult, StateChange,
    VerificationResult,
};

use super::condition::{check_execution, check_job};
use super::query::{filter_history, job_matches, resolve_job_id, sort_and_page};
use super::{
    JobHistoryFilter, JobQuery, JobStore, StoreEvent, StoreEventType, UpdateExecutionRequest,
    UpdateJobStateRequest,
};
use super::watch::{WatchFilter, Watchers};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL UNIQUE,
        short_id TEXT NOT NULL,
        client_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        job TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_short_id ON jobs (short_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_client_id ON jobs (client_id)",
    "CREATE TABLE IF NOT EXISTS job_states (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        current_state INTEGER NOT NULL,
        previous_state INTEGER NOT NULL,
        comment TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        UNIQUE (job_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS job_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (job_id, node_id, execution_id)
    )",
    "CREATE TABLE IF NOT EXISTS node_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        job_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        UNIQUE (node_id, job_id, execution_id)
    )",
    "CREATE TABLE IF NOT EXISTS execution_states (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        current_state INTEGER NOT NULL,
        previous_state INTEGER NOT NULL,
        compute_reference TEXT NOT NULL,
        comment TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        UNIQUE (job_id, node_id, execution_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS execution_outputs (
        job_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        output TEXT NOT NULL,
        PRIMARY KEY (job_id, node_id, execution_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS execution_verification_proposals (
        job_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        proposal BLOB NOT NULL,
        PRIMARY KEY (job_id, node_id, execution_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS execution_verification_results (
        job_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        complete INTEGER NOT NULL,
        result INTEGER NOT NULL,
        PRIMARY KEY (job_id, node_id, execution_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS execution_publish_results (
        job_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        result TEXT NOT NULL,
        PRIMARY KEY (job_id, node_id, execution_id, version)
    )",
];

#[derive(sqlx::FromRow)]
struct JobStateRow {
    version: i64,
    current_state: i64,
    previous_state: i64,
    created_at: i64,
}

#[derive(sqlx::FromRow)]
struct ExecutionStateRow {
    job_id: String,
    node_id: String,
    execution_id: String,
    version: i64,
    current_state: i64,
    previous_state: i64,
    compute_reference: String,
    updated_at: i64,
    created_at: i64,
}

#[derive(sqlx::FromRow)]
struct JobHistoryRow {
    version: i64,
    current_state: i64,
    previous_state: i64,
    comment: String,
    created_at: i64,
    seq: i64,
}

#[derive(sqlx::FromRow)]
struct ExecutionHistoryRow {
    node_id: String,
    execution_id: String,
    version: i64,
    current_state: i64,
    previous_state: i64,
    compute_reference: String,
    comment: String,
    created_at: i64,
    seq: i64,
}

#[derive(sqlx::FromRow)]
struct VerificationRow {
    complete: bool,
    result: bool,
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

fn job_state_type(code: i64) -> Result<JobStateType> {
    JobStateType::from_code(code)
        .ok_or_else(|| StoreError::Internal(format!("unknown job state code {code}")))
}

fn execution_state_type(code: i64) -> Result<ExecutionStateType> {
    ExecutionStateType::from_code(code)
        .ok_or_else(|| StoreError::Internal(format!("unknown execution state code {code}")))
}

fn version(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StoreError::Internal(format!("negative version {value}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub struct SqliteJobStore {
    pool: SqlitePool,
    write_gate: Mutex<()>,
    clock: Arc<dyn Clock>,
    watchers: Watchers,
}

impl SqliteJobStore {
    /// Opens (creating if needed) the database described by `config` and
    /// applies the schema.
    pub async fn connect(config: &SqliteConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = match &config.path {
            Some(path) => {
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
                SqlitePoolOptions::new()
                    .max_connections(config.max_connections.max(1))
                    .connect_with(options)
                    .await?
            }
            None => {
                // Each connection to :memory: is its own database, so pin one.
                let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None::<Duration>)
                    .max_lifetime(None::<Duration>)
                    .connect_with(options)
                    .await?
            }
        };

        let store = Self {
            pool,
            write_gate: Mutex::new(()),
            clock,
            watchers: Watchers::default(),
        };
        store.migrate().await?;

        tracing::info!(
            path = ?config.path,
            max_connections = config.max_connections,
            "Opened SQLite job store"
        );
        Ok(store)
    }

    /// A private in-memory database on the system clock.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&SqliteConfig::in_memory(), Arc::new(SystemClock)).await
    }

    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::info!(tables = SCHEMA.len(), "Applied job store schema");
        Ok(())
    }
}

// ============================================================================
// Row access helpers. All take a single connection so they work both inside a
// write transaction and on a pooled read connection.
// ============================================================================

async fn resolve_id(conn: &mut SqliteConnection, id: &str) -> Result<String> {
    let candidates: Vec<String> =
        sqlx::query_scalar("SELECT job_id FROM jobs WHERE job_id = ?1 OR short_id = ?1 ORDER BY id")
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;
    resolve_job_id(id, candidates)
}

async fn job_exists(conn: &mut SqliteConnection, job_id: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE job_id = ?")
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn load_job(conn: &mut SqliteConnection, job_id: &str) -> Result<Job> {
    let payload: Option<String> = sqlx::query_scalar("SELECT job FROM jobs WHERE job_id = ?")
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;
    let payload = payload.ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
    Ok(serde_json::from_str(&payload)?)
}

async fn latest_job_state(conn: &mut SqliteConnection, job_id: &str) -> Result<JobStateRow> {
    sqlx::query_as::<_, JobStateRow>(
        "SELECT version, current_state, previous_state, created_at
         FROM job_states WHERE job_id = ? ORDER BY version DESC LIMIT 1",
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
}

/// Next per-job history sequence number, shared by job and execution rows.
async fn next_seq(conn: &mut SqliteConnection, job_id: &str) -> Result<i64> {
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(seq) FROM (
             SELECT seq FROM job_states WHERE job_id = ?1
             UNION ALL
             SELECT seq FROM execution_states WHERE job_id = ?1
         )",
    )
    .bind(job_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(max.unwrap_or(0) + 1)
}

async fn load_job_state(conn: &mut SqliteConnection, job: &Job) -> Result<JobState> {
    let row = latest_job_state(&mut *conn, &job.id).await?;
    let executions = load_executions(&mut *conn, &job.id, None).await?;
    Ok(JobState {
        job_id: job.id.clone(),
        state: job_state_type(row.current_state)?,
        previous_state: job_state_type(row.previous_state)?,
        version: version(row.version)?,
        executions,
        create_time: job.created_at,
        update_time: from_nanos(row.created_at),
        timeout_at: job.timeout_at(),
    })
}

/// Latest version of each execution of `job_id`, optionally narrowed to one
/// execution, in creation order.
async fn load_executions(
    conn: &mut SqliteConnection,
    job_id: &str,
    only: Option<&ExecutionId>,
) -> Result<Vec<Execution>> {
    let (node_id, execution_id) = match only {
        Some(id) => (Some(id.node_id.as_str()), Some(id.execution_id.as_str())),
        None => (None, None),
    };

    let rows = sqlx::query_as::<_, ExecutionStateRow>(
        "SELECT es.job_id, es.node_id, es.execution_id, es.version, es.current_state,
                es.previous_state, es.compute_reference, es.created_at AS updated_at,
                je.created_at AS created_at
         FROM execution_states es
         JOIN (
             SELECT job_id, node_id, execution_id, MAX(version) AS version
             FROM execution_states
             WHERE job_id = ?1
             GROUP BY job_id, node_id, execution_id
         ) latest
           ON latest.job_id = es.job_id
          AND latest.node_id = es.node_id
          AND latest.execution_id = es.execution_id
          AND latest.version = es.version
         JOIN job_executions je
           ON je.job_id = es.job_id
          AND je.node_id = es.node_id
          AND je.execution_id = es.execution_id
         WHERE es.job_id = ?1
           AND (?2 IS NULL OR es.node_id = ?2)
           AND (?3 IS NULL OR es.execution_id = ?3)
         ORDER BY je.id",
    )
    .bind(job_id)
    .bind(node_id)
    .bind(execution_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut executions = Vec::with_capacity(rows.len());
    for row in rows {
        let id = ExecutionId::new(row.job_id, row.node_id, row.execution_id);
        let run_output = latest_json(&mut *conn, "execution_outputs", "output", &id)
            .await?
            .map(|json| serde_json::from_str::<RunCommandResult>(&json))
            .transpose()?;
        let verification_proposal: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT proposal FROM execution_verification_proposals
             WHERE job_id = ? AND node_id = ? AND execution_id = ?
             ORDER BY version DESC LIMIT 1",
        )
        .bind(&id.job_id)
        .bind(&id.node_id)
        .bind(&id.execution_id)
        .fetch_optional(&mut *conn)
        .await?;
        let verification_result = sqlx::query_as::<_, VerificationRow>(
            "SELECT complete, result FROM execution_verification_results
             WHERE job_id = ? AND node_id = ? AND execution_id = ?
             ORDER BY version DESC LIMIT 1",
        )
        .bind(&id.job_id)
        .bind(&id.node_id)
        .bind(&id.execution_id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|r| VerificationResult {
            complete: r.complete,
            result: r.result,
        });
        let published_result = latest_json(&mut *conn, "execution_publish_results", "result", &id)
            .await?
            .map(|json| serde_json::from_str::<PublishedResult>(&json))
            .transpose()?;

        executions.push(Execution {
            id,
            compute_reference: row.compute_reference,
            state: execution_state_type(row.current_state)?,
            previous_state: execution_state_type(row.previous_state)?,
            version: version(row.version)?,
            run_output,
            verification_proposal,
            verification_result,
            published_result,
            create_time: from_nanos(row.created_at),
            update_time: from_nanos(row.updated_at),
        });
    }
    Ok(executions)
}

/// Reads the JSON column of the highest-version row of a per-execution
/// payload table. Table and column names come from this module only.
async fn latest_json(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    id: &ExecutionId,
) -> Result<Option<String>> {
    let sql = format!(
        "SELECT {column} FROM {table}
         WHERE job_id = ? AND node_id = ? AND execution_id = ?
         ORDER BY version DESC LIMIT 1"
    );
    let value: Option<String> = sqlx::query_scalar(&sql)
        .bind(&id.job_id)
        .bind(&id.node_id)
        .bind(&id.execution_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value)
}

/// Writes a versioned row for every payload the patch carries.
async fn insert_payloads(
    conn: &mut SqliteConnection,
    id: &ExecutionId,
    version: i64,
    patch: &ExecutionPatch,
) -> Result<()> {
    if let Some(output) = &patch.run_output {
        sqlx::query(
            "INSERT INTO execution_outputs (job_id, node_id, execution_id, version, output)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id.job_id)
        .bind(&id.node_id)
        .bind(&id.execution_id)
        .bind(version)
        .bind(serde_json::to_string(output)?)
        .execute(&mut *conn)
        .await?;
    }
    if let Some(proposal) = &patch.verification_proposal {
        sqlx::query(
            "INSERT INTO execution_verification_proposals
                 (job_id, node_id, execution_id, version, proposal)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id.job_id)
        .bind(&id.node_id)
        .bind(&id.execution_id)
        .bind(version)
        .bind(proposal.as_slice())
        .execute(&mut *conn)
        .await?;
    }
    if let Some(result) = &patch.verification_result {
        sqlx::query(
            "INSERT INTO execution_verification_results
                 (job_id, node_id, execution_id, version, complete, result)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id.job_id)
        .bind(&id.node_id)
        .bind(&id.execution_id)
        .bind(version)
        .bind(result.complete)
        .bind(result.result)
        .execute(&mut *conn)
        .await?;
    }
    if let Some(published) = &patch.published_result {
        sqlx::query(
            "INSERT INTO execution_publish_results (job_id, node_id, execution_id, version, result)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id.job_id)
        .bind(&id.node_id)
        .bind(&id.execution_id)
        .bind(version)
        .bind(serde_json::to_string(published)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_execution_state(
    conn: &mut SqliteConnection,
    execution: &Execution,
    comment: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let seq = next_seq(&mut *conn, &execution.id.job_id).await?;
    sqlx::query(
        "INSERT INTO execution_states
             (job_id, node_id, execution_id, version, current_state, previous_state,
              compute_reference, comment, created_at, seq)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&execution.id.job_id)
    .bind(&execution.id.node_id)
    .bind(&execution.id.execution_id)
    .bind(execution.version as i64)
    .bind(execution.state.code())
    .bind(execution.previous_state.code())
    .bind(&execution.compute_reference)
    .bind(comment)
    .bind(to_nanos(now))
    .bind(seq)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, mut job: Job) -> Result<Job> {
        {
            let _gate = self.write_gate.lock().await;
            let mut tx = self.pool.begin().await?;

            if job_exists(&mut tx, &job.id).await? {
                return Err(StoreError::JobAlreadyExists(job.id));
            }

            let now = self.clock.now();
            job.created_at = now;
            let payload = serde_json::to_string(&job)?;

            let inserted = sqlx::query(
                "INSERT INTO jobs (job_id, short_id, client_id, created_at, job)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&job.id)
            .bind(short_id(&job.id))
            .bind(&job.client_id)
            .bind(to_nanos(now))
            .bind(&payload)
            .execute(&mut *tx)
            .await;
            if let Err(e) = inserted {
                if is_unique_violation(&e) {
                    return Err(StoreError::JobAlreadyExists(job.id));
                }
                return Err(e.into());
            }

            sqlx::query(
                "INSERT INTO job_states
                     (job_id, version, current_state, previous_state, comment, created_at, seq)
                 VALUES (?, 1, ?, ?, 'Job created', ?, 1)",
            )
            .bind(&job.id)
            .bind(JobStateType::New.code())
            .bind(JobStateType::New.code())
            .bind(to_nanos(now))
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
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
        let mut conn = self.pool.acquire().await?;
        let job_id = resolve_id(&mut conn, id).await?;
        load_job(&mut conn, &job_id).await
    }

    async fn get_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let mut conn = self.pool.acquire().await?;
        if let Some(id) = query.id.as_deref().filter(|id| !id.is_empty()) {
            let job_id = resolve_id(&mut conn, id).await?;
            return Ok(vec![load_job(&mut conn, &job_id).await?]);
        }

        let client_id = query
            .client_id
            .as_deref()
            .filter(|c| !query.return_all && !c.is_empty());
        let payloads: Vec<String> = sqlx::query_scalar(
            "SELECT job FROM jobs WHERE (?1 IS NULL OR client_id = ?1) ORDER BY id",
        )
        .bind(client_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut matching = Vec::new();
        for payload in payloads {
            let job: Job = serde_json::from_str(&payload)?;
            if job_matches(query, &job) {
                matching.push(job);
            }
        }
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
        let mut conn = self.pool.acquire().await?;
        let job_id = resolve_id(&mut conn, id).await?;
        let job = load_job(&mut conn, &job_id).await?;
        load_job_state(&mut conn, &job).await
    }

    async fn get_in_progress_jobs(&self) -> Result<Vec<JobWithInfo>> {
        let terminal: Vec<String> = JobStateType::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.code().to_string())
            .collect();
        let sql = format!(
            "SELECT j.job FROM jobs j
             JOIN job_states s ON s.job_id = j.job_id
             WHERE s.version = (SELECT MAX(version) FROM job_states WHERE job_id = j.job_id)
               AND s.current_state NOT IN ({})
             ORDER BY j.id",
            terminal.join(", ")
        );

        let mut conn = self.pool.acquire().await?;
        let payloads: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&mut *conn).await?;

        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let job: Job = serde_json::from_str(&payload)?;
            let state = load_job_state(&mut conn, &job).await?;
            jobs.push(JobWithInfo { job, state });
        }
        Ok(jobs)
    }

    async fn get_job_history(
        &self,
        id: &str,
        filter: &JobHistoryFilter,
    ) -> Result<Vec<JobHistory>> {
        let mut conn = self.pool.acquire().await?;
        let job_id = resolve_id(&mut conn, id).await?;

        let job_rows = sqlx::query_as::<_, JobHistoryRow>(
            "SELECT version, current_state, previous_state, comment, created_at, seq
             FROM job_states WHERE job_id = ? ORDER BY seq",
        )
        .bind(&job_id)
        .fetch_all(&mut *conn)
        .await?;
        let execution_rows = sqlx::query_as::<_, ExecutionHistoryRow>(
            "SELECT node_id, execution_id, version, current_state, previous_state,
                    compute_reference, comment, created_at, seq
             FROM execution_states WHERE job_id = ? ORDER BY seq",
        )
        .bind(&job_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut entries = Vec::with_capacity(job_rows.len() + execution_rows.len());
        for row in job_rows {
            entries.push((
                row.seq,
                JobHistory::job_level(
                    &job_id,
                    StateChange::new(
                        job_state_type(row.previous_state)?,
                        job_state_type(row.current_state)?,
                    ),
                    version(row.version)?,
                    row.comment,
                    from_nanos(row.created_at),
                ),
            ));
        }
        for row in execution_rows {
            let id = ExecutionId::new(&job_id, row.node_id, row.execution_id);
            entries.push((
                row.seq,
                JobHistory::execution_level(
                    &id,
                    &row.compute_reference,
                    StateChange::new(
                        execution_state_type(row.previous_state)?,
                        execution_state_type(row.current_state)?,
                    ),
                    version(row.version)?,
                    row.comment,
                    from_nanos(row.created_at),
                ),
            ));
        }
        entries.sort_by_key(|(seq, _)| *seq);

        Ok(filter_history(
            entries.into_iter().map(|(_, entry)| entry).collect(),
            filter,
        ))
    }

    async fn update_job_state(&self, request: UpdateJobStateRequest) -> Result<u64> {
        let (previous, new_version) = {
            let _gate = self.write_gate.lock().await;
            let mut tx = self.pool.begin().await?;

            let current = latest_job_state(&mut tx, &request.job_id).await?;
            let state = job_state_type(current.current_state)?;
            let current_version = version(current.version)?;

            if let Err(e) = check_job(
                &request.job_id,
                state,
                current_version,
                &request.condition,
                request.new_state,
            ) {
                tracing::warn!(job_id = %request.job_id, error = %e, "Rejected job state update");
                return Err(e);
            }

            let now = self.clock.now();
            let new_version = current_version + 1;
            let seq = next_seq(&mut tx, &request.job_id).await?;
            sqlx::query(
                "INSERT INTO job_states
                     (job_id, version, current_state, previous_state, comment, created_at, seq)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&request.job_id)
            .bind(new_version as i64)
            .bind(request.new_state.code())
            .bind(state.code())
            .bind(&request.comment)
            .bind(to_nanos(now))
            .bind(seq)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            self.watchers.publish(&StoreEvent::job(
                StoreEventType::Updated,
                &request.job_id,
                request.new_state,
                new_version,
                now,
            ));
            (state, new_version)
        };

        tracing::debug!(
            job_id = %request.job_id,
            from = %previous,
            to = %request.new_state,
            version = new_version,
            "Job state updated"
        );
        Ok(new_version)
    }

    async fn create_execution(&self, execution: Execution) -> Result<Execution> {
        let execution = {
            let _gate = self.write_gate.lock().await;
            let mut tx = self.pool.begin().await?;

            if !job_exists(&mut tx, &execution.id.job_id).await? {
                return Err(StoreError::JobNotFound(execution.id.job_id.clone()));
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
            let id = &execution.id;

            let inserted = sqlx::query(
                "INSERT INTO job_executions (job_id, node_id, execution_id, created_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&id.job_id)
            .bind(&id.node_id)
            .bind(&id.execution_id)
            .bind(to_nanos(now))
            .execute(&mut *tx)
            .await;
            if let Err(e) = inserted {
                if is_unique_violation(&e) {
                    return Err(StoreError::ExecutionAlreadyExists(id.clone()));
                }
                return Err(e.into());
            }

            sqlx::query(
                "INSERT INTO node_executions (node_id, job_id, execution_id) VALUES (?, ?, ?)",
            )
            .bind(&id.node_id)
            .bind(&id.job_id)
            .bind(&id.execution_id)
            .execute(&mut *tx)
            .await?;

            insert_execution_state(&mut tx, &execution, "Execution created", now).await?;

            let initial = ExecutionPatch {
                state: None,
                compute_reference: None,
                run_output: execution.run_output.clone(),
                verification_proposal: execution.verification_proposal.clone(),
                verification_result: execution.verification_result,
                published_result: execution.published_result.clone(),
            };
            insert_payloads(&mut tx, id, 1, &initial).await?;

            tx.commit().await?;
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
            let _gate = self.write_gate.lock().await;
            let mut tx = self.pool.begin().await?;

            if !job_exists(&mut tx, &id.job_id).await? {
                return Err(StoreError::JobNotFound(id.job_id.clone()));
            }
            let current = load_executions(&mut tx, &id.job_id, Some(id))
                .await?
                .into_iter()
                .next()
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

            let now = self.clock.now();
            let updated = current.apply(&request.new_values, now);
            insert_execution_state(&mut tx, &updated, &request.comment, now).await?;
            insert_payloads(&mut tx, id, updated.version as i64, &request.new_values).await?;

            tx.commit().await?;
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
        let mut conn = self.pool.acquire().await?;
        let job_id = resolve_id(&mut conn, job_id).await?;
        load_executions(&mut conn, &job_id, None).await
    }

    fn watch(&self, filter: WatchFilter) -> mpsc::Receiver<StoreEvent> {
        self.watchers.subscribe(filter)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        tracing::info!("Closed SQLite job store");
        Ok(())
    }
}
