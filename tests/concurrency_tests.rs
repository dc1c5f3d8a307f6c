//! Racing writers against every backend.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use jobstore_lite::clock::{Clock, SystemClock};
use jobstore_lite::config::{open_store, SqliteConfig, StoreConfig};
use jobstore_lite::models::{
    Execution, ExecutionId, ExecutionPatch, ExecutionStateType, Job, JobSpec, JobStateType,
};
use jobstore_lite::store::{
    ExecutionCondition, JobCondition, JobHistoryFilter, JobStore, UpdateExecutionRequest,
    UpdateJobStateRequest,
};
use jobstore_lite::ErrorKind;

const WRITERS: usize = 16;

/// Whole seconds from the epoch, one per call. The caller that draws
/// `stall_at` is held for a while before getting its timestamp.
struct StallingClock {
    ticks: AtomicI64,
    stall_at: i64,
}

impl Clock for StallingClock {
    fn now(&self) -> DateTime<Utc> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        if tick == self.stall_at {
            std::thread::sleep(Duration::from_millis(200));
        }
        DateTime::from_timestamp(tick, 0).unwrap()
    }
}

fn configs(dir: &TempDir) -> [StoreConfig; 3] {
    [
        StoreConfig::in_memory(),
        StoreConfig::sqlite(SqliteConfig::in_memory()),
        StoreConfig::sqlite(SqliteConfig::file(dir.path().join("race.db")).with_max_connections(4)),
    ]
}

async fn stores() -> (Vec<Arc<dyn JobStore>>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut stores = Vec::new();
    for config in &configs(&dir) {
        stores.push(open_store(config, Arc::new(SystemClock)).await.unwrap());
    }
    (stores, dir)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_writer_wins_a_version() {
    let (stores, _dir) = stores().await;
    for store in stores {
        store
            .create_job(Job::with_id("race", "client", JobSpec::default()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..WRITERS {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_job_state(
                        UpdateJobStateRequest::new("race", JobStateType::Queued)
                            .with_condition(JobCondition::new().expect_version(1))
                            .with_comment(format!("writer {i}")),
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(version) => {
                    assert_eq!(version, 2);
                    winners += 1;
                }
                Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidVersion),
            }
        }
        assert_eq!(winners, 1);

        let state = store.get_job_state("race").await.unwrap();
        assert_eq!(state.version, 2);
        let history = store
            .get_job_history("race", &JobHistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        store.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retrying_writers_never_lose_updates() {
    const ROUNDS: usize = 5;

    let (stores, _dir) = stores().await;
    for store in stores {
        store
            .create_job(Job::with_id("counter", "client", JobSpec::default()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..WRITERS / 2 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..ROUNDS {
                    loop {
                        let current = store.get_job_state("counter").await.unwrap();
                        let next = if round % 2 == 0 {
                            JobStateType::Queued
                        } else {
                            JobStateType::InProgress
                        };
                        let result = store
                            .update_job_state(
                                UpdateJobStateRequest::new("counter", next).with_condition(
                                    JobCondition::new().expect_version(current.version),
                                ),
                            )
                            .await;
                        match result {
                            Ok(_) => break,
                            Err(e) if e.kind() == ErrorKind::InvalidVersion => continue,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let expected = 1 + (WRITERS / 2 * ROUNDS) as u64;
        let state = store.get_job_state("counter").await.unwrap();
        assert_eq!(state.version, expected);

        let history = store
            .get_job_history("counter", &JobHistoryFilter::default())
            .await
            .unwrap();
        let versions: Vec<u64> = history.iter().map(|e| e.new_version).collect();
        assert_eq!(versions, (1..=expected).collect::<Vec<_>>());
        store.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_execution_bids_are_serialized() {
    let (stores, _dir) = stores().await;
    for store in stores {
        store
            .create_job(Job::with_id("bids", "client", JobSpec::default()))
            .await
            .unwrap();
        let exec_id = ExecutionId::new("bids", "node-1", "exec-1");
        store
            .create_execution(Execution::new(exec_id.clone()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..WRITERS {
            let store = store.clone();
            let exec_id = exec_id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_execution(
                        UpdateExecutionRequest::new(
                            exec_id,
                            ExecutionPatch::state(ExecutionStateType::AskForBid)
                                .with_compute_reference(format!("ref-{i}")),
                        )
                        .with_condition(
                            ExecutionCondition::new().expect_state(ExecutionStateType::New),
                        ),
                    )
                    .await
            }));
        }

        let mut winner = None;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(execution) => {
                    assert!(winner.is_none(), "two writers passed the same condition");
                    winner = Some(execution);
                }
                Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidState),
            }
        }

        let winner = winner.unwrap();
        let stored = store.get_executions("bids").await.unwrap();
        assert_eq!(stored, vec![winner]);
        assert_eq!(stored[0].version, 2);
        store.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_creates_of_same_job() {
    let (stores, _dir) = stores().await;
    for store in stores {
        let mut handles = Vec::new();
        for i in 0..WRITERS {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create_job(Job::with_id("dup", format!("client-{i}"), JobSpec::default()))
                    .await
            }));
        }

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_eq!(e.kind(), ErrorKind::AlreadyExists),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(
            store
                .get_job_history("dup", &JobHistoryFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
        store.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_history_time_follows_version_order() {
    let dir = tempfile::tempdir().unwrap();
    for config in &configs(&dir) {
        let clock = Arc::new(StallingClock {
            ticks: AtomicI64::new(0),
            stall_at: 1,
        });
        let store = open_store(config, clock).await.unwrap();
        store
            .create_job(Job::with_id("ordered", "client", JobSpec::default()))
            .await
            .unwrap();

        // The first writer draws the stalled tick; the second arrives while
        // it is still waiting on the clock.
        let first = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .update_job_state(
                        UpdateJobStateRequest::new("ordered", JobStateType::Queued)
                            .with_comment("first"),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .update_job_state(
                        UpdateJobStateRequest::new("ordered", JobStateType::InProgress)
                            .with_comment("second"),
                    )
                    .await
            })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let history = store
            .get_job_history("ordered", &JobHistoryFilter::default())
            .await
            .unwrap();
        let versions: Vec<u64> = history.iter().map(|e| e.new_version).collect();
        assert_eq!(versions, vec![1, 2, 3], "{}", config.backend);
        assert!(history.windows(2).all(|w| w[0].time < w[1].time));

        let state = store.get_job_state("ordered").await.unwrap();
        assert_eq!(state.version, 3);
        assert_eq!(state.update_time, history[2].time);

        // Polling from the second entry's time sees everything after it.
        let since = store
            .get_job_history(
                "ordered",
                &JobHistoryFilter {
                    since: Some(history[1].time),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            since.iter().map(|e| e.new_version).collect::<Vec<_>>(),
            vec![2, 3]
        );
        store.close().await.unwrap();
    }
}
