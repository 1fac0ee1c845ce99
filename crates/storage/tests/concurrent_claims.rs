#![forbid(unsafe_code)]

use qc_core::job::JobState;
use qc_storage::{JobEnqueueRequest, QueueConfig, SqliteStore, StoreError, now_ms};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("qc_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Four claimants, each with its own connection to one database file, must
/// see disjoint jobs. This is the exactly-once property the immediate
/// write transaction exists for.
#[test]
fn concurrent_claimants_see_disjoint_jobs() {
    const JOBS: usize = 100;
    const CLAIMANTS: usize = 4;

    let dir = temp_dir("disjoint");
    let mut store = SqliteStore::open(&dir).expect("open store");
    for i in 0..JOBS {
        store
            .job_enqueue(
                JobEnqueueRequest {
                    id: format!("job-{i:03}"),
                    command: "true".to_string(),
                    ..Default::default()
                },
                &QueueConfig::default(),
            )
            .expect("enqueue job");
    }
    drop(store);

    let claimed: Arc<Mutex<Vec<(usize, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for claimant in 0..CLAIMANTS {
        let dir = dir.clone();
        let claimed = Arc::clone(&claimed);
        handles.push(std::thread::spawn(move || {
            let mut store = SqliteStore::open(&dir).expect("open store in thread");
            let worker_id = format!("w{claimant}");
            loop {
                match store.job_claim_one(&worker_id, now_ms()) {
                    Ok(Some(job)) => {
                        claimed.lock().expect("lock").push((claimant, job.id));
                    }
                    Ok(None) => break,
                    // Contention beyond the busy-wait counts as "no claim
                    // this tick"; try again.
                    Err(StoreError::Busy) => std::thread::sleep(
                        std::time::Duration::from_millis(5),
                    ),
                    Err(err) => panic!("claim failed: {err}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("claimant thread");
    }

    let claimed = claimed.lock().expect("lock");
    assert_eq!(claimed.len(), JOBS, "every job claimed exactly once");
    let unique: HashSet<&String> = claimed.iter().map(|(_, id)| id).collect();
    assert_eq!(unique.len(), JOBS, "no job claimed by two claimants");

    let store = SqliteStore::open(&dir).expect("reopen store");
    let summary = store.status_summary().expect("summary");
    assert_eq!(summary.processing as usize, JOBS);
    assert_eq!(summary.pending, 0);
}

/// Concurrent dlq_retry callers: exactly one wins, the rest observe a
/// non-dead state.
#[test]
fn concurrent_dlq_retries_resolve_to_one_winner() {
    let dir = temp_dir("dlq_race");
    let mut store = SqliteStore::open(&dir).expect("open store");
    store
        .job_enqueue(
            JobEnqueueRequest {
                id: "corpse".to_string(),
                command: "false".to_string(),
                max_retries: Some(0),
                ..Default::default()
            },
            &QueueConfig::default(),
        )
        .expect("enqueue");
    let now = now_ms();
    store.job_claim_one("w", now).expect("claim").expect("job");
    store.job_fail("corpse", now, "exit status 1").expect("fail");
    assert_eq!(
        store.job_get("corpse").expect("get").expect("row").state,
        JobState::Dead
    );
    drop(store);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let dir = dir.clone();
        handles.push(std::thread::spawn(move || {
            let mut store = SqliteStore::open(&dir).expect("open store in thread");
            loop {
                match store.job_dlq_retry("corpse", now_ms()) {
                    Ok(_) => return true,
                    Err(StoreError::Busy) => {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                    }
                    Err(StoreError::NotDead { .. }) => return false,
                    Err(err) => panic!("dlq retry failed: {err}"),
                }
            }
        }));
    }
    let wins: Vec<bool> = handles
        .into_iter()
        .map(|h| h.join().expect("retry thread"))
        .collect();
    assert_eq!(wins.iter().filter(|w| **w).count(), 1, "{wins:?}");

    let store = SqliteStore::open(&dir).expect("reopen store");
    let row = store.job_get("corpse").expect("get").expect("row");
    assert_eq!(row.state, JobState::Pending);
    assert_eq!(row.attempts, 0);
}
