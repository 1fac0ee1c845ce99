#![forbid(unsafe_code)]

use qc_core::job::JobState;
use qc_storage::{JobEnqueueRequest, QueueConfig, SqliteStore, ms_to_rfc3339, now_ms};
use std::path::PathBuf;

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

fn setup(test_name: &str) -> SqliteStore {
    SqliteStore::open(temp_dir(test_name)).expect("open store")
}

fn enqueue_with_priority(store: &mut SqliteStore, id: &str, priority: i64) {
    store
        .job_enqueue(
            JobEnqueueRequest {
                id: id.to_string(),
                command: "echo ok".to_string(),
                priority: Some(priority),
                ..Default::default()
            },
            &QueueConfig::default(),
        )
        .expect("enqueue job");
}

#[test]
fn higher_priority_is_claimed_first() {
    let mut store = setup("priority");
    enqueue_with_priority(&mut store, "lo", 0);
    enqueue_with_priority(&mut store, "hi", 10);

    let now = now_ms();
    let first = store.job_claim_one("w", now).expect("claim").expect("job");
    assert_eq!(first.id, "hi");
    let second = store.job_claim_one("w", now).expect("claim").expect("job");
    assert_eq!(second.id, "lo");
}

#[test]
fn claim_order_is_total_over_priority_created_and_id() {
    let mut store = setup("ties");
    // Enqueues can land in the same millisecond, so created_at alone is
    // not a total order; the id is the final deterministic tie-breaker.
    for (id, priority) in [("b", 5), ("a", 5), ("c", 9), ("d", 5)] {
        enqueue_with_priority(&mut store, id, priority);
    }

    let mut expected = store
        .jobs_list(qc_storage::ListFilter::All)
        .expect("list jobs");
    expected.sort_by(|x, y| {
        y.priority
            .cmp(&x.priority)
            .then(x.created_at_ms.cmp(&y.created_at_ms))
            .then(x.id.cmp(&y.id))
    });
    let expected: Vec<String> = expected.into_iter().map(|j| j.id).collect();

    let now = now_ms();
    let mut claimed = Vec::new();
    while let Some(job) = store.job_claim_one("w", now).expect("claim") {
        claimed.push(job.id);
    }
    assert_eq!(claimed, expected);
    assert_eq!(claimed[0], "c", "highest priority always goes first");
}

#[test]
fn scheduled_jobs_are_invisible_until_run_at() {
    let mut store = setup("scheduled");
    let run_at_ms = now_ms() + 60_000;
    store
        .job_enqueue(
            JobEnqueueRequest {
                id: "later".to_string(),
                command: "echo later".to_string(),
                run_at: Some(ms_to_rfc3339(run_at_ms)),
                ..Default::default()
            },
            &QueueConfig::default(),
        )
        .expect("enqueue scheduled");

    assert!(
        store
            .job_claim_one("w", now_ms())
            .expect("claim")
            .is_none(),
        "job must not be claimable before run_at"
    );
    let claimed = store
        .job_claim_one("w", run_at_ms)
        .expect("claim")
        .expect("claimable at run_at");
    assert_eq!(claimed.id, "later");
    assert!(claimed.started_at_ms.expect("started") >= run_at_ms);
}

#[test]
fn run_at_in_the_past_means_eligible_now() {
    let mut store = setup("past_run_at");
    let job = store
        .job_enqueue(
            JobEnqueueRequest {
                id: "past".to_string(),
                command: "echo ok".to_string(),
                run_at: Some("2001-01-01T00:00:00Z".to_string()),
                ..Default::default()
            },
            &QueueConfig::default(),
        )
        .expect("enqueue");
    // available_at >= created_at always holds.
    assert!(job.available_at_ms >= job.created_at_ms);
    assert!(
        store
            .job_claim_one("w", now_ms())
            .expect("claim")
            .expect("job")
            .id
            == "past"
    );
}

#[test]
fn claimed_jobs_are_not_visible_to_other_claims() {
    let mut store = setup("exclusive");
    enqueue_with_priority(&mut store, "only", 0);
    let now = now_ms();
    let first = store.job_claim_one("w1", now).expect("claim");
    assert!(first.is_some());
    let second = store.job_claim_one("w2", now).expect("claim");
    assert!(second.is_none(), "a processing job must not be re-claimed");

    let row = store.job_get("only").expect("get").expect("row");
    assert_eq!(row.state, JobState::Processing);
}

#[test]
fn empty_queue_claims_return_none() {
    let mut store = setup("empty");
    assert!(store.job_claim_one("w", now_ms()).expect("claim").is_none());
}
