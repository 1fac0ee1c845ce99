#![forbid(unsafe_code)]
//! qc_worker — one claim/execute/finalize loop in its own OS process.
//! Coordination with other workers happens exclusively through the shared
//! queue database; workers never talk to each other.

mod executor;

use executor::Outcome;
use qc_core::job::JobState;
use rand::Rng;
use qc_storage::{JobRow, QueueConfig, SqliteStore, StoreError, now_ms};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Transient store contention on finalize is retried this many times
/// before the worker gives up and dies.
const FINALIZE_RETRIES: u32 = 5;
const FINALIZE_RETRY_SLEEP_MS: u64 = 100;

#[derive(Debug)]
struct WorkerConfig {
    data_dir: PathBuf,
    worker_id: String,
    poll_ms: u64,
    idle_timeout_ms: u64,
    reap_stale_s: u64,
    once: bool,
}

fn usage() -> &'static str {
    "qc_worker — claim and execute queued jobs until idle or signalled\n\n\
USAGE:\n\
  qc_worker [--data-dir DIR] [--worker-id ID]\n\
            [--poll-ms MS] [--idle-timeout-s S]\n\
            [--reap-stale-s S] [--once]\n\n\
NOTES:\n\
  - poll/idle defaults come from queue_config.json in the data dir.\n\
  - SIGINT/SIGTERM finish the in-flight job, then exit without claiming.\n\
  - `--once` claims at most one job and exits (smoke test).\n\
  - `--reap-stale-s S` resets processing rows older than S seconds at\n\
    startup (recovers jobs leaked by a killed worker).\n"
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Default)]
struct WorkerArgs {
    data_dir: Option<PathBuf>,
    worker_id: Option<String>,
    poll_ms: Option<u64>,
    idle_timeout_s: Option<f64>,
    reap_stale_s: Option<u64>,
    once: bool,
}

fn parse_args_from(args: &[String]) -> Result<WorkerArgs, String> {
    let mut parsed = WorkerArgs {
        data_dir: env_var("QC_DATA_DIR").map(PathBuf::from),
        worker_id: env_var("QC_WORKER_ID"),
        poll_ms: env_var("QC_POLL_MS").and_then(|v| v.parse().ok()),
        idle_timeout_s: env_var("QC_IDLE_TIMEOUT_S").and_then(|v| v.parse().ok()),
        ..WorkerArgs::default()
    };

    let mut i = 0usize;
    while i < args.len() {
        let a = args[i].as_str();
        match a {
            "--data-dir" => {
                i += 1;
                let v = args.get(i).ok_or("--data-dir requires DIR")?;
                parsed.data_dir = Some(PathBuf::from(v));
            }
            "--worker-id" => {
                i += 1;
                let v = args.get(i).ok_or("--worker-id requires ID")?;
                parsed.worker_id = Some(v.to_string());
            }
            "--poll-ms" => {
                i += 1;
                let v = args.get(i).ok_or("--poll-ms requires MS")?;
                parsed.poll_ms = Some(
                    v.parse::<u64>()
                        .map_err(|_| "--poll-ms must be an integer (milliseconds)")?,
                );
            }
            "--idle-timeout-s" => {
                i += 1;
                let v = args.get(i).ok_or("--idle-timeout-s requires S")?;
                let parsed_v = v
                    .parse::<f64>()
                    .map_err(|_| "--idle-timeout-s must be a number (seconds)")?;
                if !parsed_v.is_finite() || parsed_v <= 0.0 {
                    return Err("--idle-timeout-s must be positive".to_string());
                }
                parsed.idle_timeout_s = Some(parsed_v);
            }
            "--reap-stale-s" => {
                i += 1;
                let v = args.get(i).ok_or("--reap-stale-s requires S")?;
                parsed.reap_stale_s = Some(
                    v.parse::<u64>()
                        .map_err(|_| "--reap-stale-s must be an integer (seconds)")?,
                );
            }
            "--once" => parsed.once = true,
            other => return Err(format!("Unknown arg: {other}\n\n{}", usage())),
        }
        i += 1;
    }
    Ok(parsed)
}

/// Flags win over env vars; anything still unset falls back to the config
/// file snapshot taken once at startup.
fn resolve_config(args: WorkerArgs) -> WorkerConfig {
    let data_dir = args
        .data_dir
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let file_cfg = QueueConfig::load(&data_dir);
    let poll_ms = args
        .poll_ms
        .unwrap_or_else(|| (file_cfg.poll_interval.max(0.05) * 1000.0) as u64)
        .max(1);
    let idle_timeout_s = args.idle_timeout_s.unwrap_or(file_cfg.idle_timeout);
    WorkerConfig {
        data_dir,
        worker_id: args
            .worker_id
            .unwrap_or_else(|| format!("qc_worker:{}", std::process::id())),
        poll_ms,
        idle_timeout_ms: (idle_timeout_s.max(0.0) * 1000.0) as u64,
        reap_stale_s: args.reap_stale_s.unwrap_or(0),
        once: args.once,
    }
}

/// Poll sleep with a little jitter so workers started together do not
/// hammer the write lock in lockstep.
fn poll_delay(poll_ms: u64) -> Duration {
    let jitter_cap = (poll_ms / 4).max(1);
    let jitter = rand::rng().random_range(0..jitter_cap);
    Duration::from_millis(poll_ms + jitter)
}

fn install_shutdown_flag() -> Result<Arc<AtomicBool>, std::io::Error> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))?;
    Ok(flag)
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = match parse_args_from(&std::env::args().skip(1).collect::<Vec<_>>()) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    let cfg = resolve_config(args);

    let shutdown = match install_shutdown_flag() {
        Ok(flag) => flag,
        Err(err) => {
            eprintln!("failed to install signal handlers: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut store = match SqliteStore::open(&cfg.data_dir) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("failed to open queue store: {err}");
            return ExitCode::FAILURE;
        }
    };

    if cfg.reap_stale_s > 0 {
        match store.reap_zombie_processing(now_ms(), (cfg.reap_stale_s as i64).saturating_mul(1000))
        {
            Ok(ids) if !ids.is_empty() => {
                tracing::info!(worker_id = %cfg.worker_id, reaped = ids.len(), "reset stale processing jobs");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(worker_id = %cfg.worker_id, error = %err, "stale-job sweep failed");
            }
        }
    }

    match run_loop(&mut store, &cfg, &shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(worker_id = %cfg.worker_id, error = %err, "worker failed");
            ExitCode::FAILURE
        }
    }
}

fn run_loop(
    store: &mut SqliteStore,
    cfg: &WorkerConfig,
    shutdown: &AtomicBool,
) -> Result<(), StoreError> {
    tracing::info!(
        worker_id = %cfg.worker_id,
        poll_ms = cfg.poll_ms,
        idle_timeout_ms = cfg.idle_timeout_ms,
        "worker started"
    );
    let mut last_claim = Instant::now();
    loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!(worker_id = %cfg.worker_id, "shutdown requested; exiting");
            return Ok(());
        }
        match store.job_claim_one(&cfg.worker_id, now_ms()) {
            Ok(Some(job)) => {
                last_claim = Instant::now();
                process_job(store, cfg, &job)?;
                if shutdown.load(Ordering::Relaxed) {
                    tracing::info!(
                        worker_id = %cfg.worker_id,
                        "shutdown requested; finalized in-flight job, exiting"
                    );
                    return Ok(());
                }
                if cfg.once {
                    return Ok(());
                }
            }
            // A contended busy-wait is "no claim this tick", not an error.
            Ok(None) | Err(StoreError::Busy) => {
                if cfg.once {
                    return Ok(());
                }
                if last_claim.elapsed() >= Duration::from_millis(cfg.idle_timeout_ms) {
                    tracing::info!(
                        worker_id = %cfg.worker_id,
                        idle_ms = cfg.idle_timeout_ms,
                        "no claimable jobs; idle timeout reached, exiting"
                    );
                    return Ok(());
                }
                sleep(poll_delay(cfg.poll_ms));
            }
            Err(err) => return Err(err),
        }
    }
}

fn process_job(
    store: &mut SqliteStore,
    cfg: &WorkerConfig,
    job: &JobRow,
) -> Result<(), StoreError> {
    tracing::info!(
        worker_id = %cfg.worker_id,
        job_id = %job.id,
        command = %job.command,
        "processing job"
    );
    let outcome = executor::execute(job);
    finalize(store, cfg, job, &outcome)
}

/// Apply the outcome to the store. The in-flight job must not be dropped
/// on transient contention, so Busy gets a short bounded retry.
fn finalize(
    store: &mut SqliteStore,
    cfg: &WorkerConfig,
    job: &JobRow,
    outcome: &Outcome,
) -> Result<(), StoreError> {
    let mut strikes = 0u32;
    loop {
        let result = match outcome {
            Outcome::Success => store.job_complete(&job.id, now_ms()),
            other => {
                let brief = other.brief().unwrap_or_else(|| "execution failed".to_string());
                store.job_fail(&job.id, now_ms(), &brief)
            }
        };
        match result {
            Ok(row) => {
                report_transition(cfg, &row, outcome);
                return Ok(());
            }
            Err(err) if err.is_transient() && strikes < FINALIZE_RETRIES => {
                strikes += 1;
                sleep(Duration::from_millis(FINALIZE_RETRY_SLEEP_MS));
            }
            Err(err) => return Err(err),
        }
    }
}

fn report_transition(cfg: &WorkerConfig, row: &JobRow, outcome: &Outcome) {
    match row.state {
        JobState::Completed => {
            tracing::info!(worker_id = %cfg.worker_id, job_id = %row.id, "completed job");
        }
        JobState::Dead => {
            tracing::warn!(
                worker_id = %cfg.worker_id,
                job_id = %row.id,
                attempts = row.attempts,
                error = row.last_error.as_deref().unwrap_or(""),
                "job moved to dead-letter queue"
            );
        }
        JobState::Pending => {
            tracing::info!(
                worker_id = %cfg.worker_id,
                job_id = %row.id,
                attempts = row.attempts,
                available_at = %qc_storage::ms_to_rfc3339(row.available_at_ms),
                outcome = ?outcome,
                "job failed; retry scheduled"
            );
        }
        JobState::Processing => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_args_reads_flags() {
        let parsed = parse_args_from(&args(&[
            "--data-dir",
            "/tmp/q",
            "--worker-id",
            "w7",
            "--poll-ms",
            "250",
            "--idle-timeout-s",
            "3.5",
            "--once",
        ]))
        .expect("parse");
        assert_eq!(parsed.data_dir.as_deref(), Some(std::path::Path::new("/tmp/q")));
        assert_eq!(parsed.worker_id.as_deref(), Some("w7"));
        assert_eq!(parsed.poll_ms, Some(250));
        assert_eq!(parsed.idle_timeout_s, Some(3.5));
        assert!(parsed.once);
    }

    #[test]
    fn parse_args_rejects_unknown_and_malformed() {
        assert!(parse_args_from(&args(&["--what"])).is_err());
        assert!(parse_args_from(&args(&["--poll-ms"])).is_err());
        assert!(parse_args_from(&args(&["--poll-ms", "soon"])).is_err());
        assert!(parse_args_from(&args(&["--idle-timeout-s", "-1"])).is_err());
    }

    #[test]
    fn resolve_config_falls_back_to_file_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "qc_worker_cfg_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let cfg = resolve_config(WorkerArgs {
            data_dir: Some(dir.clone()),
            ..WorkerArgs::default()
        });
        // queue_config.json defaults: poll 0.5s, idle 60s.
        assert_eq!(cfg.poll_ms, 500);
        assert_eq!(cfg.idle_timeout_ms, 60_000);
        assert!(cfg.worker_id.starts_with("qc_worker:"));
        assert!(!cfg.once);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn poll_delay_stays_within_jitter_band() {
        for _ in 0..50 {
            let d = poll_delay(200);
            assert!(d >= Duration::from_millis(200));
            assert!(d < Duration::from_millis(251));
        }
    }
}
