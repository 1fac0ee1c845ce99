#![forbid(unsafe_code)]
//! queuectl — control surface for the job queue: enqueue, inspect, run
//! workers, manage the dead-letter queue, and reset the store.

mod supervisor;

use qc_core::job::JobState;
use qc_storage::{
    JobEnqueueRequest, ListFilter, QueueConfig, SqliteStore, StoreError, ms_to_rfc3339, now_ms,
};
use serde::Deserialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use supervisor::SupervisorConfig;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn usage() -> &'static str {
    "queuectl — durable single-node background job queue\n\n\
USAGE:\n\
  queuectl [--data-dir DIR] <command> [args]\n\n\
COMMANDS:\n\
  enqueue <json>                      add a job, e.g. '{\"id\":\"j1\",\"command\":\"echo hi\"}'\n\
  worker start [--count N] [--idle-timeout S]\n\
               [--reap-stale S] [--worker-bin PATH]\n\
                                      run N worker processes in the foreground\n\
  status                              job counts per state\n\
  list [--state S]                    list jobs, optionally filtered by state\n\
  dlq list                            list dead-lettered jobs\n\
  dlq retry <id>                      requeue a dead job with a clean slate\n\
  logs <id> [--tail N]                show the tail of a job's log file\n\
  metrics                             totals, mean attempts, mean duration\n\
  config set <key> <value>            update queue_config.json\n\
  reset [--yes]                       backup, wipe, and reinitialize the queue\n\n\
The data directory defaults to the current directory (or QC_DATA_DIR).\n"
}

enum CommandError {
    Usage(String),
    Store(StoreError),
    Exit(u8),
}

impl From<StoreError> for CommandError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<std::io::Error> for CommandError {
    fn from(value: std::io::Error) -> Self {
        Self::Store(StoreError::Io(value))
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    match dispatch(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CommandError::Usage(message)) => {
            eprintln!("{message}");
            ExitCode::from(2)
        }
        Err(CommandError::Store(err)) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code().clamp(1, 127) as u8)
        }
        Err(CommandError::Exit(code)) => ExitCode::from(code),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn dispatch(mut args: Vec<String>) -> Result<(), CommandError> {
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        return Ok(());
    }

    let mut data_dir = env_var("QC_DATA_DIR").map(PathBuf::from);
    while args.first().map(String::as_str) == Some("--data-dir") {
        args.remove(0);
        if args.is_empty() {
            return Err(CommandError::Usage("--data-dir requires DIR".to_string()));
        }
        data_dir = Some(PathBuf::from(args.remove(0)));
    }
    let data_dir = data_dir
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let Some(command) = args.first().cloned() else {
        return Err(CommandError::Usage(usage().to_string()));
    };
    let rest = &args[1..];

    match command.as_str() {
        "enqueue" => cmd_enqueue(&data_dir, rest),
        "worker" => cmd_worker(&data_dir, rest),
        "status" => cmd_status(&data_dir),
        "list" => cmd_list(&data_dir, rest),
        "dlq" => cmd_dlq(&data_dir, rest),
        "logs" => cmd_logs(&data_dir, rest),
        "metrics" => cmd_metrics(&data_dir),
        "config" => cmd_config(&data_dir, rest),
        "reset" => cmd_reset(&data_dir, rest),
        other => Err(CommandError::Usage(format!(
            "Unknown command: {other}\n\n{}",
            usage()
        ))),
    }
}

// ---------------------------------------------------------------------------
// enqueue

/// Client-facing enqueue payload. Unknown keys are ignored, matching the
/// config file's tolerance for newer writers.
#[derive(Debug, Default, Deserialize)]
struct EnqueueSpec {
    id: Option<String>,
    command: Option<String>,
    max_retries: Option<i64>,
    base_backoff: Option<f64>,
    priority: Option<i64>,
    timeout_seconds: Option<f64>,
    run_at: Option<String>,
}

impl EnqueueSpec {
    fn into_request(self) -> JobEnqueueRequest {
        JobEnqueueRequest {
            id: self.id.unwrap_or_default(),
            command: self.command.unwrap_or_default(),
            max_retries: self.max_retries,
            base_backoff: self.base_backoff,
            priority: self.priority,
            timeout_seconds: self.timeout_seconds,
            run_at: self.run_at,
        }
    }
}

fn cmd_enqueue(data_dir: &Path, rest: &[String]) -> Result<(), CommandError> {
    let [raw] = rest else {
        return Err(CommandError::Usage(
            "enqueue expects exactly one JSON argument".to_string(),
        ));
    };
    let spec: EnqueueSpec = serde_json::from_str(raw)
        .map_err(|e| CommandError::Usage(format!("invalid job json: {e}")))?;

    let mut store = SqliteStore::open(data_dir)?;
    let config = QueueConfig::load(data_dir);
    let job = store.job_enqueue(spec.into_request(), &config)?;
    println!(
        "Enqueued job {} (available_at={})",
        job.id,
        ms_to_rfc3339(job.available_at_ms)
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// worker start (supervisor)

fn cmd_worker(data_dir: &Path, rest: &[String]) -> Result<(), CommandError> {
    if rest.first().map(String::as_str) != Some("start") {
        return Err(CommandError::Usage(
            "worker supports: worker start [--count N] [--idle-timeout S]".to_string(),
        ));
    }
    let mut count: u32 = 1;
    let mut idle_timeout_s: Option<f64> = None;
    let mut reap_stale_s: Option<u64> = None;
    let mut worker_bin: Option<String> = None;

    let mut i = 1usize;
    while i < rest.len() {
        match rest[i].as_str() {
            "--count" => {
                i += 1;
                let v = rest.get(i).ok_or_else(|| usage_err("--count requires N"))?;
                count = v
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| usage_err("--count must be a positive integer"))?;
            }
            "--idle-timeout" => {
                i += 1;
                let v = rest
                    .get(i)
                    .ok_or_else(|| usage_err("--idle-timeout requires S"))?;
                let parsed = v
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or_else(|| usage_err("--idle-timeout must be a positive number"))?;
                idle_timeout_s = Some(parsed);
            }
            "--reap-stale" => {
                i += 1;
                let v = rest
                    .get(i)
                    .ok_or_else(|| usage_err("--reap-stale requires S"))?;
                reap_stale_s = Some(
                    v.parse::<u64>()
                        .map_err(|_| usage_err("--reap-stale must be an integer (seconds)"))?,
                );
            }
            "--worker-bin" => {
                i += 1;
                let v = rest
                    .get(i)
                    .ok_or_else(|| usage_err("--worker-bin requires PATH"))?;
                worker_bin = Some(v.to_string());
            }
            other => return Err(usage_err(&format!("Unknown arg: {other}"))),
        }
        i += 1;
    }

    // Make sure the store exists before the fleet races to create it.
    SqliteStore::open(data_dir)?;

    let code = supervisor::run(SupervisorConfig {
        data_dir: data_dir.to_path_buf(),
        count,
        idle_timeout_s,
        reap_stale_s,
        worker_bin,
    })
    .map_err(|e| {
        eprintln!("{e}");
        CommandError::Exit(1)
    })?;
    if code == 0 {
        Ok(())
    } else {
        Err(CommandError::Exit(code))
    }
}

fn usage_err(message: &str) -> CommandError {
    CommandError::Usage(message.to_string())
}

// ---------------------------------------------------------------------------
// inspection

fn cmd_status(data_dir: &Path) -> Result<(), CommandError> {
    let store = SqliteStore::open(data_dir)?;
    let summary = store.status_summary()?;
    if summary.total() == 0 {
        println!("No jobs found.");
        println!("All counters: pending=0, processing=0, completed=0, dead=0");
    } else {
        for state in JobState::ALL {
            println!("{}: {}", state.as_str(), summary.count(state));
        }
    }
    println!("Active workers: inspect qc_worker processes (e.g. pgrep qc_worker).");
    Ok(())
}

fn parse_state(raw: &str) -> Result<JobState, CommandError> {
    JobState::parse(raw).ok_or_else(|| {
        usage_err(&format!(
            "unknown state '{raw}' (expected pending, processing, completed or dead)"
        ))
    })
}

fn cmd_list(data_dir: &Path, rest: &[String]) -> Result<(), CommandError> {
    let filter = match rest {
        [] => ListFilter::All,
        [flag, value] if flag == "--state" => ListFilter::State(parse_state(value)?),
        _ => return Err(usage_err("list supports: list [--state S]")),
    };

    let store = SqliteStore::open(data_dir)?;
    let jobs = store.jobs_list(filter)?;
    match filter {
        ListFilter::All => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "{} | {} | {} | {} | {}",
                    job.id,
                    job.command,
                    job.state.as_str(),
                    job.attempts,
                    job.max_retries
                );
            }
        }
        ListFilter::State(state) => {
            if jobs.is_empty() {
                println!("No jobs in state '{}'.", state.as_str());
                return Ok(());
            }
            for job in jobs {
                println!(
                    "{} | {} | {} | {} | {}",
                    job.id,
                    job.command,
                    job.attempts,
                    job.max_retries,
                    ms_to_rfc3339(job.available_at_ms)
                );
            }
        }
    }
    Ok(())
}

fn cmd_dlq(data_dir: &Path, rest: &[String]) -> Result<(), CommandError> {
    match rest {
        [sub] if sub == "list" => {
            let store = SqliteStore::open(data_dir)?;
            let jobs = store.jobs_list(ListFilter::State(JobState::Dead))?;
            if jobs.is_empty() {
                println!("DLQ is empty.");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "{} | {} | {} | {} | {}",
                    job.id,
                    job.command,
                    job.attempts,
                    job.max_retries,
                    ms_to_rfc3339(job.updated_at_ms)
                );
            }
            Ok(())
        }
        [sub, id] if sub == "retry" => {
            let mut store = SqliteStore::open(data_dir)?;
            let job = store.job_dlq_retry(id, now_ms())?;
            println!(
                "Job {} requeued from the dead-letter queue (available_at={})",
                job.id,
                ms_to_rfc3339(job.available_at_ms)
            );
            Ok(())
        }
        _ => Err(usage_err("dlq supports: dlq list | dlq retry <id>")),
    }
}

fn tail_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].to_vec()
}

fn cmd_logs(data_dir: &Path, rest: &[String]) -> Result<(), CommandError> {
    let (id, tail) = match rest {
        [id] => (id, 30usize),
        [id, flag, value] if flag == "--tail" => (
            id,
            value
                .parse::<usize>()
                .map_err(|_| usage_err("--tail must be a non-negative integer"))?,
        ),
        _ => return Err(usage_err("logs supports: logs <id> [--tail N]")),
    };

    let store = SqliteStore::open(data_dir)?;
    let job = store
        .job_get(id)?
        .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
    println!("Log path: {}", job.stdout_log);
    let path = Path::new(&job.stdout_log);
    if !path.exists() {
        println!("No log file yet.");
        return Ok(());
    }
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    for line in tail_lines(&text, tail) {
        println!("{line}");
    }
    Ok(())
}

fn cmd_metrics(data_dir: &Path) -> Result<(), CommandError> {
    let store = SqliteStore::open(data_dir)?;
    let metrics = store.metrics()?;
    println!("Total jobs: {}", metrics.total);
    println!("Completed: {}", metrics.completed);
    println!("Dead: {}", metrics.dead);
    println!("Avg attempts (non-pending jobs): {:.2}", metrics.avg_attempts);
    println!(
        "Avg duration (secs, completed jobs): {:.2}",
        metrics.avg_duration_seconds
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// config

fn apply_config_value(config: &mut QueueConfig, key: &str, raw: &str) -> Result<(), String> {
    fn positive_real(key: &str, raw: &str) -> Result<f64, String> {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or_else(|| format!("{key} must be a positive number"))
    }

    match key {
        "max_retries" => {
            config.max_retries = raw
                .parse::<i64>()
                .ok()
                .filter(|v| *v >= 0)
                .ok_or("max_retries must be a non-negative integer")?;
        }
        "base_backoff" => config.base_backoff = positive_real(key, raw)?,
        "idle_timeout" => config.idle_timeout = positive_real(key, raw)?,
        "poll_interval" => config.poll_interval = positive_real(key, raw)?,
        "default_timeout_seconds" => {
            config.default_timeout_seconds = if raw.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(positive_real(key, raw)?)
            };
        }
        other => return Err(format!("unknown config key: {other}")),
    }
    Ok(())
}

fn cmd_config(data_dir: &Path, rest: &[String]) -> Result<(), CommandError> {
    let [sub, key, value] = rest else {
        return Err(usage_err("config supports: config set <key> <value>"));
    };
    if sub != "set" {
        return Err(usage_err("config supports: config set <key> <value>"));
    }
    let mut config = QueueConfig::load(data_dir);
    apply_config_value(&mut config, key, value).map_err(CommandError::Usage)?;
    config.save(data_dir)?;
    println!("Config updated");
    Ok(())
}

// ---------------------------------------------------------------------------
// reset

fn backup_stamp() -> String {
    let format = format_description!("[year][month][day]T[hour][minute][second]Z");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "19700101T000000Z".to_string())
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn confirm_reset() -> Result<bool, CommandError> {
    print!("Are you sure you want to delete all jobs and reset the queue? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

fn cmd_reset(data_dir: &Path, rest: &[String]) -> Result<(), CommandError> {
    let assume_yes = match rest {
        [] => false,
        [flag] if flag == "--yes" => true,
        _ => return Err(usage_err("reset supports: reset [--yes]")),
    };
    if !assume_yes && !confirm_reset()? {
        eprintln!("Reset aborted.");
        return Err(CommandError::Exit(1));
    }

    let db_path = SqliteStore::db_path(data_dir);
    let logs_dir = data_dir.join("logs");
    let backup_dir = data_dir.join(format!("backup_{}", backup_stamp()));
    std::fs::create_dir_all(&backup_dir)?;
    if db_path.exists() {
        std::fs::copy(&db_path, backup_dir.join("queue.db.bak"))?;
        println!("Backed up queue.db -> {}", backup_dir.display());
    }
    if logs_dir.exists() {
        copy_dir_all(&logs_dir, &backup_dir.join("logs"))?;
        println!("Backed up logs -> {}", backup_dir.display());
    }

    for name in ["queue.db", "queue.db-wal", "queue.db-shm"] {
        let path = data_dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
    }
    if logs_dir.exists() {
        std::fs::remove_dir_all(&logs_dir)?;
    }

    SqliteStore::open(data_dir)?;
    println!("Reset complete. Database reinitialized.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_spec_parses_full_payload_and_ignores_extras() {
        let spec: EnqueueSpec = serde_json::from_str(
            r#"{"id":"j1","command":"echo hi","max_retries":2,"base_backoff":1.5,
                "priority":7,"timeout_seconds":9.5,"run_at":"2026-01-01T00:00:00Z",
                "someday":"maybe"}"#,
        )
        .expect("parse spec");
        let request = spec.into_request();
        assert_eq!(request.id, "j1");
        assert_eq!(request.command, "echo hi");
        assert_eq!(request.max_retries, Some(2));
        assert_eq!(request.base_backoff, Some(1.5));
        assert_eq!(request.priority, Some(7));
        assert_eq!(request.timeout_seconds, Some(9.5));
        assert_eq!(request.run_at.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn enqueue_spec_missing_fields_become_empty_strings() {
        let spec: EnqueueSpec = serde_json::from_str(r#"{}"#).expect("parse spec");
        let request = spec.into_request();
        assert!(request.id.is_empty());
        assert!(request.command.is_empty());
    }

    #[test]
    fn tail_lines_keeps_the_last_n() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(tail_lines(text, 2), vec!["c", "d"]);
        assert_eq!(tail_lines(text, 10), vec!["a", "b", "c", "d"]);
        assert!(tail_lines(text, 0).is_empty());
    }

    #[test]
    fn config_values_are_typed_per_key() {
        let mut config = QueueConfig::default();
        apply_config_value(&mut config, "max_retries", "5").expect("set max_retries");
        assert_eq!(config.max_retries, 5);
        apply_config_value(&mut config, "base_backoff", "1.5").expect("set base_backoff");
        assert_eq!(config.base_backoff, 1.5);
        apply_config_value(&mut config, "default_timeout_seconds", "30").expect("set timeout");
        assert_eq!(config.default_timeout_seconds, Some(30.0));
        apply_config_value(&mut config, "default_timeout_seconds", "null").expect("clear timeout");
        assert_eq!(config.default_timeout_seconds, None);

        assert!(apply_config_value(&mut config, "max_retries", "-2").is_err());
        assert!(apply_config_value(&mut config, "poll_interval", "0").is_err());
        assert!(apply_config_value(&mut config, "shiny_new_knob", "1").is_err());
    }

    #[test]
    fn backup_stamp_is_compact_utc() {
        let stamp = backup_stamp();
        assert_eq!(stamp.len(), 16, "{stamp}");
        assert!(stamp.ends_with('Z'), "{stamp}");
        assert!(stamp.contains('T'), "{stamp}");
    }
}
