#![forbid(unsafe_code)]
//! Runs one job's shell command, captures its output into the per-job log
//! file, and reports the outcome. Never panics or errors into the worker
//! loop: every failure mode is an `Outcome` value.

use qc_storage::{JobRow, ms_to_rfc3339, now_ms};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const WAIT_POLL_MS: u64 = 100;
/// After the polite SIGTERM, how long the child gets before SIGKILL.
const KILL_GRACE_MS: u64 = 2_000;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Outcome {
    Success,
    NonZero { code: i64, brief: String },
    Timeout { seconds: f64 },
    SpawnError(String),
}

impl Outcome {
    /// Short diagnostic recorded as the job's last_error on failure.
    pub(crate) fn brief(&self) -> Option<String> {
        match self {
            Outcome::Success => None,
            Outcome::NonZero { brief, .. } => Some(brief.clone()),
            Outcome::Timeout { seconds } => Some(format!("timed out after {seconds}s")),
            Outcome::SpawnError(message) => Some(message.clone()),
        }
    }
}

/// Execute `job.command` through the shell, appending interleaved
/// stdout/stderr to the job's log file between START/END markers.
pub(crate) fn execute(job: &JobRow) -> Outcome {
    let log_path = Path::new(&job.stdout_log);
    if let Some(parent) = log_path.parent()
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        return Outcome::SpawnError(format!("create log dir failed: {err}"));
    }
    let mut log = match OpenOptions::new().append(true).create(true).open(log_path) {
        Ok(file) => file,
        Err(err) => return Outcome::SpawnError(format!("open log file failed: {err}")),
    };
    let _ = writeln!(log, "--- START {} ---", ms_to_rfc3339(now_ms()));

    let (child_stdout, child_stderr) = match (log.try_clone(), log.try_clone()) {
        (Ok(out), Ok(err)) => (out, err),
        (Err(err), _) | (_, Err(err)) => {
            return exception(&mut log, format!("clone log handle failed: {err}"));
        }
    };

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(&job.command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(child_stdout))
        .stderr(Stdio::from(child_stderr))
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => return exception(&mut log, format!("spawn failed: {err}")),
    };

    let status = match job.timeout_seconds {
        None => match child.wait() {
            Ok(status) => status,
            Err(err) => return exception(&mut log, format!("wait failed: {err}")),
        },
        Some(limit) => match wait_with_timeout(&mut child, limit) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = writeln!(
                    log,
                    "--- TIMEOUT {} after {limit}s ---",
                    ms_to_rfc3339(now_ms())
                );
                return Outcome::Timeout { seconds: limit };
            }
            Err(err) => return exception(&mut log, format!("wait failed: {err}")),
        },
    };

    match status.code() {
        Some(0) => {
            let _ = writeln!(log, "--- END {} rc=0 ---", ms_to_rfc3339(now_ms()));
            Outcome::Success
        }
        Some(code) => {
            let _ = writeln!(log, "--- END {} rc={code} ---", ms_to_rfc3339(now_ms()));
            Outcome::NonZero {
                code: code as i64,
                brief: format!("exit status {code}"),
            }
        }
        // No exit code: the child died to a signal.
        None => {
            let _ = writeln!(log, "--- END {} rc=signal ---", ms_to_rfc3339(now_ms()));
            Outcome::NonZero {
                code: -1,
                brief: "terminated by signal".to_string(),
            }
        }
    }
}

fn exception(log: &mut File, message: String) -> Outcome {
    let _ = writeln!(
        log,
        "--- EXCEPTION {}: {message} ---",
        ms_to_rfc3339(now_ms())
    );
    Outcome::SpawnError(message)
}

/// Wait for the child, killing it once the wall-clock limit passes.
/// Returns Ok(None) when the child was killed for exceeding the limit.
fn wait_with_timeout(child: &mut Child, limit_seconds: f64) -> std::io::Result<Option<ExitStatus>> {
    let limit_ms = (limit_seconds.max(0.0) * 1000.0).ceil() as u64;
    let deadline = Instant::now() + Duration::from_millis(limit_ms);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            break;
        }
        sleep(Duration::from_millis(WAIT_POLL_MS));
    }
    terminate(child);
    Ok(None)
}

/// Polite stop first so the command can flush and clean up, force-kill
/// after the grace window.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        let grace_deadline = Instant::now() + Duration::from_millis(KILL_GRACE_MS);
        while Instant::now() < grace_deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir(test_name: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = base.join(format!("qc_executor_{test_name}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn job(dir: &std::path::Path, command: &str, timeout_seconds: Option<f64>) -> JobRow {
        JobRow {
            id: "t".to_string(),
            command: command.to_string(),
            state: qc_core::job::JobState::Processing,
            attempts: 0,
            max_retries: 3,
            base_backoff: 2.0,
            priority: 0,
            timeout_seconds,
            stdout_log: dir.join("job_t.log").to_string_lossy().to_string(),
            last_error: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            available_at_ms: 0,
            started_at_ms: Some(0),
            finished_at_ms: None,
        }
    }

    fn read_log(job: &JobRow) -> String {
        std::fs::read_to_string(&job.stdout_log).expect("read log")
    }

    #[test]
    fn success_captures_output_between_markers() {
        let dir = temp_dir("success");
        let job = job(&dir, "echo hello-from-job", None);
        let outcome = execute(&job);
        assert_eq!(outcome, Outcome::Success);

        let log = read_log(&job);
        assert!(log.contains("--- START "), "{log}");
        assert!(log.contains("hello-from-job"), "{log}");
        assert!(log.contains("rc=0 ---"), "{log}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn nonzero_exit_reports_the_code() {
        let dir = temp_dir("nonzero");
        let job = job(&dir, "exit 3", None);
        match execute(&job) {
            Outcome::NonZero { code, brief } => {
                assert_eq!(code, 3);
                assert_eq!(brief, "exit status 3");
            }
            other => panic!("expected NonZero, got {other:?}"),
        }
        assert!(read_log(&job).contains("rc=3"), "{}", read_log(&job));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_command_is_a_normal_failure() {
        let dir = temp_dir("unknown_cmd");
        let job = job(&dir, "definitely-not-a-command-qx", None);
        match execute(&job) {
            // sh reports 127 for command-not-found; that is a job failure,
            // not a spawn error.
            Outcome::NonZero { code, .. } => assert_eq!(code, 127),
            other => panic!("expected NonZero, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stderr_is_interleaved_into_the_log() {
        let dir = temp_dir("stderr");
        let job = job(&dir, "echo out && echo err >&2", None);
        assert_eq!(execute(&job), Outcome::Success);
        let log = read_log(&job);
        assert!(log.contains("out"), "{log}");
        assert!(log.contains("err"), "{log}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn timeout_kills_the_child_and_reports_timeout() {
        let dir = temp_dir("timeout");
        let job = job(&dir, "sleep 30", Some(0.3));
        let started = Instant::now();
        match execute(&job) {
            Outcome::Timeout { seconds } => assert_eq!(seconds, 0.3),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "child must not run to completion"
        );
        let log = read_log(&job);
        assert!(log.contains("--- TIMEOUT "), "{log}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn log_file_is_appended_across_runs() {
        let dir = temp_dir("append");
        let job = job(&dir, "echo again", None);
        assert_eq!(execute(&job), Outcome::Success);
        assert_eq!(execute(&job), Outcome::Success);
        let log = read_log(&job);
        assert_eq!(log.matches("--- START ").count(), 2, "{log}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn outcome_brief_is_suitable_for_last_error() {
        assert_eq!(Outcome::Success.brief(), None);
        assert_eq!(
            Outcome::Timeout { seconds: 1.5 }.brief().as_deref(),
            Some("timed out after 1.5s")
        );
        assert_eq!(
            Outcome::SpawnError("spawn failed: x".to_string())
                .brief()
                .as_deref(),
            Some("spawn failed: x")
        );
    }
}
