#![forbid(unsafe_code)]
//! Spawns N worker processes, forwards the first interrupt/terminate
//! signal to each child once, waits for all of them, and folds their exit
//! statuses into one. Workers are not restarted: a dead worker is
//! terminal for its slot.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

const WORKER_BIN_NAME: &str = "qc_worker";

pub(crate) struct SupervisorConfig {
    pub(crate) data_dir: PathBuf,
    pub(crate) count: u32,
    pub(crate) idle_timeout_s: Option<f64>,
    pub(crate) reap_stale_s: Option<u64>,
    pub(crate) worker_bin: Option<String>,
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn find_executable_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in dirs {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn find_executable_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    let dirs = std::env::split_paths(&path_var).collect::<Vec<_>>();
    find_executable_in_dirs(name, &dirs)
}

/// Resolution order: explicit flag, QC_WORKER_BIN, a sibling of the
/// current executable (plus one directory up, for test binaries living in
/// target/*/deps), then PATH.
pub(crate) fn resolve_worker_bin(explicit: Option<String>) -> Result<PathBuf, String> {
    let explicit = explicit.or_else(|| {
        std::env::var("QC_WORKER_BIN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    });
    if let Some(raw) = explicit {
        let path = PathBuf::from(&raw);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(format!("worker binary is not executable: {raw}"));
    }

    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let mut dirs = vec![dir.to_path_buf()];
        if let Some(parent) = dir.parent() {
            dirs.push(parent.to_path_buf());
        }
        if let Some(found) = find_executable_in_dirs(WORKER_BIN_NAME, &dirs) {
            return Ok(found);
        }
    }

    find_executable_in_path(WORKER_BIN_NAME).ok_or_else(|| {
        format!(
            "could not find the {WORKER_BIN_NAME} binary; set --worker-bin or QC_WORKER_BIN"
        )
    })
}

fn spawn_worker(bin: &Path, cfg: &SupervisorConfig) -> std::io::Result<Child> {
    let mut command = Command::new(bin);
    command.arg("--data-dir").arg(&cfg.data_dir);
    if let Some(idle) = cfg.idle_timeout_s {
        command.arg("--idle-timeout-s").arg(idle.to_string());
    }
    if let Some(reap) = cfg.reap_stale_s {
        command.arg("--reap-stale-s").arg(reap.to_string());
    }
    command.stdin(Stdio::null()).spawn()
}

#[cfg(unix)]
fn forward_signal(children: &mut [Child], terminate: bool) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let signal = if terminate {
        Signal::SIGTERM
    } else {
        Signal::SIGINT
    };
    for child in children.iter_mut() {
        if let Ok(None) = child.try_wait() {
            let _ = kill(Pid::from_raw(child.id() as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn forward_signal(_children: &mut [Child], _terminate: bool) {}

/// Returns the aggregate exit code: 0 iff every worker exited 0.
pub(crate) fn run(cfg: SupervisorConfig) -> Result<u8, String> {
    let worker_bin = resolve_worker_bin(cfg.worker_bin.clone())?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let terminated = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .map_err(|e| format!("failed to install signal handler: {e}"))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&terminated))
        .map_err(|e| format!("failed to install signal handler: {e}"))?;

    println!(
        "Starting {} worker(s) in foreground... (idle-timeout={})",
        cfg.count,
        cfg.idle_timeout_s
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "config".to_string())
    );

    let mut children = Vec::with_capacity(cfg.count as usize);
    for slot in 0..cfg.count {
        let child = spawn_worker(&worker_bin, &cfg)
            .map_err(|e| format!("failed to spawn worker {slot}: {e}"))?;
        tracing::debug!(slot, pid = child.id(), "worker spawned");
        children.push(child);
    }

    let mut forwarded = false;
    let mut statuses: Vec<Option<std::process::ExitStatus>> = vec![None; children.len()];
    loop {
        if !forwarded && (interrupted.load(Ordering::Relaxed) || terminated.load(Ordering::Relaxed))
        {
            // One forward per supervisor lifetime; a second Ctrl-C just
            // waits like the first.
            forward_signal(&mut children, terminated.load(Ordering::Relaxed));
            forwarded = true;
            println!("Stopping workers: waiting for in-flight jobs to finish.");
        }
        let mut all_done = true;
        for (idx, child) in children.iter_mut().enumerate() {
            if statuses[idx].is_some() {
                continue;
            }
            match child.try_wait() {
                Ok(Some(status)) => statuses[idx] = Some(status),
                Ok(None) => all_done = false,
                Err(err) => return Err(format!("failed to wait for worker {idx}: {err}")),
            }
        }
        if all_done {
            break;
        }
        sleep(Duration::from_millis(100));
    }

    let all_ok = statuses
        .iter()
        .all(|status| matches!(status, Some(s) if s.success()));
    Ok(if all_ok { 0 } else { 1 })
}
