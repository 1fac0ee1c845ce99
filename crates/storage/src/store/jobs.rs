#![forbid(unsafe_code)]

use super::SqliteStore;
use super::error::StoreError;
use super::support::{now_ms, rfc3339_to_ms};
use super::types::{JobEnqueueRequest, JobRow, ListFilter, MetricsSnapshot, StatusSummary};
use qc_core::job::{JobState, validate_command, validate_job_id};
use qc_core::policy::retry_delay_ms;
use rusqlite::{Connection, OptionalExtension, params};

const MAX_LAST_ERROR_LEN: usize = 400;

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, base_backoff, priority, \
     timeout_seconds, stdout_log, last_error, created_at_ms, updated_at_ms, \
     available_at_ms, started_at_ms, finished_at_ms";

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow, rusqlite::Error> {
    let state_raw: String = row.get(2)?;
    let state = JobState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown job state: {state_raw}").into(),
        )
    })?;
    Ok(JobRow {
        id: row.get(0)?,
        command: row.get(1)?,
        state,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        base_backoff: row.get(5)?,
        priority: row.get(6)?,
        timeout_seconds: row.get(7)?,
        stdout_log: row.get(8)?,
        last_error: row.get(9)?,
        created_at_ms: row.get(10)?,
        updated_at_ms: row.get(11)?,
        available_at_ms: row.get(12)?,
        started_at_ms: row.get(13)?,
        finished_at_ms: row.get(14)?,
    })
}

fn fetch_job(conn: &Connection, id: &str) -> Result<Option<JobRow>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
            params![id],
            read_job_row,
        )
        .optional()?)
}

fn fetch_job_state(conn: &Connection, id: &str) -> Result<Option<JobState>, StoreError> {
    let raw: Option<String> = conn
        .query_row("SELECT state FROM jobs WHERE id=?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    match raw {
        None => Ok(None),
        Some(raw) => JobState::parse(&raw)
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job state: {raw}"))),
    }
}

fn normalize_last_error(raw: &str) -> String {
    raw.trim().chars().take(MAX_LAST_ERROR_LEN).collect()
}

impl SqliteStore {
    /// Insert a new pending job. Missing retry/backoff settings default
    /// from the given config snapshot; a missing timeout defaults from
    /// `default_timeout_seconds`.
    pub fn job_enqueue(
        &mut self,
        request: JobEnqueueRequest,
        defaults: &super::config::QueueConfig,
    ) -> Result<JobRow, StoreError> {
        let id = validate_job_id(&request.id)
            .map_err(|e| StoreError::InvalidSpec(e.to_string()))?
            .to_string();
        let command = validate_command(&request.command)
            .map_err(|e| StoreError::InvalidSpec(e.to_string()))?
            .to_string();

        let max_retries = request.max_retries.unwrap_or(defaults.max_retries);
        if max_retries < 0 {
            return Err(StoreError::InvalidSpec(
                "max_retries must not be negative".to_string(),
            ));
        }
        let base_backoff = request.base_backoff.unwrap_or(defaults.base_backoff);
        if !base_backoff.is_finite() || base_backoff <= 0.0 {
            return Err(StoreError::InvalidSpec(
                "base_backoff must be a positive number".to_string(),
            ));
        }
        let timeout_seconds = request
            .timeout_seconds
            .or(defaults.default_timeout_seconds);
        if let Some(t) = timeout_seconds
            && (!t.is_finite() || t <= 0.0)
        {
            return Err(StoreError::InvalidSpec(
                "timeout_seconds must be a positive number".to_string(),
            ));
        }
        let priority = request.priority.unwrap_or(0);

        let now = now_ms();
        // available_at may never precede created_at, so a run_at in the
        // past means "eligible immediately".
        let available_at_ms = match request.run_at.as_deref() {
            None => now,
            Some(raw) => rfc3339_to_ms(raw)
                .ok_or_else(|| {
                    StoreError::InvalidSpec(format!(
                        "run_at is not a valid ISO-8601 UTC timestamp: {raw}"
                    ))
                })?
                .max(now),
        };

        let stdout_log = self.log_path(&id).to_string_lossy().to_string();

        let tx = self.txn_immediate()?;
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM jobs WHERE id=?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::DuplicateId { id });
        }
        tx.execute(
            r#"
            INSERT INTO jobs(
              id, command, state, attempts, max_retries, base_backoff, priority,
              timeout_seconds, stdout_log, created_at_ms, updated_at_ms, available_at_ms
            )
            VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)
            "#,
            params![
                id,
                command,
                max_retries,
                base_backoff,
                priority,
                timeout_seconds,
                stdout_log,
                now,
                available_at_ms,
            ],
        )?;
        let job = fetch_job(&tx, &id)?.ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        tx.commit()?;
        Ok(job)
    }

    /// Atomically claim the next eligible pending job, if any.
    ///
    /// Selection and the pending→processing write share one immediate
    /// transaction, so two workers can never claim the same row. Ordering
    /// is total: priority DESC, then created_at, then id.
    pub fn job_claim_one(
        &mut self,
        worker_id: &str,
        now_ms: i64,
    ) -> Result<Option<JobRow>, StoreError> {
        let tx = self.txn_immediate()?;
        let candidate: Option<String> = tx
            .query_row(
                r#"
                SELECT id FROM jobs
                WHERE state='pending' AND available_at_ms<=?1
                ORDER BY priority DESC, created_at_ms ASC, id ASC
                LIMIT 1
                "#,
                params![now_ms],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            return Ok(None);
        };
        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET state='processing', started_at_ms=?2, updated_at_ms=?2
            WHERE id=?1 AND state='pending'
            "#,
            params![id, now_ms],
        )?;
        if changed != 1 {
            // Unreachable under an immediate transaction; treat as no claim.
            return Ok(None);
        }
        let job = fetch_job(&tx, &id)?.ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        tx.commit()?;
        tracing::debug!(worker_id, job_id = %job.id, "claimed job");
        Ok(Some(job))
    }

    /// processing → completed.
    pub fn job_complete(&mut self, id: &str, now_ms: i64) -> Result<JobRow, StoreError> {
        let tx = self.txn_immediate()?;
        match fetch_job_state(&tx, id)? {
            None => return Err(StoreError::NotFound { id: id.to_string() }),
            Some(JobState::Processing) => {}
            Some(state) => {
                return Err(StoreError::NotProcessing {
                    id: id.to_string(),
                    state: state.as_str().to_string(),
                });
            }
        }
        tx.execute(
            r#"
            UPDATE jobs
            SET state='completed', finished_at_ms=?2, updated_at_ms=?2
            WHERE id=?1 AND state='processing'
            "#,
            params![id, now_ms],
        )?;
        let job = fetch_job(&tx, id)?.ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        tx.commit()?;
        Ok(job)
    }

    /// Record a failed execution: retry with exponential backoff, or move
    /// to the dead-letter queue once retries are exhausted.
    pub fn job_fail(
        &mut self,
        id: &str,
        now_ms: i64,
        error: &str,
    ) -> Result<JobRow, StoreError> {
        let tx = self.txn_immediate()?;
        let Some(current) = fetch_job(&tx, id)? else {
            return Err(StoreError::NotFound { id: id.to_string() });
        };
        if current.state != JobState::Processing {
            return Err(StoreError::NotProcessing {
                id: id.to_string(),
                state: current.state.as_str().to_string(),
            });
        }

        let attempts = current.attempts + 1;
        let last_error = normalize_last_error(error);
        if attempts > current.max_retries {
            tx.execute(
                r#"
                UPDATE jobs
                SET state='dead', attempts=?2, last_error=?3, finished_at_ms=?4, updated_at_ms=?4
                WHERE id=?1 AND state='processing'
                "#,
                params![id, attempts, last_error, now_ms],
            )?;
        } else {
            // A pending job carries no terminal timestamps: clear both so the
            // row looks exactly like a freshly scheduled one.
            let available_at_ms =
                now_ms.saturating_add(retry_delay_ms(current.base_backoff, attempts));
            tx.execute(
                r#"
                UPDATE jobs
                SET state='pending', attempts=?2, last_error=?3, available_at_ms=?4,
                    started_at_ms=NULL, finished_at_ms=NULL, updated_at_ms=?5
                WHERE id=?1 AND state='processing'
                "#,
                params![id, attempts, last_error, available_at_ms, now_ms],
            )?;
        }
        let job = fetch_job(&tx, id)?.ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        tx.commit()?;
        Ok(job)
    }

    /// dead → pending with a clean slate. Idempotence across concurrent
    /// callers falls out of the immediate transaction: the second caller
    /// observes a non-dead state and fails with NOT_DEAD.
    pub fn job_dlq_retry(&mut self, id: &str, now_ms: i64) -> Result<JobRow, StoreError> {
        let tx = self.txn_immediate()?;
        match fetch_job_state(&tx, id)? {
            None => return Err(StoreError::NotFound { id: id.to_string() }),
            Some(JobState::Dead) => {}
            Some(state) => {
                return Err(StoreError::NotDead {
                    id: id.to_string(),
                    state: state.as_str().to_string(),
                });
            }
        }
        tx.execute(
            r#"
            UPDATE jobs
            SET state='pending', attempts=0, last_error=NULL, available_at_ms=?2,
                started_at_ms=NULL, finished_at_ms=NULL, updated_at_ms=?2
            WHERE id=?1 AND state='dead'
            "#,
            params![id, now_ms],
        )?;
        let job = fetch_job(&tx, id)?.ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        tx.commit()?;
        Ok(job)
    }

    pub fn job_get(&self, id: &str) -> Result<Option<JobRow>, StoreError> {
        fetch_job(&self.conn, id)
    }

    pub fn jobs_list(&self, filter: ListFilter) -> Result<Vec<JobRow>, StoreError> {
        let mut jobs = Vec::new();
        match filter {
            ListFilter::All => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at_ms ASC, id ASC"
                ))?;
                let rows = stmt.query_map([], read_job_row)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
            ListFilter::State(state) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state=?1 ORDER BY created_at_ms ASC, id ASC"
                ))?;
                let rows = stmt.query_map(params![state.as_str()], read_job_row)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
        }
        Ok(jobs)
    }

    pub fn status_summary(&self) -> Result<StatusSummary, StoreError> {
        let mut summary = StatusSummary::default();
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (state, count) = row?;
            let count = count.max(0) as u64;
            match JobState::parse(&state) {
                Some(JobState::Pending) => summary.pending = count,
                Some(JobState::Processing) => summary.processing = count,
                Some(JobState::Completed) => summary.completed = count,
                Some(JobState::Dead) => summary.dead = count,
                None => return Err(StoreError::Corrupt(format!("unknown job state: {state}"))),
            }
        }
        Ok(summary)
    }

    pub fn metrics(&self) -> Result<MetricsSnapshot, StoreError> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        let completed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state='completed'",
            [],
            |row| row.get(0),
        )?;
        let dead: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state='dead'",
            [],
            |row| row.get(0),
        )?;
        let avg_attempts: Option<f64> = self.conn.query_row(
            "SELECT AVG(attempts) FROM jobs WHERE state!='pending'",
            [],
            |row| row.get(0),
        )?;
        let avg_duration_ms: Option<f64> = self.conn.query_row(
            r#"
            SELECT AVG(finished_at_ms - started_at_ms) FROM jobs
            WHERE state='completed'
              AND started_at_ms IS NOT NULL AND finished_at_ms IS NOT NULL
            "#,
            [],
            |row| row.get(0),
        )?;
        Ok(MetricsSnapshot {
            total: total.max(0) as u64,
            completed: completed.max(0) as u64,
            dead: dead.max(0) as u64,
            avg_attempts: avg_attempts.unwrap_or(0.0),
            avg_duration_seconds: avg_duration_ms.unwrap_or(0.0) / 1000.0,
        })
    }

    /// Reset `processing` rows whose claim is older than `stale_after_ms`
    /// back to `pending`. Recovers rows leaked by a worker that was killed
    /// without finalizing (e.g. SIGKILL). Returns the reset ids.
    pub fn reap_zombie_processing(
        &mut self,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> Result<Vec<String>, StoreError> {
        let cutoff = now_ms.saturating_sub(stale_after_ms.max(0));
        let tx = self.txn_immediate()?;
        let mut ids = Vec::new();
        {
            let mut stmt = tx.prepare(
                r#"
                SELECT id FROM jobs
                WHERE state='processing'
                  AND (started_at_ms IS NULL OR started_at_ms < ?1)
                ORDER BY id ASC
                "#,
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            for row in rows {
                ids.push(row?);
            }
        }
        if ids.is_empty() {
            return Ok(ids);
        }
        tx.execute(
            r#"
            UPDATE jobs
            SET state='pending', available_at_ms=?2, started_at_ms=NULL,
                finished_at_ms=NULL, updated_at_ms=?2
            WHERE state='processing'
              AND (started_at_ms IS NULL OR started_at_ms < ?1)
            "#,
            params![cutoff, now_ms],
        )?;
        tx.commit()?;
        Ok(ids)
    }
}
