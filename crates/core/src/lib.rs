#![forbid(unsafe_code)]

pub mod job {
    const MAX_JOB_ID_LEN: usize = 128;
    const MAX_COMMAND_LEN: usize = 10_000;

    /// Lifecycle state of a queued job, stored as TEXT.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum JobState {
        Pending,
        Processing,
        Completed,
        Dead,
    }

    impl JobState {
        pub fn as_str(self) -> &'static str {
            match self {
                JobState::Pending => "pending",
                JobState::Processing => "processing",
                JobState::Completed => "completed",
                JobState::Dead => "dead",
            }
        }

        pub fn parse(raw: &str) -> Option<Self> {
            match raw {
                "pending" => Some(JobState::Pending),
                "processing" => Some(JobState::Processing),
                "completed" => Some(JobState::Completed),
                "dead" => Some(JobState::Dead),
                _ => None,
            }
        }

        pub fn is_terminal(self) -> bool {
            matches!(self, JobState::Completed | JobState::Dead)
        }

        pub const ALL: [JobState; 4] = [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Dead,
        ];
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum JobSpecError {
        EmptyId,
        IdTooLong,
        InvalidIdChar { ch: char, index: usize },
        EmptyCommand,
        CommandTooLong,
    }

    impl std::fmt::Display for JobSpecError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::EmptyId => write!(f, "job id must not be empty"),
                Self::IdTooLong => write!(f, "job id is too long (max {MAX_JOB_ID_LEN})"),
                Self::InvalidIdChar { ch, index } => {
                    write!(f, "job id contains invalid char {ch:?} at index {index}")
                }
                Self::EmptyCommand => write!(f, "command must not be empty"),
                Self::CommandTooLong => {
                    write!(f, "command is too long (max {MAX_COMMAND_LEN})")
                }
            }
        }
    }

    impl std::error::Error for JobSpecError {}

    /// Job ids name the row and the per-job log file, so the charset is
    /// restricted to characters that are safe in both places.
    pub fn validate_job_id(raw: &str) -> Result<&str, JobSpecError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(JobSpecError::EmptyId);
        }
        if value.len() > MAX_JOB_ID_LEN {
            return Err(JobSpecError::IdTooLong);
        }
        for (index, ch) in value.chars().enumerate() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ':') {
                continue;
            }
            return Err(JobSpecError::InvalidIdChar { ch, index });
        }
        Ok(value)
    }

    pub fn validate_command(raw: &str) -> Result<&str, JobSpecError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(JobSpecError::EmptyCommand);
        }
        if value.len() > MAX_COMMAND_LEN {
            return Err(JobSpecError::CommandTooLong);
        }
        Ok(value)
    }
}

pub mod policy {
    pub const DEFAULT_MAX_RETRIES: i64 = 3;
    pub const DEFAULT_BASE_BACKOFF: f64 = 2.0;
    pub const DEFAULT_IDLE_TIMEOUT_S: f64 = 60.0;
    pub const DEFAULT_POLL_INTERVAL_S: f64 = 0.5;

    /// Retry delays are clamped so a mistyped max_retries cannot schedule a
    /// job years into the future.
    pub const RETRY_DELAY_CEILING_MS: i64 = 24 * 60 * 60 * 1000;

    /// Delay before a failed job becomes claimable again:
    /// `base_backoff ** attempts` seconds, clamped to [0, 24h].
    pub fn retry_delay_ms(base_backoff: f64, attempts: i64) -> i64 {
        if attempts <= 0 {
            return 0;
        }
        let seconds = base_backoff.powi(attempts.min(i32::MAX as i64) as i32);
        if !seconds.is_finite() {
            return RETRY_DELAY_CEILING_MS;
        }
        let ms = seconds * 1000.0;
        if ms <= 0.0 {
            0
        } else if ms >= RETRY_DELAY_CEILING_MS as f64 {
            RETRY_DELAY_CEILING_MS
        } else {
            ms as i64
        }
    }
}
