use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Longest `last_error` / run error we persist, in characters.
pub const MAX_ERROR_CHARS: usize = 2000;

/// Upper bound for `NewJob::delay_secs`, same as the retry delay ceiling.
pub const MAX_DELAY_SECS: i64 = crate::jobs::retry::MAX_RETRY_DELAY_SECS;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub workspace_id: String,
    pub job_type: String,
    pub status: String,
    pub payload: Value,
    pub dedupe_key: Option<String>,
    pub priority: i32,
    pub run_after: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,

    pub lock_token: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,

    pub last_error: Option<String>,
    pub replay_of_job_id: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn status(&self) -> Result<JobStatus, ParseJobStatusError> {
        self.status.parse()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().map(|s| s.is_terminal()).unwrap_or(false)
    }
}

/// A job to insert. Only `workspace_id` and `job_type` are required; the
/// rest default the way producers usually want them.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub workspace_id: String,
    pub job_type: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    /// Absolute start time. Wins over `delay_secs`.
    #[serde(default)]
    pub run_after: Option<DateTime<Utc>>,
    /// Start this many seconds after the database's `now()`.
    #[serde(default)]
    pub delay_secs: Option<i64>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

fn empty_payload() -> Value {
    Value::Object(Default::default())
}

impl NewJob {
    pub fn new(workspace_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            job_type: job_type.into(),
            payload: empty_payload(),
            dedupe_key: None,
            priority: None,
            run_after: None,
            delay_secs: None,
            max_attempts: None,
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    pub fn delay_secs(mut self, secs: i64) -> Self {
        self.delay_secs = Some(secs);
        self
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_id.trim().is_empty() {
            anyhow::bail!("workspace_id is required");
        }
        if self.job_type.trim().is_empty() {
            anyhow::bail!("job_type is required");
        }
        if let Some(d) = self.delay_secs {
            if !(0..=MAX_DELAY_SECS).contains(&d) {
                anyhow::bail!("delay_secs must be in 0..={MAX_DELAY_SECS} (got {d})");
            }
        }
        if let Some(n) = self.max_attempts {
            if n < 1 {
                anyhow::bail!("max_attempts must be >= 1 (got {n})");
            }
        }
        Ok(())
    }
}

/// `enqueued = false` means a live job with the same dedupe key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueResult {
    pub enqueued: bool,
    pub job_id: Option<i64>,
}

impl EnqueueResult {
    pub fn inserted(job_id: i64) -> Self {
        Self {
            enqueued: true,
            job_id: Some(job_id),
        }
    }

    pub fn deduplicated() -> Self {
        Self {
            enqueued: false,
            job_id: None,
        }
    }
}

/// What a `complete`/`fail` report did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Completed,
    Retrying { run_after: DateTime<Utc> },
    Dead,
    /// The caller no longer owns the claim (reaped, re-claimed, or already
    /// finished). Nothing was written.
    Stale,
}

impl ReportOutcome {
    pub fn is_stale(&self) -> bool {
        matches!(self, ReportOutcome::Stale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }

    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Dead,
    ];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} is not a valid job status")]
pub struct ParseJobStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(ParseJobStatusError(other.to_owned())),
        }
    }
}

/// Make an error message storable: NUL bytes (rejected by PostgreSQL TEXT)
/// become U+FFFD, then the text is cut to [`MAX_ERROR_CHARS`] without
/// splitting a char.
pub fn truncate_error(message: &str) -> String {
    let cleaned = message.replace('\0', "\u{FFFD}");
    match cleaned.char_indices().nth(MAX_ERROR_CHARS) {
        Some((idx, _)) => cleaned[..idx].to_string(),
        None => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "failed".parse::<JobStatus>().unwrap_err();
        assert_eq!(err, ParseJobStatusError("failed".into()));
        assert_eq!(err.to_string(), "failed is not a valid job status");
    }

    #[test]
    fn only_completed_and_dead_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
    }

    #[test]
    fn truncate_error_keeps_short_messages() {
        assert_eq!(truncate_error("boom"), "boom");
    }

    #[test]
    fn truncate_error_replaces_nul_bytes() {
        assert_eq!(truncate_error("bad\0bytes"), "bad\u{FFFD}bytes");
        let long = "\0".repeat(MAX_ERROR_CHARS + 5);
        let cut = truncate_error(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_CHARS);
        assert!(!cut.contains('\0'));
    }

    #[test]
    fn truncate_error_caps_length_on_char_boundary() {
        let long = "é".repeat(MAX_ERROR_CHARS + 10);
        let cut = truncate_error(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_CHARS);
    }

    #[test]
    fn new_job_validation() {
        assert!(NewJob::new("ws", "alert.check").validate().is_ok());
        assert!(NewJob::new("", "alert.check").validate().is_err());
        assert!(NewJob::new("ws", "  ").validate().is_err());
        assert!(NewJob::new("ws", "alert.check")
            .max_attempts(0)
            .validate()
            .is_err());
        assert!(NewJob::new("ws", "alert.check")
            .delay_secs(-1)
            .validate()
            .is_err());
        assert!(NewJob::new("ws", "alert.check")
            .delay_secs(MAX_DELAY_SECS + 1)
            .validate()
            .is_err());
        assert!(NewJob::new("ws", "alert.check")
            .delay_secs(30)
            .validate()
            .is_ok());
    }

    #[test]
    fn new_job_deserializes_with_defaults() {
        let job: NewJob =
            serde_json::from_value(serde_json::json!({"workspace_id": "ws", "job_type": "t"}))
                .unwrap();
        assert_eq!(job.payload, serde_json::json!({}));
        assert!(job.dedupe_key.is_none());
        assert!(job.priority.is_none());
    }
}
