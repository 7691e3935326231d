//! Job records and the types that describe them.
//!
//! - **JobId**: typed identifier for a job instance
//! - **JobStatus**: closed set of lifecycle states
//! - **JobConfig**: per-job retry/timeout/priority/scheduling policy
//! - **JobError**: failure recorded on a job by the dispatcher
//! - **Job**: the record owned by the [`JobStore`](super::JobStore)
//! - **JobContext**: what a handler receives when it is invoked

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ErrorCode, JobforgeError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Ready to be leased by a worker
    Pending,
    /// Waiting for its scheduled time
    Scheduled,
    /// Leased and executing on a worker
    Processing,
    /// Failed an attempt, waiting out its retry delay
    Retrying,
    /// Handler returned a result
    Completed,
    /// Failed after exhausting retries
    Failed,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Scheduled,
        Self::Processing,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the job can be manually retried.
    pub fn can_retry(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Dispatched only when nothing more urgent is pending
    Low = 0,
    /// Default for most jobs
    #[default]
    Normal = 1,
    /// Dispatched before normal jobs
    High = 2,
    /// Dispatched before everything else
    Critical = 3,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Config
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-job execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Retries allowed after the first attempt (0 = run once)
    pub max_retries: u32,
    /// Delay between a failed attempt and the job becoming pending again
    pub retry_delay_ms: u64,
    /// Deadline for a single attempt, must be non-zero
    pub timeout_ms: u64,
    /// Dispatch priority
    pub priority: JobPriority,
    /// Earliest time the job may run
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_ms: 30_000,
            priority: JobPriority::Normal,
            scheduled_at: None,
        }
    }
}

impl JobConfig {
    /// Set the priority.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the number of retries after the first attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = saturating_millis(delay);
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = saturating_millis(timeout);
        self
    }

    /// Set the scheduled time.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Reject configs the dispatcher cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(JobforgeError::validation("timeout_ms must be greater than zero")
                .with_context("field", "timeout_ms"));
        }
        Ok(())
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// No handler was registered for the job name at dispatch time
    HandlerNotFound,
    /// The handler returned an error or panicked
    Handler,
    /// The attempt's deadline elapsed before the handler resolved
    TimedOut,
}

impl JobErrorKind {
    /// The crate-level error code this failure corresponds to.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::HandlerNotFound => ErrorCode::HandlerNotFound,
            Self::Handler => ErrorCode::HandlerError,
            Self::TimedOut => ErrorCode::TimedOut,
        }
    }
}

/// Failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Failure kind
    pub kind: JobErrorKind,
    /// Error message
    pub message: String,
    /// Additional context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// A handler failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Handler,
            message: message.into(),
            context: None,
        }
    }

    pub fn handler_not_found(name: &str) -> Self {
        Self {
            kind: JobErrorKind::HandlerNotFound,
            message: format!("No handler registered for job: {}", name),
            context: None,
        }
    }

    pub fn timed_out(timeout_ms: u64) -> Self {
        Self {
            kind: JobErrorKind::TimedOut,
            message: format!("Job timed out after {}ms", timeout_ms),
            context: Some(serde_json::json!({ "timeout_ms": timeout_ms })),
        }
    }

    /// A handler task that panicked.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(format!("Handler panicked: {}", message.into()))
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

impl std::error::Error for JobError {}

impl From<JobforgeError> for JobError {
    fn from(error: JobforgeError) -> Self {
        let kind = match error.code() {
            ErrorCode::HandlerNotFound => JobErrorKind::HandlerNotFound,
            ErrorCode::TimedOut => JobErrorKind::TimedOut,
            _ => JobErrorKind::Handler,
        };
        Self {
            kind,
            message: error.user_message().to_string(),
            context: None,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(format!("{:#}", error))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(format!("Invalid payload: {}", error))
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// What a handler returns.
pub type HandlerResult = std::result::Result<serde_json::Value, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A job record.
///
/// Records are owned by the store; every accessor hands out a snapshot clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// Name of the handler that runs this job
    pub name: String,
    /// Opaque input handed to the handler
    pub payload: serde_json::Value,
    /// Current status
    pub status: JobStatus,
    /// Execution policy
    pub config: JobConfig,
    /// Number of execution attempts so far
    pub attempts: u32,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the latest attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure of the latest attempt (Retrying/Failed only)
    pub error: Option<JobError>,
    /// Handler output (Completed only)
    pub result: Option<serde_json::Value>,
    /// Insertion order, breaks `created_at` ties
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl Job {
    /// Create a new job. It starts `Scheduled` when `scheduled_at` lies in the future.
    pub fn new(name: impl Into<String>, payload: serde_json::Value, config: JobConfig) -> Self {
        let now = Utc::now();
        let status = match config.scheduled_at {
            Some(at) if at > now => JobStatus::Scheduled,
            _ => JobStatus::Pending,
        };

        Self {
            id: JobId::new(),
            name: name.into(),
            payload,
            status,
            config,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            sequence: 0,
        }
    }

    /// Check whether a scheduled job is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.config.scheduled_at.map_or(true, |at| at <= now)
    }

    /// Whether a failed attempt may be followed by another one.
    pub fn has_retries_left(&self) -> bool {
        self.attempts <= self.config.max_retries
    }

    /// Dispatch order: higher priority first, then oldest first.
    pub fn dispatch_cmp(&self, other: &Self) -> Ordering {
        other
            .config
            .priority
            .cmp(&self.config.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    name: String,
    payload: serde_json::Value,
    attempt: u32,
    timeout: Duration,
}

impl JobContext {
    pub(crate) fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            payload: job.payload.clone(),
            attempt: job.attempts,
            timeout: job.config.timeout(),
        }
    }

    /// Get the job ID.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Get the job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the raw payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Take ownership of the payload.
    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> std::result::Result<T, JobError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Deadline for this attempt. Exceeding it is not enforced on the handler itself.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            job_name = %self.name,
            attempt = self.attempt,
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            job_name = %self.name,
            attempt = self.attempt,
            message
        );
    }

    /// Log an error associated with this job.
    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.job_id,
            job_name = %self.name,
            attempt = self.attempt,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_id() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);

        let uuid = Uuid::new_v4();
        let id = JobId::from_uuid(uuid);
        assert_eq!(id.0, uuid);
        assert_eq!(id.to_string(), uuid.to_string());
    }

    #[test]
    fn test_job_status() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());

        assert!(JobStatus::Failed.can_retry());
        assert!(!JobStatus::Completed.can_retry());
        assert_eq!(JobStatus::Processing.to_string(), "processing");
    }

    #[test]
    fn test_job_priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        assert_eq!(JobPriority::default(), JobPriority::Normal);
    }

    #[test]
    fn test_config_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.priority, JobPriority::Normal);
        assert!(config.scheduled_at.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_saturates_huge_durations() {
        let config = JobConfig::default()
            .with_timeout(Duration::MAX)
            .with_retry_delay(Duration::MAX);
        assert_eq!(config.timeout_ms, u64::MAX);
        assert_eq!(config.retry_delay_ms, u64::MAX);

        let config = JobConfig::default().with_timeout(Duration::from_millis(1500));
        assert_eq!(config.timeout_ms, 1500);
    }

    #[test]
    fn test_config_rejects_zero_timeout() {
        let config = JobConfig::default().with_timeout(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn test_new_job_status_depends_on_schedule() {
        let job = Job::new("echo", json!({}), JobConfig::default());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);

        let later = Utc::now() + chrono::Duration::seconds(60);
        let job = Job::new("echo", json!({}), JobConfig::default().scheduled_for(later));
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(!job.is_due(Utc::now()));
        assert!(job.is_due(later));

        let past = Utc::now() - chrono::Duration::seconds(1);
        let job = Job::new("echo", json!({}), JobConfig::default().scheduled_for(past));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_retries_left() {
        let mut job = Job::new("x", json!(null), JobConfig::default().with_max_retries(2));
        job.attempts = 2;
        assert!(job.has_retries_left());
        job.attempts = 3;
        assert!(!job.has_retries_left());

        let mut once = Job::new("x", json!(null), JobConfig::default().with_max_retries(0));
        once.attempts = 1;
        assert!(!once.has_retries_left());
    }

    #[test]
    fn test_dispatch_order() {
        let low = Job::new("low", json!(null), JobConfig::default().with_priority(JobPriority::Low));
        let high = Job::new("high", json!(null), JobConfig::default().with_priority(JobPriority::High));
        assert_eq!(high.dispatch_cmp(&low), Ordering::Less);

        let mut first = Job::new("a", json!(null), JobConfig::default());
        let mut second = first.clone();
        first.sequence = 1;
        second.sequence = 2;
        assert_eq!(first.dispatch_cmp(&second), Ordering::Less);
    }

    #[test]
    fn test_job_error_conversions() {
        let err = JobError::from(JobforgeError::handler_not_found("missing"));
        assert_eq!(err.kind, JobErrorKind::HandlerNotFound);

        let err = JobError::timed_out(50);
        assert_eq!(err.kind, JobErrorKind::TimedOut);
        assert_eq!(err.kind.code(), ErrorCode::TimedOut);
        assert_eq!(err.context, Some(json!({ "timeout_ms": 50 })));

        let err: JobError = "boom".into();
        assert_eq!(err.kind, JobErrorKind::Handler);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_context_payload_decoding() {
        #[derive(Deserialize)]
        struct Input {
            x: i64,
        }

        let job = Job::new("echo", json!({ "x": 1 }), JobConfig::default());
        let ctx = JobContext::from_job(&job);
        let input: Input = ctx.payload_as().unwrap();
        assert_eq!(input.x, 1);

        let bad = ctx.payload_as::<Vec<String>>().unwrap_err();
        assert_eq!(bad.kind, JobErrorKind::Handler);
    }
}
