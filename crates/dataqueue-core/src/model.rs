//! The durable data model: jobs, cron schedules, waitpoints and events.
//!
//! Field names mirror §3 of the job-queue contract this crate implements;
//! storage backends map them onto `snake_case` columns or hash fields
//! one-to-one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Opaque, monotonically-increasing job identifier.
pub type JobId = i64;
/// Opaque, monotonically-increasing cron-schedule identifier.
pub type CronScheduleId = i64;
/// Opaque, monotonically-increasing event identifier.
pub type EventId = i64;

/// `{id, tier}` — the bearer of a per-group concurrency cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGroup {
    pub id: String,
    pub tier: Option<String>,
}

/// A single retry failure, appended to `error_history` in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobErrorEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Why a job landed in `failed` on its most recent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    HandlerError,
    NoHandler,
}

/// Retry-delay policy carried on the job (or propagated from a cron
/// schedule). See [`crate::retry::next_attempt_at`] for the formula.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in seconds. Defaults to 60 when unset but another retry
    /// field is set.
    pub retry_delay: Option<i64>,
    /// `true` = exponential backoff (the default once any retry field is
    /// set), `false` = fixed delay.
    pub retry_backoff: Option<bool>,
    /// Upper bound on the computed delay, in seconds.
    pub retry_delay_max: Option<i64>,
}

impl RetryPolicy {
    pub fn is_unset(&self) -> bool {
        self.retry_delay.is_none() && self.retry_backoff.is_none() && self.retry_delay_max.is_none()
    }
}

/// `status` alphabet (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Waiting => "waiting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// A single named step's memoised result, persisted inside `step_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub completed: bool,
    pub result: Value,
}

/// Dead-letter linkage, populated once a source job exhausts its retries
/// with `dead_letter_job_type` set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterLink {
    pub dead_letter_job_type: Option<String>,
    pub dead_letter_job_id: Option<JobId>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

/// A durable unit of work. See §3 for the field-by-field contract and
/// invariants; [`crate::backend::Backend`] is the only thing permitted to
/// mutate one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    // Classification
    pub job_type: String,
    pub payload: Value,
    pub tags: Vec<String>,
    pub idempotency_key: Option<String>,
    pub group: Option<JobGroup>,

    // Scheduling
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,

    // Execution budget
    pub max_attempts: i32,
    pub attempts: i32,
    pub timeout_ms: Option<i64>,
    pub force_kill_on_timeout: bool,
    pub retry_policy: RetryPolicy,

    // Lease
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,

    // Outcome
    pub status: JobStatus,
    pub output: Option<Value>,
    pub error_history: Vec<JobErrorEntry>,
    pub failure_reason: Option<FailureReason>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub dead_letter: DeadLetterLink,

    // Suspension
    pub wait_until: Option<DateTime<Utc>>,
    pub wait_token_id: Option<String>,
    pub step_data: HashMap<String, StepRecord>,

    // Lifecycle timestamps
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_retried_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_cancelled_at: Option<DateTime<Utc>>,

    // Progress
    pub progress: Option<u8>,
}

impl Job {
    /// §3 invariant: `processing` iff both lease fields are set.
    pub fn lease_consistent(&self) -> bool {
        (self.status == JobStatus::Processing)
            == (self.locked_at.is_some() && self.locked_by.is_some())
    }

    /// §3 invariant: `waiting` iff exactly one of `wait_until`/`wait_token_id`.
    pub fn wait_consistent(&self) -> bool {
        let exactly_one = self.wait_until.is_some() ^ self.wait_token_id.is_some();
        (self.status == JobStatus::Waiting) == exactly_one
    }
}

/// Status of a cron schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronScheduleStatus {
    Active,
    Paused,
}

/// A recurring template that promotes into a [`Job`] when due. See §3/§4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSchedule {
    pub id: CronScheduleId,
    pub schedule_name: String,
    pub cron_expression: String,
    pub job_type: String,
    pub payload: Value,
    pub timezone: String,
    pub allow_overlap: bool,
    pub status: CronScheduleStatus,

    // Fields propagated onto each enqueued job.
    pub priority: i32,
    pub max_attempts: i32,
    pub timeout_ms: Option<i64>,
    pub retry_policy: RetryPolicy,
    pub tags: Vec<String>,
    pub dead_letter_job_type: Option<String>,

    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<JobId>,
    pub next_run_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a waitpoint token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Waiting,
    Completed,
    TimedOut,
}

/// An external-signal rendezvous (`wp_…`). May exist unbound to any job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waitpoint {
    pub id: String,
    pub job_id: Option<JobId>,
    pub status: TokenStatus,
    pub output: Option<Value>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

/// The append-only per-job event log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Added,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retried,
    Edited,
    Prolonged,
    Waiting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: EventId,
    pub job_id: JobId,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}
