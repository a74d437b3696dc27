//! The backend contract (§4.1) — the one interface every storage
//! implementation (`dataqueue-postgres`, `dataqueue-redis`,
//! `dataqueue-testing`'s in-memory store) satisfies atomically.

use crate::error::DataQueueResult;
use crate::model::{
    CronSchedule, CronScheduleId, CronScheduleStatus, Job, JobEvent, JobGroup, JobId,
    RetryPolicy, StepRecord, Waitpoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Arguments to `addJob`. `id` and bookkeeping fields are assigned by the
/// backend.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub tags: Vec<String>,
    pub idempotency_key: Option<String>,
    pub group: Option<JobGroup>,
    pub priority: i32,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub timeout_ms: Option<i64>,
    pub force_kill_on_timeout: bool,
    pub retry_policy: RetryPolicy,
    pub dead_letter_job_type: Option<String>,
}

impl Default for NewJob {
    fn default() -> Self {
        Self {
            job_type: String::new(),
            payload: Value::Null,
            tags: Vec::new(),
            idempotency_key: None,
            group: None,
            priority: 0,
            run_at: None,
            max_attempts: 1,
            timeout_ms: None,
            force_kill_on_timeout: false,
            retry_policy: RetryPolicy::default(),
            dead_letter_job_type: None,
        }
    }
}

/// How a tag filter's `tags` list should be matched against a job's tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    /// Job's tags are a superset of the filter.
    All,
    /// Non-empty intersection.
    Any,
    /// Set equality.
    Exact,
    /// Empty intersection.
    None,
}

/// A `runAt` comparator, for filters that need more than equality.
#[derive(Debug, Clone, Copy)]
pub enum TimeComparator {
    Gt(DateTime<Utc>),
    Gte(DateTime<Utc>),
    Lt(DateTime<Utc>),
    Lte(DateTime<Utc>),
    Eq(DateTime<Utc>),
}

/// Filters accepted by `getJobs`. All fields are conjunctive (AND).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Vec<crate::model::JobStatus>,
    pub job_type: Vec<String>,
    pub tags: Option<(TagMode, Vec<String>)>,
    pub run_at: Option<TimeComparator>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// A nullable-field patch: distinguishes "leave alone" from "set to null".
#[derive(Debug, Clone)]
pub enum Patch<T> {
    Clear,
    Set(T),
}

/// Updates accepted by `editJob`/`editAllPendingJobs`. Only acts on
/// `pending` jobs; `job_type` is immutable and not represented here.
#[derive(Debug, Clone, Default)]
pub struct JobEdit {
    pub payload: Option<Value>,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub run_at: Option<DateTime<Utc>>,
    pub timeout_ms: Option<Patch<i64>>,
    pub tags: Option<Patch<Vec<String>>>,
    pub retry_delay: Option<Patch<i64>>,
    pub retry_backoff: Option<Patch<bool>>,
    pub retry_delay_max: Option<Patch<i64>>,
}

/// Arguments to `createToken`.
#[derive(Debug, Clone, Default)]
pub struct NewToken {
    pub job_id: Option<JobId>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

/// Arguments to `addCronSchedule`.
#[derive(Debug, Clone)]
pub struct NewCronSchedule {
    pub schedule_name: String,
    pub cron_expression: String,
    pub job_type: String,
    pub payload: Value,
    pub timezone: String,
    pub allow_overlap: bool,
    pub priority: i32,
    pub max_attempts: i32,
    pub timeout_ms: Option<i64>,
    pub retry_policy: RetryPolicy,
    pub tags: Vec<String>,
    pub dead_letter_job_type: Option<String>,
}

/// Updates accepted by `editCronSchedule`.
#[derive(Debug, Clone, Default)]
pub struct CronScheduleEdit {
    pub cron_expression: Option<String>,
    pub payload: Option<Value>,
    pub timezone: Option<String>,
    pub allow_overlap: Option<bool>,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub timeout_ms: Option<Patch<i64>>,
    pub retry_policy: Option<RetryPolicy>,
    pub tags: Option<Vec<String>>,
    pub dead_letter_job_type: Option<Patch<String>>,
}

/// Aggregate counts, used by the supervisor's tracing output and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub waiting: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// The atomic persistence contract. Every method here must be safe to call
/// from any number of concurrent workers; see §4.2 and §5 for the
/// concurrency guarantees a conforming implementation must uphold.
#[async_trait]
pub trait Backend: Send + Sync {
    // -- Jobs ---------------------------------------------------------

    async fn add_job(&self, job: NewJob) -> DataQueueResult<JobId>;

    /// Same contract as `add_job`, applied item-by-item; new items in a
    /// single atomic unit where the backend supports it. Return order
    /// matches `jobs` order.
    async fn add_jobs(&self, jobs: Vec<NewJob>) -> DataQueueResult<Vec<JobId>>;

    async fn get_job(&self, id: JobId) -> DataQueueResult<Option<Job>>;

    async fn get_jobs(&self, filter: JobFilter) -> DataQueueResult<Vec<Job>>;

    /// The heart of the engine: promote ready/retry/timed-out work and
    /// atomically claim up to `batch_size` of it for `worker_id`. See §4.2.
    ///
    /// `group_concurrency`, when set, caps how many jobs sharing a
    /// `group.id` may be `processing` process-wide at once; the backend
    /// enforces it as part of the same atomic claim (§4.2 "group
    /// concurrency cap").
    async fn get_next_batch(
        &self,
        worker_id: &str,
        batch_size: usize,
        job_type_filter: Option<&[String]>,
        group_concurrency: Option<u32>,
    ) -> DataQueueResult<Vec<Job>>;

    async fn complete_job(&self, id: JobId, output: Option<Value>) -> DataQueueResult<()>;

    async fn fail_job(
        &self,
        id: JobId,
        error: &str,
        failure_reason: crate::model::FailureReason,
    ) -> DataQueueResult<()>;

    async fn retry_job(&self, id: JobId) -> DataQueueResult<()>;

    async fn cancel_job(&self, id: JobId) -> DataQueueResult<()>;

    async fn edit_job(&self, id: JobId, edit: JobEdit) -> DataQueueResult<()>;

    /// Applies `edit` to every `pending` job matching `filter`; returns the
    /// count touched.
    async fn edit_all_pending_jobs(
        &self,
        filter: JobFilter,
        edit: JobEdit,
    ) -> DataQueueResult<u64>;

    /// Heartbeat: best-effort; never fails the job.
    async fn prolong_job(&self, id: JobId);

    async fn update_progress(&self, id: JobId, pct: u8);

    async fn update_output(&self, id: JobId, value: Value);

    async fn reclaim_stuck_jobs(&self, max_processing_minutes: i64) -> DataQueueResult<u64>;

    async fn cleanup_old_jobs(
        &self,
        days_to_keep: i64,
        batch_size: Option<usize>,
    ) -> DataQueueResult<u64>;

    async fn cleanup_old_job_events(
        &self,
        days_to_keep: i64,
        batch_size: Option<usize>,
    ) -> DataQueueResult<u64>;

    async fn stats(&self) -> DataQueueResult<QueueStats>;

    // -- Waitpoints -----------------------------------------------------

    async fn create_token(&self, token: NewToken) -> DataQueueResult<Waitpoint>;

    async fn get_token(&self, id: &str) -> DataQueueResult<Option<Waitpoint>>;

    /// Transitions the token to `completed`; if bound to a `waiting` job,
    /// restores it to `pending` and re-queues it.
    async fn complete_token(&self, id: &str, output: Value) -> DataQueueResult<()>;

    async fn expire_timed_out_tokens(&self) -> DataQueueResult<u64>;

    /// Transitions a `processing` job to `waiting`, persisting its step
    /// cache and the wait target. Exactly one of `wait_until`/`token_id` is
    /// `Some`.
    async fn wait_job(
        &self,
        id: JobId,
        wait_until: Option<DateTime<Utc>>,
        token_id: Option<String>,
        step_data: HashMap<String, StepRecord>,
    ) -> DataQueueResult<()>;

    // -- Cron -------------------------------------------------------------

    async fn add_cron_schedule(&self, schedule: NewCronSchedule) -> DataQueueResult<CronScheduleId>;

    async fn get_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<Option<CronSchedule>>;

    async fn get_cron_schedule_by_name(&self, name: &str) -> DataQueueResult<Option<CronSchedule>>;

    async fn list_cron_schedules(
        &self,
        status: Option<CronScheduleStatus>,
    ) -> DataQueueResult<Vec<CronSchedule>>;

    async fn pause_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()>;

    async fn resume_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()>;

    async fn edit_cron_schedule(
        &self,
        id: CronScheduleId,
        edit: CronScheduleEdit,
    ) -> DataQueueResult<()>;

    async fn remove_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()>;

    async fn get_due_cron_schedules(&self) -> DataQueueResult<Vec<CronSchedule>>;

    async fn update_cron_schedule_after_enqueue(
        &self,
        id: CronScheduleId,
        last_enqueued_at: DateTime<Utc>,
        last_job_id: JobId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DataQueueResult<()>;

    // -- Events -------------------------------------------------------------

    /// Errors recording an event are swallowed by the caller, never
    /// surfaced (§4.1); implementations should still return a `Result` so
    /// callers that *do* want to observe a storage outage for diagnostics
    /// can, but the engine itself never propagates one.
    async fn record_job_event(
        &self,
        job_id: JobId,
        event_type: crate::model::EventType,
        metadata: Option<Value>,
    ) -> DataQueueResult<()>;

    async fn get_job_events(&self, job_id: JobId) -> DataQueueResult<Vec<JobEvent>>;

    // -- Group concurrency ------------------------------------------------

    /// Current process-wide in-flight count for `group_id`. Backends that
    /// don't implement cross-process group accounting may return 0;
    /// `dataqueue-postgres` and `dataqueue-redis` track it durably.
    async fn group_in_flight(&self, group_id: &str) -> DataQueueResult<u64> {
        let _ = group_id;
        Ok(0)
    }

    /// A cheap liveness probe (pool/client reachability).
    async fn ping(&self) -> DataQueueResult<()> {
        Ok(())
    }
}
