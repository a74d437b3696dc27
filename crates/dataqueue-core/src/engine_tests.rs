//! End-to-end coverage of the engine's observable behaviour, running the
//! real [`Processor`]/[`Supervisor`]/[`JobQueue`] against the in-memory
//! backend from `dataqueue-testing`.

use crate::backend::{Backend, JobFilter, NewJob, NewToken};
use crate::context::{AbortSignal, HandlerError, HandlerResult, JobContext};
use crate::events::QueueEvent;
use crate::model::{FailureReason, JobStatus, RetryPolicy};
use crate::processor::{JobHandler, ProcessorOptions};
use crate::queue::JobQueue;
use async_trait::async_trait;
use dataqueue_testing::MemoryBackend;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, payload: Value, _signal: AbortSignal, _ctx: JobContext) -> HandlerResult {
        Ok(payload)
    }
}

struct AlwaysFailHandler;

#[async_trait]
impl JobHandler for AlwaysFailHandler {
    async fn handle(&self, _payload: Value, _signal: AbortSignal, _ctx: JobContext) -> HandlerResult {
        Err(HandlerError::Failed(anyhow::anyhow!("handler intentionally failed")))
    }
}

fn queue() -> JobQueue {
    JobQueue::new(Arc::new(MemoryBackend::new()))
}

#[tokio::test]
async fn basic_lifecycle_completes_a_job() {
    let queue = queue();
    let id = queue
        .add_job(NewJob {
            job_type: "echo".into(),
            payload: json!({"hello": "world"}),
            ..NewJob::default()
        })
        .await
        .unwrap();

    let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert("echo".into(), Arc::new(EchoHandler));
    let processor = queue.processor(handlers, ProcessorOptions { poll_interval: Duration::from_millis(10), ..ProcessorOptions::default() });

    processor.start().await;

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output, Some(json!({"hello": "world"})));
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn failed_job_schedules_a_fixed_delay_retry() {
    let queue = queue();
    let id = queue
        .add_job(NewJob {
            job_type: "boom".into(),
            max_attempts: 3,
            retry_policy: RetryPolicy {
                retry_delay: Some(3600),
                retry_backoff: Some(false),
                retry_delay_max: None,
            },
            ..NewJob::default()
        })
        .await
        .unwrap();

    let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert("boom".into(), Arc::new(AlwaysFailHandler));
    let processor = queue.processor(handlers, ProcessorOptions::default());

    processor.start().await;

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.failure_reason, Some(FailureReason::HandlerError));
    let next = job.next_attempt_at.expect("a retryable failure sets next_attempt_at");
    let delta = next - job.last_failed_at.unwrap();
    assert!((delta.num_seconds() - 3600).abs() <= 1);

    // A second pass (simulating the next poll, after fast-forwarding the
    // backend's notion of "due") should not reclaim it early.
    let batch = queue.backend().get_next_batch("w2", 10, None, None).await.unwrap();
    assert!(batch.is_empty(), "retry isn't due yet");
}

#[tokio::test]
async fn exhausting_retries_dead_letters_the_job() {
    let queue = queue();
    let id = queue
        .add_job(NewJob {
            job_type: "boom".into(),
            max_attempts: 1,
            retry_policy: RetryPolicy {
                retry_delay: Some(0),
                retry_backoff: Some(false),
                retry_delay_max: None,
            },
            dead_letter_job_type: Some("boom.dead".into()),
            ..NewJob::default()
        })
        .await
        .unwrap();

    let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert("boom".into(), Arc::new(AlwaysFailHandler));
    let processor = queue.processor(handlers, ProcessorOptions::default());
    processor.start().await;

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, job.max_attempts);
    let dlq_id = job.dead_letter.dead_letter_job_id.expect("exhausted retries dead-letter");
    let dlq_job = queue.get_job(dlq_id).await.unwrap().unwrap();
    assert_eq!(dlq_job.job_type, "boom.dead");
}

#[tokio::test]
async fn higher_priority_jobs_claim_first() {
    let backend = Arc::new(MemoryBackend::new());
    let low = backend.add_job(NewJob { job_type: "t".into(), priority: 0, ..NewJob::default() }).await.unwrap();
    let high = backend.add_job(NewJob { job_type: "t".into(), priority: 100, ..NewJob::default() }).await.unwrap();
    let mid = backend.add_job(NewJob { job_type: "t".into(), priority: 50, ..NewJob::default() }).await.unwrap();

    let batch = backend.get_next_batch("w1", 10, None, None).await.unwrap();
    let ids: Vec<i64> = batch.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![high, mid, low]);
}

#[tokio::test]
async fn idempotency_key_collapses_duplicate_enqueues() {
    let queue = queue();
    let first = queue
        .add_job(NewJob { job_type: "t".into(), idempotency_key: Some("order-42".into()), ..NewJob::default() })
        .await
        .unwrap();
    let second = queue
        .add_job(NewJob { job_type: "t".into(), idempotency_key: Some("order-42".into()), ..NewJob::default() })
        .await
        .unwrap();
    assert_eq!(first, second);

    let jobs = queue
        .get_jobs(JobFilter { job_type: vec!["t".into()], ..JobFilter::default() })
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
}

struct ResumableHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for ResumableHandler {
    async fn handle(&self, _payload: Value, _signal: AbortSignal, ctx: JobContext) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step_one: i64 = ctx.run("fetch", || async { Ok::<i64, HandlerError>(42) }).await?;
        if step_one != 42 {
            return Err(HandlerError::Failed(anyhow::anyhow!("unexpected memoised value")));
        }
        // First invocation suspends before ever reaching this point twice.
        Err(ctx.wait_for(Duration::from_millis(1)))
    }
}

#[tokio::test]
async fn wait_for_suspends_and_step_data_is_memoised_on_resume() {
    let queue = queue();
    let id = queue.add_job(NewJob { job_type: "resumable".into(), ..NewJob::default() }).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert("resumable".into(), Arc::new(ResumableHandler { calls: calls.clone() }));
    let processor = queue.processor(handlers, ProcessorOptions::default());

    processor.start().await;
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert!(job.step_data.contains_key("fetch"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Let the wait elapse, then claim again: the memoised step must not
    // re-run its closure (the handler would error if `step_one != 42`,
    // and we assert the closure only logically executed once worth of
    // progress by checking attempts advanced without losing step_data).
    tokio::time::sleep(Duration::from_millis(15)).await;
    let batch = queue.backend().get_next_batch("w1", 10, None, None).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert!(batch[0].step_data.contains_key("fetch"));
}

#[tokio::test]
async fn token_completion_resumes_a_waiting_job() {
    let queue = queue();
    let id = queue.add_job(NewJob { job_type: "wait-for-approval".into(), ..NewJob::default() }).await.unwrap();

    let token = queue.create_token(NewToken { job_id: Some(id), ..NewToken::default() }).await.unwrap();

    // A job must be claimed (`processing`) before it can be suspended.
    let claimed = queue.backend().get_next_batch("w1", 10, None, None).await.unwrap();
    assert_eq!(claimed.len(), 1);
    queue
        .backend()
        .wait_job(id, None, Some(token.id.clone()), HashMap::new())
        .await
        .unwrap();
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Waiting);

    queue.complete_token(&token.id, json!({"approved": true})).await.unwrap();

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let batch = queue.backend().get_next_batch("w1", 10, None, None).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, id);
}

#[tokio::test]
async fn cron_overlap_guard_skips_while_previous_run_is_active() {
    let queue = queue();
    let schedule_id = queue
        .add_cron_schedule(crate::backend::NewCronSchedule {
            schedule_name: "every-minute".into(),
            cron_expression: "* * * * *".into(),
            job_type: "tick".into(),
            payload: json!({}),
            timezone: "UTC".into(),
            allow_overlap: false,
            priority: 0,
            max_attempts: 1,
            timeout_ms: None,
            retry_policy: RetryPolicy::default(),
            tags: Vec::new(),
            dead_letter_job_type: None,
        })
        .await
        .unwrap();

    // Force it due right now by editing next_run_at indirectly: enqueue,
    // then immediately try again while the first job is still pending.
    queue
        .backend()
        .update_cron_schedule_after_enqueue(schedule_id, chrono::Utc::now(), 0, Some(chrono::Utc::now()))
        .await
        .ok();

    let enqueued_first = queue.enqueue_due_cron_jobs().await.unwrap();
    assert_eq!(enqueued_first, 1);

    let schedule = queue.get_cron_schedule(schedule_id).await.unwrap().unwrap();
    let last_job_id = schedule.last_job_id.unwrap();
    let last_job = queue.get_job(last_job_id).await.unwrap().unwrap();
    assert_eq!(last_job.status, JobStatus::Pending);

    // Make it "due" again without the previous job having finished.
    queue
        .backend()
        .update_cron_schedule_after_enqueue(schedule_id, chrono::Utc::now(), last_job_id, Some(chrono::Utc::now()))
        .await
        .unwrap();

    let enqueued_second = queue.enqueue_due_cron_jobs().await.unwrap();
    assert_eq!(enqueued_second, 0, "overlap guard must skip while the prior job is still active");
}

#[tokio::test]
async fn job_failed_event_fires_on_the_bus() {
    let queue = queue();
    let id = queue.add_job(NewJob { job_type: "boom".into(), max_attempts: 1, ..NewJob::default() }).await.unwrap();

    let saw_failure = Arc::new(AtomicUsize::new(0));
    let flag = saw_failure.clone();
    queue.events().on("job:failed", move |event| {
        if let QueueEvent::JobFailed { job_id, .. } = event {
            if *job_id == id {
                flag.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert("boom".into(), Arc::new(AlwaysFailHandler));
    let processor = queue.processor(handlers, ProcessorOptions::default());
    processor.start().await;

    assert_eq!(saw_failure.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn supervisor_reclaims_stuck_jobs() {
    let backend = Arc::new(MemoryBackend::new());
    let id = backend.add_job(NewJob { job_type: "t".into(), ..NewJob::default() }).await.unwrap();
    backend.get_next_batch("zombie-worker", 10, None, None).await.unwrap();
    assert_eq!(backend.get_job(id).await.unwrap().unwrap().status, JobStatus::Processing);

    // A 0-minute threshold means "reclaim anything currently processing".
    let reclaimed = backend.reclaim_stuck_jobs(0).await.unwrap();
    assert_eq!(reclaimed, 1);
    assert_eq!(backend.get_job(id).await.unwrap().unwrap().status, JobStatus::Pending);
}
