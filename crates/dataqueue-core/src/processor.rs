//! The worker pool (§4.5): poll, claim, dispatch handlers with
//! timeout/abort semantics, report outcomes.

use crate::backend::Backend;
use crate::context::{AbortSignal, HandlerError, JobContext, TimeoutHandle};
use crate::cron::CronScheduler;
use crate::events::{emit_error, EventBus, QueueEvent};
use crate::model::{EventType, FailureReason, Job};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Application code bound to a `jobType`, executing one invocation of a
/// job (§4.5).
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        payload: Value,
        signal: AbortSignal,
        ctx: JobContext,
    ) -> Result<Value, HandlerError>;
}

/// `ProcessorOptions` (§6).
#[derive(Clone)]
pub struct ProcessorOptions {
    pub worker_id: String,
    pub batch_size: usize,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub job_type_filter: Option<Vec<String>>,
    pub group_concurrency: Option<u32>,
    pub verbose: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        let batch_size = 10;
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            batch_size,
            concurrency: batch_size,
            poll_interval: Duration::from_millis(5000),
            job_type_filter: None,
            group_concurrency: None,
            verbose: false,
        }
    }
}

/// The interval at which an in-flight job's lease is refreshed so
/// `reclaimStuckJobs` doesn't steal a still-running job (§4.5 step 7).
fn heartbeat_interval(timeout_ms: Option<i64>) -> Duration {
    match timeout_ms {
        Some(ms) if ms > 0 => Duration::from_millis((ms as u64 / 3).max(1000)),
        _ => Duration::from_secs(20),
    }
}

/// Polls the backend, claims batches, and runs handlers with bounded
/// concurrency. One `Processor` owns one worker pool for one `workerId`.
pub struct Processor {
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
    cron: Option<Arc<CronScheduler>>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    options: ProcessorOptions,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl Processor {
    pub fn new(
        backend: Arc<dyn Backend>,
        events: Arc<EventBus>,
        handlers: HashMap<String, Arc<dyn JobHandler>>,
        options: ProcessorOptions,
    ) -> Self {
        let cron = Some(Arc::new(CronScheduler::new(backend.clone(), events.clone())));
        Self {
            semaphore: Arc::new(Semaphore::new(options.concurrency.max(1))),
            backend,
            events,
            cron,
            handlers,
            options,
            running: Arc::new(AtomicBool::new(false)),
            background: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One pass: evaluate due cron schedules, claim a batch, dispatch it,
    /// await all handlers, return the count processed.
    pub async fn start(&self) -> usize {
        if let Some(cron) = &self.cron {
            if let Err(e) = cron.enqueue_due_jobs().await {
                emit_error(&self.events, "processor:cron", &e);
            }
        }

        let filter_owned = self.options.job_type_filter.clone();
        let filter_slice = filter_owned.as_deref();
        let batch = match self
            .backend
            .get_next_batch(
                &self.options.worker_id,
                self.options.batch_size,
                filter_slice,
                self.options.group_concurrency,
            )
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                emit_error(&self.events, "processor:claim", &e);
                return 0;
            }
        };

        let mut joins = Vec::with_capacity(batch.len());
        for job in batch {
            let permit = self.semaphore.clone().acquire_owned().await;
            let Ok(permit) = permit else { continue };
            let this_backend = self.backend.clone();
            let this_events = self.events.clone();
            let handler = self.handlers.get(&job.job_type).cloned();
            let worker_id = self.options.worker_id.clone();
            joins.push(tokio::spawn(async move {
                let _permit = permit;
                dispatch_one(this_backend, this_events, worker_id, handler, job).await;
            }));
        }

        let count = joins.len();
        for j in joins {
            let _ = j.await;
        }
        count
    }

    /// Launches a loop running `start()` then sleeping `pollInterval`,
    /// cancellable via `stop()`/`stopAndDrain()`.
    pub async fn start_in_background(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                this.start().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(this.options.poll_interval).await;
            }
        });
        *self.background.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Prevents new batches and awaits in-flight handlers up to
    /// `timeout`; after it elapses, returns regardless (handlers continue
    /// but their outcomes may race with reclaim).
    pub async fn stop_and_drain(&self, timeout: Duration) {
        let started = tokio::time::Instant::now();
        self.stop().await;
        let handle = self.background.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
        // Draining in-flight handlers: wait for all concurrency permits to
        // free up (i.e. no handler still holds one), bounded by whatever of
        // the original timeout budget the background task join didn't use.
        let remaining = timeout.saturating_sub(started.elapsed());
        let drain_permits = self.options.concurrency.max(1);
        let _ = tokio::time::timeout(remaining, self.semaphore.acquire_many(drain_permits as u32)).await;
    }
}

async fn dispatch_one(
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
    worker_id: String,
    handler: Option<Arc<dyn JobHandler>>,
    job: Job,
) {
    let Some(handler) = handler else {
        if let Err(e) = backend
            .fail_job(job.id, "no handler registered for job type", FailureReason::NoHandler)
            .await
        {
            emit_error(&events, "processor:no-handler", &e);
        }
        events.emit(QueueEvent::JobFailed {
            job_id: job.id,
            job_type: job.job_type.clone(),
            will_retry: job.attempts < job.max_attempts,
            error: "no handler registered".to_string(),
        });
        return;
    };

    events.emit(QueueEvent::JobProcessing {
        job_id: job.id,
        job_type: job.job_type.clone(),
    });

    let timeout_handle = TimeoutHandle::new(job.timeout_ms);
    let signal = AbortSignal::new();
    let ctx = JobContext::new(
        job.id,
        worker_id,
        backend.clone(),
        events.clone(),
        job.step_data.clone(),
        timeout_handle.clone(),
    );

    let timed_out = Arc::new(AtomicBool::new(false));
    let timer_task = if timeout_handle.has_deadline() {
        Some(tokio::spawn(run_timer(
            timeout_handle.clone(),
            signal.clone(),
            timed_out.clone(),
        )))
    } else {
        None
    };

    let heartbeat_backend = backend.clone();
    let heartbeat_job_id = job.id;
    let heartbeat_period = heartbeat_interval(job.timeout_ms);
    let heartbeat_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(heartbeat_period).await;
            heartbeat_backend.prolong_job(heartbeat_job_id).await;
        }
    });

    let outcome = handler.handle(job.payload.clone(), signal.clone(), ctx.clone()).await;

    heartbeat_task.abort();
    if let Some(t) = timer_task {
        t.abort();
    }

    match outcome {
        Ok(value) => {
            let output = ctx.take_output_override().await.or(Some(value));
            if let Err(e) = backend.complete_job(job.id, output).await {
                emit_error(&events, "processor:complete", &e);
            }
            events.emit(QueueEvent::JobCompleted { job_id: job.id });
        }
        Err(HandlerError::Wait(signal)) => {
            let step_data = ctx.snapshot_step_data().await;
            if let Err(e) = backend
                .wait_job(job.id, signal.wait_until, signal.token_id, step_data)
                .await
            {
                emit_error(&events, "processor:wait", &e);
            }
            events.emit(QueueEvent::JobWaiting { job_id: job.id });
        }
        Err(HandlerError::Failed(err)) => {
            let reason = if timed_out.load(Ordering::SeqCst) {
                FailureReason::Timeout
            } else {
                FailureReason::HandlerError
            };
            let message = err.to_string();
            if let Err(e) = backend.fail_job(job.id, &message, reason).await {
                emit_error(&events, "processor:fail", &e);
            }
            events.emit(QueueEvent::JobFailed {
                job_id: job.id,
                job_type: job.job_type.clone(),
                will_retry: job.attempts < job.max_attempts,
                error: message,
            });
        }
    }
}

/// Drives a single monotonic timer per invocation, per §9: it watches the
/// shared deadline, re-reading it whenever `prolong`/`onTimeout` moves it,
/// rather than racing one-shot futures.
async fn run_timer(handle: TimeoutHandle, signal: AbortSignal, timed_out: Arc<AtomicBool>) {
    loop {
        let Some(deadline) = handle.current_deadline().await else {
            return;
        };
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                match handle.fire_on_timeout().await {
                    Some(extension_ms) if extension_ms > 0 => {
                        handle.prolong(Some(extension_ms)).await;
                        continue;
                    }
                    _ => {
                        timed_out.store(true, Ordering::SeqCst);
                        signal.abort();
                        return;
                    }
                }
            }
            _ = handle.notified() => {
                continue;
            }
        }
    }
}
