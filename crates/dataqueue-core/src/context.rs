//! The per-invocation API exposed to handlers (§4.5) and the plumbing it
//! needs: step memoisation, wait primitives, timeout prolongation, and a
//! cooperative abort signal.

use crate::backend::{Backend, NewToken};
use crate::events::{EventBus, QueueEvent};
use crate::model::{JobId, StepRecord, Waitpoint};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// The control-flow sentinel a handler returns (never thrown) to suspend a
/// job instead of completing or failing it. Design note §9: kept as an
/// explicit variant rather than bubbled through the generic error channel
/// so the processor never has to string-match an error to recognise a
/// suspension.
#[derive(Debug, Clone)]
pub struct WaitSignal {
    pub wait_until: Option<DateTime<Utc>>,
    pub token_id: Option<String>,
}

/// Everything a handler invocation can return besides a plain success
/// value: either a suspension or a genuine failure.
#[derive(Debug)]
pub enum HandlerError {
    Wait(WaitSignal),
    Failed(anyhow::Error),
}

impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        HandlerError::Failed(err.into())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// A cooperative cancellation token. The core never force-kills a handler
/// (§9); handlers must observe this and return promptly once it fires.
#[derive(Clone)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once `abort()` has been (or was already) called.
    pub async fn cancelled(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

type OnTimeoutCallback = Box<dyn FnMut() -> Option<i64> + Send>;

struct TimeoutState {
    /// The duration (ms) a bare `prolong()`/timer-restart falls back to.
    original_ms: Option<i64>,
    deadline: Option<Instant>,
    on_timeout: Option<OnTimeoutCallback>,
}

/// Shared between the [`JobContext`] (which lets a handler prolong the
/// deadline or register an on-timeout callback) and the processor's timer
/// task (which owns the actual sleep).
#[derive(Clone)]
pub struct TimeoutHandle {
    state: Arc<Mutex<TimeoutState>>,
    notify: Arc<Notify>,
    has_deadline: bool,
}

impl TimeoutHandle {
    pub fn new(timeout_ms: Option<i64>) -> Self {
        let deadline = timeout_ms.map(|ms| Instant::now() + StdDuration::from_millis(ms.max(0) as u64));
        Self {
            state: Arc::new(Mutex::new(TimeoutState {
                original_ms: timeout_ms,
                deadline,
                on_timeout: None,
            })),
            notify: Arc::new(Notify::new()),
            has_deadline: timeout_ms.is_some(),
        }
    }

    /// Whether this invocation has a `timeoutMs` at all; the processor only
    /// spawns a timer task when this is true.
    pub fn has_deadline(&self) -> bool {
        self.has_deadline
    }

    pub async fn current_deadline(&self) -> Option<Instant> {
        self.state.lock().await.deadline
    }

    /// `ms = None` resets to the job's original `timeoutMs` from now;
    /// `ms = Some(n)` resets to `n` ms from now. Wakes the timer task.
    pub async fn prolong(&self, ms: Option<i64>) {
        let mut state = self.state.lock().await;
        let effective = ms.or(state.original_ms);
        state.deadline = effective.map(|ms| Instant::now() + StdDuration::from_millis(ms.max(0) as u64));
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn set_on_timeout(&self, cb: OnTimeoutCallback) {
        self.state.lock().await.on_timeout = Some(cb);
    }

    /// Invoked by the timer task when the deadline elapses. Returns the
    /// extension (ms) the callback requested, if any.
    pub async fn fire_on_timeout(&self) -> Option<i64> {
        let mut state = self.state.lock().await;
        match state.on_timeout.as_mut() {
            Some(cb) => cb(),
            None => None,
        }
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

struct ContextShared {
    step_data: HashMap<String, StepRecord>,
    output_override: Option<Value>,
}

/// Per-invocation handle passed to a handler. Constructed fresh for every
/// claimed job.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    worker_id: String,
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
    shared: Arc<Mutex<ContextShared>>,
    timeout: TimeoutHandle,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        worker_id: String,
        backend: Arc<dyn Backend>,
        events: Arc<EventBus>,
        step_data: HashMap<String, StepRecord>,
        timeout: TimeoutHandle,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            backend,
            events,
            shared: Arc::new(Mutex::new(ContextShared {
                step_data,
                output_override: None,
            })),
            timeout,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Memoised sub-computation: if `name` already has a recorded result
    /// (from a prior suspended invocation), that result is returned without
    /// invoking `f`. Step names must be stable across re-invocations.
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> Result<T, HandlerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        {
            let shared = self.shared.lock().await;
            if let Some(record) = shared.step_data.get(name) {
                if record.completed {
                    let value: T = serde_json::from_value(record.result.clone())
                        .map_err(|e| HandlerError::Failed(e.into()))?;
                    return Ok(value);
                }
            }
        }
        let result = f().await?;
        let value = serde_json::to_value(&result).map_err(|e| HandlerError::Failed(e.into()))?;
        let mut shared = self.shared.lock().await;
        shared.step_data.insert(
            name.to_string(),
            StepRecord {
                completed: true,
                result: value,
            },
        );
        Ok(result)
    }

    /// Builds the suspension sentinel for a wall-clock delay. The handler
    /// must `return Err(...)` with it immediately.
    pub fn wait_for(&self, duration: StdDuration) -> HandlerError {
        let until = Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        HandlerError::Wait(WaitSignal {
            wait_until: Some(until),
            token_id: None,
        })
    }

    pub fn wait_until(&self, at: DateTime<Utc>) -> HandlerError {
        HandlerError::Wait(WaitSignal {
            wait_until: Some(at),
            token_id: None,
        })
    }

    pub fn wait_for_token(&self, token_id: impl Into<String>) -> HandlerError {
        HandlerError::Wait(WaitSignal {
            wait_until: None,
            token_id: Some(token_id.into()),
        })
    }

    pub async fn create_token(
        &self,
        timeout_at: Option<DateTime<Utc>>,
        tags: Vec<String>,
    ) -> Result<Waitpoint, HandlerError> {
        self.backend
            .create_token(NewToken {
                job_id: Some(self.job_id),
                timeout_at,
                tags,
            })
            .await
            .map_err(|e| HandlerError::Failed(e.into()))
    }

    /// Reads back a waitpoint by id. A handler resuming after
    /// `waitForToken` uses this to check whether it completed, timed out,
    /// or (spuriously) is still waiting.
    pub async fn get_token(&self, id: &str) -> Result<Option<Waitpoint>, HandlerError> {
        self.backend.get_token(id).await.map_err(|e| HandlerError::Failed(e.into()))
    }

    /// Validates `pct` is 0–100 and persists it. Synchronous validation
    /// error per §7, but note `run`/processor call sites decide whether a
    /// bad value should fail the job; this returns the error so they can.
    pub async fn set_progress(&self, pct: u8) -> Result<(), HandlerError> {
        if pct > 100 {
            return Err(HandlerError::Failed(anyhow::anyhow!(
                "progress must be within 0..=100, got {pct}"
            )));
        }
        self.backend.update_progress(self.job_id, pct).await;
        self.events.emit(QueueEvent::JobProgress { job_id: self.job_id, progress: pct });
        Ok(())
    }

    /// The value persists through `completeJob`; if the handler also
    /// returns a value, `setOutput`'s value wins (§4.5 step 6).
    pub async fn set_output(&self, value: Value) {
        self.backend.update_output(self.job_id, value.clone()).await;
        self.shared.lock().await.output_override = Some(value);
    }

    /// Resets the in-memory deadline to `ms` (or the job's original
    /// `timeoutMs`) from now, and persists a lease heartbeat so
    /// `reclaimStuckJobs` does not steal a still-running job.
    pub async fn prolong(&self, ms: Option<i64>) {
        self.timeout.prolong(ms).await;
        self.backend.prolong_job(self.job_id).await;
    }

    /// Registers the single on-timeout callback. If it returns `n > 0` the
    /// timer restarts for `n` ms; otherwise the abort proceeds.
    pub async fn on_timeout<F>(&self, cb: F)
    where
        F: FnMut() -> Option<i64> + Send + 'static,
    {
        self.timeout.set_on_timeout(Box::new(cb)).await;
    }

    pub(crate) async fn take_output_override(&self) -> Option<Value> {
        self.shared.lock().await.output_override.clone()
    }

    pub(crate) async fn snapshot_step_data(&self) -> HashMap<String, StepRecord> {
        self.shared.lock().await.step_data.clone()
    }
}
