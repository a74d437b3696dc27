//! The periodic maintenance loop (§4.6): reclaim stuck jobs, cleanup old
//! jobs/events, expire timed-out waitpoint tokens.

use crate::backend::Backend;
use crate::events::{emit_error, EventBus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// `SupervisorOptions` (§6).
#[derive(Clone)]
pub struct SupervisorOptions {
    pub interval: Duration,
    pub stuck_jobs_timeout_minutes: i64,
    pub cleanup_jobs_days_to_keep: i64,
    pub cleanup_events_days_to_keep: i64,
    pub cleanup_batch_size: usize,
    pub reclaim_stuck_jobs: bool,
    pub expire_timed_out_tokens: bool,
    pub verbose: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_jobs_timeout_minutes: 10,
            cleanup_jobs_days_to_keep: 30,
            cleanup_events_days_to_keep: 30,
            cleanup_batch_size: 1000,
            reclaim_stuck_jobs: true,
            expire_timed_out_tokens: true,
            verbose: false,
        }
    }
}

/// Counts from one maintenance tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub reclaimed: u64,
    pub cleaned_jobs: u64,
    pub cleaned_events: u64,
    pub expired_tokens: u64,
}

pub struct Supervisor {
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
    options: SupervisorOptions,
    running: Arc<AtomicBool>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(backend: Arc<dyn Backend>, events: Arc<EventBus>, options: SupervisorOptions) -> Self {
        Self {
            backend,
            events,
            options,
            running: Arc::new(AtomicBool::new(false)),
            background: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs every task independently; a failure in one never skips the
    /// rest (§4.6).
    pub async fn start(&self) -> TickReport {
        let mut report = TickReport::default();

        if self.options.reclaim_stuck_jobs {
            match self
                .backend
                .reclaim_stuck_jobs(self.options.stuck_jobs_timeout_minutes)
                .await
            {
                Ok(n) => report.reclaimed = n,
                Err(e) => emit_error(&self.events, "supervisor:reclaim", &e),
            }
        }

        if self.options.cleanup_jobs_days_to_keep > 0 {
            match self
                .backend
                .cleanup_old_jobs(
                    self.options.cleanup_jobs_days_to_keep,
                    Some(self.options.cleanup_batch_size),
                )
                .await
            {
                Ok(n) => report.cleaned_jobs = n,
                Err(e) => emit_error(&self.events, "supervisor:cleanup-jobs", &e),
            }
        }

        if self.options.cleanup_events_days_to_keep > 0 {
            match self
                .backend
                .cleanup_old_job_events(
                    self.options.cleanup_events_days_to_keep,
                    Some(self.options.cleanup_batch_size),
                )
                .await
            {
                Ok(n) => report.cleaned_events = n,
                Err(e) => emit_error(&self.events, "supervisor:cleanup-events", &e),
            }
        }

        if self.options.expire_timed_out_tokens {
            match self.backend.expire_timed_out_tokens().await {
                Ok(n) => report.expired_tokens = n,
                Err(e) => emit_error(&self.events, "supervisor:expire-tokens", &e),
            }
        }

        report
    }

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
                tokio::time::sleep(this.options.interval).await;
            }
        });
        *self.background.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn stop_and_drain(&self, timeout: Duration) {
        self.stop().await;
        let handle = self.background.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }
}
