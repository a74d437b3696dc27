//! In-process, best-effort hook dispatch (§4.7, §9 "bounded, in-process
//! pub/sub"). No cross-process delivery; a throwing listener never aborts
//! the engine.

use crate::model::JobId;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Payloads carried by each hook. Matches the six named events plus the
/// generic error channel from §4.7.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobAdded { job_id: JobId, job_type: String },
    JobCancelled { job_id: JobId },
    JobRetried { job_id: JobId },
    JobProcessing { job_id: JobId, job_type: String },
    JobCompleted { job_id: JobId },
    JobFailed { job_id: JobId, job_type: String, will_retry: bool, error: String },
    JobWaiting { job_id: JobId },
    JobProgress { job_id: JobId, progress: u8 },
    Error { context: String, message: String },
}

impl QueueEvent {
    fn channel(&self) -> &'static str {
        match self {
            QueueEvent::JobAdded { .. } => "job:added",
            QueueEvent::JobCancelled { .. } => "job:cancelled",
            QueueEvent::JobRetried { .. } => "job:retried",
            QueueEvent::JobProcessing { .. } => "job:processing",
            QueueEvent::JobCompleted { .. } => "job:completed",
            QueueEvent::JobFailed { .. } => "job:failed",
            QueueEvent::JobWaiting { .. } => "job:waiting",
            QueueEvent::JobProgress { .. } => "job:progress",
            QueueEvent::Error { .. } => "error",
        }
    }
}

type Listener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

struct Registration {
    id: u64,
    once: bool,
    listener: Listener,
}

/// A mapping `eventName -> ordered sequence of callbacks`, per §9.
#[derive(Default)]
pub struct EventBus {
    channels: DashMap<&'static str, Vec<Registration>>,
    next_id: AtomicU64,
}

/// A token returned by `on`/`once`, usable with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, channel: &'static str, once: bool, f: Listener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .entry(channel)
            .or_default()
            .push(Registration { id, once, listener: f });
        ListenerId(id)
    }

    pub fn on(&self, channel: &'static str, f: impl Fn(&QueueEvent) + Send + Sync + 'static) -> ListenerId {
        self.register(channel, false, Arc::new(f))
    }

    /// Desugars to an auto-removing callback (§9).
    pub fn once(&self, channel: &'static str, f: impl Fn(&QueueEvent) + Send + Sync + 'static) -> ListenerId {
        self.register(channel, true, Arc::new(f))
    }

    pub fn off(&self, channel: &'static str, id: ListenerId) {
        if let Some(mut entry) = self.channels.get_mut(channel) {
            entry.retain(|r| r.id != id.0);
        }
    }

    pub fn remove_all_listeners(&self, channel: Option<&'static str>) {
        match channel {
            Some(c) => {
                self.channels.remove(c);
            }
            None => self.channels.clear(),
        }
    }

    /// Fans the event out to every listener on its channel, synchronously,
    /// swallowing any listener panic boundary at the call site (listeners
    /// here are plain closures, not fallible, by construction).
    pub fn emit(&self, event: QueueEvent) {
        let channel = event.channel();
        let mut fired_once_ids = Vec::new();
        if let Some(registrations) = self.channels.get(channel) {
            for reg in registrations.iter() {
                (reg.listener)(&event);
                if reg.once {
                    fired_once_ids.push(reg.id);
                }
            }
        }
        if !fired_once_ids.is_empty() {
            if let Some(mut registrations) = self.channels.get_mut(channel) {
                registrations.retain(|r| !fired_once_ids.contains(&r.id));
            }
        }
    }
}

/// Convenience used by the processor/supervisor to report an operational
/// error on the generic `error` channel without constructing a full
/// [`QueueEvent::Error`] at every call site.
pub fn emit_error(bus: &EventBus, context: &str, err: &(impl std::fmt::Display + ?Sized)) {
    bus.emit(QueueEvent::Error {
        context: context.to_string(),
        message: err.to_string(),
    });
}

/// Marker so downstream crates can hand a `Value` through without importing
/// `serde_json` themselves just for this module's signatures.
pub type EventMetadata = Option<Value>;
