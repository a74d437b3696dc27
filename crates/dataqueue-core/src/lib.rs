//! # DataQueue
//!
//! A durable background-job engine: typed work units are enqueued,
//! persisted, then claimed, executed, retried, and finalised by one or
//! more worker processes. Recurring work is scheduled via cron
//! expressions; handlers may pause mid-execution on time-based or
//! external-signal waitpoints.
//!
//! ## Architecture
//!
//! ```text
//! Producer ──addJob/addJobs──► Backend (durable) ◄──getNextBatch── Processor
//!                                   ▲                                 │
//!                                   │                          dispatch(handler)
//!                              Supervisor                             │
//!                         (reclaim/cleanup/expire)           completeJob/failJob/waitJob
//! ```
//!
//! `dataqueue-core` is storage-agnostic: it defines the [`Backend`] trait
//! that every storage implementation satisfies atomically, and everything
//! that sits on top of it — the claim protocol's caller, the worker pool,
//! the cron evaluator, the waitpoint-aware job context, and event hooks.
//! See `dataqueue-postgres` for the relational backend and
//! `dataqueue-redis` for the key-value one.
//!
//! ## Key invariants
//!
//! - `processing` status iff both lease fields (`lockedAt`/`lockedBy`) are set.
//! - `waiting` status iff exactly one of `waitUntil`/`waitTokenId` is set.
//! - `attempts <= maxAttempts`, always.
//! - An `idempotencyKey`, once used, maps to exactly one job id.
//!
//! ## Example
//!
//! ```ignore
//! use dataqueue_core::{JobQueue, backend::NewJob, processor::ProcessorOptions};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! let queue = JobQueue::new(backend);
//! let id = queue.add_job(NewJob {
//!     job_type: "email".into(),
//!     payload: serde_json::json!({"to": "a@x.com"}),
//!     ..Default::default()
//! }).await?;
//!
//! let processor = queue.processor(handlers, ProcessorOptions::default());
//! processor.start().await;
//! ```

pub mod backend;
pub mod context;
pub mod cron;
pub mod error;
pub mod events;
pub mod model;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod supervisor;

#[cfg(test)]
mod engine_tests;

pub use backend::{Backend, JobEdit, JobFilter, NewCronSchedule, NewJob, NewToken, QueueStats, TagMode};
pub use context::{AbortSignal, HandlerError, HandlerResult, JobContext, WaitSignal};
pub use error::{DataQueueError, DataQueueResult};
pub use events::{EventBus, ListenerId, QueueEvent};
pub use model::{
    CronSchedule, CronScheduleId, CronScheduleStatus, DeadLetterLink, EventType, FailureReason,
    Job, JobErrorEntry, JobEvent, JobGroup, JobId, JobStatus, RetryPolicy, StepRecord, TokenStatus,
    Waitpoint,
};
pub use processor::{JobHandler, Processor, ProcessorOptions};
pub use queue::{JobQueue, JobQueueBuilder, JobQueueConfig};
pub use supervisor::{Supervisor, SupervisorOptions, TickReport};
