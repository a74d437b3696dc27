//! Walks through two of the engine's core guarantees against the in-memory
//! backend: a job's basic lifecycle, and priority ordering within a single
//! claim.
//!
//! Run with `cargo run -p log-processor-demo`.

use anyhow::Result;
use async_trait::async_trait;
use dataqueue_core::backend::NewJob;
use dataqueue_core::context::{AbortSignal, HandlerError, JobContext};
use dataqueue_core::model::JobStatus;
use dataqueue_core::processor::{JobHandler, ProcessorOptions};
use dataqueue_core::queue::JobQueue;
use dataqueue_testing::MemoryBackend;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

/// Appends every handled payload to a shared log, in claim order.
struct LogHandler {
    log: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(
        &self,
        payload: Value,
        _signal: AbortSignal,
        _ctx: JobContext,
    ) -> Result<Value, HandlerError> {
        self.log.lock().unwrap().push(payload.clone());
        Ok(json!({ "logged": payload }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    basic_lifecycle().await?;
    priority_order().await?;
    Ok(())
}

/// Scenario 1: add a job, run the processor once, observe it complete.
async fn basic_lifecycle() -> Result<()> {
    println!("-- basic lifecycle --");
    let backend = Arc::new(MemoryBackend::new());
    let queue = JobQueue::new(backend);
    let log = Arc::new(Mutex::new(Vec::new()));

    let job_id = queue
        .add_job(NewJob {
            job_type: "email".to_string(),
            payload: json!({ "to": "a@x" }),
            ..NewJob::default()
        })
        .await?;

    let job = queue.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Pending);

    let mut handlers = std::collections::HashMap::new();
    handlers.insert(
        "email".to_string(),
        Arc::new(LogHandler { log: log.clone() }) as Arc<dyn JobHandler>,
    );
    let processor = queue.processor(
        handlers,
        ProcessorOptions { batch_size: 1, concurrency: 1, ..ProcessorOptions::default() },
    );
    processor.start().await;

    let job = queue.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert!(job.started_at.is_some());
    println!("job {job_id} completed: {:?}", job.output);
    Ok(())
}

/// Scenario 3: three same-typed jobs at priorities 1, 10, 5; batchSize=1
/// claims highest priority first.
async fn priority_order() -> Result<()> {
    println!("-- priority order --");
    let backend = Arc::new(MemoryBackend::new());
    let queue = JobQueue::new(backend);
    let log = Arc::new(Mutex::new(Vec::new()));

    for priority in [1, 10, 5] {
        queue
            .add_job(NewJob {
                job_type: "log".to_string(),
                payload: json!({ "priority": priority }),
                priority,
                ..NewJob::default()
            })
            .await?;
    }

    let mut handlers = std::collections::HashMap::new();
    handlers.insert(
        "log".to_string(),
        Arc::new(LogHandler { log: log.clone() }) as Arc<dyn JobHandler>,
    );
    let processor = queue.processor(
        handlers,
        ProcessorOptions { batch_size: 1, concurrency: 1, ..ProcessorOptions::default() },
    );

    for _ in 0..3 {
        processor.start().await;
    }

    let order: Vec<Value> = log.lock().unwrap().clone();
    println!("claim order: {order:?}");
    assert_eq!(order[0]["priority"], json!(10));
    Ok(())
}
