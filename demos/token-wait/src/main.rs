//! Demonstrates the external-signal waitpoint: a handler suspends itself on
//! a token, an out-of-band caller completes that token, and the next
//! processor pass resumes the job with the token's output.
//!
//! Run with `cargo run -p token-wait-demo`.

use anyhow::Result;
use async_trait::async_trait;
use dataqueue_core::backend::NewJob;
use dataqueue_core::context::{AbortSignal, HandlerError, JobContext};
use dataqueue_core::model::{JobStatus, TokenStatus};
use dataqueue_core::processor::{JobHandler, ProcessorOptions};
use dataqueue_core::queue::JobQueue;
use dataqueue_testing::MemoryBackend;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Creates a token on first invocation (memoised via `ctx.run`), then
/// suspends on it until an external caller completes it.
struct TokenWaitHandler;

#[async_trait]
impl JobHandler for TokenWaitHandler {
    async fn handle(
        &self,
        _payload: Value,
        _signal: AbortSignal,
        ctx: JobContext,
    ) -> Result<Value, HandlerError> {
        let ctx_for_step = ctx.clone();
        let token_id: String = ctx
            .run("create_token", move || {
                let ctx_for_step = ctx_for_step.clone();
                async move {
                    let wp = ctx_for_step.create_token(None, vec![]).await?;
                    Ok(wp.id)
                }
            })
            .await?;

        match ctx.get_token(&token_id).await? {
            Some(wp) if wp.status == TokenStatus::Completed => {
                Ok(json!({ "ok": true, "output": wp.output }))
            }
            _ => Err(ctx.wait_for_token(token_id)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let queue = JobQueue::new(backend);

    let job_id = queue
        .add_job(NewJob { job_type: "token-wait".to_string(), ..NewJob::default() })
        .await?;

    let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert("token-wait".to_string(), Arc::new(TokenWaitHandler));
    let processor = queue.processor(
        handlers,
        ProcessorOptions { batch_size: 1, concurrency: 1, ..ProcessorOptions::default() },
    );

    processor.start().await;
    let job = queue.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Waiting);
    let token_id = job.wait_token_id.expect("waiting on a token");
    println!("job {job_id} suspended on token {token_id}");

    queue.complete_token(&token_id, json!({ "x": 1 })).await?;
    let job = queue.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Pending);
    println!("token completed, job {job_id} resumed to pending");

    processor.start().await;
    let job = queue.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    println!("job {job_id} completed with output {:?}", job.output);
    Ok(())
}
