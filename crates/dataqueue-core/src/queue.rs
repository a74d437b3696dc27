//! The top-level facade tying a [`Backend`], the [`EventBus`], and the
//! optional [`Processor`]/[`Supervisor`] together.

use crate::backend::{
    Backend, CronScheduleEdit, JobEdit, JobFilter, NewCronSchedule, NewJob, NewToken, QueueStats,
};
use crate::cron::{self, CronScheduler};
use crate::error::DataQueueResult;
use crate::events::EventBus;
use crate::model::{CronSchedule, CronScheduleId, CronScheduleStatus, Job, JobEvent, JobId, Waitpoint};
use crate::processor::{JobHandler, Processor, ProcessorOptions};
use crate::supervisor::{Supervisor, SupervisorOptions};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Wires a [`JobQueue`] together with an optional [`Processor`] and
/// [`Supervisor`] sharing the same backend and event bus.
pub struct JobQueueBuilder {
    backend: Arc<dyn Backend>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    processor_options: Option<ProcessorOptions>,
    supervisor_options: Option<SupervisorOptions>,
}

impl JobQueueBuilder {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            handlers: HashMap::new(),
            processor_options: None,
            supervisor_options: None,
        }
    }

    pub fn with_handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn with_processor(mut self, options: ProcessorOptions) -> Self {
        self.processor_options = Some(options);
        self
    }

    pub fn with_supervisor(mut self, options: SupervisorOptions) -> Self {
        self.supervisor_options = Some(options);
        self
    }

    /// Returns the assembled queue, plus a processor/supervisor if either
    /// was configured. Neither is started; callers choose when to call
    /// `start()`/`start_in_background()`.
    pub fn build(self) -> (JobQueue, Option<Arc<Processor>>, Option<Arc<Supervisor>>) {
        let queue = JobQueue::new(self.backend);
        let processor = self
            .processor_options
            .map(|opts| queue.processor(self.handlers, opts));
        let supervisor = self.supervisor_options.map(|opts| queue.supervisor(opts));
        (queue, processor, supervisor)
    }
}

/// `JobQueueConfig` (§6). Backend connection details live on the concrete
/// `dataqueue-postgres`/`dataqueue-redis` constructors; this config is the
/// engine-level knobs shared by both.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobQueueConfig {
    pub verbose: bool,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self { verbose: false }
    }
}

/// The programmatic surface (§6): one method per §4.1 backend operation,
/// plus processor/supervisor factory methods and hook registration.
pub struct JobQueue {
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
    cron: CronScheduler,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let events = Arc::new(EventBus::new());
        let cron = CronScheduler::new(backend.clone(), events.clone());
        Self { backend, events, cron }
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn processor(
        &self,
        handlers: HashMap<String, Arc<dyn JobHandler>>,
        options: ProcessorOptions,
    ) -> Arc<Processor> {
        Arc::new(Processor::new(
            self.backend.clone(),
            self.events.clone(),
            handlers,
            options,
        ))
    }

    pub fn supervisor(&self, options: SupervisorOptions) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(self.backend.clone(), self.events.clone(), options))
    }

    // -- Jobs -------------------------------------------------------------

    pub async fn add_job(&self, job: NewJob) -> DataQueueResult<JobId> {
        let job_type = job.job_type.clone();
        let id = self.backend.add_job(job).await?;
        self.events.emit(crate::events::QueueEvent::JobAdded { job_id: id, job_type });
        Ok(id)
    }

    pub async fn add_jobs(&self, jobs: Vec<NewJob>) -> DataQueueResult<Vec<JobId>> {
        let types: Vec<String> = jobs.iter().map(|j| j.job_type.clone()).collect();
        let ids = self.backend.add_jobs(jobs).await?;
        for (id, job_type) in ids.iter().zip(types) {
            self.events
                .emit(crate::events::QueueEvent::JobAdded { job_id: *id, job_type });
        }
        Ok(ids)
    }

    pub async fn get_job(&self, id: JobId) -> DataQueueResult<Option<Job>> {
        self.backend.get_job(id).await
    }

    pub async fn get_jobs(&self, filter: JobFilter) -> DataQueueResult<Vec<Job>> {
        self.backend.get_jobs(filter).await
    }

    pub async fn complete_job(&self, id: JobId, output: Option<Value>) -> DataQueueResult<()> {
        self.backend.complete_job(id, output).await
    }

    pub async fn fail_job(
        &self,
        id: JobId,
        error: &str,
        reason: crate::model::FailureReason,
    ) -> DataQueueResult<()> {
        self.backend.fail_job(id, error, reason).await
    }

    pub async fn retry_job(&self, id: JobId) -> DataQueueResult<()> {
        self.backend.retry_job(id).await?;
        self.events.emit(crate::events::QueueEvent::JobRetried { job_id: id });
        Ok(())
    }

    pub async fn cancel_job(&self, id: JobId) -> DataQueueResult<()> {
        self.backend.cancel_job(id).await?;
        self.events.emit(crate::events::QueueEvent::JobCancelled { job_id: id });
        Ok(())
    }

    pub async fn edit_job(&self, id: JobId, edit: JobEdit) -> DataQueueResult<()> {
        self.backend.edit_job(id, edit).await
    }

    pub async fn edit_all_pending_jobs(&self, filter: JobFilter, edit: JobEdit) -> DataQueueResult<u64> {
        self.backend.edit_all_pending_jobs(filter, edit).await
    }

    pub async fn reclaim_stuck_jobs(&self, max_processing_minutes: i64) -> DataQueueResult<u64> {
        self.backend.reclaim_stuck_jobs(max_processing_minutes).await
    }

    pub async fn cleanup_old_jobs(&self, days_to_keep: i64, batch_size: Option<usize>) -> DataQueueResult<u64> {
        self.backend.cleanup_old_jobs(days_to_keep, batch_size).await
    }

    pub async fn cleanup_old_job_events(
        &self,
        days_to_keep: i64,
        batch_size: Option<usize>,
    ) -> DataQueueResult<u64> {
        self.backend.cleanup_old_job_events(days_to_keep, batch_size).await
    }

    pub async fn stats(&self) -> DataQueueResult<QueueStats> {
        self.backend.stats().await
    }

    /// Cheap liveness probe of the underlying connection pool/client.
    pub async fn health(&self) -> DataQueueResult<()> {
        self.backend.ping().await
    }

    // -- Waitpoints ---------------------------------------------------------

    pub async fn create_token(&self, token: NewToken) -> DataQueueResult<Waitpoint> {
        self.backend.create_token(token).await
    }

    pub async fn get_token(&self, id: &str) -> DataQueueResult<Option<Waitpoint>> {
        self.backend.get_token(id).await
    }

    pub async fn complete_token(&self, id: &str, output: Value) -> DataQueueResult<()> {
        self.backend.complete_token(id, output).await
    }

    pub async fn expire_timed_out_tokens(&self) -> DataQueueResult<u64> {
        self.backend.expire_timed_out_tokens().await
    }

    pub async fn wait_job(
        &self,
        id: JobId,
        wait_until: Option<chrono::DateTime<chrono::Utc>>,
        token_id: Option<String>,
        step_data: HashMap<String, crate::model::StepRecord>,
    ) -> DataQueueResult<()> {
        self.backend.wait_job(id, wait_until, token_id, step_data).await?;
        self.events.emit(crate::events::QueueEvent::JobWaiting { job_id: id });
        Ok(())
    }

    // -- Cron ---------------------------------------------------------------

    pub async fn add_cron_schedule(&self, schedule: NewCronSchedule) -> DataQueueResult<CronScheduleId> {
        cron::validate(&schedule.cron_expression, &schedule.timezone)?;
        if self
            .backend
            .get_cron_schedule_by_name(&schedule.schedule_name)
            .await?
            .is_some()
        {
            return Err(crate::error::DataQueueError::DuplicateScheduleName(
                schedule.schedule_name,
            ));
        }
        self.backend.add_cron_schedule(schedule).await
    }

    pub async fn get_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<Option<CronSchedule>> {
        self.backend.get_cron_schedule(id).await
    }

    pub async fn get_cron_schedule_by_name(&self, name: &str) -> DataQueueResult<Option<CronSchedule>> {
        self.backend.get_cron_schedule_by_name(name).await
    }

    pub async fn list_cron_schedules(
        &self,
        status: Option<CronScheduleStatus>,
    ) -> DataQueueResult<Vec<CronSchedule>> {
        self.backend.list_cron_schedules(status).await
    }

    pub async fn pause_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        self.backend.pause_cron_schedule(id).await
    }

    pub async fn resume_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        self.backend.resume_cron_schedule(id).await
    }

    pub async fn edit_cron_schedule(&self, id: CronScheduleId, edit: CronScheduleEdit) -> DataQueueResult<()> {
        if let Some(expr) = &edit.cron_expression {
            let tz = match self.backend.get_cron_schedule(id).await? {
                Some(s) => s.timezone,
                None => return Err(crate::error::DataQueueError::ScheduleNotFound(id.to_string())),
            };
            cron::validate(expr, &tz)?;
        }
        self.backend.edit_cron_schedule(id, edit).await
    }

    pub async fn remove_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        self.backend.remove_cron_schedule(id).await
    }

    /// Can be called directly, or left to the processor's per-batch call.
    pub async fn enqueue_due_cron_jobs(&self) -> DataQueueResult<u64> {
        self.cron.enqueue_due_jobs().await
    }

    // -- Events ---------------------------------------------------------------

    pub async fn get_job_events(&self, job_id: JobId) -> DataQueueResult<Vec<JobEvent>> {
        self.backend.get_job_events(job_id).await
    }
}
