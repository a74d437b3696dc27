//! In-memory [`Backend`] implementation and fixtures for testing DataQueue
//! consumers (and the engine's own test suite).
//!
//! Not meant for production: a single `tokio::sync::Mutex` guards the
//! whole store, which is exactly the point — it trades throughput for an
//! implementation so simple that any test failure is the engine's fault,
//! not the backend's.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dataqueue_core::backend::{
    Backend, CronScheduleEdit, JobEdit, JobFilter, NewCronSchedule, NewJob, NewToken, Patch,
    QueueStats, TagMode, TimeComparator,
};
use dataqueue_core::error::{DataQueueError, DataQueueResult};
use dataqueue_core::model::{
    CronSchedule, CronScheduleId, CronScheduleStatus, DeadLetterLink, EventId, EventType,
    FailureReason, Job, JobErrorEntry, JobEvent, JobId, JobStatus, RetryPolicy, StepRecord,
    TokenStatus, Waitpoint,
};
use dataqueue_core::retry;
use std::collections::HashMap;
use tokio::sync::Mutex;

struct State {
    jobs: HashMap<JobId, Job>,
    next_job_id: JobId,
    idempotency_index: HashMap<String, JobId>,

    events: HashMap<JobId, Vec<JobEvent>>,
    next_event_id: EventId,

    schedules: HashMap<CronScheduleId, CronSchedule>,
    next_schedule_id: CronScheduleId,
    schedule_names: HashMap<String, CronScheduleId>,

    tokens: HashMap<String, Waitpoint>,
    next_token_seq: u64,
}

impl State {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            next_job_id: 1,
            idempotency_index: HashMap::new(),
            events: HashMap::new(),
            next_event_id: 1,
            schedules: HashMap::new(),
            next_schedule_id: 1,
            schedule_names: HashMap::new(),
            tokens: HashMap::new(),
            next_token_seq: 1,
        }
    }

    fn record_event(&mut self, job_id: JobId, event_type: EventType, metadata: Option<serde_json::Value>) {
        let id = self.next_event_id;
        self.next_event_id += 1;
        self.events.entry(job_id).or_default().push(JobEvent {
            id,
            job_id,
            event_type,
            created_at: Utc::now(),
            metadata,
        });
    }

    fn insert_job(&mut self, new: NewJob) -> JobId {
        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = self.idempotency_index.get(key) {
                return *existing;
            }
        }
        let id = self.next_job_id;
        self.next_job_id += 1;
        let now = Utc::now();
        let job = Job {
            id,
            job_type: new.job_type,
            payload: new.payload,
            tags: new.tags,
            idempotency_key: new.idempotency_key.clone(),
            group: new.group,
            priority: new.priority,
            run_at: new.run_at.unwrap_or(now),
            created_at: now,
            max_attempts: new.max_attempts.max(1),
            attempts: 0,
            timeout_ms: new.timeout_ms,
            force_kill_on_timeout: new.force_kill_on_timeout,
            retry_policy: new.retry_policy,
            locked_at: None,
            locked_by: None,
            status: JobStatus::Pending,
            output: None,
            error_history: Vec::new(),
            failure_reason: None,
            next_attempt_at: None,
            dead_letter: DeadLetterLink {
                dead_letter_job_type: new.dead_letter_job_type,
                ..Default::default()
            },
            wait_until: None,
            wait_token_id: None,
            step_data: HashMap::new(),
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_retried_at: None,
            last_failed_at: None,
            last_cancelled_at: None,
            progress: None,
        };
        if let Some(key) = new.idempotency_key {
            self.idempotency_index.insert(key, id);
        }
        self.jobs.insert(id, job);
        self.record_event(id, EventType::Added, None);
        id
    }

    fn matches_filter(job: &Job, filter: &JobFilter) -> bool {
        if !filter.status.is_empty() && !filter.status.iter().any(|s| *s == job.status) {
            return false;
        }
        if !filter.job_type.is_empty() && !filter.job_type.contains(&job.job_type) {
            return false;
        }
        if let Some((mode, tags)) = &filter.tags {
            let job_tags: std::collections::HashSet<&String> = job.tags.iter().collect();
            let filter_tags: std::collections::HashSet<&String> = tags.iter().collect();
            let ok = match mode {
                TagMode::All => filter_tags.is_subset(&job_tags),
                TagMode::Any => !filter_tags.is_disjoint(&job_tags),
                TagMode::Exact => job_tags == filter_tags,
                TagMode::None => filter_tags.is_disjoint(&job_tags),
            };
            if !ok {
                return false;
            }
        }
        if let Some(cmp) = &filter.run_at {
            let ok = match cmp {
                TimeComparator::Gt(t) => job.run_at > *t,
                TimeComparator::Gte(t) => job.run_at >= *t,
                TimeComparator::Lt(t) => job.run_at < *t,
                TimeComparator::Lte(t) => job.run_at <= *t,
                TimeComparator::Eq(t) => job.run_at == *t,
            };
            if !ok {
                return false;
            }
        }
        true
    }

    fn apply_edit(job: &mut Job, edit: &JobEdit) {
        if let Some(p) = &edit.payload {
            job.payload = p.clone();
        }
        if let Some(p) = edit.priority {
            job.priority = p;
        }
        if let Some(m) = edit.max_attempts {
            job.max_attempts = m;
        }
        if let Some(r) = edit.run_at {
            job.run_at = r;
        }
        if let Some(patch) = &edit.timeout_ms {
            job.timeout_ms = match patch {
                Patch::Clear => None,
                Patch::Set(v) => Some(*v),
            };
        }
        if let Some(patch) = &edit.tags {
            job.tags = match patch {
                Patch::Clear => Vec::new(),
                Patch::Set(v) => v.clone(),
            };
        }
        if let Some(patch) = &edit.retry_delay {
            job.retry_policy.retry_delay = match patch {
                Patch::Clear => None,
                Patch::Set(v) => Some(*v),
            };
        }
        if let Some(patch) = &edit.retry_backoff {
            job.retry_policy.retry_backoff = match patch {
                Patch::Clear => None,
                Patch::Set(v) => Some(*v),
            };
        }
        if let Some(patch) = &edit.retry_delay_max {
            job.retry_policy.retry_delay_max = match patch {
                Patch::Clear => None,
                Patch::Set(v) => Some(*v),
            };
        }
        job.updated_at = Utc::now();
    }
}

/// The in-memory backend.
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn add_job(&self, job: NewJob) -> DataQueueResult<JobId> {
        let mut state = self.state.lock().await;
        Ok(state.insert_job(job))
    }

    async fn add_jobs(&self, jobs: Vec<NewJob>) -> DataQueueResult<Vec<JobId>> {
        let mut state = self.state.lock().await;
        Ok(jobs.into_iter().map(|j| state.insert_job(j)).collect())
    }

    async fn get_job(&self, id: JobId) -> DataQueueResult<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn get_jobs(&self, filter: JobFilter) -> DataQueueResult<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| State::matches_filter(j, &filter))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(offset) = filter.offset {
            jobs = jobs.into_iter().skip(offset.max(0) as usize).collect();
        }
        if let Some(limit) = filter.limit {
            jobs.truncate(limit.max(0) as usize);
        }
        Ok(jobs)
    }

    async fn get_next_batch(
        &self,
        worker_id: &str,
        batch_size: usize,
        job_type_filter: Option<&[String]>,
        group_concurrency: Option<u32>,
    ) -> DataQueueResult<Vec<Job>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        // Step 1/2/3: promote ready delayed work, retries, and timed-out
        // (non-token) waiters into `pending`.
        let ids: Vec<JobId> = state.jobs.keys().copied().collect();
        for id in ids {
            let job = state.jobs.get_mut(&id).unwrap();
            match job.status {
                JobStatus::Failed => {
                    if let Some(next) = job.next_attempt_at {
                        if next <= now && job.attempts < job.max_attempts {
                            job.status = JobStatus::Pending;
                            job.next_attempt_at = None;
                        }
                    }
                }
                JobStatus::Waiting => {
                    if job.wait_token_id.is_none() {
                        if let Some(until) = job.wait_until {
                            if until <= now {
                                job.status = JobStatus::Pending;
                                job.wait_until = None;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Step 4: select candidates.
        let mut candidates: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.run_at <= now
                    && job_type_filter
                        .map(|types| types.iter().any(|t| t == &j.job_type))
                        .unwrap_or(true)
            })
            .map(|j| j.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ja = &state.jobs[a];
            let jb = &state.jobs[b];
            jb.priority
                .cmp(&ja.priority)
                .then(ja.created_at.cmp(&jb.created_at))
                .then(ja.id.cmp(&jb.id))
        });

        // Step 5/6: claim, honouring the group concurrency cap.
        let mut claimed = Vec::new();
        let mut group_counts: HashMap<String, u32> = HashMap::new();
        if let Some(cap) = group_concurrency {
            for job in state.jobs.values() {
                if job.status == JobStatus::Processing {
                    if let Some(group) = &job.group {
                        *group_counts.entry(group.id.clone()).or_insert(0) += 1;
                    }
                }
            }
            let _ = cap;
        }

        for id in candidates {
            if claimed.len() >= batch_size {
                break;
            }
            let group_id = state.jobs[&id].group.as_ref().map(|g| g.id.clone());
            if let (Some(cap), Some(gid)) = (group_concurrency, &group_id) {
                let count = group_counts.get(gid).copied().unwrap_or(0);
                if count >= cap {
                    continue;
                }
            }

            let job = state.jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Processing;
            job.locked_at = Some(now);
            job.locked_by = Some(worker_id.to_string());
            job.attempts += 1;
            job.updated_at = now;
            if job.started_at.is_none() {
                job.started_at = Some(now);
            }
            if job.attempts > 1 {
                job.last_retried_at = Some(now);
            }
            if let Some(gid) = group_id {
                *group_counts.entry(gid).or_insert(0) += 1;
            }
            claimed.push(job.clone());
        }

        for job in &claimed {
            state.record_event(job.id, EventType::Processing, None);
        }

        Ok(claimed)
    }

    async fn complete_job(&self, id: JobId, output: Option<serde_json::Value>) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(DataQueueError::JobNotFound(id))?;
        if job.status != JobStatus::Processing {
            return Err(DataQueueError::InvalidState(id));
        }
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.updated_at = now;
        job.step_data.clear();
        job.wait_until = None;
        job.wait_token_id = None;
        job.locked_at = None;
        job.locked_by = None;
        if let Some(output) = output {
            job.output = Some(output);
        }
        state.record_event(id, EventType::Completed, None);
        Ok(())
    }

    async fn fail_job(&self, id: JobId, error: &str, failure_reason: FailureReason) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let (attempts, max_attempts, retry_policy, dead_letter_job_type) = {
            let job = state
                .jobs
                .get_mut(&id)
                .ok_or(DataQueueError::JobNotFound(id))?;
            job.error_history.push(JobErrorEntry {
                message: error.to_string(),
                timestamp: now,
            });
            job.last_failed_at = Some(now);
            job.failure_reason = Some(failure_reason);
            job.locked_at = None;
            job.locked_by = None;
            job.updated_at = now;
            (
                job.attempts,
                job.max_attempts,
                job.retry_policy.clone(),
                job.dead_letter.dead_letter_job_type.clone(),
            )
        };

        if attempts < max_attempts {
            let next = retry::next_attempt_at(&retry_policy, attempts, now, fastrand::f64);
            let job = state.jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Failed;
            job.next_attempt_at = Some(next);
        } else {
            let job = state.jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Failed;
            job.next_attempt_at = None;

            if let Some(dlq_type) = dead_letter_job_type {
                let source = state.jobs[&id].clone();
                let envelope = serde_json::json!({
                    "originalJob": {
                        "id": source.id,
                        "jobType": source.job_type,
                    },
                    "originalPayload": source.payload,
                    "failure": {
                        "message": error,
                        "reason": failure_reason,
                    },
                });
                let dlq_id = state.insert_job(NewJob {
                    job_type: dlq_type,
                    payload: envelope,
                    ..NewJob::default()
                });
                let job = state.jobs.get_mut(&id).unwrap();
                job.dead_letter.dead_letter_job_id = Some(dlq_id);
                job.dead_letter.dead_lettered_at = Some(now);
            }
        }

        state.record_event(id, EventType::Failed, None);
        Ok(())
    }

    async fn retry_job(&self, id: JobId) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(DataQueueError::JobNotFound(id))?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Processing) {
            return Ok(());
        }
        let now = Utc::now();
        job.locked_at = None;
        job.locked_by = None;
        job.status = JobStatus::Pending;
        job.next_attempt_at = Some(now);
        job.run_at = now;
        job.last_retried_at = Some(now);
        job.updated_at = now;
        state.record_event(id, EventType::Retried, None);
        Ok(())
    }

    async fn cancel_job(&self, id: JobId) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(DataQueueError::JobNotFound(id))?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Waiting) {
            return Ok(());
        }
        let now = Utc::now();
        job.status = JobStatus::Cancelled;
        job.locked_at = None;
        job.locked_by = None;
        job.wait_until = None;
        job.wait_token_id = None;
        job.last_cancelled_at = Some(now);
        job.updated_at = now;
        state.record_event(id, EventType::Cancelled, None);
        Ok(())
    }

    async fn edit_job(&self, id: JobId, edit: JobEdit) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(DataQueueError::JobNotFound(id))?;
        if job.status != JobStatus::Pending {
            return Ok(());
        }
        State::apply_edit(job, &edit);
        state.record_event(id, EventType::Edited, None);
        Ok(())
    }

    async fn edit_all_pending_jobs(&self, filter: JobFilter, edit: JobEdit) -> DataQueueResult<u64> {
        let mut state = self.state.lock().await;
        let mut filter = filter;
        if filter.status.is_empty() {
            filter.status = vec![JobStatus::Pending];
        }
        let ids: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && State::matches_filter(j, &filter))
            .map(|j| j.id)
            .collect();
        let count = ids.len() as u64;
        for id in &ids {
            let job = state.jobs.get_mut(id).unwrap();
            State::apply_edit(job, &edit);
        }
        for id in ids {
            state.record_event(id, EventType::Edited, None);
        }
        Ok(count)
    }

    async fn prolong_job(&self, id: JobId) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.locked_at = Some(Utc::now());
            }
        }
    }

    async fn update_progress(&self, id: JobId, pct: u8) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&id) {
            job.progress = Some(pct);
        }
    }

    async fn update_output(&self, id: JobId, value: serde_json::Value) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&id) {
            job.output = Some(value);
        }
    }

    async fn reclaim_stuck_jobs(&self, max_processing_minutes: i64) -> DataQueueResult<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut reclaimed = 0u64;
        for job in state.jobs.values_mut() {
            if job.status != JobStatus::Processing {
                continue;
            }
            let Some(locked_at) = job.locked_at else { continue };
            let threshold_ms = (max_processing_minutes * 60_000).max(job.timeout_ms.unwrap_or(0));
            if now - locked_at >= ChronoDuration::milliseconds(threshold_ms) {
                job.status = JobStatus::Pending;
                job.locked_at = None;
                job.locked_by = None;
                job.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn cleanup_old_jobs(&self, days_to_keep: i64, batch_size: Option<usize>) -> DataQueueResult<u64> {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - ChronoDuration::days(days_to_keep);
        let mut ids: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Completed && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();
        if let Some(limit) = batch_size {
            ids.truncate(limit);
        }
        let count = ids.len() as u64;
        for id in ids {
            state.jobs.remove(&id);
            state.events.remove(&id);
        }
        Ok(count)
    }

    async fn cleanup_old_job_events(&self, days_to_keep: i64, batch_size: Option<usize>) -> DataQueueResult<u64> {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - ChronoDuration::days(days_to_keep);
        let mut removed = 0u64;
        let job_ids: Vec<JobId> = state.events.keys().copied().collect();
        for job_id in job_ids {
            let events = state.events.get_mut(&job_id).unwrap();
            let before = events.len();
            events.retain(|e| e.created_at >= cutoff);
            removed += (before - events.len()) as u64;
            if let Some(limit) = batch_size {
                if removed >= limit as u64 {
                    break;
                }
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> DataQueueResult<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn create_token(&self, token: NewToken) -> DataQueueResult<Waitpoint> {
        let mut state = self.state.lock().await;
        let seq = state.next_token_seq;
        state.next_token_seq += 1;
        let wp = Waitpoint {
            id: format!("wp_{seq}"),
            job_id: token.job_id,
            status: TokenStatus::Waiting,
            output: None,
            timeout_at: token.timeout_at,
            created_at: Utc::now(),
            completed_at: None,
            tags: token.tags,
        };
        state.tokens.insert(wp.id.clone(), wp.clone());
        Ok(wp)
    }

    async fn get_token(&self, id: &str) -> DataQueueResult<Option<Waitpoint>> {
        let state = self.state.lock().await;
        Ok(state.tokens.get(id).cloned())
    }

    async fn complete_token(&self, id: &str, output: serde_json::Value) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let job_id = {
            let token = state
                .tokens
                .get_mut(id)
                .ok_or_else(|| DataQueueError::TokenNotFound(id.to_string()))?;
            token.status = TokenStatus::Completed;
            token.output = Some(output);
            token.completed_at = Some(Utc::now());
            token.job_id
        };
        if let Some(job_id) = job_id {
            resume_waiting_job(&mut state, job_id);
        }
        Ok(())
    }

    async fn expire_timed_out_tokens(&self) -> DataQueueResult<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let due: Vec<(String, Option<JobId>)> = state
            .tokens
            .values()
            .filter(|t| t.status == TokenStatus::Waiting && t.timeout_at.map(|at| at <= now).unwrap_or(false))
            .map(|t| (t.id.clone(), t.job_id))
            .collect();
        for (id, job_id) in &due {
            let token = state.tokens.get_mut(id).unwrap();
            token.status = TokenStatus::TimedOut;
            token.completed_at = Some(now);
            if let Some(job_id) = job_id {
                resume_waiting_job(&mut state, *job_id);
            }
        }
        Ok(due.len() as u64)
    }

    async fn wait_job(
        &self,
        id: JobId,
        wait_until: Option<DateTime<Utc>>,
        token_id: Option<String>,
        step_data: HashMap<String, StepRecord>,
    ) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(DataQueueError::JobNotFound(id))?;
        if job.status != JobStatus::Processing {
            return Err(DataQueueError::InvalidState(id));
        }
        job.status = JobStatus::Waiting;
        job.wait_until = wait_until;
        job.wait_token_id = token_id;
        job.step_data = step_data;
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = Utc::now();
        state.record_event(id, EventType::Waiting, None);
        Ok(())
    }

    async fn add_cron_schedule(&self, schedule: NewCronSchedule) -> DataQueueResult<CronScheduleId> {
        let mut state = self.state.lock().await;
        if state.schedule_names.contains_key(&schedule.schedule_name) {
            return Err(DataQueueError::DuplicateScheduleName(schedule.schedule_name));
        }
        let id = state.next_schedule_id;
        state.next_schedule_id += 1;
        let now = Utc::now();
        let next_run_at = dataqueue_core::cron::next_run_at(&schedule.cron_expression, &schedule.timezone, now)?;
        let record = CronSchedule {
            id,
            schedule_name: schedule.schedule_name.clone(),
            cron_expression: schedule.cron_expression,
            job_type: schedule.job_type,
            payload: schedule.payload,
            timezone: schedule.timezone,
            allow_overlap: schedule.allow_overlap,
            status: CronScheduleStatus::Active,
            priority: schedule.priority,
            max_attempts: schedule.max_attempts,
            timeout_ms: schedule.timeout_ms,
            retry_policy: schedule.retry_policy,
            tags: schedule.tags,
            dead_letter_job_type: schedule.dead_letter_job_type,
            last_enqueued_at: None,
            last_job_id: None,
            next_run_at,
            created_at: now,
            updated_at: now,
        };
        state.schedule_names.insert(schedule.schedule_name, id);
        state.schedules.insert(id, record);
        Ok(id)
    }

    async fn get_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<Option<CronSchedule>> {
        let state = self.state.lock().await;
        Ok(state.schedules.get(&id).cloned())
    }

    async fn get_cron_schedule_by_name(&self, name: &str) -> DataQueueResult<Option<CronSchedule>> {
        let state = self.state.lock().await;
        Ok(state
            .schedule_names
            .get(name)
            .and_then(|id| state.schedules.get(id))
            .cloned())
    }

    async fn list_cron_schedules(&self, status: Option<CronScheduleStatus>) -> DataQueueResult<Vec<CronSchedule>> {
        let state = self.state.lock().await;
        Ok(state
            .schedules
            .values()
            .filter(|s| status.map(|st| st == s.status).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn pause_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let schedule = state
            .schedules
            .get_mut(&id)
            .ok_or_else(|| DataQueueError::ScheduleNotFound(id.to_string()))?;
        schedule.status = CronScheduleStatus::Paused;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn resume_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let schedule = state
            .schedules
            .get_mut(&id)
            .ok_or_else(|| DataQueueError::ScheduleNotFound(id.to_string()))?;
        schedule.status = CronScheduleStatus::Active;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn edit_cron_schedule(&self, id: CronScheduleId, edit: CronScheduleEdit) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let schedule = state
            .schedules
            .get_mut(&id)
            .ok_or_else(|| DataQueueError::ScheduleNotFound(id.to_string()))?;
        if let Some(expr) = edit.cron_expression {
            schedule.cron_expression = expr;
        }
        if let Some(p) = edit.payload {
            schedule.payload = p;
        }
        if let Some(tz) = edit.timezone {
            schedule.timezone = tz;
        }
        if let Some(ov) = edit.allow_overlap {
            schedule.allow_overlap = ov;
        }
        if let Some(p) = edit.priority {
            schedule.priority = p;
        }
        if let Some(m) = edit.max_attempts {
            schedule.max_attempts = m;
        }
        if let Some(patch) = edit.timeout_ms {
            schedule.timeout_ms = match patch {
                Patch::Clear => None,
                Patch::Set(v) => Some(v),
            };
        }
        if let Some(rp) = edit.retry_policy {
            schedule.retry_policy = rp;
        }
        if let Some(tags) = edit.tags {
            schedule.tags = tags;
        }
        if let Some(patch) = edit.dead_letter_job_type {
            schedule.dead_letter_job_type = match patch {
                Patch::Clear => None,
                Patch::Set(v) => Some(v),
            };
        }
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn remove_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        if let Some(schedule) = state.schedules.remove(&id) {
            state.schedule_names.remove(&schedule.schedule_name);
        }
        Ok(())
    }

    async fn get_due_cron_schedules(&self) -> DataQueueResult<Vec<CronSchedule>> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .schedules
            .values()
            .filter(|s| s.status == CronScheduleStatus::Active && s.next_run_at.map(|n| n <= now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn update_cron_schedule_after_enqueue(
        &self,
        id: CronScheduleId,
        last_enqueued_at: DateTime<Utc>,
        last_job_id: JobId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        let schedule = state
            .schedules
            .get_mut(&id)
            .ok_or_else(|| DataQueueError::ScheduleNotFound(id.to_string()))?;
        schedule.last_enqueued_at = Some(last_enqueued_at);
        schedule.last_job_id = Some(last_job_id);
        schedule.next_run_at = next_run_at;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn record_job_event(
        &self,
        job_id: JobId,
        event_type: EventType,
        metadata: Option<serde_json::Value>,
    ) -> DataQueueResult<()> {
        let mut state = self.state.lock().await;
        state.record_event(job_id, event_type, metadata);
        Ok(())
    }

    async fn get_job_events(&self, job_id: JobId) -> DataQueueResult<Vec<JobEvent>> {
        let state = self.state.lock().await;
        Ok(state.events.get(&job_id).cloned().unwrap_or_default())
    }

    async fn group_in_flight(&self, group_id: &str) -> DataQueueResult<u64> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.group.as_ref().map(|g| g.id.as_str()) == Some(group_id))
            .count() as u64)
    }
}

/// §4.2: a timed-out (non-token) wait or a completed/expired token resumes
/// the bound job to `pending` for re-queueing, whether it arrived here via
/// `complete_token`, `expire_timed_out_tokens`.
fn resume_waiting_job(state: &mut State, job_id: JobId) {
    if let Some(job) = state.jobs.get_mut(&job_id) {
        if job.status == JobStatus::Waiting {
            job.status = JobStatus::Pending;
            job.wait_until = None;
            job.wait_token_id = None;
            job.updated_at = Utc::now();
        }
    }
}

/// Small builders used across the workspace's test suites.
pub mod fixtures {
    use dataqueue_core::backend::NewJob;

    pub fn job(job_type: &str) -> NewJob {
        NewJob {
            job_type: job_type.to_string(),
            payload: serde_json::json!({}),
            ..NewJob::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataqueue_core::backend::NewJob;

    #[tokio::test]
    async fn idempotency_key_returns_existing_id() {
        let backend = MemoryBackend::new();
        let a = backend
            .add_job(NewJob {
                job_type: "email".into(),
                idempotency_key: Some("K".into()),
                ..NewJob::default()
            })
            .await
            .unwrap();
        let b = backend
            .add_job(NewJob {
                job_type: "email".into(),
                idempotency_key: Some("K".into()),
                ..NewJob::default()
            })
            .await
            .unwrap();
        assert_eq!(a, b);
        let events = backend.get_job_events(a).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.event_type == EventType::Added).count(), 1);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_created_at() {
        let backend = MemoryBackend::new();
        backend.add_job(NewJob { job_type: "t".into(), priority: 1, ..NewJob::default() }).await.unwrap();
        backend.add_job(NewJob { job_type: "t".into(), priority: 10, ..NewJob::default() }).await.unwrap();
        backend.add_job(NewJob { job_type: "t".into(), priority: 5, ..NewJob::default() }).await.unwrap();

        let batch = backend.get_next_batch("w1", 10, None, None).await.unwrap();
        let priorities: Vec<i32> = batch.iter().map(|j| j.priority).collect();
        assert_eq!(priorities, vec![10, 5, 1]);
    }

    #[tokio::test]
    async fn two_workers_never_claim_the_same_job() {
        use std::sync::Arc;
        let backend = Arc::new(MemoryBackend::new());
        backend.add_job(NewJob { job_type: "t".into(), ..NewJob::default() }).await.unwrap();

        let b1 = backend.clone();
        let b2 = backend.clone();
        let (r1, r2) = tokio::join!(
            b1.get_next_batch("w1", 10, None, None),
            b2.get_next_batch("w2", 10, None, None)
        );
        let n1 = r1.unwrap().len();
        let n2 = r2.unwrap().len();
        assert_eq!(n1 + n2, 1);
    }
}
