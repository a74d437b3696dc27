//! PostgreSQL implementation of the DataQueue [`Backend`] trait.
//!
//! Grounded in the same claim strategy as a classic job-queue-on-Postgres:
//! `SELECT … FOR UPDATE SKIP LOCKED` inside a transaction, followed by an
//! `UPDATE … RETURNING`. Group-concurrency capping can't be expressed in a
//! single `UPDATE`, so the claim reads current in-flight counts per group
//! inside the same transaction and whittles the SKIP LOCKED candidate set
//! down in Rust before committing the final `UPDATE`.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id BIGSERIAL PRIMARY KEY,
//!     job_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     tags TEXT[] NOT NULL DEFAULT '{}',
//!     idempotency_key TEXT UNIQUE,
//!     group_id TEXT,
//!     group_tier TEXT,
//!
//!     priority INTEGER NOT NULL DEFAULT 0,
//!     run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     max_attempts INTEGER NOT NULL DEFAULT 1,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     timeout_ms BIGINT,
//!     force_kill_on_timeout BOOLEAN NOT NULL DEFAULT FALSE,
//!     retry_delay BIGINT,
//!     retry_backoff BOOLEAN,
//!     retry_delay_max BIGINT,
//!
//!     locked_at TIMESTAMPTZ,
//!     locked_by TEXT,
//!
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     output JSONB,
//!     error_history JSONB NOT NULL DEFAULT '[]',
//!     failure_reason TEXT,
//!     next_attempt_at TIMESTAMPTZ,
//!     dead_letter_job_type TEXT,
//!     dead_letter_job_id BIGINT,
//!     dead_lettered_at TIMESTAMPTZ,
//!
//!     wait_until TIMESTAMPTZ,
//!     wait_token_id TEXT,
//!     step_data JSONB NOT NULL DEFAULT '{}',
//!
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     started_at TIMESTAMPTZ,
//!     completed_at TIMESTAMPTZ,
//!     last_retried_at TIMESTAMPTZ,
//!     last_failed_at TIMESTAMPTZ,
//!     last_cancelled_at TIMESTAMPTZ,
//!
//!     progress SMALLINT
//! );
//!
//! CREATE INDEX idx_jobs_ready ON jobs (priority DESC, created_at ASC)
//!     WHERE status = 'pending';
//! CREATE INDEX idx_jobs_lease ON jobs (locked_at)
//!     WHERE status = 'processing';
//! CREATE INDEX idx_jobs_group ON jobs (group_id)
//!     WHERE status = 'processing' AND group_id IS NOT NULL;
//!
//! CREATE TABLE cron_schedules (
//!     id BIGSERIAL PRIMARY KEY,
//!     schedule_name TEXT UNIQUE NOT NULL,
//!     cron_expression TEXT NOT NULL,
//!     job_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     timezone TEXT NOT NULL,
//!     allow_overlap BOOLEAN NOT NULL DEFAULT FALSE,
//!     status TEXT NOT NULL DEFAULT 'active',
//!     priority INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 1,
//!     timeout_ms BIGINT,
//!     retry_delay BIGINT,
//!     retry_backoff BOOLEAN,
//!     retry_delay_max BIGINT,
//!     tags TEXT[] NOT NULL DEFAULT '{}',
//!     dead_letter_job_type TEXT,
//!     last_enqueued_at TIMESTAMPTZ,
//!     last_job_id BIGINT,
//!     next_run_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX idx_cron_due ON cron_schedules (next_run_at) WHERE status = 'active';
//!
//! CREATE TABLE waitpoints (
//!     id TEXT PRIMARY KEY,
//!     job_id BIGINT,
//!     status TEXT NOT NULL DEFAULT 'waiting',
//!     output JSONB,
//!     timeout_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     completed_at TIMESTAMPTZ,
//!     tags TEXT[] NOT NULL DEFAULT '{}'
//! );
//! CREATE SEQUENCE waitpoints_seq;
//! CREATE INDEX idx_waitpoints_timeout ON waitpoints (timeout_at) WHERE status = 'waiting';
//!
//! CREATE TABLE job_events (
//!     id BIGSERIAL PRIMARY KEY,
//!     job_id BIGINT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     metadata JSONB
//! );
//! CREATE INDEX idx_job_events_job_id ON job_events (job_id);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dataqueue_core::backend::{
    Backend, CronScheduleEdit, JobEdit, JobFilter, NewCronSchedule, NewJob, NewToken, Patch,
    QueueStats, TagMode, TimeComparator,
};
use dataqueue_core::error::{DataQueueError, DataQueueResult};
use dataqueue_core::model::{
    CronSchedule, CronScheduleId, CronScheduleStatus, DeadLetterLink, EventType, FailureReason,
    Job, JobErrorEntry, JobEvent, JobGroup, JobId, JobStatus, RetryPolicy, StepRecord, TokenStatus,
    Waitpoint,
};
use dataqueue_core::retry;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;

fn job_status_str(s: JobStatus) -> &'static str {
    s.as_str()
}

fn parse_job_status(s: &str) -> DataQueueResult<JobStatus> {
    Ok(match s {
        "pending" => JobStatus::Pending,
        "processing" => JobStatus::Processing,
        "waiting" => JobStatus::Waiting,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        other => return Err(DataQueueError::Backend(anyhow::anyhow!("unknown job status {other:?}"))),
    })
}

fn failure_reason_str(r: FailureReason) -> &'static str {
    match r {
        FailureReason::Timeout => "timeout",
        FailureReason::HandlerError => "handler_error",
        FailureReason::NoHandler => "no_handler",
    }
}

fn parse_failure_reason(s: &str) -> Option<FailureReason> {
    match s {
        "timeout" => Some(FailureReason::Timeout),
        "handler_error" => Some(FailureReason::HandlerError),
        "no_handler" => Some(FailureReason::NoHandler),
        _ => None,
    }
}

fn event_type_str(t: EventType) -> &'static str {
    match t {
        EventType::Added => "added",
        EventType::Processing => "processing",
        EventType::Completed => "completed",
        EventType::Failed => "failed",
        EventType::Cancelled => "cancelled",
        EventType::Retried => "retried",
        EventType::Edited => "edited",
        EventType::Prolonged => "prolonged",
        EventType::Waiting => "waiting",
    }
}

fn parse_event_type(s: &str) -> DataQueueResult<EventType> {
    Ok(match s {
        "added" => EventType::Added,
        "processing" => EventType::Processing,
        "completed" => EventType::Completed,
        "failed" => EventType::Failed,
        "cancelled" => EventType::Cancelled,
        "retried" => EventType::Retried,
        "edited" => EventType::Edited,
        "prolonged" => EventType::Prolonged,
        "waiting" => EventType::Waiting,
        other => return Err(DataQueueError::Backend(anyhow::anyhow!("unknown event type {other:?}"))),
    })
}

fn cron_status_str(s: CronScheduleStatus) -> &'static str {
    match s {
        CronScheduleStatus::Active => "active",
        CronScheduleStatus::Paused => "paused",
    }
}

fn parse_cron_status(s: &str) -> DataQueueResult<CronScheduleStatus> {
    Ok(match s {
        "active" => CronScheduleStatus::Active,
        "paused" => CronScheduleStatus::Paused,
        other => return Err(DataQueueError::Backend(anyhow::anyhow!("unknown schedule status {other:?}"))),
    })
}

fn token_status_str(s: TokenStatus) -> &'static str {
    match s {
        TokenStatus::Waiting => "waiting",
        TokenStatus::Completed => "completed",
        TokenStatus::TimedOut => "timed_out",
    }
}

fn parse_token_status(s: &str) -> DataQueueResult<TokenStatus> {
    Ok(match s {
        "waiting" => TokenStatus::Waiting,
        "completed" => TokenStatus::Completed,
        "timed_out" => TokenStatus::TimedOut,
        other => return Err(DataQueueError::Backend(anyhow::anyhow!("unknown token status {other:?}"))),
    })
}

fn row_to_job(row: &PgRow) -> DataQueueResult<Job> {
    let status = parse_job_status(row.try_get::<String, _>("status")?.as_str())?;
    let error_history_json: Value = row.try_get("error_history")?;
    let error_history: Vec<JobErrorEntry> = serde_json::from_value(error_history_json)?;
    let step_data_json: Value = row.try_get("step_data")?;
    let step_data: HashMap<String, StepRecord> = serde_json::from_value(step_data_json)?;
    let group_id: Option<String> = row.try_get("group_id")?;
    let group = group_id.map(|id| JobGroup {
        id,
        tier: row.try_get("group_tier").ok().flatten(),
    });
    let failure_reason: Option<String> = row.try_get("failure_reason")?;

    Ok(Job {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        tags: row.try_get("tags")?,
        idempotency_key: row.try_get("idempotency_key")?,
        group,
        priority: row.try_get("priority")?,
        run_at: row.try_get("run_at")?,
        created_at: row.try_get("created_at")?,
        max_attempts: row.try_get("max_attempts")?,
        attempts: row.try_get("attempts")?,
        timeout_ms: row.try_get("timeout_ms")?,
        force_kill_on_timeout: row.try_get("force_kill_on_timeout")?,
        retry_policy: RetryPolicy {
            retry_delay: row.try_get("retry_delay")?,
            retry_backoff: row.try_get("retry_backoff")?,
            retry_delay_max: row.try_get("retry_delay_max")?,
        },
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        status,
        output: row.try_get("output")?,
        error_history,
        failure_reason: failure_reason.as_deref().and_then(parse_failure_reason),
        next_attempt_at: row.try_get("next_attempt_at")?,
        dead_letter: DeadLetterLink {
            dead_letter_job_type: row.try_get("dead_letter_job_type")?,
            dead_letter_job_id: row.try_get("dead_letter_job_id")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        },
        wait_until: row.try_get("wait_until")?,
        wait_token_id: row.try_get("wait_token_id")?,
        step_data,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        last_retried_at: row.try_get("last_retried_at")?,
        last_failed_at: row.try_get("last_failed_at")?,
        last_cancelled_at: row.try_get("last_cancelled_at")?,
        progress: row.try_get::<Option<i16>, _>("progress")?.map(|p| p as u8),
    })
}

fn row_to_cron_schedule(row: &PgRow) -> DataQueueResult<CronSchedule> {
    let status = parse_cron_status(row.try_get::<String, _>("status")?.as_str())?;
    Ok(CronSchedule {
        id: row.try_get("id")?,
        schedule_name: row.try_get("schedule_name")?,
        cron_expression: row.try_get("cron_expression")?,
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        timezone: row.try_get("timezone")?,
        allow_overlap: row.try_get("allow_overlap")?,
        status,
        priority: row.try_get("priority")?,
        max_attempts: row.try_get("max_attempts")?,
        timeout_ms: row.try_get("timeout_ms")?,
        retry_policy: RetryPolicy {
            retry_delay: row.try_get("retry_delay")?,
            retry_backoff: row.try_get("retry_backoff")?,
            retry_delay_max: row.try_get("retry_delay_max")?,
        },
        tags: row.try_get("tags")?,
        dead_letter_job_type: row.try_get("dead_letter_job_type")?,
        last_enqueued_at: row.try_get("last_enqueued_at")?,
        last_job_id: row.try_get("last_job_id")?,
        next_run_at: row.try_get("next_run_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_waitpoint(row: &PgRow) -> DataQueueResult<Waitpoint> {
    let status = parse_token_status(row.try_get::<String, _>("status")?.as_str())?;
    Ok(Waitpoint {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        status,
        output: row.try_get("output")?,
        timeout_at: row.try_get("timeout_at")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        tags: row.try_get("tags")?,
    })
}

fn row_to_event(row: &PgRow) -> DataQueueResult<JobEvent> {
    let event_type = parse_event_type(row.try_get::<String, _>("event_type")?.as_str())?;
    Ok(JobEvent {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        event_type,
        created_at: row.try_get("created_at")?,
        metadata: row.try_get("metadata")?,
    })
}

/// `dataqueue-postgres`'s `Backend`.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// §5 bring-your-own-connection enqueue: inserts on `tx` instead of a
    /// pool connection, so a caller-driven rollback undoes the enqueue
    /// along with whatever else shares that transaction.
    pub async fn add_job_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: NewJob,
    ) -> DataQueueResult<JobId> {
        Self::insert_one(tx, &job).await
    }

    async fn insert_one(tx: &mut Transaction<'_, Postgres>, job: &NewJob) -> DataQueueResult<JobId> {
        if let Some(key) = &job.idempotency_key {
            let existing: Option<(JobId,)> = sqlx::query_as("SELECT id FROM jobs WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| DataQueueError::Backend(e.into()))?;
            if let Some((id,)) = existing {
                return Ok(id);
            }
        }

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_type, payload, tags, idempotency_key, group_id, group_tier,
                priority, run_at, max_attempts, timeout_ms, force_kill_on_timeout,
                retry_delay, retry_backoff, retry_delay_max, status, error_history, step_data,
                dead_letter_job_type
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, COALESCE($8, NOW()), $9, $10, $11, $12, $13, $14,
                'pending', '[]'::jsonb, '{}'::jsonb, $15
            )
            RETURNING id
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(&job.tags)
        .bind(&job.idempotency_key)
        .bind(job.group.as_ref().map(|g| g.id.clone()))
        .bind(job.group.as_ref().and_then(|g| g.tier.clone()))
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.max_attempts)
        .bind(job.timeout_ms)
        .bind(job.force_kill_on_timeout)
        .bind(job.retry_policy.retry_delay)
        .bind(job.retry_policy.retry_backoff)
        .bind(job.retry_policy.retry_delay_max)
        .bind(&job.dead_letter_job_type)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        let id: JobId = row.try_get("id").map_err(|e| DataQueueError::Backend(e.into()))?;
        Self::insert_event(tx, id, EventType::Added, None).await?;
        Ok(id)
    }

    async fn insert_event(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        event_type: EventType,
        metadata: Option<Value>,
    ) -> DataQueueResult<()> {
        sqlx::query("INSERT INTO job_events (job_id, event_type, metadata) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(event_type_str(event_type))
            .bind(metadata)
            .execute(&mut **tx)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn add_job(&self, job: NewJob) -> DataQueueResult<JobId> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let id = Self::insert_one(&mut tx, &job).await?;
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(id)
    }

    async fn add_jobs(&self, jobs: Vec<NewJob>) -> DataQueueResult<Vec<JobId>> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let mut ids = Vec::with_capacity(jobs.len());
        for job in &jobs {
            ids.push(Self::insert_one(&mut tx, job).await?);
        }
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(ids)
    }

    async fn get_job(&self, id: JobId) -> DataQueueResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn get_jobs(&self, filter: JobFilter) -> DataQueueResult<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
        if !filter.status.is_empty() {
            let statuses: Vec<&str> = filter.status.iter().map(|s| job_status_str(*s)).collect();
            sql.push_str(&format!(
                " AND status = ANY(ARRAY[{}])",
                statuses.iter().map(|s| format!("'{s}'")).collect::<Vec<_>>().join(",")
            ));
        }
        if !filter.job_type.is_empty() {
            let types = filter.job_type.iter().map(|t| format!("'{}'", t.replace('\'', "''"))).collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND job_type = ANY(ARRAY[{types}])"));
        }
        if let Some((mode, tags)) = &filter.tags {
            let arr = tags.iter().map(|t| format!("'{}'", t.replace('\'', "''"))).collect::<Vec<_>>().join(",");
            match mode {
                TagMode::All => sql.push_str(&format!(" AND tags @> ARRAY[{arr}]")),
                TagMode::Any => sql.push_str(&format!(" AND tags && ARRAY[{arr}]")),
                TagMode::Exact => sql.push_str(&format!(" AND tags = ARRAY[{arr}]")),
                TagMode::None => sql.push_str(&format!(" AND NOT (tags && ARRAY[{arr}])")),
            }
        }
        if let Some(cmp) = &filter.run_at {
            let (op, _t) = match cmp {
                TimeComparator::Gt(t) => (">", t),
                TimeComparator::Gte(t) => (">=", t),
                TimeComparator::Lt(t) => ("<", t),
                TimeComparator::Lte(t) => ("<=", t),
                TimeComparator::Eq(t) => ("=", t),
            };
            sql.push_str(&format!(" AND run_at {op} $1"));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit.max(0)));
        }
        if let Some(offset) = filter.offset {
            sql.push_str(&format!(" OFFSET {}", offset.max(0)));
        }

        let mut query = sqlx::query(&sql);
        if let Some(cmp) = &filter.run_at {
            let t = match cmp {
                TimeComparator::Gt(t)
                | TimeComparator::Gte(t)
                | TimeComparator::Lt(t)
                | TimeComparator::Lte(t)
                | TimeComparator::Eq(t) => *t,
            };
            query = query.bind(t);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        rows.iter().map(row_to_job).collect()
    }

    async fn get_next_batch(
        &self,
        worker_id: &str,
        batch_size: usize,
        job_type_filter: Option<&[String]>,
        group_concurrency: Option<u32>,
    ) -> DataQueueResult<Vec<Job>> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE jobs SET status = 'pending', next_attempt_at = NULL \
             WHERE status = 'failed' AND next_attempt_at IS NOT NULL AND next_attempt_at <= $1 AND attempts < max_attempts",
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        sqlx::query(
            "UPDATE jobs SET status = 'pending', wait_until = NULL \
             WHERE status = 'waiting' AND wait_token_id IS NULL AND wait_until IS NOT NULL AND wait_until <= $1",
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        let fetch_limit = match group_concurrency {
            Some(_) => (batch_size * 4).max(batch_size) as i64,
            None => batch_size as i64,
        };

        let candidate_rows = if let Some(types) = job_type_filter {
            sqlx::query(
                "SELECT id, group_id FROM jobs WHERE status = 'pending' AND run_at <= $1 AND job_type = ANY($2) \
                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT $3 FOR UPDATE SKIP LOCKED",
            )
            .bind(now)
            .bind(types)
            .bind(fetch_limit)
            .fetch_all(&mut *tx)
            .await
        } else {
            sqlx::query(
                "SELECT id, group_id FROM jobs WHERE status = 'pending' AND run_at <= $1 \
                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT $2 FOR UPDATE SKIP LOCKED",
            )
            .bind(now)
            .bind(fetch_limit)
            .fetch_all(&mut *tx)
            .await
        }
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        let mut chosen: Vec<JobId> = Vec::with_capacity(batch_size);
        if let Some(cap) = group_concurrency {
            let counts_rows = sqlx::query(
                "SELECT group_id, COUNT(*) as n FROM jobs WHERE status = 'processing' AND group_id IS NOT NULL GROUP BY group_id",
            )
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
            let mut group_counts: HashMap<String, i64> = HashMap::new();
            for row in counts_rows {
                let gid: String = row.try_get("group_id").map_err(|e| DataQueueError::Backend(e.into()))?;
                let n: i64 = row.try_get("n").map_err(|e| DataQueueError::Backend(e.into()))?;
                group_counts.insert(gid, n);
            }

            for row in &candidate_rows {
                if chosen.len() >= batch_size {
                    break;
                }
                let id: JobId = row.try_get("id").map_err(|e| DataQueueError::Backend(e.into()))?;
                let group_id: Option<String> = row.try_get("group_id").map_err(|e| DataQueueError::Backend(e.into()))?;
                if let Some(gid) = &group_id {
                    let count = group_counts.entry(gid.clone()).or_insert(0);
                    if *count >= cap as i64 {
                        continue;
                    }
                    *count += 1;
                }
                chosen.push(id);
            }
        } else {
            for row in &candidate_rows {
                chosen.push(row.try_get("id").map_err(|e| DataQueueError::Backend(e.into()))?);
            }
        }

        if chosen.is_empty() {
            tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "UPDATE jobs SET status = 'processing', locked_at = $1, locked_by = $2, updated_at = $1, \
             attempts = attempts + 1, \
             started_at = COALESCE(started_at, $1), \
             last_retried_at = CASE WHEN attempts + 1 > 1 THEN $1 ELSE last_retried_at END \
             WHERE id = ANY($3) RETURNING *",
        )
        .bind(now)
        .bind(worker_id)
        .bind(&chosen)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        for id in &chosen {
            Self::insert_event(&mut tx, *id, EventType::Processing, None).await?;
        }

        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        rows.iter().map(row_to_job).collect()
    }

    async fn complete_job(&self, id: JobId, output: Option<Value>) -> DataQueueResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = $1, updated_at = $1, \
             locked_at = NULL, locked_by = NULL, wait_until = NULL, wait_token_id = NULL, step_data = '{}'::jsonb, \
             output = COALESCE($2, output) \
             WHERE id = $3 AND status = 'processing'",
        )
        .bind(now)
        .bind(&output)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(DataQueueError::InvalidState(id));
        }
        Self::insert_event(&mut tx, id, EventType::Completed, None).await?;
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn fail_job(&self, id: JobId, error: &str, failure_reason: FailureReason) -> DataQueueResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let now = Utc::now();

        let row = sqlx::query(
            "SELECT attempts, max_attempts, retry_delay, retry_backoff, retry_delay_max, dead_letter_job_type, \
             job_type, payload, error_history FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?
        .ok_or(DataQueueError::JobNotFound(id))?;

        let attempts: i32 = row.try_get("attempts").map_err(|e| DataQueueError::Backend(e.into()))?;
        let max_attempts: i32 = row.try_get("max_attempts").map_err(|e| DataQueueError::Backend(e.into()))?;
        let policy = RetryPolicy {
            retry_delay: row.try_get("retry_delay").map_err(|e| DataQueueError::Backend(e.into()))?,
            retry_backoff: row.try_get("retry_backoff").map_err(|e| DataQueueError::Backend(e.into()))?,
            retry_delay_max: row.try_get("retry_delay_max").map_err(|e| DataQueueError::Backend(e.into()))?,
        };
        let mut error_history: Vec<JobErrorEntry> = serde_json::from_value(
            row.try_get::<Value, _>("error_history").map_err(|e| DataQueueError::Backend(e.into()))?,
        )?;
        error_history.push(JobErrorEntry { message: error.to_string(), timestamp: now });

        sqlx::query(
            "UPDATE jobs SET error_history = $1, failure_reason = $2, last_failed_at = $3, \
             locked_at = NULL, locked_by = NULL, updated_at = $3 WHERE id = $4",
        )
        .bind(serde_json::to_value(&error_history)?)
        .bind(failure_reason_str(failure_reason))
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        if attempts < max_attempts {
            let next = retry::next_attempt_at(&policy, attempts, now, fastrand::f64);
            sqlx::query("UPDATE jobs SET status = 'failed', next_attempt_at = $1 WHERE id = $2")
                .bind(next)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| DataQueueError::Backend(e.into()))?;
        } else {
            sqlx::query("UPDATE jobs SET status = 'failed', next_attempt_at = NULL WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| DataQueueError::Backend(e.into()))?;

            let dlq_type: Option<String> = row.try_get("dead_letter_job_type").map_err(|e| DataQueueError::Backend(e.into()))?;
            if let Some(dlq_type) = dlq_type {
                let job_type: String = row.try_get("job_type").map_err(|e| DataQueueError::Backend(e.into()))?;
                let payload: Value = row.try_get("payload").map_err(|e| DataQueueError::Backend(e.into()))?;
                let envelope = serde_json::json!({
                    "originalJob": { "id": id, "jobType": job_type },
                    "originalPayload": payload,
                    "failure": { "message": error, "reason": failure_reason_str(failure_reason) },
                });
                let dlq_id = Self::insert_one(
                    &mut tx,
                    &NewJob { job_type: dlq_type, payload: envelope, ..NewJob::default() },
                )
                .await?;
                sqlx::query("UPDATE jobs SET dead_letter_job_id = $1, dead_lettered_at = $2 WHERE id = $3")
                    .bind(dlq_id)
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| DataQueueError::Backend(e.into()))?;
            }
        }

        Self::insert_event(&mut tx, id, EventType::Failed, None).await?;
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn retry_job(&self, id: JobId) -> DataQueueResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', next_attempt_at = $1, run_at = $1, last_retried_at = $1, \
             locked_at = NULL, locked_by = NULL, updated_at = $1 \
             WHERE id = $2 AND status IN ('failed', 'processing')",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        if result.rows_affected() > 0 {
            Self::insert_event(&mut tx, id, EventType::Retried, None).await?;
        }
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn cancel_job(&self, id: JobId) -> DataQueueResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', locked_at = NULL, locked_by = NULL, \
             wait_until = NULL, wait_token_id = NULL, last_cancelled_at = $1, updated_at = $1 \
             WHERE id = $2 AND status IN ('pending', 'waiting')",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        if result.rows_affected() > 0 {
            Self::insert_event(&mut tx, id, EventType::Cancelled, None).await?;
        }
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn edit_job(&self, id: JobId, edit: JobEdit) -> DataQueueResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let touched = apply_job_edit(&mut tx, &[id], &edit).await?;
        if touched > 0 {
            Self::insert_event(&mut tx, id, EventType::Edited, None).await?;
        }
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn edit_all_pending_jobs(&self, filter: JobFilter, edit: JobEdit) -> DataQueueResult<u64> {
        let mut pending_filter = filter;
        pending_filter.status = vec![JobStatus::Pending];
        let ids: Vec<JobId> = self.get_jobs(pending_filter).await?.into_iter().map(|j| j.id).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let touched = apply_job_edit(&mut tx, &ids, &edit).await?;
        for id in &ids {
            Self::insert_event(&mut tx, *id, EventType::Edited, None).await?;
        }
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(touched)
    }

    async fn prolong_job(&self, id: JobId) {
        let _ = sqlx::query("UPDATE jobs SET locked_at = NOW() WHERE id = $1 AND status = 'processing'")
            .bind(id)
            .execute(&self.pool)
            .await;
    }

    async fn update_progress(&self, id: JobId, pct: u8) {
        let _ = sqlx::query("UPDATE jobs SET progress = $1 WHERE id = $2")
            .bind(pct as i16)
            .bind(id)
            .execute(&self.pool)
            .await;
    }

    async fn update_output(&self, id: JobId, value: Value) {
        let _ = sqlx::query("UPDATE jobs SET output = $1 WHERE id = $2")
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await;
    }

    async fn reclaim_stuck_jobs(&self, max_processing_minutes: i64) -> DataQueueResult<u64> {
        let now = Utc::now();
        let max_processing_ms = max_processing_minutes * 60_000;
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', locked_at = NULL, locked_by = NULL, updated_at = $1 \
             WHERE status = 'processing' AND locked_at IS NOT NULL \
             AND locked_at < $1 - (GREATEST($2::bigint, COALESCE(timeout_ms, 0)) * INTERVAL '1 millisecond')",
        )
        .bind(now)
        .bind(max_processing_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(result.rows_affected())
    }

    async fn cleanup_old_jobs(&self, days_to_keep: i64, batch_size: Option<usize>) -> DataQueueResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(days_to_keep);
        let limit = batch_size.unwrap_or(1000) as i64;
        let result = sqlx::query(
            "DELETE FROM jobs WHERE id IN ( \
                SELECT id FROM jobs WHERE status = 'completed' AND updated_at < $1 LIMIT $2 \
             )",
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(result.rows_affected())
    }

    async fn cleanup_old_job_events(&self, days_to_keep: i64, batch_size: Option<usize>) -> DataQueueResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(days_to_keep);
        let limit = batch_size.unwrap_or(1000) as i64;
        let result = sqlx::query(
            "DELETE FROM job_events WHERE id IN ( \
                SELECT id FROM job_events WHERE created_at < $1 LIMIT $2 \
             )",
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> DataQueueResult<QueueStats> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE status = 'pending') as pending, \
                COUNT(*) FILTER (WHERE status = 'processing') as processing, \
                COUNT(*) FILTER (WHERE status = 'waiting') as waiting, \
                COUNT(*) FILTER (WHERE status = 'completed') as completed, \
                COUNT(*) FILTER (WHERE status = 'failed') as failed, \
                COUNT(*) FILTER (WHERE status = 'cancelled') as cancelled \
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        Ok(QueueStats {
            pending: row.try_get("pending").map_err(|e| DataQueueError::Backend(e.into()))?,
            processing: row.try_get("processing").map_err(|e| DataQueueError::Backend(e.into()))?,
            waiting: row.try_get("waiting").map_err(|e| DataQueueError::Backend(e.into()))?,
            completed: row.try_get("completed").map_err(|e| DataQueueError::Backend(e.into()))?,
            failed: row.try_get("failed").map_err(|e| DataQueueError::Backend(e.into()))?,
            cancelled: row.try_get("cancelled").map_err(|e| DataQueueError::Backend(e.into()))?,
        })
    }

    async fn create_token(&self, token: NewToken) -> DataQueueResult<Waitpoint> {
        let row = sqlx::query(
            "INSERT INTO waitpoints (id, job_id, status, timeout_at, tags) \
             VALUES ('wp_' || nextval('waitpoints_seq'), $1, 'waiting', $2, $3) RETURNING *",
        )
        .bind(token.job_id)
        .bind(token.timeout_at)
        .bind(&token.tags)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;
        row_to_waitpoint(&row)
    }

    async fn get_token(&self, id: &str) -> DataQueueResult<Option<Waitpoint>> {
        let row = sqlx::query("SELECT * FROM waitpoints WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        row.as_ref().map(row_to_waitpoint).transpose()
    }

    async fn complete_token(&self, id: &str, output: Value) -> DataQueueResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let now = Utc::now();
        let row = sqlx::query("UPDATE waitpoints SET status = 'completed', output = $1, completed_at = $2 WHERE id = $3 RETURNING job_id")
            .bind(&output)
            .bind(now)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?
            .ok_or_else(|| DataQueueError::TokenNotFound(id.to_string()))?;

        let job_id: Option<JobId> = row.try_get("job_id").map_err(|e| DataQueueError::Backend(e.into()))?;
        if let Some(job_id) = job_id {
            resume_waiting_job(&mut tx, job_id, now).await?;
        }
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn expire_timed_out_tokens(&self) -> DataQueueResult<u64> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let now = Utc::now();
        let rows = sqlx::query(
            "UPDATE waitpoints SET status = 'timed_out', completed_at = $1 \
             WHERE status = 'waiting' AND timeout_at IS NOT NULL AND timeout_at <= $1 RETURNING job_id",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        for row in &rows {
            let job_id: Option<JobId> = row.try_get("job_id").map_err(|e| DataQueueError::Backend(e.into()))?;
            if let Some(job_id) = job_id {
                resume_waiting_job(&mut tx, job_id, now).await?;
            }
        }
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(rows.len() as u64)
    }

    async fn wait_job(
        &self,
        id: JobId,
        wait_until: Option<DateTime<Utc>>,
        token_id: Option<String>,
        step_data: HashMap<String, StepRecord>,
    ) -> DataQueueResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'waiting', wait_until = $1, wait_token_id = $2, step_data = $3, \
             locked_at = NULL, locked_by = NULL, updated_at = $4 \
             WHERE id = $5 AND status = 'processing'",
        )
        .bind(wait_until)
        .bind(&token_id)
        .bind(serde_json::to_value(&step_data)?)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(DataQueueError::InvalidState(id));
        }
        Self::insert_event(&mut tx, id, EventType::Waiting, None).await?;
        tx.commit().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn add_cron_schedule(&self, schedule: NewCronSchedule) -> DataQueueResult<CronScheduleId> {
        let next_run_at = dataqueue_core::cron::next_run_at(&schedule.cron_expression, &schedule.timezone, Utc::now())?;
        let row = sqlx::query(
            "INSERT INTO cron_schedules ( \
                schedule_name, cron_expression, job_type, payload, timezone, allow_overlap, \
                priority, max_attempts, timeout_ms, retry_delay, retry_backoff, retry_delay_max, \
                tags, dead_letter_job_type, next_run_at \
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15) \
             ON CONFLICT (schedule_name) DO NOTHING RETURNING id",
        )
        .bind(&schedule.schedule_name)
        .bind(&schedule.cron_expression)
        .bind(&schedule.job_type)
        .bind(&schedule.payload)
        .bind(&schedule.timezone)
        .bind(schedule.allow_overlap)
        .bind(schedule.priority)
        .bind(schedule.max_attempts)
        .bind(schedule.timeout_ms)
        .bind(schedule.retry_policy.retry_delay)
        .bind(schedule.retry_policy.retry_backoff)
        .bind(schedule.retry_policy.retry_delay_max)
        .bind(&schedule.tags)
        .bind(&schedule.dead_letter_job_type)
        .bind(next_run_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        match row {
            Some(row) => row.try_get("id").map_err(|e| DataQueueError::Backend(e.into())),
            None => Err(DataQueueError::DuplicateScheduleName(schedule.schedule_name)),
        }
    }

    async fn get_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<Option<CronSchedule>> {
        let row = sqlx::query("SELECT * FROM cron_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        row.as_ref().map(row_to_cron_schedule).transpose()
    }

    async fn get_cron_schedule_by_name(&self, name: &str) -> DataQueueResult<Option<CronSchedule>> {
        let row = sqlx::query("SELECT * FROM cron_schedules WHERE schedule_name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        row.as_ref().map(row_to_cron_schedule).transpose()
    }

    async fn list_cron_schedules(&self, status: Option<CronScheduleStatus>) -> DataQueueResult<Vec<CronSchedule>> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM cron_schedules WHERE status = $1 ORDER BY id")
                    .bind(cron_status_str(s))
                    .fetch_all(&self.pool)
                    .await
            }
            None => sqlx::query("SELECT * FROM cron_schedules ORDER BY id").fetch_all(&self.pool).await,
        }
        .map_err(|e| DataQueueError::Backend(e.into()))?;
        rows.iter().map(row_to_cron_schedule).collect()
    }

    async fn pause_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        let result = sqlx::query("UPDATE cron_schedules SET status = 'paused', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(DataQueueError::ScheduleNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn resume_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        let result = sqlx::query("UPDATE cron_schedules SET status = 'active', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(DataQueueError::ScheduleNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn edit_cron_schedule(&self, id: CronScheduleId, edit: CronScheduleEdit) -> DataQueueResult<()> {
        let result = sqlx::query(
            "UPDATE cron_schedules SET \
                cron_expression = COALESCE($1, cron_expression), \
                payload = COALESCE($2, payload), \
                timezone = COALESCE($3, timezone), \
                allow_overlap = COALESCE($4, allow_overlap), \
                priority = COALESCE($5, priority), \
                max_attempts = COALESCE($6, max_attempts), \
                timeout_ms = CASE WHEN $7 THEN $8 ELSE timeout_ms END, \
                retry_delay = COALESCE($9, retry_delay), \
                retry_backoff = COALESCE($10, retry_backoff), \
                retry_delay_max = COALESCE($11, retry_delay_max), \
                tags = COALESCE($12, tags), \
                dead_letter_job_type = CASE WHEN $13 THEN $14 ELSE dead_letter_job_type END, \
                updated_at = NOW() \
             WHERE id = $15",
        )
        .bind(&edit.cron_expression)
        .bind(&edit.payload)
        .bind(&edit.timezone)
        .bind(edit.allow_overlap)
        .bind(edit.priority)
        .bind(edit.max_attempts)
        .bind(matches!(edit.timeout_ms, Some(_)))
        .bind(edit.timeout_ms.as_ref().and_then(|p| match p {
            Patch::Clear => None,
            Patch::Set(v) => Some(*v),
        }))
        .bind(edit.retry_policy.as_ref().and_then(|r| r.retry_delay))
        .bind(edit.retry_policy.as_ref().and_then(|r| r.retry_backoff))
        .bind(edit.retry_policy.as_ref().and_then(|r| r.retry_delay_max))
        .bind(&edit.tags)
        .bind(matches!(edit.dead_letter_job_type, Some(_)))
        .bind(edit.dead_letter_job_type.as_ref().and_then(|p| match p {
            Patch::Clear => None,
            Patch::Set(v) => Some(v.clone()),
        }))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(DataQueueError::ScheduleNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn remove_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        sqlx::query("DELETE FROM cron_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_due_cron_schedules(&self) -> DataQueueResult<Vec<CronSchedule>> {
        let rows = sqlx::query("SELECT * FROM cron_schedules WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= NOW()")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        rows.iter().map(row_to_cron_schedule).collect()
    }

    async fn update_cron_schedule_after_enqueue(
        &self,
        id: CronScheduleId,
        last_enqueued_at: DateTime<Utc>,
        last_job_id: JobId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DataQueueResult<()> {
        sqlx::query(
            "UPDATE cron_schedules SET last_enqueued_at = $1, last_job_id = $2, next_run_at = $3, updated_at = NOW() WHERE id = $4",
        )
        .bind(last_enqueued_at)
        .bind(last_job_id)
        .bind(next_run_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn record_job_event(&self, job_id: JobId, event_type: EventType, metadata: Option<Value>) -> DataQueueResult<()> {
        sqlx::query("INSERT INTO job_events (job_id, event_type, metadata) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(event_type_str(event_type))
            .bind(metadata)
            .execute(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_job_events(&self, job_id: JobId) -> DataQueueResult<Vec<JobEvent>> {
        let rows = sqlx::query("SELECT * FROM job_events WHERE job_id = $1 ORDER BY id ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        rows.iter().map(row_to_event).collect()
    }

    async fn group_in_flight(&self, group_id: &str) -> DataQueueResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM jobs WHERE status = 'processing' AND group_id = $1")
            .bind(group_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        let n: i64 = row.try_get("n").map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(n as u64)
    }

    async fn ping(&self) -> DataQueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }
}

async fn resume_waiting_job(tx: &mut Transaction<'_, Postgres>, job_id: JobId, now: DateTime<Utc>) -> DataQueueResult<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'pending', wait_until = NULL, wait_token_id = NULL, updated_at = $1 \
         WHERE id = $2 AND status = 'waiting'",
    )
    .bind(now)
    .bind(job_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| DataQueueError::Backend(e.into()))?;
    Ok(())
}

async fn apply_job_edit(tx: &mut Transaction<'_, Postgres>, ids: &[JobId], edit: &JobEdit) -> DataQueueResult<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET \
            payload = COALESCE($1, payload), \
            priority = COALESCE($2, priority), \
            max_attempts = COALESCE($3, max_attempts), \
            run_at = COALESCE($4, run_at), \
            timeout_ms = CASE WHEN $5 THEN $6 ELSE timeout_ms END, \
            tags = CASE WHEN $7 THEN $8 ELSE tags END, \
            retry_delay = CASE WHEN $9 THEN $10 ELSE retry_delay END, \
            retry_backoff = CASE WHEN $11 THEN $12 ELSE retry_backoff END, \
            retry_delay_max = CASE WHEN $13 THEN $14 ELSE retry_delay_max END, \
            updated_at = NOW() \
         WHERE id = ANY($15) AND status = 'pending'",
    )
    .bind(&edit.payload)
    .bind(edit.priority)
    .bind(edit.max_attempts)
    .bind(edit.run_at)
    .bind(matches!(edit.timeout_ms, Some(_)))
    .bind(edit.timeout_ms.as_ref().and_then(|p| match p {
        Patch::Clear => None,
        Patch::Set(v) => Some(*v),
    }))
    .bind(matches!(edit.tags, Some(_)))
    .bind(edit.tags.as_ref().map(|p| match p {
        Patch::Clear => Vec::new(),
        Patch::Set(v) => v.clone(),
    }))
    .bind(matches!(edit.retry_delay, Some(_)))
    .bind(edit.retry_delay.as_ref().and_then(|p| match p {
        Patch::Clear => None,
        Patch::Set(v) => Some(*v),
    }))
    .bind(matches!(edit.retry_backoff, Some(_)))
    .bind(edit.retry_backoff.as_ref().and_then(|p| match p {
        Patch::Clear => None,
        Patch::Set(v) => Some(*v),
    }))
    .bind(matches!(edit.retry_delay_max, Some(_)))
    .bind(edit.retry_delay_max.as_ref().and_then(|p| match p {
        Patch::Clear => None,
        Patch::Set(v) => Some(*v),
    }))
    .bind(ids)
    .execute(&mut **tx)
    .await
    .map_err(|e| DataQueueError::Backend(e.into()))?;
    Ok(result.rows_affected())
}
