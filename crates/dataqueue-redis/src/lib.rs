//! Redis implementation of the DataQueue [`Backend`] trait.
//!
//! Every mutation that touches more than one key runs as a single Lua
//! script via `EVALSHA`/`EVAL` (the `redis` crate's [`redis::Script`]
//! caches the SHA and falls back to `EVAL` on a cache miss), so a claim,
//! a fail-with-retry, or a token completion is atomic the same way a SQL
//! transaction is for the relational backend. This mirrors the
//! one-script-per-mutation shape a Redis-backed job queue typically uses.
//!
//! # Key layout
//!
//! All keys sit behind a configurable prefix (default `dq:`):
//!
//! - `job:{id}` — hash of a job's fields (`payload`/`tags`/`errorHistory`/
//!   `stepData`/retry-policy fields are JSON-encoded hash values).
//! - `all` — zset of every job id, scored by `createdAt`.
//! - `queue` — zset of `pending` ids ready now, scored by
//!   `priority·10^15 + (10^15 − createdAt)` (higher score claims first).
//! - `delayed` — zset of `pending` ids not yet due, scored by `runAt`.
//! - `retry` — zset of `failed` ids awaiting their next attempt, scored by
//!   `nextAttemptAt`.
//! - `waiting` — zset of `waiting` ids with a time-based wait, scored by
//!   `waitUntil`.
//! - `status:{status}` / `type:{jobType}` / `tag:{tag}` — membership sets.
//! - `job:{id}:tags` — the tag set a given job belongs to (for removal).
//! - `events:{id}` — list of JSON event records.
//! - `idempotency:{key}` — maps an idempotency key to a job id.
//! - `id_seq` / `event_id_seq` / `cron_id_seq` / `waitpoint_seq` — counters.
//! - `waitpoint:{id}` — hash of a waitpoint's fields.
//! - `waitpoint_timeout` — zset of waiting waitpoints, scored by `timeoutAt`.
//! - `cron:{id}` — hash of a cron schedule's fields.
//! - `cron_name:{name}` — maps a schedule name to its id.
//! - `crons` — set of all schedule ids.
//! - `cron_status:{status}` — membership set.
//! - `cron_due` — zset of active schedules, scored by `nextRunAt`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dataqueue_core::backend::{
    Backend, CronScheduleEdit, JobEdit, JobFilter, NewCronSchedule, NewJob, NewToken, Patch,
    QueueStats, TagMode,
};
use dataqueue_core::error::{DataQueueError, DataQueueResult};
use dataqueue_core::model::{
    CronSchedule, CronScheduleId, CronScheduleStatus, DeadLetterLink, EventType, FailureReason,
    Job, JobErrorEntry, JobEvent, JobGroup, JobId, JobStatus, RetryPolicy, StepRecord, TokenStatus,
    Waitpoint,
};
use dataqueue_core::retry;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use std::collections::HashMap;

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn opt_millis(dt: Option<DateTime<Utc>>) -> String {
    dt.map(|d| millis(d).to_string()).unwrap_or_default()
}

fn parse_opt_millis(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        None
    } else {
        s.parse::<i64>().ok().map(from_millis)
    }
}

fn ready_score(priority: i32, created_at: DateTime<Utc>) -> f64 {
    const SCALE: f64 = 1_000_000_000_000_000.0;
    priority as f64 * SCALE + (SCALE - created_at.timestamp_millis() as f64)
}

/// A job's wire representation as Redis hash fields.
struct JobFields(HashMap<String, String>);

impl JobFields {
    fn from_job_parts(id: JobId, job: &NewJob, created_at: DateTime<Utc>, run_at: DateTime<Utc>) -> DataQueueResult<Self> {
        let mut m = HashMap::new();
        m.insert("id".into(), id.to_string());
        m.insert("jobType".into(), job.job_type.clone());
        m.insert("payload".into(), serde_json::to_string(&job.payload)?);
        m.insert("tags".into(), serde_json::to_string(&job.tags)?);
        if let Some(k) = &job.idempotency_key {
            m.insert("idempotencyKey".into(), k.clone());
        }
        if let Some(g) = &job.group {
            m.insert("groupId".into(), g.id.clone());
            if let Some(t) = &g.tier {
                m.insert("groupTier".into(), t.clone());
            }
        }
        m.insert("priority".into(), job.priority.to_string());
        m.insert("runAt".into(), millis(run_at).to_string());
        m.insert("createdAt".into(), millis(created_at).to_string());
        m.insert("maxAttempts".into(), job.max_attempts.to_string());
        m.insert("attempts".into(), "0".into());
        if let Some(t) = job.timeout_ms {
            m.insert("timeoutMs".into(), t.to_string());
        }
        m.insert("forceKillOnTimeout".into(), if job.force_kill_on_timeout { "1".into() } else { "0".into() });
        if let Some(d) = job.retry_policy.retry_delay {
            m.insert("retryDelay".into(), d.to_string());
        }
        if let Some(b) = job.retry_policy.retry_backoff {
            m.insert("retryBackoff".into(), if b { "1".into() } else { "0".into() });
        }
        if let Some(d) = job.retry_policy.retry_delay_max {
            m.insert("retryDelayMax".into(), d.to_string());
        }
        m.insert("status".into(), "pending".into());
        m.insert("errorHistory".into(), "[]".into());
        m.insert("stepData".into(), "{}".into());
        m.insert("updatedAt".into(), millis(created_at).to_string());
        if let Some(t) = &job.dead_letter_job_type {
            m.insert("deadLetterJobType".into(), t.clone());
        }
        Ok(JobFields(m))
    }
}

fn job_from_fields(fields: &HashMap<String, String>) -> DataQueueResult<Job> {
    let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
    let getf = |k: &str| -> DataQueueResult<Value> {
        let raw = get(k);
        if raw.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_str(&raw)?)
        }
    };

    let tags: Vec<String> = serde_json::from_str(&get("tags")).unwrap_or_default();
    let error_history: Vec<JobErrorEntry> = serde_json::from_str(&get("errorHistory")).unwrap_or_default();
    let step_data: HashMap<String, StepRecord> = serde_json::from_str(&get("stepData")).unwrap_or_default();
    let status = match get("status").as_str() {
        "pending" => JobStatus::Pending,
        "processing" => JobStatus::Processing,
        "waiting" => JobStatus::Waiting,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        other => return Err(DataQueueError::Backend(anyhow::anyhow!("unknown job status {other:?}"))),
    };
    let failure_reason = match get("failureReason").as_str() {
        "timeout" => Some(FailureReason::Timeout),
        "handler_error" => Some(FailureReason::HandlerError),
        "no_handler" => Some(FailureReason::NoHandler),
        _ => None,
    };
    let group_id = fields.get("groupId").cloned();
    let group = group_id.map(|id| JobGroup { id, tier: fields.get("groupTier").cloned() });

    Ok(Job {
        id: get("id").parse().unwrap_or_default(),
        job_type: get("jobType"),
        payload: getf("payload")?,
        tags,
        idempotency_key: fields.get("idempotencyKey").cloned(),
        group,
        priority: get("priority").parse().unwrap_or(0),
        run_at: parse_opt_millis(&get("runAt")).unwrap_or_else(Utc::now),
        created_at: parse_opt_millis(&get("createdAt")).unwrap_or_else(Utc::now),
        max_attempts: get("maxAttempts").parse().unwrap_or(1),
        attempts: get("attempts").parse().unwrap_or(0),
        timeout_ms: fields.get("timeoutMs").and_then(|v| v.parse().ok()),
        force_kill_on_timeout: get("forceKillOnTimeout") == "1",
        retry_policy: RetryPolicy {
            retry_delay: fields.get("retryDelay").and_then(|v| v.parse().ok()),
            retry_backoff: fields.get("retryBackoff").map(|v| v == "1"),
            retry_delay_max: fields.get("retryDelayMax").and_then(|v| v.parse().ok()),
        },
        locked_at: parse_opt_millis(&get("lockedAt")),
        locked_by: fields.get("lockedBy").cloned(),
        status,
        output: fields.get("output").and_then(|v| serde_json::from_str(v).ok()),
        error_history,
        failure_reason,
        next_attempt_at: parse_opt_millis(&get("nextAttemptAt")),
        dead_letter: DeadLetterLink {
            dead_letter_job_type: fields.get("deadLetterJobType").cloned(),
            dead_letter_job_id: fields.get("deadLetterJobId").and_then(|v| v.parse().ok()),
            dead_lettered_at: parse_opt_millis(&get("deadLetteredAt")),
        },
        wait_until: parse_opt_millis(&get("waitUntil")),
        wait_token_id: fields.get("waitTokenId").cloned(),
        step_data,
        updated_at: parse_opt_millis(&get("updatedAt")).unwrap_or_else(Utc::now),
        started_at: parse_opt_millis(&get("startedAt")),
        completed_at: parse_opt_millis(&get("completedAt")),
        last_retried_at: parse_opt_millis(&get("lastRetriedAt")),
        last_failed_at: parse_opt_millis(&get("lastFailedAt")),
        last_cancelled_at: parse_opt_millis(&get("lastCancelledAt")),
        progress: fields.get("progress").and_then(|v| v.parse().ok()),
    })
}

const ADD_JOB_SCRIPT: &str = r#"
local idem_key = ARGV[1]
if idem_key ~= "" then
    local existing = redis.call('GET', KEYS[1])
    if existing then
        return existing
    end
end

local id = redis.call('INCR', KEYS[2])
local job_key = KEYS[3] .. id
local created_at = tonumber(ARGV[2])
local run_at = tonumber(ARGV[3])
local priority = tonumber(ARGV[4])
local job_type = ARGV[5]
local ready_score = ARGV[6]

for i = 7, #ARGV, 2 do
    redis.call('HSET', job_key, ARGV[i], ARGV[i+1])
end
redis.call('HSET', job_key, 'id', id)

redis.call('ZADD', KEYS[4], created_at, id)
if run_at <= created_at then
    redis.call('ZADD', KEYS[5], ready_score, id)
else
    redis.call('ZADD', KEYS[6], run_at, id)
end
redis.call('SADD', KEYS[7], id)
redis.call('SADD', KEYS[8], id)
if idem_key ~= "" then
    redis.call('SET', KEYS[1], id)
end

return tostring(id)
"#;

const CLAIM_BATCH_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local worker_id = ARGV[2]
local batch_size = tonumber(ARGV[3])
local group_cap = tonumber(ARGV[4])
local queue_key = KEYS[1]
local delayed_key = KEYS[2]
local retry_key = KEYS[3]
local waiting_key = KEYS[4]
local job_prefix = KEYS[5]
local status_prefix = KEYS[6]

-- promote delayed jobs that are now due
local due_delayed = redis.call('ZRANGEBYSCORE', delayed_key, '-inf', now)
for _, id in ipairs(due_delayed) do
    redis.call('ZREM', delayed_key, id)
    local priority = tonumber(redis.call('HGET', job_prefix .. id, 'priority')) or 0
    local created_at = tonumber(redis.call('HGET', job_prefix .. id, 'createdAt')) or now
    local score = priority * 1e15 + (1e15 - created_at)
    redis.call('ZADD', queue_key, score, id)
end

-- promote retries whose nextAttemptAt has passed
local due_retry = redis.call('ZRANGEBYSCORE', retry_key, '-inf', now)
for _, id in ipairs(due_retry) do
    local attempts = tonumber(redis.call('HGET', job_prefix .. id, 'attempts')) or 0
    local max_attempts = tonumber(redis.call('HGET', job_prefix .. id, 'maxAttempts')) or 1
    if attempts < max_attempts then
        redis.call('ZREM', retry_key, id)
        redis.call('HSET', job_prefix .. id, 'status', 'pending')
        redis.call('HDEL', job_prefix .. id, 'nextAttemptAt')
        redis.call('SREM', status_prefix .. 'failed', id)
        redis.call('SADD', status_prefix .. 'pending', id)
        local priority = tonumber(redis.call('HGET', job_prefix .. id, 'priority')) or 0
        local created_at = tonumber(redis.call('HGET', job_prefix .. id, 'createdAt')) or now
        local score = priority * 1e15 + (1e15 - created_at)
        redis.call('ZADD', queue_key, score, id)
    end
end

-- promote timed-out time-based waiters
local due_wait = redis.call('ZRANGEBYSCORE', waiting_key, '-inf', now)
for _, id in ipairs(due_wait) do
    local token = redis.call('HGET', job_prefix .. id, 'waitTokenId')
    if not token or token == "" then
        redis.call('ZREM', waiting_key, id)
        redis.call('HSET', job_prefix .. id, 'status', 'pending')
        redis.call('HDEL', job_prefix .. id, 'waitUntil')
        redis.call('SREM', status_prefix .. 'waiting', id)
        redis.call('SADD', status_prefix .. 'pending', id)
        local priority = tonumber(redis.call('HGET', job_prefix .. id, 'priority')) or 0
        local created_at = tonumber(redis.call('HGET', job_prefix .. id, 'createdAt')) or now
        local score = priority * 1e15 + (1e15 - created_at)
        redis.call('ZADD', queue_key, score, id)
    end
end

local candidates = redis.call('ZREVRANGE', queue_key, 0, batch_size * 5 - 1)
local claimed = {}
local group_seen = {}

for _, id in ipairs(candidates) do
    if #claimed >= batch_size then
        break
    end
    local type_ok = true
    if ARGV[5] ~= "" then
        local job_type = redis.call('HGET', job_prefix .. id, 'jobType')
        type_ok = false
        for t in string.gmatch(ARGV[5], '[^,]+') do
            if t == job_type then
                type_ok = true
            end
        end
    end
    if type_ok then
        local gid = redis.call('HGET', job_prefix .. id, 'groupId')
        local ok = true
        if group_cap > 0 and gid and gid ~= "" then
            local in_flight = tonumber(redis.call('SCARD', KEYS[7] .. gid)) or 0
            local pending_pick = group_seen[gid] or 0
            if in_flight + pending_pick >= group_cap then
                ok = false
            else
                group_seen[gid] = pending_pick + 1
            end
        end
        if ok then
            table.insert(claimed, id)
        end
    end
end

for _, id in ipairs(claimed) do
    redis.call('ZREM', queue_key, id)
    redis.call('SREM', status_prefix .. 'pending', id)
    redis.call('SADD', status_prefix .. 'processing', id)
    local attempts = tonumber(redis.call('HGET', job_prefix .. id, 'attempts')) or 0
    redis.call('HSET', job_prefix .. id, 'status', 'processing', 'lockedAt', now, 'lockedBy', worker_id,
        'attempts', attempts + 1, 'updatedAt', now)
    if redis.call('HGET', job_prefix .. id, 'startedAt') == false then
        redis.call('HSET', job_prefix .. id, 'startedAt', now)
    end
    local gid = redis.call('HGET', job_prefix .. id, 'groupId')
    if gid and gid ~= "" then
        redis.call('SADD', KEYS[7] .. gid, id)
    end
end

return claimed
"#;

const COMPLETE_JOB_SCRIPT: &str = r#"
local job_key = KEYS[1]
local now = ARGV[1]
local output = ARGV[2]
local status = redis.call('HGET', job_key, 'status')
if status ~= 'processing' then
    return 0
end
if output ~= "" then
    redis.call('HSET', job_key, 'output', output)
end
redis.call('HSET', job_key, 'status', 'completed', 'completedAt', now, 'updatedAt', now,
    'stepData', '{}')
redis.call('HDEL', job_key, 'lockedAt', 'lockedBy', 'waitUntil', 'waitTokenId')
redis.call('SREM', KEYS[2], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[3])
local gid = redis.call('HGET', job_key, 'groupId')
if gid and gid ~= "" then
    redis.call('SREM', KEYS[4] .. gid, ARGV[3])
end
return 1
"#;

const CANCEL_JOB_SCRIPT: &str = r#"
local job_key = KEYS[1]
local status = redis.call('HGET', job_key, 'status')
if status ~= 'pending' and status ~= 'waiting' then
    return 0
end
redis.call('SREM', KEYS[2] .. status, ARGV[2])
redis.call('SADD', KEYS[2] .. 'cancelled', ARGV[2])
redis.call('ZREM', KEYS[3], ARGV[2])
redis.call('ZREM', KEYS[4], ARGV[2])
redis.call('HSET', job_key, 'status', 'cancelled', 'lastCancelledAt', ARGV[1], 'updatedAt', ARGV[1])
redis.call('HDEL', job_key, 'lockedAt', 'lockedBy', 'waitUntil', 'waitTokenId')
return 1
"#;

const FAIL_JOB_SCRIPT: &str = r#"
local job_key = KEYS[1]
local status_processing = KEYS[2]
local status_failed = KEYS[3]
local retry_key = KEYS[4]
local group_prefix = KEYS[5]

local now = ARGV[1]
local error_history = ARGV[2]
local failure_reason = ARGV[3]
local next_attempt = ARGV[4]
local group_id = ARGV[5]
local id = ARGV[6]

redis.call('HSET', job_key, 'errorHistory', error_history, 'failureReason', failure_reason,
    'lastFailedAt', now, 'updatedAt', now)
redis.call('HDEL', job_key, 'lockedAt', 'lockedBy')
redis.call('SREM', status_processing, id)
if group_id ~= "" then
    redis.call('SREM', group_prefix .. group_id, id)
end

if next_attempt ~= "" then
    redis.call('HSET', job_key, 'status', 'failed', 'nextAttemptAt', next_attempt)
    redis.call('SADD', status_failed, id)
    redis.call('ZADD', retry_key, next_attempt, id)
else
    redis.call('HSET', job_key, 'status', 'failed')
    redis.call('SADD', status_failed, id)
end
return 1
"#;

const RETRY_JOB_SCRIPT: &str = r#"
local job_key = KEYS[1]
local status_prefix = KEYS[2]
local status_pending = KEYS[3]
local retry_key = KEYS[4]
local queue_key = KEYS[5]

local now = ARGV[1]
local id = ARGV[2]

local status = redis.call('HGET', job_key, 'status')
if not status then
    return -1
end
if status ~= 'failed' and status ~= 'processing' then
    return 0
end

redis.call('HSET', job_key, 'status', 'pending', 'runAt', now, 'lastRetriedAt', now, 'updatedAt', now)
redis.call('HDEL', job_key, 'lockedAt', 'lockedBy', 'nextAttemptAt')
redis.call('SREM', status_prefix .. status, id)
redis.call('SADD', status_pending, id)
redis.call('ZREM', retry_key, id)

local priority = tonumber(redis.call('HGET', job_key, 'priority')) or 0
local created_at = tonumber(redis.call('HGET', job_key, 'createdAt')) or tonumber(now)
local score = priority * 1e15 + (1e15 - created_at)
redis.call('ZADD', queue_key, score, id)
return 1
"#;

const COMPLETE_TOKEN_SCRIPT: &str = r#"
local wp_key = KEYS[1]
local wp_timeout_key = KEYS[2]
local job_prefix = KEYS[3]
local status_prefix = KEYS[4]
local waiting_key = KEYS[5]
local queue_key = KEYS[6]

local now = ARGV[1]
local output = ARGV[2]
local id = ARGV[3]

local exists = redis.call('HGET', wp_key, 'id')
if not exists then
    return -1
end

redis.call('HSET', wp_key, 'status', 'completed', 'output', output, 'completedAt', now)
redis.call('ZREM', wp_timeout_key, id)

local job_id = redis.call('HGET', wp_key, 'jobId')
if job_id and job_id ~= "" then
    local job_key = job_prefix .. job_id
    local status = redis.call('HGET', job_key, 'status')
    if status == 'waiting' then
        local priority = tonumber(redis.call('HGET', job_key, 'priority')) or 0
        local created_at = tonumber(redis.call('HGET', job_key, 'createdAt')) or tonumber(now)
        local score = priority * 1e15 + (1e15 - created_at)
        redis.call('HSET', job_key, 'status', 'pending', 'updatedAt', now)
        redis.call('HDEL', job_key, 'waitUntil', 'waitTokenId')
        redis.call('SREM', status_prefix .. 'waiting', job_id)
        redis.call('SADD', status_prefix .. 'pending', job_id)
        redis.call('ZREM', waiting_key, job_id)
        redis.call('ZADD', queue_key, score, job_id)
    end
end
return 1
"#;

const EXPIRE_TIMED_OUT_TOKENS_SCRIPT: &str = r#"
local wp_timeout_key = KEYS[1]
local wp_prefix = KEYS[2]
local job_prefix = KEYS[3]
local status_prefix = KEYS[4]
local waiting_key = KEYS[5]
local queue_key = KEYS[6]
local now = tonumber(ARGV[1])

local due = redis.call('ZRANGEBYSCORE', wp_timeout_key, '-inf', now)
for _, id in ipairs(due) do
    local wp_key = wp_prefix .. id
    redis.call('HSET', wp_key, 'status', 'timed_out', 'completedAt', now)
    redis.call('ZREM', wp_timeout_key, id)
    local job_id = redis.call('HGET', wp_key, 'jobId')
    if job_id and job_id ~= "" then
        local job_key = job_prefix .. job_id
        local status = redis.call('HGET', job_key, 'status')
        if status == 'waiting' then
            local priority = tonumber(redis.call('HGET', job_key, 'priority')) or 0
            local created_at = tonumber(redis.call('HGET', job_key, 'createdAt')) or now
            local score = priority * 1e15 + (1e15 - created_at)
            redis.call('HSET', job_key, 'status', 'pending', 'updatedAt', now)
            redis.call('HDEL', job_key, 'waitUntil', 'waitTokenId')
            redis.call('SREM', status_prefix .. 'waiting', job_id)
            redis.call('SADD', status_prefix .. 'pending', job_id)
            redis.call('ZREM', waiting_key, job_id)
            redis.call('ZADD', queue_key, score, job_id)
        end
    end
end
return #due
"#;

const WAIT_JOB_SCRIPT: &str = r#"
local job_key = KEYS[1]
local status_processing = KEYS[2]
local status_waiting = KEYS[3]
local waiting_key = KEYS[4]

local now = ARGV[1]
local step_data = ARGV[2]
local wait_until = ARGV[3]
local token_id = ARGV[4]
local id = ARGV[5]

local status = redis.call('HGET', job_key, 'status')
if status ~= 'processing' then
    return 0
end

redis.call('HSET', job_key, 'status', 'waiting', 'stepData', step_data, 'updatedAt', now)
redis.call('HDEL', job_key, 'lockedAt', 'lockedBy')
if wait_until ~= "" then
    redis.call('HSET', job_key, 'waitUntil', wait_until)
end
if token_id ~= "" then
    redis.call('HSET', job_key, 'waitTokenId', token_id)
end
redis.call('SREM', status_processing, id)
redis.call('SADD', status_waiting, id)
if wait_until ~= "" then
    redis.call('ZADD', waiting_key, wait_until, id)
end
return 1
"#;

pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
    add_job_script: Script,
    claim_batch_script: Script,
    complete_job_script: Script,
    cancel_job_script: Script,
    fail_job_script: Script,
    retry_job_script: Script,
    complete_token_script: Script,
    expire_timed_out_tokens_script: Script,
    wait_job_script: Script,
}

impl RedisBackend {
    pub async fn connect(client: &redis::Client, prefix: impl Into<String>) -> DataQueueResult<Self> {
        let conn = client.get_connection_manager().await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            add_job_script: Script::new(ADD_JOB_SCRIPT),
            claim_batch_script: Script::new(CLAIM_BATCH_SCRIPT),
            complete_job_script: Script::new(COMPLETE_JOB_SCRIPT),
            cancel_job_script: Script::new(CANCEL_JOB_SCRIPT),
            fail_job_script: Script::new(FAIL_JOB_SCRIPT),
            retry_job_script: Script::new(RETRY_JOB_SCRIPT),
            complete_token_script: Script::new(COMPLETE_TOKEN_SCRIPT),
            expire_timed_out_tokens_script: Script::new(EXPIRE_TIMED_OUT_TOKENS_SCRIPT),
            wait_job_script: Script::new(WAIT_JOB_SCRIPT),
        })
    }

    fn k(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    /// §5 bring-your-own-connection enqueue. The key-value backend has no
    /// notion of a caller-held transaction to insert within, so this always
    /// rejects; `PgBackend::add_job_tx` is the relational counterpart that
    /// actually honours it.
    pub async fn add_job_tx(&self, _job: NewJob) -> DataQueueResult<JobId> {
        Err(DataQueueError::TransactionalEnqueueUnsupported)
    }

    async fn load_job(&self, id: JobId) -> DataQueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.k(&format!("job:{id}")))
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(&fields).map(Some)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn add_job(&self, job: NewJob) -> DataQueueResult<JobId> {
        let now = Utc::now();
        let run_at = job.run_at.unwrap_or(now);
        let mut conn = self.conn.clone();

        let next_id_key = self.k("id_seq");
        let placeholder_id = 0;
        let fields = JobFields::from_job_parts(placeholder_id, &job, now, run_at)?.0;

        let idem_key = job.idempotency_key.clone().unwrap_or_default();
        let idem_redis_key = if idem_key.is_empty() { self.k("idempotency:__none__") } else { self.k(&format!("idempotency:{idem_key}")) };

        let mut argv: Vec<String> = vec![
            idem_key.clone(),
            millis(now).to_string(),
            millis(run_at).to_string(),
            job.priority.to_string(),
            job.job_type.clone(),
            ready_score(job.priority, now).to_string(),
        ];
        for (k, v) in fields.iter() {
            if k == "id" {
                continue;
            }
            argv.push(k.clone());
            argv.push(v.clone());
        }

        let result: String = self
            .add_job_script
            .key(idem_redis_key)
            .key(&next_id_key)
            .key(self.k("job:"))
            .key(self.k("all"))
            .key(self.k("queue"))
            .key(self.k("delayed"))
            .key(self.k("status:pending"))
            .key(self.k(&format!("type:{}", job.job_type)))
            .arg(argv)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;

        let id: JobId = result.parse().map_err(|_| DataQueueError::Backend(anyhow::anyhow!("malformed job id from script")))?;

        for tag in &job.tags {
            let _: () = conn.sadd(self.k(&format!("tag:{tag}")), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        if !job.tags.is_empty() {
            let _: () = conn.sadd(self.k(&format!("job:{id}:tags")), &job.tags).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        self.record_job_event(id, EventType::Added, None).await?;
        Ok(id)
    }

    async fn add_jobs(&self, jobs: Vec<NewJob>) -> DataQueueResult<Vec<JobId>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.add_job(job).await?);
        }
        Ok(ids)
    }

    async fn get_job(&self, id: JobId) -> DataQueueResult<Option<Job>> {
        self.load_job(id).await
    }

    async fn get_jobs(&self, filter: JobFilter) -> DataQueueResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrevrange(self.k("all"), 0, -1).await.map_err(|e| DataQueueError::Backend(e.into()))?;

        let mut jobs = Vec::new();
        for id_str in ids {
            let id: JobId = id_str.parse().unwrap_or(0);
            let Some(job) = self.load_job(id).await? else { continue };

            if !filter.status.is_empty() && !filter.status.contains(&job.status) {
                continue;
            }
            if !filter.job_type.is_empty() && !filter.job_type.contains(&job.job_type) {
                continue;
            }
            if let Some((mode, tags)) = &filter.tags {
                let matches = match mode {
                    TagMode::All => tags.iter().all(|t| job.tags.contains(t)),
                    TagMode::Any => tags.iter().any(|t| job.tags.contains(t)),
                    TagMode::Exact => {
                        job.tags.len() == tags.len() && tags.iter().all(|t| job.tags.contains(t))
                    }
                    TagMode::None => !tags.iter().any(|t| job.tags.contains(t)),
                };
                if !matches {
                    continue;
                }
            }
            if let Some(cmp) = &filter.run_at {
                use dataqueue_core::backend::TimeComparator::*;
                let keep = match cmp {
                    Gt(t) => job.run_at > *t,
                    Gte(t) => job.run_at >= *t,
                    Lt(t) => job.run_at < *t,
                    Lte(t) => job.run_at <= *t,
                    Eq(t) => job.run_at == *t,
                };
                if !keep {
                    continue;
                }
            }
            jobs.push(job);
        }

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
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let types_arg = job_type_filter.map(|ts| ts.join(",")).unwrap_or_default();

        let ids: Vec<String> = self
            .claim_batch_script
            .key(self.k("queue"))
            .key(self.k("delayed"))
            .key(self.k("retry"))
            .key(self.k("waiting"))
            .key(self.k("job:"))
            .key(self.k("status:"))
            .key(self.k("group:"))
            .arg(millis(now))
            .arg(worker_id)
            .arg(batch_size)
            .arg(group_concurrency.unwrap_or(0))
            .arg(types_arg)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id_str in ids {
            let id: JobId = id_str.parse().unwrap_or(0);
            if let Some(job) = self.load_job(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn complete_job(&self, id: JobId, output: Option<Value>) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let output_json = output.map(|v| v.to_string()).unwrap_or_default();
        let touched: i64 = self
            .complete_job_script
            .key(self.k(&format!("job:{id}")))
            .key(self.k("status:processing"))
            .key(self.k("status:completed"))
            .key(self.k("group:"))
            .arg(millis(now))
            .arg(output_json)
            .arg(id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        if touched == 0 {
            return Err(DataQueueError::InvalidState(id));
        }
        self.record_job_event(id, EventType::Completed, None).await
    }

    async fn fail_job(&self, id: JobId, error: &str, failure_reason: FailureReason) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let job_key = self.k(&format!("job:{id}"));

        let fields: HashMap<String, String> = conn.hgetall(&job_key).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if fields.is_empty() {
            return Err(DataQueueError::JobNotFound(id));
        }
        let job = job_from_fields(&fields)?;

        let mut error_history = job.error_history.clone();
        error_history.push(JobErrorEntry { message: error.to_string(), timestamp: now });
        let reason_str = match failure_reason {
            FailureReason::Timeout => "timeout",
            FailureReason::HandlerError => "handler_error",
            FailureReason::NoHandler => "no_handler",
        };
        let next_attempt = if job.attempts < job.max_attempts {
            let next = retry::next_attempt_at(&job.retry_policy, job.attempts, now, fastrand::f64);
            millis(next).to_string()
        } else {
            String::new()
        };
        let group_id = job.group.as_ref().map(|g| g.id.clone()).unwrap_or_default();

        let _: i64 = self
            .fail_job_script
            .key(&job_key)
            .key(self.k("status:processing"))
            .key(self.k("status:failed"))
            .key(self.k("retry"))
            .key(self.k("group:"))
            .arg(millis(now))
            .arg(serde_json::to_string(&error_history)?)
            .arg(reason_str)
            .arg(&next_attempt)
            .arg(&group_id)
            .arg(id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;

        if next_attempt.is_empty() {
            if let Some(dlq_type) = &job.dead_letter.dead_letter_job_type {
                let envelope = serde_json::json!({
                    "originalJob": { "id": id, "jobType": job.job_type },
                    "originalPayload": job.payload,
                    "failure": { "message": error, "reason": reason_str },
                });
                let dlq_id = self
                    .add_job(NewJob { job_type: dlq_type.clone(), payload: envelope, ..NewJob::default() })
                    .await?;
                let _: () = conn
                    .hset_multiple(&job_key, &[("deadLetterJobId", dlq_id.to_string()), ("deadLetteredAt", millis(now).to_string())])
                    .await
                    .map_err(|e| DataQueueError::Backend(e.into()))?;
            }
        }

        self.record_job_event(id, EventType::Failed, None).await
    }

    async fn retry_job(&self, id: JobId) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let job_key = self.k(&format!("job:{id}"));

        let outcome: i64 = self
            .retry_job_script
            .key(&job_key)
            .key(self.k("status:"))
            .key(self.k("status:pending"))
            .key(self.k("retry"))
            .key(self.k("queue"))
            .arg(millis(now))
            .arg(id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;

        match outcome {
            -1 => Err(DataQueueError::JobNotFound(id)),
            1 => self.record_job_event(id, EventType::Retried, None).await,
            _ => Ok(()),
        }
    }

    async fn cancel_job(&self, id: JobId) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let touched: i64 = self
            .cancel_job_script
            .key(self.k(&format!("job:{id}")))
            .key(self.k("status:"))
            .key(self.k("queue"))
            .key(self.k("delayed"))
            .arg(millis(now))
            .arg(id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        if touched == 0 {
            return Ok(());
        }
        self.record_job_event(id, EventType::Cancelled, None).await
    }

    async fn edit_job(&self, id: JobId, edit: JobEdit) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let job_key = self.k(&format!("job:{id}"));
        let status: Option<String> = conn.hget(&job_key, "status").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if status.as_deref() != Some("pending") {
            return Ok(());
        }
        apply_job_edit(&mut conn, &self.prefix, id, &edit).await?;
        self.record_job_event(id, EventType::Edited, None).await
    }

    async fn edit_all_pending_jobs(&self, filter: JobFilter, edit: JobEdit) -> DataQueueResult<u64> {
        let mut pending_filter = filter;
        pending_filter.status = vec![JobStatus::Pending];
        let ids: Vec<JobId> = self.get_jobs(pending_filter).await?.into_iter().map(|j| j.id).collect();
        let mut conn = self.conn.clone();
        for id in &ids {
            apply_job_edit(&mut conn, &self.prefix, *id, &edit).await?;
            self.record_job_event(*id, EventType::Edited, None).await?;
        }
        Ok(ids.len() as u64)
    }

    async fn prolong_job(&self, id: JobId) {
        let mut conn = self.conn.clone();
        let _: Result<(), _> = conn.hset(self.k(&format!("job:{id}")), "lockedAt", millis(Utc::now())).await;
    }

    async fn update_progress(&self, id: JobId, pct: u8) {
        let mut conn = self.conn.clone();
        let _: Result<(), _> = conn.hset(self.k(&format!("job:{id}")), "progress", pct).await;
    }

    async fn update_output(&self, id: JobId, value: Value) {
        let mut conn = self.conn.clone();
        if let Ok(json) = serde_json::to_string(&value) {
            let _: Result<(), _> = conn.hset(self.k(&format!("job:{id}")), "output", json).await;
        }
    }

    async fn reclaim_stuck_jobs(&self, max_processing_minutes: i64) -> DataQueueResult<u64> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let max_processing_ms = max_processing_minutes * 60_000;
        let ids: Vec<String> = conn.smembers(self.k("status:processing")).await.map_err(|e| DataQueueError::Backend(e.into()))?;

        let mut count = 0u64;
        for id_str in ids {
            let id: JobId = id_str.parse().unwrap_or(0);
            let job_key = self.k(&format!("job:{id}"));
            let fields: HashMap<String, String> = conn.hgetall(&job_key).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            let Ok(job) = job_from_fields(&fields) else { continue };
            let stuck = match job.locked_at {
                Some(locked) => {
                    let threshold_ms = max_processing_ms.max(job.timeout_ms.unwrap_or(0));
                    now - locked >= chrono::Duration::milliseconds(threshold_ms)
                }
                None => false,
            };
            if !stuck {
                continue;
            }
            let _: () = conn
                .hset_multiple(&job_key, &[("status", "pending".to_string()), ("updatedAt", millis(now).to_string())])
                .await
                .map_err(|e| DataQueueError::Backend(e.into()))?;
            let _: () = conn.hdel(&job_key, &["lockedAt", "lockedBy"]).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            let _: () = conn.srem(self.k("status:processing"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            let _: () = conn.sadd(self.k("status:pending"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            let _: () = conn.zadd(self.k("queue"), id, ready_score(job.priority, job.created_at)).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            if let Some(group) = &job.group {
                let _: () = conn.srem(self.k(&format!("group:{}", group.id)), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            }
            count += 1;
        }
        Ok(count)
    }

    async fn cleanup_old_jobs(&self, days_to_keep: i64, batch_size: Option<usize>) -> DataQueueResult<u64> {
        let mut conn = self.conn.clone();
        let cutoff = Utc::now() - chrono::Duration::days(days_to_keep);
        let ids: Vec<String> = conn.smembers(self.k("status:completed")).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let limit = batch_size.unwrap_or(1000);
        let mut count = 0u64;
        for id_str in ids.into_iter().take(limit) {
            let id: JobId = id_str.parse().unwrap_or(0);
            let job_key = self.k(&format!("job:{id}"));
            let updated_at: Option<i64> = conn.hget(&job_key, "updatedAt").await.map_err(|e| DataQueueError::Backend(e.into()))?;
            if updated_at.map(from_millis).is_none_or(|u| u >= cutoff) {
                continue;
            }
            let _: () = conn.del(&job_key).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            let _: () = conn.zrem(self.k("all"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            let _: () = conn.srem(self.k("status:completed"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            let _: () = conn.del(self.k(&format!("events:{id}"))).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            count += 1;
        }
        Ok(count)
    }

    /// Independent of `cleanup_old_jobs` (`cleanup_events_days_to_keep` can
    /// differ from `cleanup_jobs_days_to_keep`): `events:{id}` lists are
    /// append-only and chronologically ordered, so trimming the stale head
    /// with `LPOP` is equivalent to a day-cutoff `DELETE` on the relational
    /// backend's `job_events` table, without needing a secondary index.
    async fn cleanup_old_job_events(&self, days_to_keep: i64, batch_size: Option<usize>) -> DataQueueResult<u64> {
        let mut conn = self.conn.clone();
        let cutoff = Utc::now() - chrono::Duration::days(days_to_keep);
        let mut budget = batch_size.unwrap_or(1000);
        let ids: Vec<String> = conn.zrange(self.k("all"), 0, -1).await.map_err(|e| DataQueueError::Backend(e.into()))?;

        let mut removed = 0u64;
        'jobs: for id in ids {
            let key = self.k(&format!("events:{id}"));
            loop {
                if budget == 0 {
                    break 'jobs;
                }
                let head: Vec<String> = conn.lrange(&key, 0, 0).await.map_err(|e| DataQueueError::Backend(e.into()))?;
                let Some(raw) = head.into_iter().next() else { break };
                let stale = serde_json::from_str::<Value>(&raw)
                    .ok()
                    .and_then(|v| v["createdAt"].as_i64())
                    .map(from_millis)
                    .is_some_and(|ts| ts < cutoff);
                if !stale {
                    break;
                }
                let _: Option<String> = conn.lpop(&key, None).await.map_err(|e| DataQueueError::Backend(e.into()))?;
                removed += 1;
                budget -= 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> DataQueueResult<QueueStats> {
        let mut conn = self.conn.clone();
        let pending: i64 = conn.scard(self.k("status:pending")).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let processing: i64 = conn.scard(self.k("status:processing")).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let waiting: i64 = conn.scard(self.k("status:waiting")).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let completed: i64 = conn.scard(self.k("status:completed")).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let failed: i64 = conn.scard(self.k("status:failed")).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let cancelled: i64 = conn.scard(self.k("status:cancelled")).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(QueueStats { pending, processing, waiting, completed, failed, cancelled })
    }

    async fn create_token(&self, token: NewToken) -> DataQueueResult<Waitpoint> {
        let mut conn = self.conn.clone();
        let seq: i64 = conn.incr(self.k("waitpoint_seq"), 1).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let id = format!("wp_{seq}");
        let now = Utc::now();
        let mut fields = vec![
            ("id".to_string(), id.clone()),
            ("status".to_string(), "waiting".to_string()),
            ("createdAt".to_string(), millis(now).to_string()),
            ("tags".to_string(), serde_json::to_string(&token.tags)?),
        ];
        if let Some(job_id) = token.job_id {
            fields.push(("jobId".to_string(), job_id.to_string()));
        }
        if let Some(t) = token.timeout_at {
            fields.push(("timeoutAt".to_string(), millis(t).to_string()));
        }
        let key = self.k(&format!("waitpoint:{id}"));
        let _: () = conn.hset_multiple(&key, &fields).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if let Some(t) = token.timeout_at {
            let _: () = conn.zadd(self.k("waitpoint_timeout"), &id, millis(t)).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        Ok(Waitpoint { id, job_id: token.job_id, status: TokenStatus::Waiting, output: None, timeout_at: token.timeout_at, created_at: now, completed_at: None, tags: token.tags })
    }

    async fn get_token(&self, id: &str) -> DataQueueResult<Option<Waitpoint>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.k(&format!("waitpoint:{id}"))).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if fields.is_empty() {
            return Ok(None);
        }
        waitpoint_from_fields(&fields).map(Some)
    }

    async fn complete_token(&self, id: &str, output: Value) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let outcome: i64 = self
            .complete_token_script
            .key(self.k(&format!("waitpoint:{id}")))
            .key(self.k("waitpoint_timeout"))
            .key(self.k("job:"))
            .key(self.k("status:"))
            .key(self.k("waiting"))
            .key(self.k("queue"))
            .arg(millis(now))
            .arg(output.to_string())
            .arg(id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        if outcome < 0 {
            return Err(DataQueueError::TokenNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn expire_timed_out_tokens(&self) -> DataQueueResult<u64> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let expired: i64 = self
            .expire_timed_out_tokens_script
            .key(self.k("waitpoint_timeout"))
            .key(self.k("waitpoint:"))
            .key(self.k("job:"))
            .key(self.k("status:"))
            .key(self.k("waiting"))
            .key(self.k("queue"))
            .arg(millis(now))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(expired.max(0) as u64)
    }

    async fn wait_job(
        &self,
        id: JobId,
        wait_until: Option<DateTime<Utc>>,
        token_id: Option<String>,
        step_data: HashMap<String, StepRecord>,
    ) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let job_key = self.k(&format!("job:{id}"));

        let touched: i64 = self
            .wait_job_script
            .key(&job_key)
            .key(self.k("status:processing"))
            .key(self.k("status:waiting"))
            .key(self.k("waiting"))
            .arg(millis(now))
            .arg(serde_json::to_string(&step_data)?)
            .arg(opt_millis(wait_until))
            .arg(token_id.unwrap_or_default())
            .arg(id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        if touched == 0 {
            return Err(DataQueueError::InvalidState(id));
        }

        self.record_job_event(id, EventType::Waiting, None).await
    }

    async fn add_cron_schedule(&self, schedule: NewCronSchedule) -> DataQueueResult<CronScheduleId> {
        let mut conn = self.conn.clone();
        let name_key = self.k(&format!("cron_name:{}", schedule.schedule_name));
        let existing: Option<i64> = conn.get(&name_key).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if existing.is_some() {
            return Err(DataQueueError::DuplicateScheduleName(schedule.schedule_name));
        }

        let id: CronScheduleId = conn.incr(self.k("cron_id_seq"), 1).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let now = Utc::now();
        let next_run_at = dataqueue_core::cron::next_run_at(&schedule.cron_expression, &schedule.timezone, now)?;

        let cron_key = self.k(&format!("cron:{id}"));
        let mut fields = vec![
            ("id".to_string(), id.to_string()),
            ("scheduleName".to_string(), schedule.schedule_name.clone()),
            ("cronExpression".to_string(), schedule.cron_expression.clone()),
            ("jobType".to_string(), schedule.job_type.clone()),
            ("payload".to_string(), schedule.payload.to_string()),
            ("timezone".to_string(), schedule.timezone.clone()),
            ("allowOverlap".to_string(), if schedule.allow_overlap { "1".into() } else { "0".into() }),
            ("status".to_string(), "active".to_string()),
            ("priority".to_string(), schedule.priority.to_string()),
            ("maxAttempts".to_string(), schedule.max_attempts.to_string()),
            ("tags".to_string(), serde_json::to_string(&schedule.tags)?),
            ("createdAt".to_string(), millis(now).to_string()),
            ("updatedAt".to_string(), millis(now).to_string()),
        ];
        if let Some(t) = schedule.timeout_ms {
            fields.push(("timeoutMs".to_string(), t.to_string()));
        }
        if let Some(d) = schedule.retry_policy.retry_delay {
            fields.push(("retryDelay".to_string(), d.to_string()));
        }
        if let Some(b) = schedule.retry_policy.retry_backoff {
            fields.push(("retryBackoff".to_string(), if b { "1".into() } else { "0".into() }));
        }
        if let Some(d) = schedule.retry_policy.retry_delay_max {
            fields.push(("retryDelayMax".to_string(), d.to_string()));
        }
        if let Some(t) = &schedule.dead_letter_job_type {
            fields.push(("deadLetterJobType".to_string(), t.clone()));
        }
        if let Some(next) = next_run_at {
            fields.push(("nextRunAt".to_string(), millis(next).to_string()));
        }

        let _: () = conn.hset_multiple(&cron_key, &fields).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let _: () = conn.set(&name_key, id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let _: () = conn.sadd(self.k("crons"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let _: () = conn.sadd(self.k("cron_status:active"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if let Some(next) = next_run_at {
            let _: () = conn.zadd(self.k("cron_due"), id, millis(next)).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        Ok(id)
    }

    async fn get_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<Option<CronSchedule>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.k(&format!("cron:{id}"))).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if fields.is_empty() {
            return Ok(None);
        }
        cron_from_fields(&fields).map(Some)
    }

    async fn get_cron_schedule_by_name(&self, name: &str) -> DataQueueResult<Option<CronSchedule>> {
        let mut conn = self.conn.clone();
        let id: Option<CronScheduleId> = conn.get(self.k(&format!("cron_name:{name}"))).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        match id {
            Some(id) => self.get_cron_schedule(id).await,
            None => Ok(None),
        }
    }

    async fn list_cron_schedules(&self, status: Option<CronScheduleStatus>) -> DataQueueResult<Vec<CronSchedule>> {
        let mut conn = self.conn.clone();
        let key = match status {
            Some(CronScheduleStatus::Active) => self.k("cron_status:active"),
            Some(CronScheduleStatus::Paused) => self.k("cron_status:paused"),
            None => self.k("crons"),
        };
        let ids: Vec<CronScheduleId> = conn.smembers(&key).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(s) = self.get_cron_schedule(id).await? {
                out.push(s);
            }
        }
        Ok(out)
    }

    async fn pause_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.k(&format!("cron:{id}"));
        let exists: bool = conn.exists(&key).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if !exists {
            return Err(DataQueueError::ScheduleNotFound(id.to_string()));
        }
        let _: () = conn.hset(&key, "status", "paused").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let _: () = conn.srem(self.k("cron_status:active"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let _: () = conn.sadd(self.k("cron_status:paused"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let _: () = conn.zrem(self.k("cron_due"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn resume_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.k(&format!("cron:{id}"));
        let exists: bool = conn.exists(&key).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if !exists {
            return Err(DataQueueError::ScheduleNotFound(id.to_string()));
        }
        let _: () = conn.hset(&key, "status", "active").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let _: () = conn.srem(self.k("cron_status:paused"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let _: () = conn.sadd(self.k("cron_status:active"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let next_run_at: Option<i64> = conn.hget(&key, "nextRunAt").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if let Some(next) = next_run_at {
            let _: () = conn.zadd(self.k("cron_due"), id, next).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        Ok(())
    }

    async fn edit_cron_schedule(&self, id: CronScheduleId, edit: CronScheduleEdit) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.k(&format!("cron:{id}"));
        let exists: bool = conn.exists(&key).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if !exists {
            return Err(DataQueueError::ScheduleNotFound(id.to_string()));
        }

        let mut fields: Vec<(String, String)> = Vec::new();
        if let Some(e) = &edit.cron_expression {
            fields.push(("cronExpression".into(), e.clone()));
        }
        if let Some(p) = &edit.payload {
            fields.push(("payload".into(), p.to_string()));
        }
        if let Some(tz) = &edit.timezone {
            fields.push(("timezone".into(), tz.clone()));
        }
        if let Some(o) = edit.allow_overlap {
            fields.push(("allowOverlap".into(), if o { "1".into() } else { "0".into() }));
        }
        if let Some(p) = edit.priority {
            fields.push(("priority".into(), p.to_string()));
        }
        if let Some(m) = edit.max_attempts {
            fields.push(("maxAttempts".into(), m.to_string()));
        }
        if let Some(policy) = &edit.retry_policy {
            if let Some(d) = policy.retry_delay {
                fields.push(("retryDelay".into(), d.to_string()));
            }
            if let Some(b) = policy.retry_backoff {
                fields.push(("retryBackoff".into(), if b { "1".into() } else { "0".into() }));
            }
            if let Some(d) = policy.retry_delay_max {
                fields.push(("retryDelayMax".into(), d.to_string()));
            }
        }
        if let Some(tags) = &edit.tags {
            fields.push(("tags".into(), serde_json::to_string(tags)?));
        }
        match &edit.timeout_ms {
            Some(Patch::Set(v)) => fields.push(("timeoutMs".into(), v.to_string())),
            Some(Patch::Clear) => {
                let _: () = conn.hdel(&key, "timeoutMs").await.map_err(|e| DataQueueError::Backend(e.into()))?;
            }
            None => {}
        }
        match &edit.dead_letter_job_type {
            Some(Patch::Set(v)) => fields.push(("deadLetterJobType".into(), v.clone())),
            Some(Patch::Clear) => {
                let _: () = conn.hdel(&key, "deadLetterJobType").await.map_err(|e| DataQueueError::Backend(e.into()))?;
            }
            None => {}
        }
        fields.push(("updatedAt".into(), millis(Utc::now()).to_string()));

        if !fields.is_empty() {
            let _: () = conn.hset_multiple(&key, &fields).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        Ok(())
    }

    async fn remove_cron_schedule(&self, id: CronScheduleId) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.k(&format!("cron:{id}"));
        let name: Option<String> = conn.hget(&key, "scheduleName").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let status: Option<String> = conn.hget(&key, "status").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let _: () = conn.del(&key).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if let Some(name) = name {
            let _: () = conn.del(self.k(&format!("cron_name:{name}"))).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        let _: () = conn.srem(self.k("crons"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        if let Some(status) = status {
            let _: () = conn.srem(self.k(&format!("cron_status:{status}")), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        let _: () = conn.zrem(self.k("cron_due"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_due_cron_schedules(&self) -> DataQueueResult<Vec<CronSchedule>> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let ids: Vec<CronScheduleId> = conn.zrangebyscore(self.k("cron_due"), "-inf", millis(now)).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(s) = self.get_cron_schedule(id).await? {
                out.push(s);
            }
        }
        Ok(out)
    }

    async fn update_cron_schedule_after_enqueue(
        &self,
        id: CronScheduleId,
        last_enqueued_at: DateTime<Utc>,
        last_job_id: JobId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.k(&format!("cron:{id}"));
        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("lastEnqueuedAt".to_string(), millis(last_enqueued_at).to_string()),
                    ("lastJobId".to_string(), last_job_id.to_string()),
                    ("updatedAt".to_string(), millis(Utc::now()).to_string()),
                ],
            )
            .await
            .map_err(|e| DataQueueError::Backend(e.into()))?;
        match next_run_at {
            Some(next) => {
                let _: () = conn.hset(&key, "nextRunAt", millis(next)).await.map_err(|e| DataQueueError::Backend(e.into()))?;
                let _: () = conn.zadd(self.k("cron_due"), id, millis(next)).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            }
            None => {
                let _: () = conn.hdel(&key, "nextRunAt").await.map_err(|e| DataQueueError::Backend(e.into()))?;
                let _: () = conn.zrem(self.k("cron_due"), id).await.map_err(|e| DataQueueError::Backend(e.into()))?;
            }
        }
        Ok(())
    }

    async fn record_job_event(&self, job_id: JobId, event_type: EventType, metadata: Option<Value>) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let event_id: EventIdAlias = conn.incr(self.k("event_id_seq"), 1).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let event = serde_json::json!({
            "id": event_id,
            "jobId": job_id,
            "eventType": event_type_str(event_type),
            "createdAt": millis(Utc::now()),
            "metadata": metadata,
        });
        let _: () = conn.rpush(self.k(&format!("events:{job_id}")), event.to_string()).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_job_events(&self, job_id: JobId) -> DataQueueResult<Vec<JobEvent>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(self.k(&format!("events:{job_id}")), 0, -1).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        let mut out = Vec::with_capacity(raw.len());
        for line in raw {
            let v: Value = serde_json::from_str(&line)?;
            out.push(JobEvent {
                id: v["id"].as_i64().unwrap_or(0),
                job_id: v["jobId"].as_i64().unwrap_or(job_id),
                event_type: parse_event_type(v["eventType"].as_str().unwrap_or(""))?,
                created_at: from_millis(v["createdAt"].as_i64().unwrap_or(0)),
                metadata: v.get("metadata").cloned().filter(|m| !m.is_null()),
            });
        }
        Ok(out)
    }

    async fn group_in_flight(&self, group_id: &str) -> DataQueueResult<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.scard(self.k(&format!("group:{group_id}"))).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(n)
    }

    async fn ping(&self) -> DataQueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| DataQueueError::Backend(e.into()))?;
        Ok(())
    }
}

type EventIdAlias = i64;

async fn apply_job_edit(conn: &mut ConnectionManager, prefix: &str, id: JobId, edit: &JobEdit) -> DataQueueResult<()> {
    let job_key = format!("{prefix}job:{id}");
    let mut fields: Vec<(String, String)> = Vec::new();
    if let Some(p) = &edit.payload {
        fields.push(("payload".into(), p.to_string()));
    }
    if let Some(p) = edit.priority {
        fields.push(("priority".into(), p.to_string()));
        let created_at: i64 = conn.hget(&job_key, "createdAt").await.unwrap_or(0);
        let _: () = conn.zadd(format!("{prefix}queue"), id, ready_score(p, from_millis(created_at))).await.map_err(|e| DataQueueError::Backend(e.into()))?;
    }
    if let Some(m) = edit.max_attempts {
        fields.push(("maxAttempts".into(), m.to_string()));
    }
    if let Some(t) = edit.run_at {
        fields.push(("runAt".into(), millis(t).to_string()));
    }
    match &edit.timeout_ms {
        Some(Patch::Set(v)) => fields.push(("timeoutMs".into(), v.to_string())),
        Some(Patch::Clear) => {
            let _: () = conn.hdel(&job_key, "timeoutMs").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        None => {}
    }
    match &edit.tags {
        Some(Patch::Set(tags)) => fields.push(("tags".into(), serde_json::to_string(tags)?)),
        Some(Patch::Clear) => fields.push(("tags".into(), "[]".into())),
        None => {}
    }
    match &edit.retry_delay {
        Some(Patch::Set(v)) => fields.push(("retryDelay".into(), v.to_string())),
        Some(Patch::Clear) => {
            let _: () = conn.hdel(&job_key, "retryDelay").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        None => {}
    }
    match &edit.retry_backoff {
        Some(Patch::Set(v)) => fields.push(("retryBackoff".into(), if *v { "1".into() } else { "0".into() })),
        Some(Patch::Clear) => {
            let _: () = conn.hdel(&job_key, "retryBackoff").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        None => {}
    }
    match &edit.retry_delay_max {
        Some(Patch::Set(v)) => fields.push(("retryDelayMax".into(), v.to_string())),
        Some(Patch::Clear) => {
            let _: () = conn.hdel(&job_key, "retryDelayMax").await.map_err(|e| DataQueueError::Backend(e.into()))?;
        }
        None => {}
    }
    fields.push(("updatedAt".into(), millis(Utc::now()).to_string()));
    if !fields.is_empty() {
        let _: () = conn.hset_multiple(&job_key, &fields).await.map_err(|e| DataQueueError::Backend(e.into()))?;
    }
    Ok(())
}

fn waitpoint_from_fields(fields: &HashMap<String, String>) -> DataQueueResult<Waitpoint> {
    let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
    let status = match get("status").as_str() {
        "waiting" => TokenStatus::Waiting,
        "completed" => TokenStatus::Completed,
        "timed_out" => TokenStatus::TimedOut,
        other => return Err(DataQueueError::Backend(anyhow::anyhow!("unknown token status {other:?}"))),
    };
    Ok(Waitpoint {
        id: get("id"),
        job_id: fields.get("jobId").and_then(|v| v.parse().ok()),
        status,
        output: fields.get("output").and_then(|v| serde_json::from_str(v).ok()),
        timeout_at: parse_opt_millis(&get("timeoutAt")),
        created_at: parse_opt_millis(&get("createdAt")).unwrap_or_else(Utc::now),
        completed_at: parse_opt_millis(&get("completedAt")),
        tags: serde_json::from_str(&get("tags")).unwrap_or_default(),
    })
}

fn cron_from_fields(fields: &HashMap<String, String>) -> DataQueueResult<CronSchedule> {
    let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
    let status = match get("status").as_str() {
        "active" => CronScheduleStatus::Active,
        "paused" => CronScheduleStatus::Paused,
        other => return Err(DataQueueError::Backend(anyhow::anyhow!("unknown schedule status {other:?}"))),
    };
    Ok(CronSchedule {
        id: get("id").parse().unwrap_or_default(),
        schedule_name: get("scheduleName"),
        cron_expression: get("cronExpression"),
        job_type: get("jobType"),
        payload: serde_json::from_str(&get("payload")).unwrap_or(Value::Null),
        timezone: get("timezone"),
        allow_overlap: get("allowOverlap") == "1",
        status,
        priority: get("priority").parse().unwrap_or(0),
        max_attempts: get("maxAttempts").parse().unwrap_or(1),
        timeout_ms: fields.get("timeoutMs").and_then(|v| v.parse().ok()),
        retry_policy: RetryPolicy {
            retry_delay: fields.get("retryDelay").and_then(|v| v.parse().ok()),
            retry_backoff: fields.get("retryBackoff").map(|v| v == "1"),
            retry_delay_max: fields.get("retryDelayMax").and_then(|v| v.parse().ok()),
        },
        tags: serde_json::from_str(&get("tags")).unwrap_or_default(),
        dead_letter_job_type: fields.get("deadLetterJobType").cloned(),
        last_enqueued_at: parse_opt_millis(&get("lastEnqueuedAt")),
        last_job_id: fields.get("lastJobId").and_then(|v| v.parse().ok()),
        next_run_at: parse_opt_millis(&get("nextRunAt")),
        created_at: parse_opt_millis(&get("createdAt")).unwrap_or_else(Utc::now),
        updated_at: parse_opt_millis(&get("updatedAt")).unwrap_or_else(Utc::now),
    })
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
