//! Cron-expression evaluation and the schedule evaluator (§4.4).
//!
//! Parsing/next-fire computation are plain functions so backend crates can
//! validate an expression at `addCronSchedule`/`editCronSchedule` time
//! without depending on the processor; [`CronScheduler`] is the piece that
//! promotes due schedules into jobs.

use crate::backend::{Backend, NewJob};
use crate::error::{DataQueueError, DataQueueResult};
use crate::events::{emit_error, EventBus, QueueEvent};
use crate::model::{CronScheduleStatus, JobStatus};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;

/// Adapts a standard 5-field expression (`min hour dom month dow`) to the
/// `cron` crate's 6-field form (`sec min hour dom month dow`) by pinning
/// seconds to `0`. 6- and 7-field expressions pass through unchanged, so
/// callers that want sub-minute precision aren't blocked.
fn normalize(expr: &str) -> DataQueueResult<String> {
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {expr}")),
        6 | 7 => Ok(expr.to_string()),
        _ => Err(DataQueueError::InvalidCronExpression(
            expr.to_string(),
            format!("expected 5 space-separated fields, found {fields}"),
        )),
    }
}

/// Validates `expr` (and an IANA `timezone` name), returning an error a
/// caller can surface synchronously from `addCronSchedule`/
/// `editCronSchedule` (§4.4: "Invalid cronExpression ... reject").
pub fn validate(expr: &str, timezone: &str) -> DataQueueResult<()> {
    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized)
        .map_err(|e| DataQueueError::InvalidCronExpression(expr.to_string(), e.to_string()))?;
    Tz::from_str(timezone)
        .map_err(|_| DataQueueError::InvalidCronExpression(expr.to_string(), format!("unknown timezone {timezone:?}")))?;
    Ok(())
}

/// The next fire instant strictly after `after`, evaluated in `timezone`.
///
/// DST resolution (open question, §9): when `after`'s local successor falls
/// in a spring-forward gap or a fall-back fold, this fires once at the
/// first valid occurrence and does not repeat it — the underlying `cron`
/// crate resolves ambiguous local times via `LocalResult::earliest()`,
/// which matches that policy.
pub fn next_run_at(expr: &str, timezone: &str, after: DateTime<Utc>) -> DataQueueResult<Option<DateTime<Utc>>> {
    let normalized = normalize(expr)?;
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| DataQueueError::InvalidCronExpression(expr.to_string(), e.to_string()))?;
    let tz = Tz::from_str(timezone)
        .map_err(|_| DataQueueError::InvalidCronExpression(expr.to_string(), format!("unknown timezone {timezone:?}")))?;

    let after_in_tz = after.with_timezone(&tz);
    Ok(schedule.after(&after_in_tz).next().map(|dt| dt.with_timezone(&Utc)))
}

/// Promotes due [`crate::model::CronSchedule`]s into jobs, honouring the
/// overlap guard. Runs just before each processor batch, or stand-alone.
pub struct CronScheduler {
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
}

impl CronScheduler {
    pub fn new(backend: Arc<dyn Backend>, events: Arc<EventBus>) -> Self {
        Self { backend, events }
    }

    /// §4.4 steps 1–4. Returns the number of jobs enqueued.
    pub async fn enqueue_due_jobs(&self) -> DataQueueResult<u64> {
        let due = self.backend.get_due_cron_schedules().await?;
        let mut enqueued = 0u64;

        for schedule in due {
            if schedule.status != CronScheduleStatus::Active {
                continue;
            }

            if !schedule.allow_overlap {
                if let Some(last_job_id) = schedule.last_job_id {
                    match self.backend.get_job(last_job_id).await {
                        Ok(Some(job))
                            if matches!(
                                job.status,
                                JobStatus::Pending | JobStatus::Processing | JobStatus::Waiting
                            ) =>
                        {
                            // Still active: skip this tick, do not advance nextRunAt.
                            continue;
                        }
                        Err(e) => {
                            emit_error(&self.events, "cron:overlap-check", &e);
                            continue;
                        }
                        _ => {}
                    }
                }
            }

            let now = Utc::now();
            let new_job = NewJob {
                job_type: schedule.job_type.clone(),
                payload: schedule.payload.clone(),
                tags: schedule.tags.clone(),
                priority: schedule.priority,
                max_attempts: schedule.max_attempts,
                timeout_ms: schedule.timeout_ms,
                retry_policy: schedule.retry_policy.clone(),
                dead_letter_job_type: schedule.dead_letter_job_type.clone(),
                run_at: Some(now),
                ..NewJob::default()
            };

            let job_id = match self.backend.add_job(new_job).await {
                Ok(id) => id,
                Err(e) => {
                    emit_error(&self.events, "cron:enqueue", &e);
                    continue;
                }
            };

            let next = next_run_at(&schedule.cron_expression, &schedule.timezone, now)
                .unwrap_or(None);

            if let Err(e) = self
                .backend
                .update_cron_schedule_after_enqueue(schedule.id, now, job_id, next)
                .await
            {
                emit_error(&self.events, "cron:update-after-enqueue", &e);
                continue;
            }

            self.events.emit(QueueEvent::JobAdded {
                job_id,
                job_type: schedule.job_type.clone(),
            });
            enqueued += 1;
        }

        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_expression() {
        assert!(validate("not a cron", "UTC").is_err());
    }

    #[test]
    fn accepts_five_field_expression_in_utc() {
        assert!(validate("*/5 * * * *", "UTC").is_ok());
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(validate("* * * * *", "Not/AZone").is_err());
    }

    #[test]
    fn next_run_is_strictly_after_reference_instant() {
        let now = Utc::now();
        let next = next_run_at("* * * * *", "UTC", now).unwrap().unwrap();
        assert!(next > now);
    }
}
