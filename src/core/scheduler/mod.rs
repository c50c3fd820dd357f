//! The watermark is claimed with a compare-and-set before dispatch, so an
//! occurrence is delivered at most once even with racing tickers.

pub mod cron_expr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::store::Store;
use crate::core::store::types::{JobKind, ScheduleJob};
pub use cron_expr::{parse_schedule, previous_occurrence};

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// What a worker needs to execute one scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchMessage {
    pub job_kind: JobKind,
    pub tenant_id: String,
    pub audit_names: Vec<String>,
    pub output_name_template: Option<String>,
}

impl From<&ScheduleJob> for DispatchMessage {
    fn from(job: &ScheduleJob) -> Self {
        Self {
            job_kind: job.kind,
            tenant_id: job.tenant_id.clone(),
            audit_names: job.audit_names.clone(),
            output_name_template: job.name_template.clone(),
        }
    }
}

/// Fire-and-forget hand-off to whatever executes jobs.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, message: DispatchMessage) -> Result<()>;
}

/// Whether `job` should fire at `now`.
///
/// With a watermark the job is due once its latest cron occurrence is newer
/// than the watermark. A job that never ran is due only if that occurrence
/// is within `catch_up_window`, so fresh jobs do not replay old history.
pub fn is_due(job: &ScheduleJob, now: DateTime<Utc>, catch_up_window: Duration) -> Result<bool, ScheduleError> {
    let schedule = parse_schedule(&job.cron)?;
    let Some(prev) = previous_occurrence(&schedule, now) else {
        return Ok(false);
    };
    Ok(match job.last_triggered {
        Some(watermark) => prev > watermark,
        None => now - prev < catch_up_window,
    })
}

pub struct ScheduleTicker {
    store: Store,
    dispatcher: Arc<dyn Dispatcher>,
    catch_up_window: Duration,
}

impl ScheduleTicker {
    pub fn new(store: Store, dispatcher: Arc<dyn Dispatcher>, catch_up_window: Duration) -> Self {
        Self {
            store,
            dispatcher,
            catch_up_window,
        }
    }

    /// Evaluate every enabled job once. Returns the ids that were dispatched.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let jobs = self.store.list_enabled_schedules().await?;
        debug!("Tick at {}: {} enabled schedules", now, jobs.len());

        let mut dispatched = Vec::new();
        for job in jobs {
            let due = match is_due(&job, now, self.catch_up_window) {
                Ok(due) => due,
                Err(e) => {
                    warn!("Skipping schedule {}: {}", job.id, e);
                    continue;
                }
            };
            if !due {
                continue;
            }

            match self
                .store
                .claim_schedule(job.id, job.last_triggered, now)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    info!("Schedule {} was claimed by another ticker", job.id);
                    continue;
                }
                Err(e) => {
                    error!("Failed to claim schedule {}: {}", job.id, e);
                    continue;
                }
            }

            info!(
                "Dispatching schedule {} ({}) for tenant {}",
                job.id, job.kind, job.tenant_id
            );
            if let Err(e) = self.dispatcher.dispatch(DispatchMessage::from(&job)).await {
                error!("Dispatch of schedule {} failed: {}", job.id, e);
                continue;
            }
            dispatched.push(job.id);
        }
        Ok(dispatched)
    }
}
