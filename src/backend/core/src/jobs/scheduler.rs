//! Delayed job promotion and schedules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::events::{EventBus, JobEvent};
use super::store::JobStore;
use crate::error::{JobforgeError, Result};
use crate::telemetry::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Schedules
// ═══════════════════════════════════════════════════════════════════════════════

/// When a scheduled job should first become runnable.
///
/// Each schedule yields a single fire time. A cron job that should keep recurring
/// must be scheduled again by the caller, typically from its own handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Run after a delay from now
    Delay(#[serde(with = "humantime_serde")] Duration),
    /// Run at a fixed time
    At(DateTime<Utc>),
    /// Run at the next time matching a cron expression
    Cron(String),
}

impl ScheduleSpec {
    pub fn delay(delay: Duration) -> Self {
        Self::Delay(delay)
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Self::At(at)
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron(expression.into())
    }

    /// Compute the fire time relative to `now`.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Delay(delay) => {
                let delay = chrono::Duration::from_std(*delay).map_err(|_| {
                    JobforgeError::validation("Schedule delay is out of range")
                })?;
                now.checked_add_signed(delay)
                    .ok_or_else(|| JobforgeError::validation("Schedule delay is out of range"))
            }
            Self::At(at) => Ok(*at),
            Self::Cron(expression) => {
                let schedule = parse_cron(expression)?;
                schedule.after(&now).next().ok_or_else(|| {
                    JobforgeError::validation(format!(
                        "Cron expression '{}' has no upcoming fire time",
                        expression
                    ))
                })
            }
        }
    }
}

/// Parse a cron expression. Five-field expressions fire at second zero.
fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| {
        JobforgeError::validation(format!("Invalid cron expression '{}'", expression))
            .with_internal_message(e.to_string())
            .with_context("expression", expression)
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Promotes due `Scheduled` jobs to `Pending` on a fixed tick.
///
/// A job becomes runnable at most one tick after its `scheduled_at`.
#[derive(Debug, Clone)]
pub struct Scheduler {
    store: Arc<JobStore>,
    events: EventBus,
    wakeup: Arc<Notify>,
    tick_interval: Duration,
    queue_name: String,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        events: EventBus,
        wakeup: Arc<Notify>,
        tick_interval: Duration,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            events,
            wakeup,
            tick_interval,
            queue_name: queue_name.into(),
        }
    }

    /// Promote everything due now. Returns the number of promoted jobs.
    pub fn tick(&self) -> usize {
        self.tick_at(Utc::now())
    }

    pub(crate) fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let promoted = self.store.promote_due(now);
        for job in &promoted {
            tracing::debug!(job_id = %job.id, job_name = %job.name, "Scheduled job promoted");
            self.events.emit(JobEvent::Promoted {
                job_id: job.id,
                name: job.name.clone(),
            });
            self.wakeup.notify_one();
        }
        if !promoted.is_empty() {
            JobMetrics::record_promoted(&self.queue_name, promoted.len());
        }
        promoted.len()
    }

    /// Run the tick loop until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                queue = %self.queue_name,
                tick_ms = self.tick_interval.as_millis() as u64,
                "Scheduler started"
            );

            while !*shutdown.borrow() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }

            tracing::info!(queue = %self.queue_name, "Scheduler stopped");
        })
    }
}
