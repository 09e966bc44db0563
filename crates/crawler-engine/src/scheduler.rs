use std::time::Duration;

use chrono::{DateTime, Utc};
use crawler_core::schedule::next_due;
use crawler_core::{DataSourceId, JobId, TriggerSource};
use crawler_store::{DataSource, DataSourceFilter, DataSourceRegistry, JobStore};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::queue::Admission;

/// What one evaluation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub enqueued: Vec<JobId>,
    /// Due, but a job for the source was already queued or running.
    pub skipped_in_flight: Vec<DataSourceId>,
    /// Due, but the queue was full. Picked up again on a later tick.
    pub deferred_full: Vec<DataSourceId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.enqueued.is_empty() && self.skipped_in_flight.is_empty() && self.deferred_full.is_empty()
    }
}

/// Periodically turns due cron schedules into queued jobs.
///
/// Due times are derived from job history rather than stored, so a tick
/// that could not enqueue simply tries again next time and missed ticks are
/// never backfilled.
#[derive(Clone)]
pub struct SchedulerEngine {
    registry: DataSourceRegistry,
    store: JobStore,
    admission: Admission,
    interval: Duration,
}

impl SchedulerEngine {
    pub fn new(
        registry: DataSourceRegistry,
        store: JobStore,
        admission: Admission,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            admission,
            interval,
        }
    }

    /// Main loop. Ticks every `interval` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "scheduler started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()) {
                        error!("scheduler tick error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Evaluate every schedule-enabled source once, as of `now`.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        for source in self.registry.list(&DataSourceFilter::scheduled())? {
            if !self.is_due(&source, now)? {
                continue;
            }
            match self.admission.submit(&source, TriggerSource::Schedule) {
                Ok(job) => report.enqueued.push(job.id),
                Err(EngineError::AlreadyRunning { .. }) => report.skipped_in_flight.push(source.id),
                Err(EngineError::QueueFull { .. }) => {
                    warn!(source_id = %source.id, "queue full, scheduled crawl deferred");
                    report.deferred_full.push(source.id);
                }
                Err(e) => error!(source_id = %source.id, error = %e, "scheduled enqueue failed"),
            }
        }

        if report.is_empty() {
            debug!("scheduler tick: nothing due");
        } else {
            info!(
                enqueued = report.enqueued.len(),
                skipped_in_flight = report.skipped_in_flight.len(),
                deferred_full = report.deferred_full.len(),
                "scheduler tick"
            );
        }
        Ok(report)
    }

    /// Next due = first occurrence strictly after the last terminal job's
    /// end, or after creation if the source never ran.
    fn is_due(&self, source: &DataSource, now: DateTime<Utc>) -> Result<bool> {
        let Some(expression) = source.schedule.active_expression() else {
            return Ok(false);
        };
        let anchor = self
            .store
            .last_finished_at(&source.id)?
            .unwrap_or(source.created_at);

        match next_due(expression, anchor) {
            Ok(Some(due)) => Ok(due <= now),
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "stored schedule no longer parses");
                Ok(false)
            }
        }
    }
}
