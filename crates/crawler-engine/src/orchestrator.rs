use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use crawler_core::{
    CrawlerConfig, DataSourceId, FailureKind, JobEvent, JobId, JobStatus, TriggerSource,
};
use crawler_store::{
    now, CrawlJob, DataSource, DataSourceFilter, DataSourceRegistry, DataSourceUpdate, Database,
    JobCounts, JobFilter, JobStore, NewDataSource, SourceOverview,
};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::capability::CapabilitySet;
use crate::dispatcher::{wait_released, ActiveJobs, Dispatcher};
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::executor::CrawlExecutor;
use crate::projector::StatusProjector;
use crate::queue::{Admission, JobQueue};
use crate::scheduler::{SchedulerEngine, TickReport};

const DELETE_ATTEMPTS: usize = 3;

/// Dashboard snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overview {
    pub sources: SourceOverview,
    pub jobs: JobCounts,
    /// Jobs waiting in the admission queue.
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

/// What [`Orchestrator::recover`] did with leftovers from a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Persisted `queued` jobs put back on the queue, in enqueue order.
    pub requeued: Vec<JobId>,
    /// Jobs found `running` and failed with `restart_recovery`.
    pub interrupted: Vec<JobId>,
}

/// Entry point for everything the crawler does.
///
/// Owns the registry, job store, queue, worker pool and scheduler, and
/// exposes them as one API. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CrawlerConfig,
    registry: DataSourceRegistry,
    store: JobStore,
    queue: Arc<JobQueue>,
    events: EventBus,
    admission: Admission,
    executor: CrawlExecutor,
    dispatcher: Dispatcher,
    scheduler: SchedulerEngine,
    active: Arc<ActiveJobs>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(db: Database, config: CrawlerConfig, capabilities: CapabilitySet) -> Self {
        let registry = DataSourceRegistry::new(db.clone());
        let store = JobStore::new(db);
        let queue = Arc::new(JobQueue::new(config.queue.capacity));
        let events = EventBus::new(StatusProjector::new(registry.clone()));
        let admission = Admission::new(store.clone(), Arc::clone(&queue), events.clone());
        let executor = CrawlExecutor::new(
            store.clone(),
            Arc::clone(&queue),
            events.clone(),
            capabilities,
            &config.executor,
        );
        let active = Arc::new(ActiveJobs::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::clone(&queue),
            events.clone(),
            executor.clone(),
            Arc::clone(&active),
        );
        let scheduler = SchedulerEngine::new(
            registry.clone(),
            store.clone(),
            admission.clone(),
            config.scheduler.tick(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                queue,
                events,
                admission,
                executor,
                dispatcher,
                scheduler,
                active,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // ── data sources ────────────────────────────────────────────────────

    pub fn create_source(&self, new: NewDataSource) -> Result<DataSource> {
        Ok(self.inner.registry.create(new)?)
    }

    /// Edits never touch jobs already created; they run on their snapshot.
    pub fn update_source(&self, id: &DataSourceId, update: DataSourceUpdate) -> Result<DataSource> {
        Ok(self.inner.registry.update(id, update)?)
    }

    pub fn get_source(&self, id: &DataSourceId) -> Result<DataSource> {
        Ok(self.inner.registry.get(id)?)
    }

    pub fn list_sources(&self, filter: &DataSourceFilter) -> Result<Vec<DataSource>> {
        Ok(self.inner.registry.list(filter)?)
    }

    /// Remove a source. Without `force` this is a `Conflict` while a job is
    /// queued or running; with `force` that job is cancelled and brought to
    /// `failed` first. Job history is kept.
    #[instrument(skip(self), fields(source_id = %id))]
    pub async fn delete_source(&self, id: &DataSourceId, force: bool) -> Result<()> {
        if !force {
            return Ok(self.inner.registry.delete(id)?);
        }

        for attempt in 1..=DELETE_ATTEMPTS {
            if let Some(job) = self.inner.store.active_for_source(id)? {
                match self.stop_job(&job.id, "data source deleted").await {
                    Ok(_) | Err(EngineError::Conflict { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            match self.inner.registry.delete(id) {
                Ok(()) => return Ok(()),
                // a retry or trigger slipped in between
                Err(crawler_store::StoreError::Conflict { .. }) if attempt < DELETE_ATTEMPTS => {
                    warn!(attempt, "in-flight job reappeared during forced delete");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict {
            reason: format!("data source {id} keeps getting new jobs"),
        })
    }

    pub fn overview(&self) -> Result<Overview> {
        Ok(Overview {
            sources: self.inner.registry.overview()?,
            jobs: self.inner.store.counts()?,
            queue_depth: self.inner.queue.len(),
            queue_capacity: self.inner.queue.capacity(),
        })
    }

    // ── jobs ────────────────────────────────────────────────────────────

    /// Queue a manual crawl. Skips the schedule but not single-flight.
    #[instrument(skip(self), fields(source_id = %source_id))]
    pub fn trigger(&self, source_id: &DataSourceId) -> Result<CrawlJob> {
        let source = self.inner.registry.get(source_id)?;
        self.inner.admission.submit(&source, TriggerSource::Manual)
    }

    /// Manually re-run the source of a failed job with its current
    /// configuration.
    pub fn retry_job(&self, job_id: &JobId) -> Result<CrawlJob> {
        let job = self.inner.store.get(job_id)?;
        if job.status != JobStatus::Failed {
            return Err(EngineError::Conflict {
                reason: format!("job {job_id} is {}, only failed jobs can be retried", job.status),
            });
        }
        self.trigger(&job.source_id)
    }

    /// Cancel a queued or running job and return it once it is `failed`.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<CrawlJob> {
        self.stop_job(job_id, "requested by user").await
    }

    pub fn get_job(&self, id: &JobId) -> Result<CrawlJob> {
        Ok(self.inner.store.get(id)?)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<CrawlJob>> {
        Ok(self.inner.store.list(filter)?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    #[instrument(skip(self), fields(job_id = %job_id, %reason))]
    async fn stop_job(&self, job_id: &JobId, reason: &str) -> Result<CrawlJob> {
        let inner = &self.inner;
        let job = inner.store.get(job_id)?;
        if job.status.is_terminal() {
            return Err(EngineError::Conflict {
                reason: format!("job {job_id} is already {}", job.status),
            });
        }

        if job.status == JobStatus::Queued {
            inner.queue.remove(job_id);
            let message = format!("cancelled: {reason}");
            let at = now();
            if inner.store.cancel_queued(job_id, &message, at)? {
                inner.events.emit(JobEvent::Failed {
                    job_id: job.id.clone(),
                    source_id: job.source_id.clone(),
                    kind: FailureKind::Cancelled,
                    message,
                    retry: None,
                    at,
                });
                return Ok(inner.store.get(job_id)?);
            }
            // a worker started it in the meantime
        }

        match inner.active.signal(job_id, reason) {
            Some(done) => wait_released(done).await,
            None => {
                // running with no worker: left over from an abandoned shutdown
                let current = inner.store.get(job_id)?;
                if current.status == JobStatus::Running {
                    inner
                        .executor
                        .fail(&current, FailureKind::Cancelled, format!("cancelled: {reason}"));
                }
            }
        }
        Ok(inner.store.get(job_id)?)
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Reconcile with what a previous process left behind. Call once before
    /// [`start`](Self::start).
    ///
    /// Queued jobs go back on the queue in their enqueue order, ignoring
    /// capacity. Running jobs were interrupted: each is failed with
    /// `restart_recovery` and retried if attempts remain.
    #[instrument(skip(self))]
    pub fn recover(&self) -> Result<RecoveryReport> {
        let inner = &self.inner;
        let already = inner.queue.snapshot();
        let requeued: Vec<JobId> = inner
            .store
            .list_by_status(JobStatus::Queued)?
            .into_iter()
            .map(|job| job.id)
            .filter(|id| !already.contains(id))
            .collect();
        inner.queue.restore(requeued.iter().cloned());

        let mut interrupted = Vec::new();
        for job in inner.store.list_by_status(JobStatus::Running)? {
            if inner.active.contains(&job.id) {
                continue;
            }
            inner.executor.fail(
                &job,
                FailureKind::RestartRecovery,
                "crawl interrupted by restart".to_string(),
            );
            interrupted.push(job.id);
        }

        info!(
            requeued = requeued.len(),
            interrupted = interrupted.len(),
            "recovery complete"
        );
        Ok(RecoveryReport {
            requeued,
            interrupted,
        })
    }

    /// One scheduler evaluation as of now.
    pub fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.inner.scheduler.tick(now)
    }

    /// Spawn the worker pool and, if enabled, the scheduler loop.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            warn!("orchestrator already started");
            return;
        }
        // allow start after an earlier shutdown
        inner.shutdown_tx.send_replace(false);

        let workers = inner.config.dispatch.max_concurrent_jobs.max(1);
        for worker in 0..workers {
            let dispatcher = inner.dispatcher.clone();
            let shutdown = inner.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(dispatcher.run_worker(worker, shutdown)));
        }

        if inner.config.scheduler.enabled {
            let scheduler = inner.scheduler.clone();
            let shutdown = inner.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(scheduler.run(shutdown)));
        }
        info!(
            workers,
            scheduler = inner.config.scheduler.enabled,
            queue_capacity = inner.queue.capacity(),
            "orchestrator started"
        );
    }

    /// Stop taking new work and wait up to the grace period for running
    /// crawls. Anything still running afterwards is aborted and left
    /// `running` for [`recover`](Self::recover) on the next start.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let tasks = std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return;
        }
        inner.shutdown_tx.send_replace(true);

        let grace = inner.config.dispatch.shutdown_grace();
        let deadline = Instant::now() + grace;
        let mut abandoned = 0usize;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                // resolves once the aborted task has dropped its job
                let _ = task.await;
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(abandoned, grace_secs = grace.as_secs(), "shutdown grace elapsed, running crawls abandoned");
        } else {
            info!("orchestrator stopped");
        }
    }

    /// Jobs currently held by a worker.
    pub fn running_count(&self) -> usize {
        self.inner.active.len()
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.inner.config
    }
}
