use std::sync::Arc;
use std::time::Duration;

use crawler_core::{FailureKind, JobEvent, JobId};
use crawler_store::{now, JobStore};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::capability::CancelSignal;
use crate::events::EventBus;
use crate::executor::CrawlExecutor;
use crate::queue::JobQueue;

const REQUEUE_DELAY: Duration = Duration::from_millis(500);

struct ActiveEntry {
    signal: CancelSignal,
    done: watch::Receiver<bool>,
}

/// Jobs currently held by a worker, keyed by id.
#[derive(Default)]
pub struct ActiveJobs {
    jobs: DashMap<JobId, ActiveEntry>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id` until the returned guard is dropped.
    pub(crate) fn register(self: &Arc<Self>, id: &JobId, signal: CancelSignal) -> ActiveGuard {
        let (done_tx, done_rx) = watch::channel(false);
        self.jobs.insert(
            id.clone(),
            ActiveEntry {
                signal,
                done: done_rx,
            },
        );
        ActiveGuard {
            jobs: Arc::clone(self),
            id: id.clone(),
            done: done_tx,
        }
    }

    /// Ask a held job to stop. Returns a receiver that flips to `true` once
    /// the worker has released it, or `None` if no worker holds the job.
    pub fn signal(&self, id: &JobId, reason: &str) -> Option<watch::Receiver<bool>> {
        let entry = self.jobs.get(id)?;
        entry.signal.cancel(reason);
        Some(entry.done.clone())
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Releases a worker's hold on a job, including when the task is aborted.
pub(crate) struct ActiveGuard {
    jobs: Arc<ActiveJobs>,
    id: JobId,
    done: watch::Sender<bool>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.jobs.jobs.remove(&self.id);
        let _ = self.done.send(true);
    }
}

/// Wait until a signalled job has been released by its worker.
pub async fn wait_released(mut done: watch::Receiver<bool>) {
    // Err means the guard is gone, which is also a release
    let _ = done.wait_for(|released| *released).await;
}

/// Moves jobs from the queue into the executor, one job per worker.
///
/// The pool size is the global concurrency ceiling; a worker takes the next
/// job only after the previous one is terminal.
#[derive(Clone)]
pub struct Dispatcher {
    store: JobStore,
    queue: Arc<JobQueue>,
    events: EventBus,
    executor: CrawlExecutor,
    active: Arc<ActiveJobs>,
}

impl Dispatcher {
    pub fn new(
        store: JobStore,
        queue: Arc<JobQueue>,
        events: EventBus,
        executor: CrawlExecutor,
        active: Arc<ActiveJobs>,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            executor,
            active,
        }
    }

    /// Worker loop. Exits when `shutdown` flips to `true`; a job already in
    /// hand is finished first.
    pub async fn run_worker(self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "dispatch worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let id = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                id = self.queue.next() => id,
            };
            self.dispatch(id).await;
        }
        debug!(worker, "dispatch worker stopped");
    }

    /// Start one queued job and run it to completion.
    pub async fn dispatch(&self, id: JobId) {
        let signal = CancelSignal::new();
        let _guard = self.active.register(&id, signal.clone());

        let job = match self.store.mark_running(&id, now()) {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %id, "job no longer startable, skipped");
                return;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to start job");
                self.settle_unstarted(&id, format!("failed to start crawl: {e}"))
                    .await;
                return;
            }
        };

        info!(job_id = %job.id, source_id = %job.source_id, attempt = job.attempt, "crawl started");
        self.events.emit(JobEvent::Started {
            job_id: job.id.clone(),
            source_id: job.source_id.clone(),
            attempt: job.attempt,
            at: job.started_at.unwrap_or_else(now),
        });

        self.executor.execute(job, signal).await;
    }

    /// A job taken off the queue but never marked running still holds its
    /// source's single-flight slot. Fail it through the retry policy, or put
    /// it back at the head of the queue when even that cannot be recorded.
    async fn settle_unstarted(&self, id: &JobId, message: String) {
        let settled = match self.store.get(id) {
            Ok(job) => self.executor.try_fail(&job, FailureKind::Transient, message),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = settled {
            warn!(job_id = %id, error = %e, "job could not be settled, requeueing");
            tokio::time::sleep(REQUEUE_DELAY).await;
            self.queue.requeue(id.clone());
        }
    }
}
