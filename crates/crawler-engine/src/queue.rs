use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crawler_core::{JobEvent, JobId, TriggerSource};
use crawler_store::{CrawlJob, DataSource, JobStore, NewCrawlJob};
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::error::{EngineError, Result};
use crate::events::EventBus;

/// Bounded FIFO of job ids waiting for a worker.
///
/// Capacity counts queued jobs only; running jobs hold a worker slot, not
/// a queue slot.
pub struct JobQueue {
    inner: Mutex<VecDeque<JobId>>,
    capacity: usize,
    notify: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Reserve a slot and run `create` to persist the job, both under the
    /// queue lock so concurrent admissions cannot overshoot capacity. When
    /// the queue is full `create` is never called.
    ///
    /// `announce` runs after `create` succeeds and before the id becomes
    /// visible to workers, so whatever it emits precedes `job.started`.
    pub fn admit<F, A>(&self, create: F, announce: A) -> Result<CrawlJob>
    where
        F: FnOnce() -> Result<CrawlJob>,
        A: FnOnce(&CrawlJob),
    {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            return Err(EngineError::QueueFull {
                capacity: self.capacity,
            });
        }
        let job = create()?;
        announce(&job);
        queue.push_back(job.id.clone());
        drop(queue);
        self.notify.notify_one();
        Ok(job)
    }

    /// Re-insert persisted jobs after a restart, ignoring capacity.
    pub fn restore(&self, ids: impl IntoIterator<Item = JobId>) {
        let mut queue = self.lock();
        let before = queue.len();
        queue.extend(ids);
        let restored = queue.len() - before;
        drop(queue);
        if restored > 0 {
            self.notify.notify_one();
        }
    }

    /// Put a job a worker could not start back at the head of the queue,
    /// ignoring capacity.
    pub fn requeue(&self, id: JobId) {
        self.lock().push_front(id);
        self.notify.notify_one();
    }

    /// Drop a job that has not been picked up yet.
    pub fn remove(&self, id: &JobId) -> bool {
        let mut queue = self.lock();
        match queue.iter().position(|queued| queued == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Wait for the head of the queue.
    pub async fn next(&self) -> JobId {
        loop {
            if let Some(id) = self.try_next() {
                return id;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_next(&self) -> Option<JobId> {
        let mut queue = self.lock();
        let id = queue.pop_front()?;
        let more = !queue.is_empty();
        drop(queue);
        // hand the wakeup on so an idle worker picks up the rest
        if more {
            self.notify.notify_one();
        }
        Some(id)
    }

    /// Queued ids, head first.
    pub fn snapshot(&self) -> Vec<JobId> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<JobId>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creates jobs for a source: single-flight pre-check, bounded admission,
/// `job.created` event.
#[derive(Clone)]
pub struct Admission {
    store: JobStore,
    queue: Arc<JobQueue>,
    events: EventBus,
}

impl Admission {
    pub fn new(store: JobStore, queue: Arc<JobQueue>, events: EventBus) -> Self {
        Self {
            store,
            queue,
            events,
        }
    }

    /// Queue a first attempt for `source`.
    ///
    /// `AlreadyRunning` takes precedence over `QueueFull`; neither creates a
    /// job record.
    #[instrument(skip(self, source), fields(source_id = %source.id, trigger = %triggered_by))]
    pub fn submit(&self, source: &DataSource, triggered_by: TriggerSource) -> Result<CrawlJob> {
        if let Some(active) = self.store.active_for_source(&source.id)? {
            debug!(job_id = %active.id, "source already has a job in flight");
            return Err(EngineError::AlreadyRunning {
                source_id: source.id.to_string(),
            });
        }

        let new = NewCrawlJob::for_source(source, triggered_by);
        let job = self.queue.admit(
            || self.store.insert_queued(&new).map_err(EngineError::from),
            |job| {
                info!(job_id = %job.id, "crawl job queued");
                self.events.emit(created(job));
            },
        )?;
        Ok(job)
    }
}

pub(crate) fn created(job: &CrawlJob) -> JobEvent {
    JobEvent::Created {
        job_id: job.id.clone(),
        source_id: job.source_id.clone(),
        attempt: job.attempt,
        triggered_by: job.triggered_by,
    }
}
