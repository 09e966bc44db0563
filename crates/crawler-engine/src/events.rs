use crawler_core::JobEvent;
use tokio::sync::broadcast;
use tracing::debug;

use crate::projector::StatusProjector;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fan-out point for job lifecycle events.
///
/// The status projector runs inline, before the event is published, so a
/// subscriber that sees `job.completed` can already read the updated source.
/// Broadcast delivery is best-effort: slow subscribers observe `Lagged`.
#[derive(Clone)]
pub struct EventBus {
    projector: StatusProjector,
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(projector: StatusProjector) -> Self {
        Self::with_capacity(projector, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(projector: StatusProjector, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { projector, tx }
    }

    pub fn emit(&self, event: JobEvent) {
        self.projector.apply(&event);
        debug!(event = event.name(), job_id = %event.job_id(), source_id = %event.source_id(), "job event");
        // no receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}
