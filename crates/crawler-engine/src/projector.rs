use crawler_core::JobEvent;
use crawler_store::{DataSourceRegistry, StoreError};
use tracing::{debug, error};

/// Derives a data source's aggregate status from its job lifecycle events.
///
/// The only writer of `status`, `documents_count` and `last_crawl`. Each
/// event maps to a single UPDATE that recomputes the status from the job
/// table, so events applied late or out of order still leave the status
/// matching the latest job transition.
#[derive(Clone)]
pub struct StatusProjector {
    registry: DataSourceRegistry,
}

impl StatusProjector {
    pub fn new(registry: DataSourceRegistry) -> Self {
        Self { registry }
    }

    pub fn apply(&self, event: &JobEvent) {
        let source_id = event.source_id();
        let result = match event {
            JobEvent::Started { .. } | JobEvent::Failed { .. } => {
                self.registry.refresh_status(source_id)
            }
            JobEvent::Completed {
                documents_processed,
                at,
                ..
            } => self
                .registry
                .record_completion(source_id, *documents_processed, *at),
            JobEvent::Created { .. } | JobEvent::Progress { .. } => return,
        };

        match result {
            Ok(status) => {
                debug!(source_id = %source_id, event = event.name(), %status, "source status projected");
            }
            Err(StoreError::SourceNotFound { .. }) => {
                debug!(source_id = %source_id, event = event.name(), "event for deleted source ignored");
            }
            Err(e) => {
                error!(source_id = %source_id, event = event.name(), error = %e, "status projection failed");
            }
        }
    }
}
