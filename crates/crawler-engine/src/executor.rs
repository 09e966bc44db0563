use std::sync::Arc;
use std::time::Duration;

use crawler_core::config::ExecutorConfig;
use crawler_core::{FailureKind, JobEvent};
use crawler_store::{now, CrawlJob, JobStore};
use tracing::{error, info, instrument, warn};

use crate::capability::{CancelSignal, CapabilitySet, CrawlContext, CrawlError, ProgressSink};
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::queue::{created, JobQueue};

/// Runs one job to a terminal state and applies the retry policy.
#[derive(Clone)]
pub struct CrawlExecutor {
    store: JobStore,
    queue: Arc<JobQueue>,
    events: EventBus,
    capabilities: CapabilitySet,
    timeout: Duration,
    max_attempts: u32,
}

impl CrawlExecutor {
    pub fn new(
        store: JobStore,
        queue: Arc<JobQueue>,
        events: EventBus,
        capabilities: CapabilitySet,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            capabilities,
            timeout: config.timeout(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Drive a `running` job through its capability.
    ///
    /// Returns once the job is `completed` or `failed`.
    #[instrument(skip_all, fields(job_id = %job.id, source_id = %job.source_id, attempt = job.attempt))]
    pub async fn execute(&self, job: CrawlJob, signal: CancelSignal) {
        let Some(capability) = self.capabilities.get(job.source_type) else {
            let message = format!("no crawl capability registered for {}", job.source_type);
            self.fail(&job, FailureKind::Permanent, message);
            return;
        };

        let ctx = CrawlContext::new(
            job.id.clone(),
            job.source_id.clone(),
            job.attempt,
            signal.clone(),
            ProgressSink {
                store: self.store.clone(),
                events: self.events.clone(),
            },
        );

        let outcome = tokio::select! {
            biased;
            result = tokio::time::timeout(self.timeout, capability.fetch(&job.config_snapshot, &ctx)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        let message = format!("crawl timed out after {}s", self.timeout.as_secs());
                        self.fail(&job, FailureKind::Timeout, message);
                        return;
                    }
                }
            }
            _ = signal.cancelled() => Err(CrawlError::Cancelled(signal.reason().to_string())),
        };

        match outcome {
            Ok(outcome) => self.complete(&job, outcome.documents_processed),
            Err(e) => self.fail(&job, e.kind(), e.to_string()),
        }
    }

    fn complete(&self, job: &CrawlJob, documents: u64) {
        let at = now();
        match self.store.complete(&job.id, documents, at) {
            Ok(true) => {
                info!(documents, "crawl completed");
                self.events.emit(JobEvent::Completed {
                    job_id: job.id.clone(),
                    source_id: job.source_id.clone(),
                    documents_processed: documents,
                    at,
                });
            }
            Ok(false) => warn!("job left running before it could complete"),
            Err(e) => {
                error!(error = %e, "failed to record completion");
                let message = format!("failed to record completion: {e}");
                self.fail(job, FailureKind::Transient, message);
            }
        }
    }

    /// Fail `job` and, for a retryable kind with attempts left, queue its
    /// next attempt in the same transaction. A retry that cannot be admitted
    /// leaves the job failed with the reason appended.
    pub(crate) fn fail(&self, job: &CrawlJob, kind: FailureKind, message: String) {
        if let Err(e) = self.try_fail(job, kind, message) {
            error!(job_id = %job.id, error = %e, "failed to record job failure");
        }
    }

    pub(crate) fn try_fail(
        &self,
        job: &CrawlJob,
        kind: FailureKind,
        mut message: String,
    ) -> Result<()> {
        let at = now();

        if kind.is_retryable() && job.attempt < self.max_attempts {
            let failed_message = message.clone();
            let admitted = self.queue.admit(
                || {
                    self.store
                        .fail_and_retry(&job.id, kind, &message, at)
                        .map_err(EngineError::from)
                },
                |retry| {
                    self.events.emit(JobEvent::Failed {
                        job_id: job.id.clone(),
                        source_id: job.source_id.clone(),
                        kind,
                        message: failed_message,
                        retry: Some(retry.id.clone()),
                        at,
                    });
                    self.events.emit(created(retry));
                },
            );
            match admitted {
                Ok(retry) => {
                    warn!(job_id = %job.id, retry_job_id = %retry.id, attempt = retry.attempt, %kind, error = %message, "crawl failed, retrying");
                    return Ok(());
                }
                Err(EngineError::QueueFull { .. }) => {
                    message = format!("{message} (retry not admitted: queue full)");
                }
                Err(e) => return Err(e),
            }
        }

        if self.store.fail(&job.id, kind, &message, at)? {
            warn!(job_id = %job.id, attempt = job.attempt, %kind, error = %message, "crawl failed");
            self.events.emit(JobEvent::Failed {
                job_id: job.id.clone(),
                source_id: job.source_id.clone(),
                kind,
                message,
                retry: None,
                at,
            });
        }
        Ok(())
    }
}
