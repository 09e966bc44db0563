use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use crawler_core::{DataSourceConfig, DataSourceId, DataSourceType, FailureKind, JobEvent, JobId};
use crawler_store::{JobStore, MAX_RUNNING_PROGRESS};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::EventBus;

/// The thing that actually talks to an external system.
///
/// Implementations report progress through the [`CrawlContext`] and should
/// call [`CrawlContext::checkpoint`] between units of work so cancellation
/// is observed promptly.
#[async_trait]
pub trait CrawlCapability: Send + Sync {
    async fn fetch(
        &self,
        config: &DataSourceConfig,
        ctx: &CrawlContext,
    ) -> Result<CrawlOutcome, CrawlError>;
}

/// Successful crawl summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrawlOutcome {
    /// Total documents handled by this crawl.
    pub documents_processed: u64,
}

/// Why a capability stopped without finishing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrawlError {
    /// Worth retrying: network blips, rate limits, upstream 5xx.
    #[error("transient crawl error: {0}")]
    Transient(String),

    /// Retrying will not help: bad credentials, missing resource.
    #[error("permanent crawl error: {0}")]
    Permanent(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl CrawlError {
    pub fn transient(msg: impl Into<String>) -> Self {
        CrawlError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        CrawlError::Permanent(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            CrawlError::Transient(_) => FailureKind::Transient,
            CrawlError::Permanent(_) => FailureKind::Permanent,
            CrawlError::Cancelled(_) => FailureKind::Cancelled,
        }
    }
}

/// Cooperative cancellation with a reason attached.
///
/// The first reason wins; later `cancel` calls only re-fire the token.
#[derive(Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> &str {
        self.reason.get().map_or("cancelled", String::as_str)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason.get())
            .finish()
    }
}

/// Where progress reports go for a dispatched job.
#[derive(Clone)]
pub(crate) struct ProgressSink {
    pub(crate) store: JobStore,
    pub(crate) events: EventBus,
}

#[derive(Default)]
struct ProgressState {
    progress: u8,
    documents: u64,
}

/// Per-job handle passed to a [`CrawlCapability`].
pub struct CrawlContext {
    job_id: JobId,
    source_id: DataSourceId,
    attempt: u32,
    signal: CancelSignal,
    state: Mutex<ProgressState>,
    sink: Option<ProgressSink>,
}

impl CrawlContext {
    pub(crate) fn new(
        job_id: JobId,
        source_id: DataSourceId,
        attempt: u32,
        signal: CancelSignal,
        sink: ProgressSink,
    ) -> Self {
        Self {
            job_id,
            source_id,
            attempt,
            signal,
            state: Mutex::new(ProgressState::default()),
            sink: Some(sink),
        }
    }

    /// A context whose reports go nowhere, for driving a capability outside
    /// the engine.
    pub fn detached(signal: CancelSignal) -> Self {
        Self {
            job_id: JobId::generate(),
            source_id: DataSourceId::generate(),
            attempt: 1,
            signal,
            state: Mutex::new(ProgressState::default()),
            sink: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn source_id(&self) -> &DataSourceId {
        &self.source_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report a progress percentage and the documents handled since the
    /// last report. Percentages that do not increase are ignored; the delta
    /// is always counted. Doubles as a cancellation checkpoint.
    pub fn report(&self, percent: u8, documents_delta: u64) -> Result<(), CrawlError> {
        self.checkpoint()?;

        let (progress, documents) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let percent = percent.min(MAX_RUNNING_PROGRESS);
            let raised = percent > state.progress;
            if !raised && documents_delta == 0 {
                return Ok(());
            }
            if raised {
                state.progress = percent;
            }
            state.documents += documents_delta;
            (state.progress, state.documents)
        };

        let Some(sink) = &self.sink else {
            return Ok(());
        };
        match sink.store.record_progress(&self.job_id, progress, documents_delta) {
            Ok(true) => sink.events.emit(JobEvent::Progress {
                job_id: self.job_id.clone(),
                source_id: self.source_id.clone(),
                progress,
                documents_processed: documents,
            }),
            Ok(false) => debug!(job_id = %self.job_id, "progress after job left running ignored"),
            Err(e) => warn!(job_id = %self.job_id, error = %e, "failed to persist progress"),
        }
        Ok(())
    }

    /// `Err(Cancelled)` once the job has been asked to stop.
    pub fn checkpoint(&self) -> Result<(), CrawlError> {
        if self.signal.is_cancelled() {
            return Err(CrawlError::Cancelled(self.signal.reason().to_string()));
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves when the job is cancelled; for use in `tokio::select!`.
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }
}

/// One optional capability per source type.
///
/// Lookup is an exhaustive match, so adding a source type does not compile
/// until it has a slot here.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    website: Option<Arc<dyn CrawlCapability>>,
    confluence: Option<Arc<dyn CrawlCapability>>,
    jira: Option<Arc<dyn CrawlCapability>>,
    google_drive: Option<Arc<dyn CrawlCapability>>,
    onedrive: Option<Arc<dyn CrawlCapability>>,
    s3: Option<Arc<dyn CrawlCapability>>,
    azure_blob: Option<Arc<dyn CrawlCapability>>,
    teams: Option<Arc<dyn CrawlCapability>>,
    slack: Option<Arc<dyn CrawlCapability>>,
    discord: Option<Arc<dyn CrawlCapability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source_type: DataSourceType, capability: Arc<dyn CrawlCapability>) -> Self {
        *self.slot_mut(source_type) = Some(capability);
        self
    }

    pub fn get(&self, source_type: DataSourceType) -> Option<Arc<dyn CrawlCapability>> {
        let slot = match source_type {
            DataSourceType::Website => &self.website,
            DataSourceType::Confluence => &self.confluence,
            DataSourceType::Jira => &self.jira,
            DataSourceType::GoogleDrive => &self.google_drive,
            DataSourceType::Onedrive => &self.onedrive,
            DataSourceType::S3 => &self.s3,
            DataSourceType::AzureBlob => &self.azure_blob,
            DataSourceType::Teams => &self.teams,
            DataSourceType::Slack => &self.slack,
            DataSourceType::Discord => &self.discord,
        };
        slot.clone()
    }

    /// Types with a registered capability, in declaration order.
    pub fn registered(&self) -> Vec<DataSourceType> {
        DataSourceType::ALL
            .into_iter()
            .filter(|t| self.get(*t).is_some())
            .collect()
    }

    fn slot_mut(&mut self, source_type: DataSourceType) -> &mut Option<Arc<dyn CrawlCapability>> {
        match source_type {
            DataSourceType::Website => &mut self.website,
            DataSourceType::Confluence => &mut self.confluence,
            DataSourceType::Jira => &mut self.jira,
            DataSourceType::GoogleDrive => &mut self.google_drive,
            DataSourceType::Onedrive => &mut self.onedrive,
            DataSourceType::S3 => &mut self.s3,
            DataSourceType::AzureBlob => &mut self.azure_blob,
            DataSourceType::Teams => &mut self.teams,
            DataSourceType::Slack => &mut self.slack,
            DataSourceType::Discord => &mut self.discord,
        }
    }
}
