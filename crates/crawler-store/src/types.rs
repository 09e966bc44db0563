use chrono::{DateTime, Utc};
use crawler_core::{
    CrawlSchedule, DataSourceConfig, DataSourceId, DataSourceStatus, DataSourceType, FailureKind,
    JobId, JobStatus, ScheduleSpec, TriggerSource,
};
use serde::{Deserialize, Serialize};

/// A configured external system that is periodically crawled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: DataSourceId,
    pub name: String,
    pub source_type: DataSourceType,
    pub config: DataSourceConfig,
    pub schedule: CrawlSchedule,
    /// Written only by the status projector.
    pub status: DataSourceStatus,
    pub documents_count: u64,
    /// Completion time of the most recent successful crawl.
    pub last_crawl: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`crate::DataSourceRegistry::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDataSource {
    pub name: String,
    pub source_type: DataSourceType,
    #[serde(default)]
    pub config: DataSourceConfig,
    #[serde(default)]
    pub schedule: ScheduleSpec,
}

impl NewDataSource {
    pub fn new(name: impl Into<String>, source_type: DataSourceType, config: DataSourceConfig) -> Self {
        Self {
            name: name.into(),
            source_type,
            config,
            schedule: ScheduleSpec::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = schedule;
        self
    }
}

/// Partial update; `None` fields are left untouched. The type is immutable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceUpdate {
    pub name: Option<String>,
    pub config: Option<DataSourceConfig>,
    pub schedule: Option<ScheduleSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceFilter {
    pub status: Option<DataSourceStatus>,
    pub source_type: Option<DataSourceType>,
    /// Only sources whose schedule is enabled.
    #[serde(default)]
    pub scheduled_only: bool,
    /// Case-insensitive substring match against name or type.
    pub search: Option<String>,
}

impl DataSourceFilter {
    pub fn scheduled() -> Self {
        Self {
            scheduled_only: true,
            ..Self::default()
        }
    }
}

/// Dashboard counters across all data sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOverview {
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
    pub syncing: u64,
    pub error: u64,
    pub total_documents: u64,
    pub last_crawl: Option<DateTime<Utc>>,
}

/// One execution attempt of gathering content from a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: JobId,
    pub source_id: DataSourceId,
    pub source_type: DataSourceType,
    /// Source configuration as it was when the job was created.
    pub config_snapshot: DataSourceConfig,
    pub status: JobStatus,
    /// 0-100, never decreasing; 100 only once completed.
    pub progress: u8,
    pub documents_processed: u64,
    /// Append-only, in the order the errors occurred.
    pub errors: Vec<String>,
    pub failure_kind: Option<FailureKind>,
    /// 1 for the first try, incremented by each retry.
    pub attempt: u32,
    pub retry_of: Option<JobId>,
    pub triggered_by: TriggerSource,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Input for [`crate::JobStore::insert_queued`].
#[derive(Debug, Clone)]
pub struct NewCrawlJob {
    pub source_id: DataSourceId,
    pub source_type: DataSourceType,
    pub config_snapshot: DataSourceConfig,
    pub attempt: u32,
    pub retry_of: Option<JobId>,
    pub triggered_by: TriggerSource,
}

impl NewCrawlJob {
    /// First attempt for `source`, snapshotting its current configuration.
    pub fn for_source(source: &DataSource, triggered_by: TriggerSource) -> Self {
        Self {
            source_id: source.id.clone(),
            source_type: source.source_type,
            config_snapshot: source.config.clone(),
            attempt: 1,
            retry_of: None,
            triggered_by,
        }
    }

    /// Next attempt of `job`, reusing its snapshot rather than the live source.
    pub fn retry_of(job: &CrawlJob) -> Self {
        Self {
            source_id: job.source_id.clone(),
            source_type: job.source_type,
            config_snapshot: job.config_snapshot.clone(),
            attempt: job.attempt + 1,
            retry_of: Some(job.id.clone()),
            triggered_by: TriggerSource::Retry,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub source_id: Option<DataSourceId>,
    pub status: Option<JobStatus>,
    /// Newest first; `None` returns everything.
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn for_source(source_id: &DataSourceId) -> Self {
        Self {
            source_id: Some(source_id.clone()),
            ..Self::default()
        }
    }
}

/// Number of jobs per lifecycle status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}
