//! Shared vocabulary for the knowledge crawler: configuration, error type,
//! domain ids and enums, cron schedule helpers and job lifecycle events.

pub mod config;
pub mod error;
pub mod event;
pub mod schedule;
pub mod types;

pub use config::CrawlerConfig;
pub use error::{CrawlerError, Result};
pub use event::JobEvent;
pub use schedule::{CrawlSchedule, ScheduleFrequency, ScheduleSpec};
pub use types::{
    DataSourceConfig, DataSourceId, DataSourceStatus, DataSourceType, FailureKind, JobId,
    JobStatus, TriggerSource,
};
