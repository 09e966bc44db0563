//! SQLite persistence for the crawler: the data source registry and the
//! crawl job store. Both share one [`Database`] handle.

pub mod db;
pub mod error;
pub mod jobs;
pub mod registry;
pub mod types;

pub use db::{init_db, now, Database};
pub use error::{Result, StoreError};
pub use jobs::{JobStore, MAX_RUNNING_PROGRESS};
pub use registry::DataSourceRegistry;
pub use types::{
    CrawlJob, DataSource, DataSourceFilter, DataSourceUpdate, JobCounts, JobFilter, NewCrawlJob,
    NewDataSource, SourceOverview,
};
