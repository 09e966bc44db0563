use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_SECS: u64 = 30;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
pub const DEFAULT_CRAWL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Top-level config (crawler.toml + CRAWLER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// When false only manual triggers create jobs.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: DEFAULT_TICK_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of `queued` jobs; admission beyond this is refused.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Global ceiling on simultaneously running jobs (worker pool size).
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// How long shutdown waits for running crawls before abandoning them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl DispatchConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Deadline for a single crawl attempt.
    #[serde(default = "default_crawl_timeout_secs")]
    pub timeout_secs: u64,
    /// Total attempts per logical crawl, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ExecutorConfig {
    /// Never zero: a zero deadline would fail every crawl on entry.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_CRAWL_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Settings for the built-in HTTP crawler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_max_concurrent_jobs() -> usize {
    DEFAULT_MAX_CONCURRENT_JOBS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_crawl_timeout_secs() -> u64 {
    DEFAULT_CRAWL_TIMEOUT_SECS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_user_agent() -> String {
    concat!("knowledge-crawler/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.crawler/crawler.db", home)
}

impl CrawlerConfig {
    /// Load config from a TOML file with CRAWLER_* env var overrides.
    ///
    /// Path resolution: explicit argument, then ~/.crawler/crawler.toml.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CrawlerError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CRAWLER_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.crawler/crawler.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = CrawlerConfig::load(Some("/nonexistent/crawler.toml")).unwrap();
        assert_eq!(cfg.queue.capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(cfg.executor.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(cfg.scheduler.enabled);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[dispatch]\nmax_concurrent_jobs = 2\n\n[executor]\ntimeout_secs = 60\n\n[queue]\ncapacity = 8"
        )
        .unwrap();

        let cfg = CrawlerConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.dispatch.max_concurrent_jobs, 2);
        assert_eq!(cfg.executor.timeout(), Duration::from_secs(60));
        assert_eq!(cfg.queue.capacity, 8);
        assert_eq!(cfg.dispatch.shutdown_grace_secs, DEFAULT_SHUTDOWN_GRACE_SECS);
    }

    #[test]
    fn tick_never_drops_to_zero() {
        let cfg = SchedulerConfig {
            enabled: true,
            tick_secs: 0,
        };
        assert_eq!(cfg.tick(), Duration::from_secs(1));
    }

    #[test]
    fn crawl_timeout_never_drops_to_zero() {
        let cfg = ExecutorConfig {
            timeout_secs: 0,
            max_attempts: 3,
        };
        assert_eq!(cfg.timeout(), Duration::from_secs(1));
        assert_eq!(ExecutorConfig::default().timeout(), Duration::from_secs(300));
    }
}
