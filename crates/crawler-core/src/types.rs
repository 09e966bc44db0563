use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CrawlerError, Result};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh, time-sortable id.
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Identity of a data source record.
    DataSourceId
);
opaque_id!(
    /// Identity of a crawl job record.
    JobId
);

/// The closed set of systems a data source can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceType {
    Website,
    Confluence,
    Jira,
    GoogleDrive,
    Onedrive,
    S3,
    AzureBlob,
    Teams,
    Slack,
    Discord,
}

impl DataSourceType {
    pub const ALL: [DataSourceType; 10] = [
        DataSourceType::Website,
        DataSourceType::Confluence,
        DataSourceType::Jira,
        DataSourceType::GoogleDrive,
        DataSourceType::Onedrive,
        DataSourceType::S3,
        DataSourceType::AzureBlob,
        DataSourceType::Teams,
        DataSourceType::Slack,
        DataSourceType::Discord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceType::Website => "website",
            DataSourceType::Confluence => "confluence",
            DataSourceType::Jira => "jira",
            DataSourceType::GoogleDrive => "google_drive",
            DataSourceType::Onedrive => "onedrive",
            DataSourceType::S3 => "s3",
            DataSourceType::AzureBlob => "azure_blob",
            DataSourceType::Teams => "teams",
            DataSourceType::Slack => "slack",
            DataSourceType::Discord => "discord",
        }
    }

    /// Check that `config` carries what a crawler of this type needs.
    ///
    /// Runs at creation and update so a malformed source never reaches the queue.
    pub fn validate_config(&self, config: &DataSourceConfig) -> Result<()> {
        if let Some(ref raw) = config.url {
            let parsed = url::Url::parse(raw)
                .map_err(|e| CrawlerError::validation(format!("url '{raw}' is invalid: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(CrawlerError::validation(format!(
                    "url '{raw}' must use http or https"
                )));
            }
        }

        match self {
            DataSourceType::Website | DataSourceType::Confluence | DataSourceType::Jira => {
                if config.url.is_none() {
                    return Err(CrawlerError::validation(format!(
                        "{self} sources require a url"
                    )));
                }
            }
            DataSourceType::GoogleDrive
            | DataSourceType::Onedrive
            | DataSourceType::Teams
            | DataSourceType::Slack
            | DataSourceType::Discord => {
                if config.credentials_ref.as_deref().map_or(true, str::is_empty) {
                    return Err(CrawlerError::validation(format!(
                        "{self} sources require a credentials_ref"
                    )));
                }
            }
            DataSourceType::S3 => require_setting(config, "bucket", *self)?,
            DataSourceType::AzureBlob => require_setting(config, "container", *self)?,
        }
        Ok(())
    }
}

fn require_setting(config: &DataSourceConfig, key: &str, ty: DataSourceType) -> Result<()> {
    match config.settings.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(CrawlerError::validation(format!(
            "{ty} sources require settings.{key}"
        ))),
    }
}

impl fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSourceType {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self> {
        DataSourceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CrawlerError::UnknownVariant {
                kind: "data source type",
                value: s.to_string(),
            })
    }
}

/// Aggregate status of a data source, derived from its job history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceStatus {
    /// Last terminal job completed.
    Active,
    /// No job has ever finished.
    Inactive,
    /// Last terminal job failed and no retry is pending.
    Error,
    /// A job is running, or a retry is queued behind a failed attempt.
    Syncing,
}

impl DataSourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceStatus::Active => "active",
            DataSourceStatus::Inactive => "inactive",
            DataSourceStatus::Error => "error",
            DataSourceStatus::Syncing => "syncing",
        }
    }
}

impl fmt::Display for DataSourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSourceStatus {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(DataSourceStatus::Active),
            "inactive" => Ok(DataSourceStatus::Inactive),
            "error" => Ok(DataSourceStatus::Error),
            "syncing" => Ok(DataSourceStatus::Syncing),
            other => Err(CrawlerError::UnknownVariant {
                kind: "data source status",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CrawlerError::UnknownVariant {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The capability exceeded its deadline.
    Timeout,
    /// Network or rate-limit failure reported by the capability.
    Transient,
    /// Authentication or configuration failure reported by the capability.
    Permanent,
    /// Explicit cancellation or deletion of the owning source.
    Cancelled,
    /// The job was found `running` with no live executor at startup.
    RestartRecovery,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Cancelled => "cancelled",
            FailureKind::RestartRecovery => "restart_recovery",
        }
    }

    /// Transient failures are retried up to the configured attempt limit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::Transient | FailureKind::RestartRecovery
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "timeout" => Ok(FailureKind::Timeout),
            "transient" => Ok(FailureKind::Transient),
            "permanent" => Ok(FailureKind::Permanent),
            "cancelled" => Ok(FailureKind::Cancelled),
            "restart_recovery" => Ok(FailureKind::RestartRecovery),
            other => Err(CrawlerError::UnknownVariant {
                kind: "failure kind",
                value: other.to_string(),
            }),
        }
    }
}

/// What caused a job to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Manual,
    Retry,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Manual => "manual",
            TriggerSource::Retry => "retry",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "schedule" => Ok(TriggerSource::Schedule),
            "manual" => Ok(TriggerSource::Manual),
            "retry" => Ok(TriggerSource::Retry),
            other => Err(CrawlerError::UnknownVariant {
                kind: "trigger source",
                value: other.to_string(),
            }),
        }
    }
}

/// Type-specific connection settings for a data source.
///
/// A copy of this is snapshotted into every job at creation, so editing a
/// source never changes what an in-flight crawl does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Base URL for web-addressable sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Name of a credential held by the secret store (never the secret itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,
    /// Content filters (include/exclude patterns, spaces, projects, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, serde_json::Value>,
    /// Anything else a particular crawler needs, e.g. `bucket` for S3.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl DataSourceConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }
}
