use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DataSourceId, FailureKind, JobId, TriggerSource};

/// Job lifecycle notification.
///
/// Produced by the queue, dispatcher and executor; consumed by the status
/// projector and by any external subscriber (monitoring, API push).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Created {
        job_id: JobId,
        source_id: DataSourceId,
        attempt: u32,
        triggered_by: TriggerSource,
    },
    Started {
        job_id: JobId,
        source_id: DataSourceId,
        attempt: u32,
        at: DateTime<Utc>,
    },
    Progress {
        job_id: JobId,
        source_id: DataSourceId,
        progress: u8,
        documents_processed: u64,
    },
    Completed {
        job_id: JobId,
        source_id: DataSourceId,
        documents_processed: u64,
        at: DateTime<Utc>,
    },
    Failed {
        job_id: JobId,
        source_id: DataSourceId,
        kind: FailureKind,
        message: String,
        /// The job queued to retry this one, if the retry policy fired.
        retry: Option<JobId>,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Created { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn source_id(&self) -> &DataSourceId {
        match self {
            JobEvent::Created { source_id, .. }
            | JobEvent::Started { source_id, .. }
            | JobEvent::Progress { source_id, .. }
            | JobEvent::Completed { source_id, .. }
            | JobEvent::Failed { source_id, .. } => source_id,
        }
    }

    /// Wire name, e.g. `"job.completed"`.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Created { .. } => "job.created",
            JobEvent::Started { .. } => "job.started",
            JobEvent::Progress { .. } => "job.progress",
            JobEvent::Completed { .. } => "job.completed",
            JobEvent::Failed { .. } => "job.failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_event_serializes_with_tag() {
        let ev = JobEvent::Failed {
            job_id: "j-1".into(),
            source_id: "s-1".into(),
            kind: FailureKind::Timeout,
            message: "crawl timed out after 5s".into(),
            retry: Some("j-2".into()),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["retry"], "j-2");
        assert_eq!(ev.name(), "job.failed");
        assert_eq!(ev.source_id().as_str(), "s-1");
    }
}
