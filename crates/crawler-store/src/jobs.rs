use chrono::{DateTime, Utc};
use crawler_core::{DataSourceId, FailureKind, JobId, JobStatus};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, instrument, warn};

use crate::db::{enum_column, json_column, now, opt_timestamp, parse_ts, timestamp, ts, Database};
use crate::error::{Result, StoreError};
use crate::types::{CrawlJob, JobCounts, JobFilter, NewCrawlJob};

const JOB_COLUMNS: &str = "id, source_id, source_type, config_snapshot, status, progress,
     documents_processed, errors, failure_kind, attempt, retry_of, triggered_by,
     enqueued_at, started_at, finished_at";

/// Highest progress a job may show before it has completed.
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Persistence for crawl job records.
///
/// Every state change is a guarded `UPDATE ... WHERE status = ...`, so a
/// transition that lost a race reports `false`/`None` instead of clobbering
/// a terminal job.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a `queued` job. Fails with `AlreadyRunning` if the source
    /// already has a queued or running job.
    #[instrument(skip(self, new), fields(source_id = %new.source_id, attempt = new.attempt))]
    pub fn insert_queued(&self, new: &NewCrawlJob) -> Result<CrawlJob> {
        let conn = self.db.lock();
        insert_job(&conn, new, now())
    }

    #[instrument(skip(self), fields(job_id = %id))]
    pub fn get(&self, id: &JobId) -> Result<CrawlJob> {
        let conn = self.db.lock();
        get_job(&conn, id)
    }

    /// Jobs matching `filter`, newest first.
    #[instrument(skip(self))]
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<CrawlJob>> {
        let limit = filter.limit.map_or(-1, |l| l as i64);
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs
             WHERE (?1 IS NULL OR source_id = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY seq DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![
                filter.source_id.as_ref().map(|s| s.as_str()),
                filter.status.map(|s| s.as_str()),
                limit,
            ],
            row_to_job,
        )?;
        let jobs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// All jobs in `status`, in enqueue order.
    pub fn list_by_status(&self, status: JobStatus) -> Result<Vec<CrawlJob>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE status = ?1 ORDER BY seq"
        ))?;
        let rows = stmt.query_map([status.as_str()], row_to_job)?;
        let jobs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// The queued or running job for `source_id`, if any.
    pub fn active_for_source(&self, source_id: &DataSourceId) -> Result<Option<CrawlJob>> {
        let conn = self.db.lock();
        let job = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM crawl_jobs
                     WHERE source_id = ?1 AND status IN ('queued', 'running')"
                ),
                [source_id.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// End time of the most recent terminal job for `source_id`.
    pub fn last_finished_at(&self, source_id: &DataSourceId) -> Result<Option<DateTime<Utc>>> {
        let conn = self.db.lock();
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(finished_at) FROM crawl_jobs
             WHERE source_id = ?1 AND status IN ('completed', 'failed')",
            [source_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(raw.map(|r| parse_ts(0, &r)).transpose()?)
    }

    pub fn counts(&self) -> Result<JobCounts> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM crawl_jobs GROUP BY status")?;
        let mut counts = JobCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((enum_column::<JobStatus>(row, 0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status {
                JobStatus::Queued => counts.queued = n,
                JobStatus::Running => counts.running = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// `queued → running`. Returns `None` when the job is no longer queued
    /// (cancelled in the meantime) or another job of the same source is
    /// already running.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn mark_running(&self, id: &JobId, at: DateTime<Utc>) -> Result<Option<CrawlJob>> {
        let conn = self.db.lock();
        let n = conn.execute(
            "UPDATE crawl_jobs SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'queued'
               AND NOT EXISTS (SELECT 1 FROM crawl_jobs other
                               WHERE other.source_id = crawl_jobs.source_id
                                 AND other.status = 'running')",
            rusqlite::params![id.as_str(), ts(at)],
        )?;
        if n == 0 {
            debug!("job not eligible to start");
            return Ok(None);
        }
        get_job(&conn, id).map(Some)
    }

    /// Raise progress (never lowers it, never past 99) and add
    /// `documents_delta`. Returns `false` once the job is no longer running.
    pub fn record_progress(&self, id: &JobId, progress: u8, documents_delta: u64) -> Result<bool> {
        let progress = progress.min(MAX_RUNNING_PROGRESS);
        let conn = self.db.lock();
        let n = conn.execute(
            "UPDATE crawl_jobs
             SET progress = MAX(progress, ?2),
                 documents_processed = documents_processed + ?3
             WHERE id = ?1 AND status = 'running'",
            rusqlite::params![id.as_str(), progress, documents_delta as i64],
        )?;
        Ok(n > 0)
    }

    /// `running → completed` with progress forced to 100.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn complete(&self, id: &JobId, documents: u64, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.db.lock();
        let n = conn.execute(
            "UPDATE crawl_jobs
             SET status = 'completed', progress = 100,
                 documents_processed = ?2, finished_at = ?3
             WHERE id = ?1 AND status = 'running'",
            rusqlite::params![id.as_str(), documents as i64, ts(at)],
        )?;
        if n > 0 {
            info!("job completed");
        }
        Ok(n > 0)
    }

    /// Fail a queued or running job, appending `message` to its errors.
    /// Returns `false` if the job was already terminal.
    #[instrument(skip(self, message), fields(job_id = %id, kind = %kind))]
    pub fn fail(
        &self,
        id: &JobId,
        kind: FailureKind,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let failed = fail_in(&tx, id, &[JobStatus::Queued, JobStatus::Running], kind, message, at)?;
        tx.commit()?;
        if failed {
            warn!(error = %message, "job failed");
        }
        Ok(failed)
    }

    /// Fail a job that has not started yet as `Cancelled`. Returns `false`
    /// if it is no longer queued.
    #[instrument(skip(self, reason), fields(job_id = %id))]
    pub fn cancel_queued(&self, id: &JobId, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let failed = fail_in(&tx, id, &[JobStatus::Queued], FailureKind::Cancelled, reason, at)?;
        tx.commit()?;
        if failed {
            info!(%reason, "queued job cancelled");
        }
        Ok(failed)
    }

    /// Fail an in-flight job and insert its retry (attempt + 1, same config
    /// snapshot) in one transaction, so no other job for the source can slip
    /// in between.
    #[instrument(skip(self, message), fields(job_id = %id, kind = %kind))]
    pub fn fail_and_retry(
        &self,
        id: &JobId,
        kind: FailureKind,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<CrawlJob> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let job = get_job(&tx, id)?;
        if !fail_in(&tx, id, &[JobStatus::Queued, JobStatus::Running], kind, message, at)? {
            return Err(StoreError::Conflict {
                reason: format!("job {id} is no longer queued or running"),
            });
        }
        let retry = insert_job(&tx, &NewCrawlJob::retry_of(&job), at)?;
        tx.commit()?;
        warn!(error = %message, retry_job_id = %retry.id, attempt = retry.attempt, "job failed, retry queued");
        Ok(retry)
    }
}

fn insert_job(conn: &Connection, new: &NewCrawlJob, at: DateTime<Utc>) -> Result<CrawlJob> {
    let id = JobId::generate();
    let config_json = serde_json::to_string(&new.config_snapshot)?;
    let inserted = conn.execute(
        "INSERT INTO crawl_jobs
         (id, source_id, source_type, config_snapshot, status, progress,
          documents_processed, errors, failure_kind, attempt, retry_of,
          triggered_by, enqueued_at, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, 'queued', 0, 0, '[]', NULL, ?5, ?6, ?7, ?8, NULL, NULL)",
        rusqlite::params![
            id.as_str(),
            new.source_id.as_str(),
            new.source_type.as_str(),
            config_json,
            new.attempt,
            new.retry_of.as_ref().map(|r| r.as_str()),
            new.triggered_by.as_str(),
            ts(at),
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            return Err(StoreError::AlreadyRunning {
                source_id: new.source_id.to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    }
    debug!(job_id = %id, "job queued");

    Ok(CrawlJob {
        id,
        source_id: new.source_id.clone(),
        source_type: new.source_type,
        config_snapshot: new.config_snapshot.clone(),
        status: JobStatus::Queued,
        progress: 0,
        documents_processed: 0,
        errors: Vec::new(),
        failure_kind: None,
        attempt: new.attempt,
        retry_of: new.retry_of.clone(),
        triggered_by: new.triggered_by,
        enqueued_at: at,
        started_at: None,
        finished_at: None,
    })
}

fn get_job(conn: &Connection, id: &JobId) -> Result<CrawlJob> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = ?1"),
        [id.as_str()],
        row_to_job,
    )
    .optional()?
    .ok_or_else(|| StoreError::JobNotFound { id: id.to_string() })
}

/// Move a job in one of `from` to `failed`, appending `message`.
fn fail_in(
    conn: &Connection,
    id: &JobId,
    from: &[JobStatus],
    kind: FailureKind,
    message: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let current: Option<(String, String)> = conn
        .query_row(
            "SELECT status, errors FROM crawl_jobs WHERE id = ?1",
            [id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((status, errors)) = current else {
        return Err(StoreError::JobNotFound { id: id.to_string() });
    };
    let status: JobStatus = status.parse()?;
    if !from.contains(&status) {
        return Ok(false);
    }

    let mut errors: Vec<String> = serde_json::from_str(&errors)?;
    errors.push(message.to_string());

    conn.execute(
        "UPDATE crawl_jobs
         SET status = 'failed', failure_kind = ?2, errors = ?3, finished_at = ?4
         WHERE id = ?1",
        rusqlite::params![id.as_str(), kind.as_str(), serde_json::to_string(&errors)?, ts(at)],
    )?;
    Ok(true)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrawlJob> {
    Ok(CrawlJob {
        id: JobId::from(row.get::<_, String>(0)?),
        source_id: DataSourceId::from(row.get::<_, String>(1)?),
        source_type: enum_column(row, 2)?,
        config_snapshot: json_column(row, 3)?,
        status: enum_column(row, 4)?,
        progress: row.get(5)?,
        documents_processed: row.get::<_, i64>(6)? as u64,
        errors: json_column(row, 7)?,
        failure_kind: row
            .get::<_, Option<String>>(8)?
            .map(|raw| raw.parse::<FailureKind>())
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
            })?,
        attempt: row.get(9)?,
        retry_of: row.get::<_, Option<String>>(10)?.map(JobId::from),
        triggered_by: enum_column(row, 11)?,
        enqueued_at: timestamp(row, 12)?,
        started_at: opt_timestamp(row, 13)?,
        finished_at: opt_timestamp(row, 14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DataSourceRegistry;
    use crate::types::{DataSource, NewDataSource};
    use crawler_core::{DataSourceConfig, DataSourceType, TriggerSource};

    fn setup() -> (JobStore, DataSource) {
        let db = Database::open_in_memory().unwrap();
        let source = DataSourceRegistry::new(db.clone())
            .create(NewDataSource::new(
                "Docs",
                DataSourceType::Website,
                DataSourceConfig::with_url("https://docs.example.com"),
            ))
            .unwrap();
        (JobStore::new(db), source)
    }

    fn running(store: &JobStore, source: &DataSource) -> CrawlJob {
        let job = store
            .insert_queued(&NewCrawlJob::for_source(source, TriggerSource::Manual))
            .unwrap();
        store.mark_running(&job.id, now()).unwrap().unwrap()
    }

    #[test]
    fn second_in_flight_job_is_already_running() {
        let (store, source) = setup();
        store
            .insert_queued(&NewCrawlJob::for_source(&source, TriggerSource::Schedule))
            .unwrap();
        let err = store
            .insert_queued(&NewCrawlJob::for_source(&source, TriggerSource::Manual))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyRunning { .. }));
    }

    #[test]
    fn progress_never_decreases_and_caps_below_completion() {
        let (store, source) = setup();
        let job = running(&store, &source);

        assert!(store.record_progress(&job.id, 40, 3).unwrap());
        assert!(store.record_progress(&job.id, 20, 2).unwrap());
        assert_eq!(store.get(&job.id).unwrap().progress, 40);

        assert!(store.record_progress(&job.id, 100, 0).unwrap());
        let job = store.get(&job.id).unwrap();
        assert_eq!(job.progress, MAX_RUNNING_PROGRESS);
        assert_eq!(job.documents_processed, 5);
    }

    #[test]
    fn completion_forces_full_progress_and_end_time() {
        let (store, source) = setup();
        let job = running(&store, &source);
        assert!(store.complete(&job.id, 12, now()).unwrap());

        let job = store.get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.documents_processed, 12);
        assert!(job.finished_at.is_some());

        // terminal jobs are immutable
        assert!(!store.record_progress(&job.id, 50, 1).unwrap());
        assert!(!store.fail(&job.id, FailureKind::Transient, "late", now()).unwrap());
        assert_eq!(store.get(&job.id).unwrap(), job);
    }

    #[test]
    fn failure_appends_errors_in_order() {
        let (store, source) = setup();
        let job = running(&store, &source);
        assert!(store
            .fail(&job.id, FailureKind::Permanent, "authentication failed", now())
            .unwrap());

        let job = store.get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_kind, Some(FailureKind::Permanent));
        assert_eq!(job.errors, vec!["authentication failed".to_string()]);
        assert!(job.finished_at.is_some());
        assert!(job.progress < 100);
    }

    #[test]
    fn retry_keeps_snapshot_and_bumps_attempt() {
        let (store, source) = setup();
        let job = running(&store, &source);

        let retry = store
            .fail_and_retry(&job.id, FailureKind::Transient, "connection reset", now())
            .unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.status, JobStatus::Queued);
        assert_eq!(retry.retry_of.as_ref(), Some(&job.id));
        assert_eq!(retry.triggered_by, TriggerSource::Retry);
        assert_eq!(retry.config_snapshot, job.config_snapshot);

        let failed = store.get(&job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            store.active_for_source(&source.id).unwrap().map(|j| j.id),
            Some(retry.id.clone())
        );

        // a finished job cannot be retried twice
        assert!(matches!(
            store.fail_and_retry(&job.id, FailureKind::Transient, "again", now()),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn cancel_only_applies_to_queued_jobs() {
        let (store, source) = setup();
        let job = running(&store, &source);
        assert!(!store.cancel_queued(&job.id, "cancelled by request", now()).unwrap());
        assert_eq!(store.get(&job.id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn mark_running_skips_cancelled_jobs() {
        let (store, source) = setup();
        let job = store
            .insert_queued(&NewCrawlJob::for_source(&source, TriggerSource::Manual))
            .unwrap();
        assert!(store.cancel_queued(&job.id, "cancelled by request", now()).unwrap());
        assert!(store.mark_running(&job.id, now()).unwrap().is_none());
    }

    #[test]
    fn history_queries() {
        let (store, source) = setup();
        assert_eq!(store.last_finished_at(&source.id).unwrap(), None);

        let first = running(&store, &source);
        let finished = now();
        store.complete(&first.id, 1, finished).unwrap();
        let second = store
            .insert_queued(&NewCrawlJob::for_source(&source, TriggerSource::Schedule))
            .unwrap();

        assert_eq!(store.last_finished_at(&source.id).unwrap(), Some(finished));

        let all = store.list(&JobFilter::for_source(&source.id)).unwrap();
        assert_eq!(
            all.iter().map(|j| j.id.clone()).collect::<Vec<_>>(),
            vec![second.id.clone(), first.id.clone()]
        );

        let limited = store
            .list(&JobFilter {
                limit: Some(1),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);

        assert_eq!(
            store.list_by_status(JobStatus::Queued).unwrap()[0].id,
            second.id
        );
        let counts = store.counts().unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.running, 0);
    }
}
