use chrono::{DateTime, Utc};
use crawler_core::{CrawlSchedule, CrawlerError, DataSourceId, DataSourceStatus};
use rusqlite::OptionalExtension;
use tracing::{debug, info, instrument};

use crate::db::{enum_column, json_column, now, opt_timestamp, parse_ts, timestamp, ts, Database};
use crate::error::{Result, StoreError};
use crate::types::{DataSource, DataSourceFilter, DataSourceUpdate, NewDataSource, SourceOverview};

const SOURCE_COLUMNS: &str = "id, name, source_type, config, schedule_enabled, cron_expression,
     status, documents_count, last_crawl, created_at, updated_at";

/// Aggregate status as a function of job history: `syncing` while a job runs
/// or a retry waits, otherwise the outcome of the latest terminal job. A
/// source without history keeps its current status.
const PROJECTED_STATUS: &str = "CASE
    WHEN EXISTS (SELECT 1 FROM crawl_jobs j
                 WHERE j.source_id = data_sources.id
                   AND (j.status = 'running'
                        OR (j.status = 'queued' AND j.triggered_by = 'retry')))
        THEN 'syncing'
    ELSE COALESCE((SELECT CASE j.status WHEN 'completed' THEN 'active' ELSE 'error' END
                   FROM crawl_jobs j
                   WHERE j.source_id = data_sources.id
                     AND j.status IN ('completed', 'failed')
                   ORDER BY j.finished_at DESC, j.seq DESC
                   LIMIT 1), status)
END";

/// CRUD store of data source definitions.
///
/// The registry owns every `DataSource` row; other components hold ids.
/// `status`, `documents_count` and `last_crawl` are only written through
/// [`refresh_status`](Self::refresh_status) and
/// [`record_completion`](Self::record_completion), which belong to the
/// status projector. Both recompute `status` from the job table in the same
/// statement, so a projection that lands late cannot resurrect a stale
/// status.
#[derive(Clone)]
pub struct DataSourceRegistry {
    db: Database,
}

impl DataSourceRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validate and insert a new source. New sources start `inactive`.
    #[instrument(skip(self, new), fields(name = %new.name, source_type = %new.source_type))]
    pub fn create(&self, new: NewDataSource) -> Result<DataSource> {
        let name = validate_name(&new.name)?;
        new.source_type.validate_config(&new.config)?;
        let schedule = new.schedule.resolve()?;
        let config_json = serde_json::to_string(&new.config)?;

        let id = DataSourceId::generate();
        let created = now();

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO data_sources
             (id, name, source_type, config, schedule_enabled, cron_expression,
              status, documents_count, last_crawl, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'inactive', 0, NULL, ?7, ?7)",
            rusqlite::params![
                id.as_str(),
                name,
                new.source_type.as_str(),
                config_json,
                schedule.enabled,
                schedule.cron_expression,
                ts(created),
            ],
        )?;
        info!(source_id = %id, "data source created");

        Ok(DataSource {
            id,
            name,
            source_type: new.source_type,
            config: new.config,
            schedule,
            status: DataSourceStatus::Inactive,
            documents_count: 0,
            last_crawl: None,
            created_at: created,
            updated_at: created,
        })
    }

    #[instrument(skip(self), fields(source_id = %id))]
    pub fn get(&self, id: &DataSourceId) -> Result<DataSource> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {SOURCE_COLUMNS} FROM data_sources WHERE id = ?1"),
            [id.as_str()],
            row_to_source,
        )
        .optional()?
        .ok_or_else(|| StoreError::SourceNotFound { id: id.to_string() })
    }

    /// List sources matching `filter`, oldest first.
    #[instrument(skip(self))]
    pub fn list(&self, filter: &DataSourceFilter) -> Result<Vec<DataSource>> {
        let search = filter
            .search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR source_type = ?2)
               AND (?3 = 0 OR schedule_enabled = 1)
               AND (?4 IS NULL
                    OR instr(lower(name), ?4) > 0
                    OR instr(source_type, ?4) > 0)
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![
                filter.status.map(|s| s.as_str()),
                filter.source_type.map(|t| t.as_str()),
                filter.scheduled_only,
                search,
            ],
            row_to_source,
        )?;
        let sources = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sources)
    }

    /// Apply a partial update. Jobs already created keep their own config
    /// snapshot, so this never changes what an in-flight crawl does.
    #[instrument(skip(self, update), fields(source_id = %id))]
    pub fn update(&self, id: &DataSourceId, update: DataSourceUpdate) -> Result<DataSource> {
        let current = self.get(id)?;

        let name = match update.name {
            Some(ref n) => validate_name(n)?,
            None => current.name,
        };
        let config = update.config.unwrap_or(current.config);
        current.source_type.validate_config(&config)?;
        let schedule: CrawlSchedule = match update.schedule {
            Some(spec) => spec.resolve()?,
            None => current.schedule,
        };
        let config_json = serde_json::to_string(&config)?;

        {
            let conn = self.db.lock();
            let n = conn.execute(
                "UPDATE data_sources
                 SET name = ?1, config = ?2, schedule_enabled = ?3,
                     cron_expression = ?4, updated_at = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    name,
                    config_json,
                    schedule.enabled,
                    schedule.cron_expression,
                    ts(now()),
                    id.as_str(),
                ],
            )?;
            if n == 0 {
                return Err(StoreError::SourceNotFound { id: id.to_string() });
            }
        }
        info!(source_id = %id, "data source updated");
        self.get(id)
    }

    /// Delete a source. Refused with `Conflict` while a job for it is queued
    /// or running; the check and the delete are one statement.
    ///
    /// Job history is retained.
    #[instrument(skip(self), fields(source_id = %id))]
    pub fn delete(&self, id: &DataSourceId) -> Result<()> {
        let conn = self.db.lock();
        let n = conn.execute(
            "DELETE FROM data_sources
             WHERE id = ?1
               AND NOT EXISTS (SELECT 1 FROM crawl_jobs
                               WHERE source_id = ?1 AND status IN ('queued', 'running'))",
            [id.as_str()],
        )?;
        if n == 0 {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM data_sources WHERE id = ?1)",
                [id.as_str()],
                |row| row.get(0),
            )?;
            return Err(if exists {
                StoreError::Conflict {
                    reason: format!("data source {id} has a queued or running job"),
                }
            } else {
                StoreError::SourceNotFound { id: id.to_string() }
            });
        }
        info!(source_id = %id, "data source deleted");
        Ok(())
    }

    /// Recompute the aggregate status from job history. Reserved for the
    /// status projector.
    #[instrument(skip(self), fields(source_id = %id))]
    pub fn refresh_status(&self, id: &DataSourceId) -> Result<DataSourceStatus> {
        let conn = self.db.lock();
        let status: Option<String> = conn
            .query_row(
                &format!(
                    "UPDATE data_sources SET status = {PROJECTED_STATUS}, updated_at = ?1
                     WHERE id = ?2
                     RETURNING status"
                ),
                rusqlite::params![ts(now()), id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let status = projected(id, status)?;
        debug!(%status, "status projected");
        Ok(status)
    }

    /// Project a successful crawl in one write: `documents` added to the
    /// running total, `last_crawl` advanced to `at` and the status
    /// recomputed. Reserved for the status projector.
    #[instrument(skip(self), fields(source_id = %id))]
    pub fn record_completion(
        &self,
        id: &DataSourceId,
        documents: u64,
        at: DateTime<Utc>,
    ) -> Result<DataSourceStatus> {
        let conn = self.db.lock();
        let status: Option<String> = conn
            .query_row(
                &format!(
                    "UPDATE data_sources
                     SET status = {PROJECTED_STATUS},
                         last_crawl = CASE WHEN last_crawl IS NULL OR last_crawl < ?1
                                           THEN ?1 ELSE last_crawl END,
                         documents_count = documents_count + ?2,
                         updated_at = ?3
                     WHERE id = ?4
                     RETURNING status"
                ),
                rusqlite::params![ts(at), documents as i64, ts(now()), id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        projected(id, status)
    }

    /// Dashboard counters.
    pub fn overview(&self) -> Result<SourceOverview> {
        let conn = self.db.lock();
        let overview = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'active'), 0),
                    COALESCE(SUM(status = 'inactive'), 0),
                    COALESCE(SUM(status = 'syncing'), 0),
                    COALESCE(SUM(status = 'error'), 0),
                    COALESCE(SUM(documents_count), 0),
                    MAX(last_crawl)
             FROM data_sources",
            [],
            |row| {
                Ok(SourceOverview {
                    total: row.get::<_, i64>(0)? as u64,
                    active: row.get::<_, i64>(1)? as u64,
                    inactive: row.get::<_, i64>(2)? as u64,
                    syncing: row.get::<_, i64>(3)? as u64,
                    error: row.get::<_, i64>(4)? as u64,
                    total_documents: row.get::<_, i64>(5)? as u64,
                    last_crawl: row
                        .get::<_, Option<String>>(6)?
                        .map(|raw| parse_ts(6, &raw))
                        .transpose()?,
                })
            },
        )?;
        Ok(overview)
    }
}

fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CrawlerError::validation("name must not be empty").into());
    }
    Ok(trimmed.to_string())
}

fn row_to_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataSource> {
    Ok(DataSource {
        id: DataSourceId::from(row.get::<_, String>(0)?),
        name: row.get(1)?,
        source_type: enum_column(row, 2)?,
        config: json_column(row, 3)?,
        schedule: CrawlSchedule {
            enabled: row.get(4)?,
            cron_expression: row.get(5)?,
        },
        status: enum_column(row, 6)?,
        documents_count: row.get::<_, i64>(7)? as u64,
        last_crawl: opt_timestamp(row, 8)?,
        created_at: timestamp(row, 9)?,
        updated_at: timestamp(row, 10)?,
    })
}

fn projected(id: &DataSourceId, status: Option<String>) -> Result<DataSourceStatus> {
    let status = status.ok_or_else(|| StoreError::SourceNotFound { id: id.to_string() })?;
    Ok(status.parse::<DataSourceStatus>()?)
}
