// Records written through one handle must survive reopening the file.

use crawler_core::{
    DataSourceConfig, DataSourceType, FailureKind, JobStatus, ScheduleFrequency, ScheduleSpec,
    TriggerSource,
};
use crawler_store::{now, Database, DataSourceRegistry, JobStore, NewCrawlJob, NewDataSource};

#[test]
fn reopen_keeps_sources_and_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crawler.db");

    let (source_id, job_id) = {
        let db = Database::open(&path).unwrap();
        let registry = DataSourceRegistry::new(db.clone());
        let jobs = JobStore::new(db);

        let source = registry
            .create(
                NewDataSource::new(
                    "Team wiki",
                    DataSourceType::Confluence,
                    DataSourceConfig::with_url("https://wiki.example.com"),
                )
                .with_schedule(ScheduleSpec::every(ScheduleFrequency::Daily)),
            )
            .unwrap();
        let job = jobs
            .insert_queued(&NewCrawlJob::for_source(&source, TriggerSource::Schedule))
            .unwrap();
        jobs.mark_running(&job.id, now()).unwrap().unwrap();
        jobs.fail(&job.id, FailureKind::Transient, "gateway timeout", now())
            .unwrap();
        (source.id, job.id)
    };

    // migrations are idempotent
    let db = Database::open(&path).unwrap();
    let registry = DataSourceRegistry::new(db.clone());
    let jobs = JobStore::new(db);

    let source = registry.get(&source_id).unwrap();
    assert_eq!(source.name, "Team wiki");
    assert_eq!(source.schedule.active_expression(), Some("0 0 * * *"));

    let job = jobs.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.errors, vec!["gateway timeout".to_string()]);
    assert_eq!(job.config_snapshot, source.config);
    assert!(jobs.active_for_source(&source_id).unwrap().is_none());
}
