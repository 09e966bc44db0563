mod common;

use std::time::Duration;

use crawler_core::{DataSourceStatus, FailureKind, JobStatus, TriggerSource};
use crawler_store::{now, Database, JobFilter, JobStore};

use common::*;

#[tokio::test]
async fn restart_fails_interrupted_jobs_and_retries_them() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crawler.db");

    let (interrupted, waiting, src_a, src_b) = {
        let db = Database::open(&path).unwrap();
        let orch = orchestrator(db.clone(), config(8, 1), Scripted::always(Step::Hang));
        let a = create(&orch, "alpha");
        let b = create(&orch, "beta");
        let interrupted = orch.trigger(&a.id).unwrap();
        let waiting = orch.trigger(&b.id).unwrap();
        // the previous process died mid-crawl
        JobStore::new(db)
            .mark_running(&interrupted.id, now())
            .unwrap()
            .unwrap();
        (interrupted, waiting, a.id, b.id)
    };

    let orch = orchestrator(
        Database::open(&path).unwrap(),
        config(8, 1),
        Scripted::always(Step::Succeed(vec![50])),
    );
    let report = orch.recover().unwrap();
    assert_eq!(report.requeued, vec![waiting.id.clone()]);
    assert_eq!(report.interrupted, vec![interrupted.id.clone()]);

    let failed = orch.get_job(&interrupted.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_kind, Some(FailureKind::RestartRecovery));
    assert!(!failed.errors.is_empty());

    let jobs = orch.list_jobs(&JobFilter::for_source(&src_a)).unwrap();
    assert_eq!(jobs.len(), 2);
    let retry = &jobs[0];
    assert_eq!(retry.status, JobStatus::Queued);
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.triggered_by, TriggerSource::Retry);
    assert_eq!(retry.retry_of.as_ref(), Some(&interrupted.id));
    assert_eq!(orch.get_source(&src_a).unwrap().status, DataSourceStatus::Syncing);
    assert_eq!(orch.overview().unwrap().queue_depth, 2);

    orch.start();
    assert_eq!(wait_terminal(&orch, &waiting.id).await.status, JobStatus::Completed);
    assert_eq!(wait_terminal(&orch, &retry.id).await.status, JobStatus::Completed);
    orch.shutdown().await;

    assert_eq!(orch.get_source(&src_a).unwrap().status, DataSourceStatus::Active);
    assert_eq!(orch.get_source(&src_b).unwrap().status, DataSourceStatus::Active);
}

#[tokio::test]
async fn recovered_queue_keeps_order_and_ignores_capacity() {
    let db = memory();
    let first = orchestrator(db.clone(), config(8, 1), Scripted::always(Step::Hang));
    let queued: Vec<_> = ["one", "two", "three"]
        .iter()
        .map(|name| {
            let source = create(&first, name);
            first.trigger(&source.id).unwrap().id
        })
        .collect();
    drop(first);

    let orch = orchestrator(db, config(1, 1), Scripted::always(Step::Succeed(vec![])));
    let report = orch.recover().unwrap();
    assert_eq!(report.requeued, queued);
    assert!(report.interrupted.is_empty());
    assert_eq!(orch.overview().unwrap().queue_depth, 3);

    orch.start();
    let mut started = Vec::new();
    for id in &queued {
        let job = wait_terminal(&orch, id).await;
        started.push(job.started_at.unwrap());
    }
    orch.shutdown().await;
    assert!(started.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn shutdown_abandons_crawls_that_outlive_the_grace_period() {
    let db = memory();
    let mut cfg = config(8, 1);
    cfg.dispatch.shutdown_grace_secs = 0;
    let orch = orchestrator(db.clone(), cfg, Scripted::always(Step::Hang));
    let source = create(&orch, "endless");

    orch.start();
    let job = orch.trigger(&source.id).unwrap();
    wait_for_job(&orch, &job.id, |j| j.status == JobStatus::Running).await;

    tokio::time::timeout(Duration::from_secs(2), orch.shutdown())
        .await
        .unwrap();
    assert_eq!(orch.get_job(&job.id).unwrap().status, JobStatus::Running);
    assert_eq!(orch.running_count(), 0);

    let restarted = orchestrator(db, config(8, 1), Scripted::always(Step::Succeed(vec![])));
    let report = restarted.recover().unwrap();
    assert_eq!(report.interrupted, vec![job.id.clone()]);

    let jobs = restarted.list_jobs(&JobFilter::for_source(&source.id)).unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[1].failure_kind, Some(FailureKind::RestartRecovery));

    restarted.start();
    wait_terminal(&restarted, &jobs[0].id).await;
    restarted.shutdown().await;
    assert_eq!(
        restarted.get_source(&source.id).unwrap().status,
        DataSourceStatus::Active
    );
}
