#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crawler_core::config::CrawlerConfig;
use crawler_core::{DataSourceConfig, DataSourceId, DataSourceStatus, DataSourceType, JobId};
use crawler_engine::{
    CapabilitySet, CrawlCapability, CrawlContext, CrawlError, CrawlOutcome, Orchestrator,
};
use crawler_store::{CrawlJob, DataSource, Database, JobFilter, NewDataSource};
use tokio::sync::Semaphore;

/// What the scripted crawler does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Report progress in the given percentages, one document each, then succeed.
    Succeed(Vec<u8>),
    Transient,
    Permanent,
    /// Block until [`Scripted::release`] is called, then succeed with one document.
    Gated,
    /// Block until released, then fail transiently.
    GatedTransient,
    /// Sleep, then succeed with one document.
    Sleep(Duration),
    /// Spin on checkpoints until cancelled.
    Hang,
}

/// Test capability driven by a script of steps; the last step repeats.
pub struct Scripted {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    gate: Semaphore,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<DataSourceConfig>>,
}

impl Scripted {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        let steps: VecDeque<Step> = steps.into_iter().collect();
        let fallback = steps.back().cloned().unwrap_or(Step::Succeed(vec![]));
        Arc::new(Self {
            steps: Mutex::new(steps),
            fallback,
            gate: Semaphore::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn always(step: Step) -> Arc<Self> {
        Self::new([step])
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Highest number of simultaneous `fetch` calls seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Configs passed to `fetch`, in call order.
    pub fn calls(&self) -> Vec<DataSourceConfig> {
        self.calls.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn run(&self, step: Step, ctx: &CrawlContext) -> Result<CrawlOutcome, CrawlError> {
        match step {
            Step::Succeed(percents) => {
                for pct in &percents {
                    ctx.report(*pct, 1)?;
                    tokio::task::yield_now().await;
                }
                Ok(CrawlOutcome {
                    documents_processed: percents.len() as u64,
                })
            }
            Step::Transient => Err(CrawlError::transient("connection reset by peer")),
            Step::Permanent => Err(CrawlError::permanent("authentication failed (401)")),
            Step::Gated => {
                self.gate
                    .acquire()
                    .await
                    .map_err(|e| CrawlError::permanent(e.to_string()))?
                    .forget();
                Ok(CrawlOutcome {
                    documents_processed: 1,
                })
            }
            Step::GatedTransient => {
                self.gate
                    .acquire()
                    .await
                    .map_err(|e| CrawlError::permanent(e.to_string()))?
                    .forget();
                Err(CrawlError::transient("upstream returned 503"))
            }
            Step::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(CrawlOutcome {
                    documents_processed: 1,
                })
            }
            Step::Hang => loop {
                ctx.checkpoint()?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
        }
    }
}

#[async_trait]
impl CrawlCapability for Scripted {
    async fn fetch(
        &self,
        config: &DataSourceConfig,
        ctx: &CrawlContext,
    ) -> Result<CrawlOutcome, CrawlError> {
        self.calls.lock().unwrap().push(config.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let step = self.next_step();
        let result = self.run(step, ctx).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn config(capacity: usize, workers: usize) -> CrawlerConfig {
    let mut config = CrawlerConfig::default();
    config.scheduler.enabled = false;
    config.queue.capacity = capacity;
    config.dispatch.max_concurrent_jobs = workers;
    config.dispatch.shutdown_grace_secs = 5;
    config.executor.timeout_secs = 10;
    config.executor.max_attempts = 3;
    config
}

pub fn orchestrator(db: Database, config: CrawlerConfig, crawler: Arc<Scripted>) -> Orchestrator {
    let capabilities = CapabilitySet::new().with(DataSourceType::Website, crawler);
    Orchestrator::new(db, config, capabilities)
}

pub fn memory() -> Database {
    Database::open_in_memory().unwrap()
}

pub fn website(name: &str) -> NewDataSource {
    NewDataSource::new(
        name,
        DataSourceType::Website,
        DataSourceConfig::with_url(format!("https://{name}.example.com")),
    )
}

pub fn create(orch: &Orchestrator, name: &str) -> DataSource {
    orch.create_source(website(name)).unwrap()
}

/// Poll until `job_id` satisfies `pred`, failing after five seconds.
pub async fn wait_for_job(
    orch: &Orchestrator,
    job_id: &JobId,
    pred: impl Fn(&CrawlJob) -> bool,
) -> CrawlJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = orch.get_job(job_id).unwrap();
        if pred(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on job {job_id}: {job:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_terminal(orch: &Orchestrator, job_id: &JobId) -> CrawlJob {
    wait_for_job(orch, job_id, |job| job.status.is_terminal()).await
}

/// Poll until the source reaches `status`, failing after five seconds.
pub async fn wait_source_status(orch: &Orchestrator, id: &DataSourceId, status: DataSourceStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let source = orch.get_source(id).unwrap();
        if source.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {id} to become {status}: {source:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the source has `count` jobs and the newest is terminal.
pub async fn wait_history(orch: &Orchestrator, id: &DataSourceId, count: usize) -> Vec<CrawlJob> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let jobs = orch.list_jobs(&JobFilter::for_source(id)).unwrap();
        if jobs.len() == count && jobs[0].status.is_terminal() {
            return jobs;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} finished jobs on {id}: {jobs:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
