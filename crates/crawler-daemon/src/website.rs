use std::time::Duration;

use async_trait::async_trait;
use crawler_core::config::HttpConfig;
use crawler_core::DataSourceConfig;
use crawler_engine::{CrawlCapability, CrawlContext, CrawlError, CrawlOutcome};
use reqwest::StatusCode;
use tracing::debug;

/// Fetches a website source's base URL and counts it as one document.
pub struct WebsiteCrawler {
    client: reqwest::Client,
}

impl WebsiteCrawler {
    pub fn new(config: &HttpConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CrawlCapability for WebsiteCrawler {
    async fn fetch(
        &self,
        config: &DataSourceConfig,
        ctx: &CrawlContext,
    ) -> Result<CrawlOutcome, CrawlError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| CrawlError::permanent("website source has no url"))?;
        ctx.checkpoint()?;

        debug!(job_id = %ctx.job_id(), %url, "fetching page");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CrawlError::transient(format!("request to {url} failed: {e}")))?;

        if let Some(err) = classify(resp.status(), url) {
            return Err(err);
        }
        ctx.report(50, 0)?;

        let body = resp
            .bytes()
            .await
            .map_err(|e| CrawlError::transient(format!("reading {url} failed: {e}")))?;
        debug!(job_id = %ctx.job_id(), bytes = body.len(), "page fetched");
        ctx.report(99, 1)?;

        Ok(CrawlOutcome {
            documents_processed: 1,
        })
    }
}

/// Map a non-success status to a crawl error. Auth and missing pages will
/// not fix themselves; timeouts, throttling and server errors might.
fn classify(status: StatusCode, url: &str) -> Option<CrawlError> {
    if status.is_success() {
        return None;
    }
    let message = format!("{url} returned {status}");
    let retryable = matches!(
        status,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
    ) || status.is_server_error();
    Some(if retryable {
        CrawlError::Transient(message)
    } else {
        CrawlError::Permanent(message)
    })
}
