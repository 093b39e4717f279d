//! HTTP protocol client for the external bulk-search service (§4.5.1).
//!
//! Kept as a narrow trait (`BulkSearchClient`) so the coordinator and its
//! tests depend on the wire *contract*, not on `reqwest` directly — the same
//! separation `fusillade`'s own `HttpClient` trait draws between the daemon
//! and its transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BscError, Result};
use crate::signer::Signer;
use crate::types::{SearchId, SearchItem, SearchMatch, UpstreamStatus};

#[derive(Debug, Clone, Serialize)]
struct SubmitRequest<'a> {
    items: &'a [SearchItem],
}

#[derive(Debug, Clone, Deserialize)]
struct SubmitResponse {
    search_id: uuid::Uuid,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusResponse {
    status: UpstreamStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct ResultsPage {
    items: Vec<SearchMatch>,
    #[serde(default)]
    total: Option<usize>,
}

pub struct ResultsBatch {
    pub matches: Vec<SearchMatch>,
    pub has_more: bool,
}

#[async_trait]
pub trait BulkSearchClient: Send + Sync {
    async fn submit(&self, items: &[SearchItem]) -> Result<SearchId>;
    async fn status(&self, search_id: SearchId) -> Result<UpstreamStatus>;
    async fn results_page(&self, search_id: SearchId, offset: usize, limit: usize) -> Result<ResultsBatch>;
}

#[derive(Clone, Copy, Debug)]
pub enum MastercardEnv {
    Production,
    Sandbox,
}

impl MastercardEnv {
    fn base_url(self) -> &'static str {
        match self {
            MastercardEnv::Production => "https://api.mastercard.com/track/search",
            MastercardEnv::Sandbox => "https://sandbox.api.mastercard.com/track/search",
        }
    }
}

pub struct ReqwestBulkSearchClient {
    http: reqwest::Client,
    signer: Arc<dyn Signer>,
    base_url: String,
    submit_timeout: Duration,
    status_timeout: Duration,
    results_timeout: Duration,
}

impl ReqwestBulkSearchClient {
    pub fn new(env: MastercardEnv, signer: Arc<dyn Signer>) -> Self {
        Self {
            http: reqwest::Client::new(),
            signer,
            base_url: env.base_url().to_string(),
            submit_timeout: Duration::from_secs(10),
            status_timeout: Duration::from_secs(10),
            results_timeout: Duration::from_secs(30),
        }
    }

    fn map_status(status: reqwest::StatusCode, retry_after: Option<u64>, body: &str) -> BscError {
        match status.as_u16() {
            401 | 403 => BscError::AuthError(body.to_string()),
            429 => BscError::RateLimited { retry_after_secs: retry_after },
            500..=599 => BscError::ServerError(format!("{status}: {body}")),
            _ => BscError::ServerError(format!("unexpected status {status}: {body}")),
        }
    }

    fn retry_after_secs(resp: &reqwest::Response) -> Option<u64> {
        resp.headers().get(reqwest::header::RETRY_AFTER).and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok())
    }
}

#[async_trait]
impl BulkSearchClient for ReqwestBulkSearchClient {
    async fn submit(&self, items: &[SearchItem]) -> Result<SearchId> {
        let url = format!("{}/bulk-searches", self.base_url);
        let body = serde_json::to_vec(&SubmitRequest { items }).map_err(|e| BscError::Other(e.into()))?;
        let auth = self.signer.sign("POST", &url, &[], Some(&body))?;

        let resp = self
            .http
            .post(&url)
            .header("Authorization", auth)
            .header("Content-Type", "application/json")
            .timeout(self.submit_timeout)
            .body(body)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::ACCEPTED {
            let parsed: SubmitResponse = resp.json().await?;
            Ok(SearchId(parsed.search_id))
        } else {
            let retry_after = Self::retry_after_secs(&resp);
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(Self::map_status(status, retry_after, &body))
        }
    }

    async fn status(&self, search_id: SearchId) -> Result<UpstreamStatus> {
        let url = format!("{}/bulk-searches/{}", self.base_url, search_id.0);
        let auth = self.signer.sign("GET", &url, &[], None)?;
        let resp = self.http.get(&url).header("Authorization", auth).timeout(self.status_timeout).send().await?;

        if resp.status().is_success() {
            let parsed: StatusResponse = resp.json().await?;
            Ok(parsed.status)
        } else {
            let retry_after = Self::retry_after_secs(&resp);
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(Self::map_status(status, retry_after, &body))
        }
    }

    async fn results_page(&self, search_id: SearchId, offset: usize, limit: usize) -> Result<ResultsBatch> {
        let url = format!("{}/bulk-searches/{}/results", self.base_url, search_id.0);
        // The protocol requires the empty `search_request_id=` query parameter
        // to be present even when there is no per-request filter — omitting
        // it is a documented cause of `RESULTS_NOT_FOUND` false negatives.
        let offset_s = offset.to_string();
        let limit_s = limit.to_string();
        let query: [(&str, &str); 3] = [("search_request_id", ""), ("offset", &offset_s), ("limit", &limit_s)];
        let auth = self.signer.sign("GET", &url, &query, None)?;

        let resp = self
            .http
            .get(&url)
            .header("Authorization", auth)
            .query(&query)
            .timeout(self.results_timeout)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BscError::ResultsNotFoundAfterCompleted(search_id));
        }
        if !resp.status().is_success() {
            let retry_after = Self::retry_after_secs(&resp);
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, retry_after, &body));
        }

        let page: ResultsPage = resp.json().await?;
        let has_more = match page.total {
            Some(total) => offset + page.items.len() < total,
            None => !page.items.is_empty() && page.items.len() >= limit,
        };
        Ok(ResultsBatch { matches: page.items, has_more })
    }
}
