//! Background poller: wakes on an exponential schedule, advances each due
//! search's state machine, and fetches+reconciles results once the upstream
//! service reports `COMPLETED`. Mirrors `fusillade`'s own daemon loop shape
//! (claim a batch, dispatch, sleep, repeat) but driving MerchantSearch
//! transitions instead of HTTP request execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::BulkSearchClient;
use crate::error::{BscError, Result};
use crate::manager::{AnySearch, SearchStore};
use crate::state::SearchState;
use crate::types::{SearchId, UpstreamStatus};

/// Hands reconciled matches back to the durable Record store. Implemented by
/// the enrichment orchestrator so `bsc` never depends on the Batch/Record
/// schema directly.
#[async_trait]
pub trait ResultReconciler: Send + Sync {
    async fn reconcile(&self, search: &AnySearch) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct PollSchedule {
    pub initial_delay: Duration,
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    pub hard_deadline: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            base: Duration::from_secs(30),
            max: Duration::from_secs(120),
            max_attempts: 40,
            hard_deadline: Duration::from_secs(45 * 60),
        }
    }
}

impl PollSchedule {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs().saturating_mul(1u64 << attempt.min(8));
        Duration::from_secs(scaled.min(self.max.as_secs()))
    }
}

pub struct Poller<St: SearchStore, C: BulkSearchClient, R: ResultReconciler> {
    store: Arc<St>,
    client: Arc<C>,
    reconciler: Arc<R>,
    schedule: PollSchedule,
    tick_interval: Duration,
    results_page_size: usize,
}

impl<St: SearchStore + 'static, C: BulkSearchClient + 'static, R: ResultReconciler + 'static> Poller<St, C, R> {
    pub fn new(store: Arc<St>, client: Arc<C>, reconciler: Arc<R>, schedule: PollSchedule) -> Self {
        Self { store, client, reconciler, schedule, tick_interval: Duration::from_secs(10), results_page_size: 500 }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        tracing::info!("merchant search poller starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("merchant search poller shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.tick_interval) => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "poller tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let due = self.store.list_due_for_poll(100).await?;
        for search in due {
            if let Err(e) = self.advance(search).await {
                tracing::warn!(error = %e, "failed to advance merchant search");
            }
        }
        Ok(())
    }

    async fn advance(&self, search: AnySearch) -> Result<()> {
        match search {
            AnySearch::Submitted(s) => {
                let elapsed = chrono::Utc::now() - s.state.submitted_at;
                if elapsed >= chrono::Duration::from_std(self.schedule.initial_delay).unwrap_or_default() {
                    let polling = s.start_polling(self.schedule.max_attempts, self.store.as_ref()).await?;
                    self.poll_once(polling).await
                } else {
                    Ok(())
                }
            }
            AnySearch::Polling(s) => self.poll_once(s).await,
            _ => Ok(()),
        }
    }

    async fn poll_once(&self, search: crate::search::Search<crate::state::Polling>) -> Result<()> {
        let search_id = search.search_id();
        let submitted_at = search.state.submitted_at;
        let elapsed = chrono::Utc::now() - submitted_at;
        if search.exhausted() || elapsed >= chrono::Duration::from_std(self.schedule.hard_deadline).unwrap_or_default() {
            let timed_out = search.mark_timed_out(self.store.as_ref()).await?;
            tracing::warn!(%search_id, "merchant search timed out");
            self.reconciler.reconcile(&AnySearch::Timeout(timed_out)).await?;
            return Ok(());
        }

        match self.client.status(search_id).await {
            Ok(UpstreamStatus::Completed) => {
                let fetching = search.fetch_results().await?;
                self.fetch_and_reconcile(search_id, "polling", fetching).await
            }
            Ok(UpstreamStatus::Cancelled | UpstreamStatus::Failed) => {
                let fetching = search.fetch_results().await?;
                let failed = fetching.fail("polling", "upstream reported cancelled/failed".to_string(), self.store.as_ref()).await?;
                self.reconciler.reconcile(&AnySearch::Failed(failed)).await?;
                Ok(())
            }
            Ok(UpstreamStatus::Pending | UpstreamStatus::InProgress) => {
                search.record_poll_attempt(self.store.as_ref()).await?;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                tracing::debug!(%search_id, error = %e, "transient polling error, will retry next tick");
                search.record_poll_attempt(self.store.as_ref()).await?;
                Ok(())
            }
            Err(e) => {
                let fetching = search.fetch_results().await?;
                let failed = fetching.fail("polling", e.to_string(), self.store.as_ref()).await?;
                self.reconciler.reconcile(&AnySearch::Failed(failed)).await?;
                Ok(())
            }
        }
    }

    /// Called from either the poller (`prev = "polling"`) or the webhook
    /// handler (`prev = "webhook_received"`) once the upstream status is
    /// known to be terminal-complete.
    pub async fn fetch_and_reconcile(
        &self,
        search_id: SearchId,
        prev_state_name: &'static str,
        fetching: crate::search::Search<crate::state::FetchingResults>,
    ) -> Result<()> {
        let mut matches = Vec::new();
        let mut offset = 0usize;
        loop {
            match self.client.results_page(search_id, offset, self.results_page_size).await {
                Ok(page) => {
                    let got_more = page.has_more;
                    matches.extend(page.matches);
                    if !got_more {
                        break;
                    }
                    offset += self.results_page_size;
                }
                Err(BscError::ResultsNotFoundAfterCompleted(_)) if offset == 0 => {
                    let no_results = fetching.no_results(prev_state_name, self.store.as_ref()).await?;
                    let any = AnySearch::NoResults(no_results);
                    self.reconciler.reconcile(&any).await?;
                    return Ok(());
                }
                Err(e) => {
                    let failed = fetching.fail(prev_state_name, e.to_string(), self.store.as_ref()).await?;
                    self.reconciler.reconcile(&AnySearch::Failed(failed)).await?;
                    return Ok(());
                }
            }
        }

        let completed = fetching.complete(prev_state_name, matches, self.store.as_ref()).await?;
        let any = AnySearch::Completed(completed);
        self.reconciler.reconcile(&any).await?;
        tracing::info!(%search_id, "merchant search reconciled");
        Ok(())
    }

    /// Entry point for the webhook handler: the durable dedup insert must
    /// already have happened (so a 2xx can be returned immediately even if
    /// this call is slow); this drives the state transition and results fetch.
    pub async fn handle_webhook(&self, search_id: SearchId) -> Result<()> {
        let search = self.store.get_by_id(search_id).await?;
        match search {
            Some(AnySearch::Submitted(s)) => {
                let webhook = s.receive_webhook(self.store.as_ref()).await?;
                self.drive_webhook_result(webhook).await
            }
            Some(AnySearch::Polling(s)) => {
                let webhook = s.receive_webhook(self.store.as_ref()).await?;
                self.drive_webhook_result(webhook).await
            }
            Some(other) if other.is_terminal() => {
                tracing::debug!(%search_id, "webhook for already-terminal search, dropped");
                Ok(())
            }
            Some(_) | None => Ok(()),
        }
    }

    async fn drive_webhook_result(&self, webhook: crate::search::Search<crate::state::WebhookReceived>) -> Result<()> {
        let search_id = webhook.search_id();
        match self.client.status(search_id).await {
            Ok(UpstreamStatus::Completed) => {
                let fetching = webhook.fetch_results(self.store.as_ref()).await?;
                self.fetch_and_reconcile(search_id, "webhook_received", fetching).await
            }
            _ => {
                // Status not yet terminal on the service's side despite the
                // webhook; leave it in webhook_received for the next event
                // or for the poller to eventually time it out.
                Ok(())
            }
        }
    }
}
