//! Storage trait for MerchantSearch persistence.
//!
//! Shaped like `fusillade`'s own `Storage` trait: typed, transition-carrying
//! operations rather than a generic key-value CRUD surface, so the state
//! machine in `transitions.rs` is the only code path that can move a search
//! between states.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::search::{Search, SearchData};
use crate::state::{Completed, Failed, NoResults, Polling, Submitted, Timeout, WebhookReceived};
use crate::types::SearchId;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Any persisted search, returned from lookups where the caller doesn't
/// statically know which DAG node it's in (e.g. reading back after a crash
/// to resume polling).
#[derive(Debug, Clone)]
pub enum AnySearch {
    Submitted(Search<Submitted>),
    Polling(Search<Polling>),
    WebhookReceived(Search<WebhookReceived>),
    Completed(Search<Completed>),
    NoResults(Search<NoResults>),
    Failed(Search<Failed>),
    Timeout(Search<Timeout>),
}

impl AnySearch {
    pub fn search_id(&self) -> SearchId {
        match self {
            AnySearch::Submitted(s) => s.search_id(),
            AnySearch::Polling(s) => s.search_id(),
            AnySearch::WebhookReceived(s) => s.search_id(),
            AnySearch::Completed(s) => s.search_id(),
            AnySearch::NoResults(s) => s.search_id(),
            AnySearch::Failed(s) => s.search_id(),
            AnySearch::Timeout(s) => s.search_id(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnySearch::Completed(_) | AnySearch::NoResults(_) | AnySearch::Failed(_) | AnySearch::Timeout(_)
        )
    }
}

#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Look up an existing in-flight or completed search for this
    /// `(batch_id, content_hash)`, used by the submit path to enforce the
    /// de-duplication invariant before creating a new row.
    async fn find_by_content_hash(&self, batch_id: Uuid, content_hash: &str) -> Result<Option<AnySearch>>;

    /// Atomically create the `submitted` row. Returns `DuplicateSubmission`
    /// if a concurrent writer already inserted one for the same key — the
    /// caller should fetch and use that row instead (§4.5.5).
    async fn create_submitted(&self, data: SearchData) -> Result<Search<Submitted>>;

    /// Roll back a submission that the upstream service rejected with a
    /// non-2xx response, so no orphan search row survives a failed submit.
    async fn discard(&self, search_id: SearchId) -> Result<()>;

    async fn get_by_id(&self, search_id: SearchId) -> Result<Option<AnySearch>>;

    /// List every search for a batch that has not yet reached a terminal
    /// state — used by EO's completion check (a Batch cannot complete while
    /// any of its searches are open).
    async fn list_open_for_batch(&self, batch_id: Uuid) -> Result<Vec<AnySearch>>;

    /// List searches due for a poll tick (next poll time has elapsed and the
    /// search is not terminal), used by the poller daemon on each wake-up.
    async fn list_due_for_poll(&self, limit: usize) -> Result<Vec<AnySearch>>;

    // -- CAS persistence, one per transition target --
    async fn persist_submitted(&self, search: &Search<Submitted>) -> Result<()>;
    async fn persist_polling(&self, prev_state_name: &'static str, search: &Search<Polling>) -> Result<()>;
    async fn persist_webhook_received(&self, prev_state_name: &'static str, search: &Search<WebhookReceived>) -> Result<()>;
    async fn persist_completed(&self, prev_state_name: &'static str, search: &Search<Completed>) -> Result<()>;
    async fn persist_no_results(&self, prev_state_name: &'static str, search: &Search<NoResults>) -> Result<()>;
    async fn persist_failed(&self, prev_state_name: &'static str, search: &Search<Failed>) -> Result<()>;
    async fn persist_timeout(&self, prev_state_name: &'static str, search: &Search<Timeout>) -> Result<()>;

    /// Durable, unique insert of a webhook `event_id`. Returns `false` if the
    /// event was already processed (idempotent dedup, §3 WebhookEvent
    /// invariant); the caller must treat `false` as success-no-op, never as
    /// an error.
    async fn dedup_webhook_event(&self, event_id: Uuid, search_id: SearchId, payload: serde_json::Value) -> Result<bool>;

    /// Mark every open search for a batch `cancelled` so late webhooks/polls
    /// observe a terminal state and are dropped (§4.5.5 cancellation
    /// quiescence).
    async fn cancel_batch_searches(&self, batch_id: Uuid) -> Result<()>;
}
