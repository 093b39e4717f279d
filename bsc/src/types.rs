//! Core value types for the bulk-search coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// External search identifier, assigned by the bulk-search service on submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchId(pub Uuid);

impl From<Uuid> for SearchId {
    fn from(uuid: Uuid) -> Self {
        SearchId(uuid)
    }
}

impl std::fmt::Display for SearchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Client-chosen correlation id carried on every item of a submission and
/// echoed back on every result row. Assigned once per record per submission
/// and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientReferenceId(pub Uuid);

impl From<Uuid> for ClientReferenceId {
    fn from(uuid: Uuid) -> Self {
        ClientReferenceId(uuid)
    }
}

/// One query item submitted in a bulk-search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    pub client_reference_id: ClientReferenceId,
    pub business_name: String,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

/// One candidate match the service returned for a single `client_reference_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMatch {
    pub client_reference_id: ClientReferenceId,
    pub merchant_id: String,
    pub business_name: String,
    pub tax_id: Option<String>,
    pub mcc: Option<String>,
    pub mcc_group: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub confidence_band: ConfidenceBand,
    pub confidence: f64,
}

/// The service's status token for a search, as returned from the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpstreamStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

/// Maps each submitted record to its assigned `client_reference_id`. Immutable
/// once a search is submitted.
pub type RecordIdMapping = HashMap<Uuid, ClientReferenceId>;

/// One item's selected best-match outcome, ready for BJS reconciliation.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub record_id: Uuid,
    pub best_match: Option<SearchMatch>,
}

/// A webhook delivery from the bulk-search service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: Uuid,
    pub event_type: WebhookEventType,
    pub search_id: SearchId,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookEventType {
    BulkSearchResultsReady,
    BulkSearchCancelled,
}
