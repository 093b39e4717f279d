//! `Search<S>` — a MerchantSearch pinned to one node of its state DAG.
//!
//! Mirrors the `Request<State>` typestate: the fields that exist at a given
//! point in the lifecycle live on the state marker (`state::*`), the fields
//! that are immutable for the whole lifecycle live on `SearchData`.

use serde_json::Value;
use uuid::Uuid;

use crate::state::SearchState;
use crate::types::{RecordIdMapping, SearchId};

/// Fields fixed at submission time; never mutated afterwards (§3
/// `record_id_mapping` immutability invariant).
#[derive(Debug, Clone)]
pub struct SearchData {
    pub search_id: SearchId,
    pub batch_id: Uuid,
    /// Hash of the normalized record set submitted, used for de-duplication
    /// (`(batch_id, content_hash)` uniqueness).
    pub content_hash: String,
    pub record_id_mapping: RecordIdMapping,
    pub request_payload: Value,
}

/// A MerchantSearch known to be in state `S`. Only the transitions valid for
/// `S` are implemented on it (see `transitions.rs`), so an illegal move is a
/// compile error rather than a runtime check — the runtime CAS in the store
/// is the second line of defense against races between the webhook handler
/// and the poller.
#[derive(Debug, Clone)]
pub struct Search<S: SearchState> {
    pub data: SearchData,
    pub state: S,
}

impl<S: SearchState> Search<S> {
    pub fn search_id(&self) -> SearchId {
        self.data.search_id
    }
}
