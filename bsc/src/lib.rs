//! Bulk Search Coordinator: submit, poll/webhook-race, fetch-results, and
//! best-match reconciliation for the external merchant bulk-search service.
//!
//! Layered like `fusillade`'s own request-batcher crate: typestate transitions
//! (`state`, `search`, `transitions`) sit behind a storage trait (`manager`),
//! driven by a background daemon (`poller`) that races polling against
//! webhook delivery. `batch`, `selection`, `signer`, and `client` are the
//! pieces specific to this protocol: submission grouping/de-dup, best-match
//! tie-breaking, OAuth1 request signing, and the HTTP wire client.

pub mod batch;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod poller;
pub mod search;
pub mod selection;
pub mod signer;
pub mod state;
pub mod transitions;
pub mod types;

pub use coordinator::{reconcile_completed, Coordinator};
pub use error::{BscError, Result};
pub use manager::{AnySearch, SearchStore};
pub use poller::{PollSchedule, Poller, ResultReconciler};
pub use search::{Search, SearchData};
pub use types::{
    ClientReferenceId, ConfidenceBand, Reconciled, RecordIdMapping, SearchId, SearchItem, SearchMatch, UpstreamStatus,
    WebhookEvent, WebhookEventType,
};
