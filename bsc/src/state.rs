//! Typestate markers for [`crate::search::Search<S>`], one per node of the
//! MerchantSearch DAG:
//!
//! ```text
//! submitted -> polling <-> webhook_received -> fetching_results -> completed
//!                                                                -> no_results
//!                                                                -> failed
//! any (non-terminal) -> timeout
//! ```
//!
//! Each marker carries only the fields that exist once a search has reached
//! that node; this is the same shape `fusillade`'s typestate `Request<State>`
//! uses for the HTTP-request lifecycle, generalized to the MerchantSearch DAG.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SearchMatch, UpstreamStatus};

/// Common trait implemented by every marker so the store can persist a
/// `Search<S>` generically and record the textual state name for CAS.
pub trait SearchState: Send + Sync + Clone + std::fmt::Debug {
    const NAME: &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submitted {
    pub submitted_at: DateTime<Utc>,
}
impl SearchState for Submitted {
    const NAME: &'static str = "submitted";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Polling {
    pub submitted_at: DateTime<Utc>,
    pub poll_attempts: u32,
    pub max_poll_attempts: u32,
    pub last_polled_at: DateTime<Utc>,
}
impl SearchState for Polling {
    const NAME: &'static str = "polling";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookReceived {
    pub submitted_at: DateTime<Utc>,
    pub poll_attempts: u32,
    pub received_at: DateTime<Utc>,
}
impl SearchState for WebhookReceived {
    const NAME: &'static str = "webhook_received";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchingResults {
    pub submitted_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}
impl SearchState for FetchingResults {
    const NAME: &'static str = "fetching_results";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completed {
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub matches: Vec<SearchMatch>,
}
impl SearchState for Completed {
    const NAME: &'static str = "completed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoResults {
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}
impl SearchState for NoResults {
    const NAME: &'static str = "no_results";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failed {
    pub submitted_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}
impl SearchState for Failed {
    const NAME: &'static str = "failed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeout {
    pub submitted_at: DateTime<Utc>,
    pub timed_out_at: DateTime<Utc>,
    pub poll_attempts: u32,
}
impl SearchState for Timeout {
    const NAME: &'static str = "timeout";
}

/// Upstream status observed on a poll tick, used by callers to decide which
/// transition to drive (kept here, not in `types`, since it's a
/// state-machine-internal decision input rather than a wire type).
#[derive(Debug, Clone, Copy)]
pub struct PollObservation {
    pub status: UpstreamStatus,
}
