//! Error taxonomy for the bulk-search coordinator.
//!
//! Mirrors the kinds from the enrichment error taxonomy (`StageTransient` /
//! `StagePermanent` / `CoordinationError` / `IntegrityError`) but scoped to
//! what BSC itself can observe: the external service's HTTP surface and the
//! store's CAS semantics.

use crate::types::SearchId;

pub type Result<T> = std::result::Result<T, BscError>;

#[derive(Debug, thiserror::Error)]
pub enum BscError {
    /// 401/403 from the bulk-search service. Non-retryable.
    #[error("bulk-search authentication failed: {0}")]
    AuthError(String),

    /// 429, optionally carrying a `Retry-After` hint. Retryable.
    #[error("bulk-search rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// 5xx or network-level failure. Retryable up to the configured attempt budget.
    #[error("bulk-search server error: {0}")]
    ServerError(String),

    /// The service answered `RESULTS_NOT_FOUND` for a search it had already
    /// reported `COMPLETED`. Terminal `no_results`, not a failure.
    #[error("no results available for completed search {0}")]
    ResultsNotFoundAfterCompleted(SearchId),

    /// Exceeded `max_poll_attempts` or the hard per-search deadline.
    #[error("search {0} timed out")]
    Timeout(SearchId),

    /// A state transition was attempted that the DAG in the state machine
    /// does not permit (reverse or skipped transition).
    #[error("invalid transition for search {0}: {1} -> {2}")]
    InvalidTransition(SearchId, &'static str, &'static str),

    /// Compare-and-set lost the race; caller should re-read and retry once.
    #[error("concurrent modification of search {0}, CAS lost")]
    CasConflict(SearchId),

    /// A submission was attempted for a `(batch_id, content_hash)` that
    /// already has an in-flight or completed search. Not an error to the
    /// caller — the existing row should be returned instead.
    #[error("duplicate submission for batch {batch_id}, existing search {existing}")]
    DuplicateSubmission { batch_id: uuid::Uuid, existing: SearchId },

    #[error("request signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BscError {
    /// Whether a caller should retry this error under the rate limiter's
    /// backoff policy, as opposed to treating it as a terminal failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, BscError::RateLimited { .. } | BscError::ServerError(_) | BscError::Http(_))
    }
}
