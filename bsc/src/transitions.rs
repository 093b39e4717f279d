//! Valid moves along the MerchantSearch DAG. Each function consumes the
//! `Search<FromState>` by value so a caller cannot accidentally reuse a
//! stale typestate value after the store's CAS has (or hasn't) applied the
//! new state — the old value is gone either way.

use chrono::Utc;

use crate::error::{BscError, Result};
use crate::manager::SearchStore;
use crate::search::Search;
use crate::state::{Completed, Failed, NoResults, Polling, SearchState, Submitted, Timeout, WebhookReceived};
use crate::types::SearchMatch;

impl Search<Submitted> {
    /// First poll tick with no webhook yet observed.
    pub async fn start_polling<St: SearchStore + ?Sized>(self, max_poll_attempts: u32, store: &St) -> Result<Search<Polling>> {
        let now = Utc::now();
        let next = Search {
            data: self.data,
            state: Polling {
                submitted_at: self.state.submitted_at,
                poll_attempts: 0,
                max_poll_attempts,
                last_polled_at: now,
            },
        };
        store.persist_polling(Submitted::NAME, &next).await?;
        Ok(next)
    }

    /// A valid webhook arrived before the first poll tick.
    pub async fn receive_webhook<St: SearchStore + ?Sized>(self, store: &St) -> Result<Search<WebhookReceived>> {
        let next = Search {
            data: self.data,
            state: WebhookReceived {
                submitted_at: self.state.submitted_at,
                poll_attempts: 0,
                received_at: Utc::now(),
            },
        };
        store.persist_webhook_received(Submitted::NAME, &next).await?;
        Ok(next)
    }

    pub async fn timeout<St: SearchStore + ?Sized>(self, store: &St) -> Result<Search<Timeout>> {
        let next = Search {
            data: self.data,
            state: Timeout {
                submitted_at: self.state.submitted_at,
                timed_out_at: Utc::now(),
                poll_attempts: 0,
            },
        };
        store.persist_timeout(Submitted::NAME, &next).await?;
        Ok(next)
    }
}

impl Search<Polling> {
    /// Record a poll attempt that observed a non-terminal upstream status.
    pub async fn record_poll_attempt<St: SearchStore + ?Sized>(mut self, store: &St) -> Result<Search<Polling>> {
        let prev = self.state.poll_attempts;
        self.state.poll_attempts += 1;
        self.state.last_polled_at = Utc::now();
        let next = Search { data: self.data, state: self.state };
        // Re-persisting within the same state is still a CAS against the
        // row's poll_attempts so two concurrent pollers can't double-count.
        store.persist_polling(Polling::NAME, &next).await?;
        tracing::debug!(search_id = %next.search_id(), attempt = prev + 1, "recorded poll attempt");
        Ok(next)
    }

    /// A webhook arrived while polling was in progress; it wins and further
    /// polling for this search must stop.
    pub async fn receive_webhook<St: SearchStore + ?Sized>(self, store: &St) -> Result<Search<WebhookReceived>> {
        let next = Search {
            data: self.data,
            state: WebhookReceived {
                submitted_at: self.state.submitted_at,
                poll_attempts: self.state.poll_attempts,
                received_at: Utc::now(),
            },
        };
        store.persist_webhook_received(Polling::NAME, &next).await?;
        Ok(next)
    }

    pub async fn mark_timed_out<St: SearchStore + ?Sized>(self, store: &St) -> Result<Search<Timeout>> {
        let next = Search {
            data: self.data,
            state: Timeout {
                submitted_at: self.state.submitted_at,
                timed_out_at: Utc::now(),
                poll_attempts: self.state.poll_attempts,
            },
        };
        store.persist_timeout(Polling::NAME, &next).await?;
        Ok(next)
    }

    /// True once `poll_attempts` has reached the configured ceiling — the
    /// caller (the poller daemon) uses this to decide whether the next tick
    /// should call `mark_timed_out` instead of `record_poll_attempt`.
    pub fn exhausted(&self) -> bool {
        self.state.poll_attempts >= self.state.max_poll_attempts
    }
}

/// Shared by both `Polling` and `WebhookReceived`, since either can observe
/// the upstream `COMPLETED` status and hand off to results-fetching.
pub trait ToFetchingResults: SearchState {}
impl ToFetchingResults for Polling {}
impl ToFetchingResults for WebhookReceived {}

impl Search<WebhookReceived> {
    pub async fn fetch_results<St: SearchStore + ?Sized>(self, store: &St) -> Result<Search<crate::state::FetchingResults>> {
        let next = Search {
            data: self.data,
            state: crate::state::FetchingResults { submitted_at: self.state.submitted_at, started_at: Utc::now() },
        };
        // `fetching_results` is a transient in-process stage not persisted
        // as its own durable row in this schema: the terminal write lands
        // directly in `persist_completed`/`persist_no_results`/`persist_failed`
        // with `WebhookReceived::NAME` as the CAS precondition.
        let _ = &next;
        Ok(next)
    }
}

impl Search<Polling> {
    pub async fn fetch_results(self) -> Result<Search<crate::state::FetchingResults>> {
        Ok(Search {
            data: self.data,
            state: crate::state::FetchingResults { submitted_at: self.state.submitted_at, started_at: Utc::now() },
        })
    }
}

impl Search<crate::state::FetchingResults> {
    pub async fn complete<St: SearchStore + ?Sized>(
        self,
        prev_state_name: &'static str,
        matches: Vec<SearchMatch>,
        store: &St,
    ) -> Result<Search<Completed>> {
        let next = Search {
            data: self.data,
            state: Completed { submitted_at: self.state.submitted_at, completed_at: Utc::now(), matches },
        };
        store.persist_completed(prev_state_name, &next).await?;
        Ok(next)
    }

    pub async fn no_results<St: SearchStore + ?Sized>(self, prev_state_name: &'static str, store: &St) -> Result<Search<NoResults>> {
        let next =
            Search { data: self.data, state: NoResults { submitted_at: self.state.submitted_at, completed_at: Utc::now() } };
        store.persist_no_results(prev_state_name, &next).await?;
        Ok(next)
    }

    pub async fn fail<St: SearchStore + ?Sized>(self, prev_state_name: &'static str, error: String, store: &St) -> Result<Search<Failed>> {
        let next = Search { data: self.data, state: Failed { submitted_at: self.state.submitted_at, failed_at: Utc::now(), error } };
        store.persist_failed(prev_state_name, &next).await?;
        Ok(next)
    }
}

/// Reject an attempt to move backwards along the DAG; kept as a named helper
/// so call sites read as an explicit policy decision rather than a bare
/// `unreachable!()`.
pub fn reject_reverse_transition(search_id: crate::types::SearchId, from: &'static str, to: &'static str) -> BscError {
    BscError::InvalidTransition(search_id, from, to)
}
