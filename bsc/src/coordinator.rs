//! Ties submission grouping, the storage trait, and the wire client into the
//! submit half of the workflow (§4.5.2). The poll/webhook/fetch half lives in
//! [`crate::poller`]; this module is what a caller (the enrichment
//! orchestrator) calls once per eligible batch of records.

use std::sync::Arc;

use uuid::Uuid;

use crate::batch::SubmissionGroup;
use crate::client::BulkSearchClient;
use crate::error::{BscError, Result};
use crate::manager::{AnySearch, SearchStore};
use crate::search::{Search, SearchData};
use crate::selection::select_best;
use crate::types::{Reconciled, SearchMatch};

pub struct Coordinator<St: SearchStore, C: BulkSearchClient> {
    store: Arc<St>,
    client: Arc<C>,
}

impl<St: SearchStore, C: BulkSearchClient> Coordinator<St, C> {
    pub fn new(store: Arc<St>, client: Arc<C>) -> Self {
        Self { store, client }
    }

    /// Submit one group, returning whatever search now exists for its
    /// `(batch_id, content_hash)` key — freshly created, or an existing one
    /// if a concurrent caller beat us to it (§3 de-dup invariant).
    pub async fn submit(&self, batch_id: Uuid, group: SubmissionGroup) -> Result<AnySearch> {
        if let Some(existing) = self.store.find_by_content_hash(batch_id, &group.content_hash).await? {
            tracing::info!(%batch_id, content_hash = %group.content_hash, "submission already exists, skipping resubmit");
            return Ok(existing);
        }

        let search_id = self.client.submit(&group.items).await?;
        let request_payload = serde_json::to_value(&group.items).map_err(|e| BscError::Other(e.into()))?;
        let data = SearchData {
            search_id,
            batch_id,
            content_hash: group.content_hash,
            record_id_mapping: group.record_id_mapping,
            request_payload,
        };

        match self.store.create_submitted(data).await {
            Ok(search) => Ok(AnySearch::Submitted(search)),
            Err(BscError::DuplicateSubmission { existing, .. }) => {
                tracing::warn!(%batch_id, %search_id, %existing, "submitted to upstream but lost the de-dup race locally");
                self.store
                    .get_by_id(existing)
                    .await?
                    .ok_or_else(|| BscError::Other(anyhow::anyhow!("duplicate search {existing} vanished")))
            }
            Err(e) => {
                // Defensive: some store implementations may partially apply
                // before erroring. A plain row-doesn't-exist discard is a
                // harmless no-op against this crate's own Postgres store.
                let _ = self.store.discard(search_id).await;
                Err(e)
            }
        }
    }

    /// Submit every group produced by [`crate::batch::group_for_submission`]
    /// for one batch, returning one result per group in submission order.
    pub async fn submit_all(&self, batch_id: Uuid, groups: Vec<SubmissionGroup>) -> Vec<Result<AnySearch>> {
        let mut results = Vec::with_capacity(groups.len());
        for group in groups {
            results.push(self.submit(batch_id, group).await);
        }
        results
    }

    pub async fn open_searches(&self, batch_id: Uuid) -> Result<Vec<AnySearch>> {
        self.store.list_open_for_batch(batch_id).await
    }

    /// Mark every open search for a cancelled batch terminal so late
    /// webhooks/polls are dropped (§4.5.5).
    pub async fn cancel_batch(&self, batch_id: Uuid) -> Result<()> {
        self.store.cancel_batch_searches(batch_id).await
    }
}

/// Apply the best-match selection ladder to every record in a completed
/// search. Matches are grouped by `client_reference_id` first (the service
/// may return several candidates per submitted item), then the single best
/// is picked per record using that record's own submitted business name as
/// the query (§4.5.4).
pub fn reconcile_completed(
    search: &Search<crate::state::Completed>,
    query_names: &std::collections::HashMap<Uuid, String>,
) -> Vec<Reconciled> {
    let mut by_client_ref: std::collections::HashMap<_, Vec<&SearchMatch>> = std::collections::HashMap::new();
    for m in &search.state.matches {
        by_client_ref.entry(m.client_reference_id).or_default().push(m);
    }

    search
        .data
        .record_id_mapping
        .iter()
        .map(|(record_id, client_ref)| {
            let query_name = query_names.get(record_id).map(String::as_str).unwrap_or_default();
            let candidates: Vec<SearchMatch> =
                by_client_ref.get(client_ref).map(|v| v.iter().map(|m| (*m).clone()).collect()).unwrap_or_default();
            let best = select_best(query_name, &candidates).cloned();
            Reconciled { record_id: *record_id, best_match: best }
        })
        .collect()
}
