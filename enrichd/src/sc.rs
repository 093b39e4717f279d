//! Supplier Cache (§4.1): candidate retrieval for the Fuzzy Matcher over the
//! ~500k-row supplier snapshot, plus the out-of-band upsert path.
//!
//! Retrieval unions four sub-linear lookups — normalized exact, normalized
//! prefix, trigram containment, first-token — against the indexes
//! `suppliers` migrations create, dedupes by `supplier_id`, and caps at `k`.
//! This module owns the union/dedupe/retry policy; `db::handlers::suppliers`
//! owns the raw bound queries.

use std::time::Duration;

use uuid::Uuid;

use crate::db::handlers::suppliers::{normalize_for_lookup, SupplierRepository};
use crate::domain::Supplier;
use crate::errors::Error;

const STAGE: &str = "finexio";
const STORAGE_RETRIES: u32 = 3;
const STORAGE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub row_count: i64,
}

/// Runs `op` with a small local retry for transient storage errors;
/// exhausted retries surface as `StorageUnavailable` (here: a
/// `StageTransient` on the `finexio` stage), never a batch-level failure
/// (§4.1 "Errors").
async fn with_retry<T, F, Fut>(op: F) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = crate::db::errors::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < STORAGE_RETRIES => {
                tracing::warn!(attempt, error = %e, "supplier cache storage error, retrying");
                tokio::time::sleep(STORAGE_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(Error::StageTransient { stage: STAGE, message: format!("supplier cache storage unavailable: {e}") });
            }
        }
    }
}

/// Retrieves up to `k` candidates for `query_name`, deterministic for a
/// given snapshot (§4.1 contract). Strategies run in this fixed order and
/// are deduped by `supplier_id` as they're unioned, so earlier strategies'
/// ranking (closest match first) survives into FM's own re-ranking.
pub async fn candidates(repo: &SupplierRepository<'_>, query_name: &str, k: usize) -> Result<Vec<Supplier>, Error> {
    let normalized = normalize_for_lookup(query_name);
    if normalized.is_empty() {
        return Ok(Vec::new());
    }
    let k_i64 = k as i64;

    let mut out: Vec<Supplier> = Vec::with_capacity(k);
    let mut seen = std::collections::HashSet::new();

    let exact = with_retry(|| repo.exact(&normalized, k_i64)).await?;
    push_unique(&mut out, &mut seen, exact, k);

    if out.len() < k {
        let prefix = with_retry(|| repo.prefix(&normalized, k_i64)).await?;
        push_unique(&mut out, &mut seen, prefix, k);
    }

    if out.len() < k {
        let trigram = with_retry(|| repo.trigram(&normalized, k_i64)).await?;
        push_unique(&mut out, &mut seen, trigram, k);
    }

    if out.len() < k {
        if let Some(first_token) = normalized.split_whitespace().next() {
            let first_token = first_token.to_string();
            let by_token = with_retry(|| repo.first_token(&first_token, k_i64)).await?;
            push_unique(&mut out, &mut seen, by_token, k);
        }
    }

    out.truncate(k);
    Ok(out)
}

fn push_unique(out: &mut Vec<Supplier>, seen: &mut std::collections::HashSet<String>, batch: Vec<Supplier>, k: usize) {
    for s in batch {
        if out.len() >= k {
            break;
        }
        if seen.insert(s.supplier_id.clone()) {
            out.push(s);
        }
    }
}

pub async fn upsert_batch(repo: &SupplierRepository<'_>, rows: &[Supplier]) -> Result<(), Error> {
    with_retry(|| repo.upsert_batch(rows)).await
}

pub async fn stats(repo: &SupplierRepository<'_>) -> Result<Stats, Error> {
    let row_count = with_retry(|| repo.row_count()).await?;
    Ok(Stats { row_count })
}

/// Builds a deterministic supplier_id for rows synced without one upstream
/// (e.g. test fixtures); production syncs always carry the network's own id.
pub fn synthesize_supplier_id(payee_name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, payee_name.as_bytes()).to_string()
}
