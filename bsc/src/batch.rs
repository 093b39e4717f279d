//! Grouping eligible records into submissions of up to 3000 items and
//! computing the content hash used for submission de-duplication.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::{ClientReferenceId, RecordIdMapping, SearchItem};

/// Hard ceiling on items per bulk-search submission, per the external
/// protocol contract.
pub const MAX_ITEMS_PER_SUBMISSION: usize = 3000;

/// One input record eligible for merchant enrichment.
#[derive(Debug, Clone)]
pub struct EligibleRecord {
    pub record_id: Uuid,
    pub business_name: String,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
}

/// A single submission's worth of items plus the mapping back to record ids
/// and the content hash used for de-dup.
pub struct SubmissionGroup {
    pub items: Vec<SearchItem>,
    pub record_id_mapping: RecordIdMapping,
    pub content_hash: String,
}

/// Splits `records` into groups of at most `MAX_ITEMS_PER_SUBMISSION`,
/// assigning a fresh `client_reference_id` to each record. The assignment is
/// only idempotent within a single call — callers that need deterministic
/// de-dup across retries rely on `content_hash`, not on client_reference_id
/// stability, since `record_id_mapping` is immutable per submission but a
/// resubmission of the same record set is a fresh submission with a fresh
/// mapping if the prior one was discarded.
pub fn group_for_submission(records: &[EligibleRecord]) -> Vec<SubmissionGroup> {
    records
        .chunks(MAX_ITEMS_PER_SUBMISSION)
        .map(|chunk| {
            let mut mapping = RecordIdMapping::new();
            let mut items = Vec::with_capacity(chunk.len());
            for record in chunk {
                let cid = ClientReferenceId(Uuid::new_v4());
                mapping.insert(record.record_id, cid);
                items.push(SearchItem {
                    client_reference_id: cid,
                    business_name: record.business_name.clone(),
                    address_line1: record.address_line1.clone(),
                    city: record.city.clone(),
                    state: record.state.clone(),
                    zip: record.zip.clone(),
                    country: record.country.clone(),
                });
            }
            let content_hash = content_hash(chunk);
            SubmissionGroup { items, record_id_mapping: mapping, content_hash }
        })
        .collect()
}

/// Deterministic hash of the record *identities and business names* in a
/// chunk, independent of chunk order (records are sorted by id first) so
/// that resubmitting the same logical record set always produces the same
/// hash regardless of upload row ordering.
fn content_hash(chunk: &[EligibleRecord]) -> String {
    let mut ids: Vec<&EligibleRecord> = chunk.iter().collect();
    ids.sort_by_key(|r| r.record_id);
    let mut hasher = Sha256::new();
    for record in ids {
        hasher.update(record.record_id.as_bytes());
        hasher.update(record.business_name.to_lowercase().trim().as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: Uuid, name: &str) -> EligibleRecord {
        EligibleRecord { record_id: id, business_name: name.into(), address_line1: None, city: None, state: None, zip: None, country: None }
    }

    #[test]
    fn content_hash_is_order_independent() {
        let a = rec(Uuid::from_u128(1), "Acme Corp");
        let b = rec(Uuid::from_u128(2), "Beta LLC");
        let h1 = content_hash(&[a.clone(), b.clone()]);
        let h2 = content_hash(&[b, a]);
        assert_eq!(h1, h2);
    }

    #[test]
    fn groups_respect_max_items_per_submission() {
        let records: Vec<_> = (0..7000u128).map(|i| rec(Uuid::from_u128(i), "X")).collect();
        let groups = group_for_submission(&records);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].items.len(), MAX_ITEMS_PER_SUBMISSION);
        assert_eq!(groups[2].items.len(), 1000);
    }

    #[test]
    fn every_record_gets_a_distinct_client_reference_id() {
        let records: Vec<_> = (0..10u128).map(|i| rec(Uuid::from_u128(i), "X")).collect();
        let groups = group_for_submission(&records);
        let group = &groups[0];
        let unique: std::collections::HashSet<_> = group.record_id_mapping.values().collect();
        assert_eq!(unique.len(), 10);
    }
}
