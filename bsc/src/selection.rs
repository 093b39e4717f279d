//! Per-record best-match selection (§4.5.4): the service may return zero or
//! more candidates per `client_reference_id`; exactly one is picked, by a
//! fixed tie-break ladder. Pure, synchronous, no I/O — unit-testable without
//! a database or HTTP mock.

use std::cmp::Ordering;

use crate::types::{ConfidenceBand, SearchMatch};

fn band_rank(band: ConfidenceBand) -> u8 {
    match band {
        ConfidenceBand::High => 2,
        ConfidenceBand::Medium => 1,
        ConfidenceBand::Low => 0,
    }
}

fn token_overlap(a: &str, b: &str) -> usize {
    let a_tokens: std::collections::HashSet<String> = a.to_lowercase().split_whitespace().map(str::to_string).collect();
    let b_tokens: std::collections::HashSet<String> = b.to_lowercase().split_whitespace().map(str::to_string).collect();
    a_tokens.intersection(&b_tokens).count()
}

/// Pick the single best candidate for `query_name`, or `None` if `matches`
/// is empty ("no match" is a valid terminal outcome, §4.5.4).
pub fn select_best<'a>(query_name: &str, matches: &'a [SearchMatch]) -> Option<&'a SearchMatch> {
    matches.iter().max_by(|a, b| compare(query_name, a, b))
}

fn compare(query_name: &str, a: &SearchMatch, b: &SearchMatch) -> Ordering {
    band_rank(a.confidence_band)
        .cmp(&band_rank(b.confidence_band))
        .then_with(|| a.confidence.partial_cmp(&b.confidence).unwrap_or(Ordering::Equal))
        .then_with(|| token_overlap(query_name, &a.business_name).cmp(&token_overlap(query_name, &b.business_name)))
        .then_with(|| a.tax_id.is_some().cmp(&b.tax_id.is_some()))
        .then_with(|| b.merchant_id.cmp(&a.merchant_id)) // stable, but reversed so max_by picks the alphabetically-first id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(id: &str, band: ConfidenceBand, conf: f64, name: &str, tax_id: Option<&str>) -> SearchMatch {
        SearchMatch {
            client_reference_id: crate::types::ClientReferenceId(uuid::Uuid::nil()),
            merchant_id: id.into(),
            business_name: name.into(),
            tax_id: tax_id.map(str::to_string),
            mcc: None,
            mcc_group: None,
            address: None,
            phone: None,
            confidence_band: band,
            confidence: conf,
        }
    }

    #[test]
    fn empty_matches_is_no_match() {
        assert!(select_best("Acme", &[]).is_none());
    }

    #[test]
    fn higher_band_wins_over_higher_numeric_confidence_in_lower_band() {
        let matches = vec![
            m("1", ConfidenceBand::Medium, 0.99, "Acme Corp", None),
            m("2", ConfidenceBand::High, 0.50, "Acme Corp", None),
        ];
        let best = select_best("Acme Corp", &matches).unwrap();
        assert_eq!(best.merchant_id, "2");
    }

    #[test]
    fn tax_id_breaks_ties_on_band_and_confidence_and_overlap() {
        let matches = vec![
            m("1", ConfidenceBand::High, 0.9, "Acme Corp", None),
            m("2", ConfidenceBand::High, 0.9, "Acme Corp", Some("12-3456789")),
        ];
        let best = select_best("Acme Corp", &matches).unwrap();
        assert_eq!(best.merchant_id, "2");
    }

    #[test]
    fn stable_by_merchant_id_as_final_tiebreak() {
        let matches = vec![
            m("zzz", ConfidenceBand::High, 0.9, "Acme", None),
            m("aaa", ConfidenceBand::High, 0.9, "Acme", None),
        ];
        let best = select_best("Acme", &matches).unwrap();
        assert_eq!(best.merchant_id, "aaa");
    }
}
