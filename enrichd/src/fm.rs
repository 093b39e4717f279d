//! Fuzzy Matcher (§4.2): pure, synchronous, never touches the network or a
//! store. Given a query name and a candidate list from the supplier cache,
//! ranks candidates and picks one best match plus a confidence band.

use crate::domain::{MatchScore, MatchType, Supplier};

const BUSINESS_SUFFIXES: &[&str] = &["llc", "inc", "corp", "ltd", "co", "company", "group", "services"];

/// Lowercase, strip punctuation, collapse whitespace. Business-suffix tokens
/// are preserved rather than stripped — they carry matching signal.
pub fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_space = false;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn has_business_indicator(normalized: &str) -> bool {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    tokens.iter().any(|t| BUSINESS_SUFFIXES.contains(t))
}

fn token_set_similarity(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

/// A deliberately small metaphone-style phonetic key: first letter plus
/// consonant skeleton, enough to catch "Smith"/"Smyth" without pulling in a
/// full metaphone implementation the corpus doesn't otherwise need.
fn phonetic_key(s: &str) -> String {
    let mut key = String::new();
    let mut prev: Option<char> = None;
    for ch in s.chars() {
        if !ch.is_alphabetic() {
            continue;
        }
        let c = ch.to_ascii_lowercase();
        let mapped = match c {
            'a' | 'e' | 'i' | 'o' | 'u' | 'y' | 'h' | 'w' => continue,
            'b' | 'f' | 'p' | 'v' => '1',
            'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => '2',
            'd' | 't' => '3',
            'l' => '4',
            'm' | 'n' => '5',
            'r' => '6',
            _ => continue,
        };
        if prev != Some(mapped) {
            key.push(mapped);
        }
        prev = Some(mapped);
    }
    key
}

fn ngram_similarity(a: &str, b: &str) -> f64 {
    strsim::sorensen_dice(a, b)
}

struct Weights {
    exact: f64,
    jaro_winkler: f64,
    token_set: f64,
    levenshtein: f64,
    ngram: f64,
    phonetic: f64,
}

const WEIGHTS: Weights = Weights { exact: 0.25, jaro_winkler: 0.25, token_set: 0.20, levenshtein: 0.15, ngram: 0.10, phonetic: 0.05 };

#[derive(Debug, Clone)]
pub struct Scored<'a> {
    pub supplier: &'a Supplier,
    /// Raw combined score in `[0, 1]`, before reporting scale.
    pub raw: f64,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub supplier_id: Option<String>,
    pub matched_name: Option<String>,
    pub score: MatchScore,
    pub match_type: MatchType,
    pub reasoning: String,
    pub needs_adjudication: bool,
}

fn score_one(query_norm: &str, candidate: &Supplier) -> f64 {
    let cand_norm = &candidate.normalized_name;

    let exact = if query_norm == cand_norm { 1.0 } else { 0.0 };
    let jw = strsim::jaro_winkler(query_norm, cand_norm);
    let ts = token_set_similarity(query_norm, cand_norm);
    let lev = strsim::normalized_levenshtein(query_norm, cand_norm);
    let ngram = ngram_similarity(query_norm, cand_norm);
    let phon = if phonetic_key(query_norm) == phonetic_key(cand_norm) { 1.0 } else { 0.0 };

    let mut combined =
        exact * WEIGHTS.exact + jw * WEIGHTS.jaro_winkler + ts * WEIGHTS.token_set + lev * WEIGHTS.levenshtein + ngram * WEIGHTS.ngram + phon * WEIGHTS.phonetic;

    let query_tokens: Vec<&str> = query_norm.split_whitespace().collect();
    let query_has_business = has_business_indicator(query_norm);
    let cand_has_business = candidate.has_business_indicator;
    let is_exact = query_norm == cand_norm;

    // §8 boundary: a single-token query MUST NOT score >= 0.90 unless the
    // candidate's normalized name is an exact match AND its common_name_score
    // is low enough that "Johnson" isn't just a generic common name. An exact
    // match against a genuinely common name (high common_name_score) still
    // takes the full penalty.
    if query_tokens.len() == 1 && !query_has_business && !(is_exact && candidate.common_name_score < 0.5) {
        let penalty = (0.20 + 0.10 * candidate.common_name_score).min(0.30);
        combined -= penalty;
    }
    if cand_has_business && !query_has_business {
        combined -= 0.05;
    }
    let len_ratio = (query_norm.len().max(1) as f64) / (cand_norm.len().max(1) as f64);
    if len_ratio > 3.0 || len_ratio < 1.0 / 3.0 {
        combined -= 0.10;
    }

    combined.clamp(0.0, 1.0)
}

/// Runs the full ranking + tie-break + penalty ladder. `candidates` is
/// assumed already capped/ordered by retrieval score (SC's job); this
/// function re-caps at 10 defensively.
pub fn best_match(query_name: &str, candidates: &[Supplier], ai_enhancement_threshold: f64) -> MatchResult {
    let query_norm = normalize(query_name);
    if query_norm.is_empty() || candidates.is_empty() {
        return MatchResult {
            supplier_id: None,
            matched_name: None,
            score: MatchScore::new(0.0),
            match_type: MatchType::None,
            reasoning: "no candidates".to_string(),
            needs_adjudication: false,
        };
    }

    let capped = &candidates[..candidates.len().min(10)];
    let mut scored: Vec<Scored> = capped.iter().map(|c| Scored { supplier: c, raw: score_one(&query_norm, c) }).collect();

    scored.sort_by(|a, b| {
        b.raw
            .partial_cmp(&a.raw)
            .unwrap()
            .then_with(|| {
                let a_prefix = query_norm.starts_with(&a.supplier.normalized_name);
                let b_prefix = query_norm.starts_with(&b.supplier.normalized_name);
                b_prefix.cmp(&a_prefix)
            })
            .then_with(|| a.supplier.normalized_name.len().cmp(&b.supplier.normalized_name.len()))
            .then_with(|| a.supplier.supplier_id.cmp(&b.supplier.supplier_id))
    });

    let top = &scored[0];
    let score_pct = top.raw * 100.0;

    if top.raw >= 0.95 {
        let match_type = if top.supplier.normalized_name == query_norm {
            MatchType::Exact
        } else if query_norm.starts_with(&top.supplier.normalized_name) || top.supplier.normalized_name.starts_with(&query_norm) {
            MatchType::Prefix
        } else {
            MatchType::Token
        };
        return MatchResult {
            supplier_id: Some(top.supplier.supplier_id.clone()),
            matched_name: Some(top.supplier.payee_name.clone()),
            score: MatchScore::new(score_pct),
            match_type,
            reasoning: format!("deterministic score {score_pct:.1} (early exit)"),
            needs_adjudication: false,
        };
    }

    let needs_adjudication = top.raw >= ai_enhancement_threshold && top.raw < 0.95;

    MatchResult {
        supplier_id: Some(top.supplier.supplier_id.clone()),
        matched_name: Some(top.supplier.payee_name.clone()),
        score: MatchScore::new(score_pct),
        match_type: if phonetic_key(&query_norm) == phonetic_key(&top.supplier.normalized_name) && top.raw < 0.7 {
            MatchType::Phonetic
        } else {
            MatchType::Token
        },
        reasoning: format!("deterministic score {score_pct:.1}"),
        needs_adjudication,
    }
}

/// Applied after CG adjudication accepts a candidate in `needs_adjudication`
/// band: reported score is unchanged, only `match_type` changes (§8 scenario 2).
pub fn apply_adjudication(mut result: MatchResult, keep: bool) -> MatchResult {
    if keep {
        result.match_type = MatchType::AiEnhanced;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supplier(id: &str, name: &str) -> Supplier {
        let normalized = normalize(name);
        Supplier {
            supplier_id: id.to_string(),
            payee_name: name.to_string(),
            has_business_indicator: has_business_indicator(&normalized),
            common_name_score: 0.0,
            name_length: normalized.len() as i32,
            normalized_name: normalized,
            business_name: None,
            dba: None,
            legal_name: None,
            ein: None,
            city: None,
            state: None,
            mcc: None,
            industry: None,
            payment_type: None,
        }
    }

    #[test]
    fn prefix_over_longer_variant() {
        let candidates = vec![supplier("s1", "AMAZON"), supplier("s2", "AMAZON BUSINESS")];
        let result = best_match("AMAZON", &candidates, 0.90);
        assert_eq!(result.supplier_id.as_deref(), Some("s1"));
        assert!(result.score.value() >= 95.0);
    }

    #[test]
    fn single_token_common_name_does_not_score_high_unless_exact() {
        let candidates = vec![Supplier { common_name_score: 0.9, ..supplier("s1", "Johnson & Johnson") }];
        let result = best_match("Johnson", &candidates, 0.90);
        assert!(result.score.value() < 90.0);
    }

    #[test]
    fn single_token_exact_match_low_common_name_score_passes() {
        let candidates = vec![Supplier { common_name_score: 0.1, ..supplier("s1", "Johnson") }];
        let result = best_match("Johnson", &candidates, 0.90);
        assert!(result.score.value() >= 90.0);
    }

    #[test]
    fn empty_candidates_is_no_match() {
        let result = best_match("Anything", &[], 0.90);
        assert_eq!(result.match_type, MatchType::None);
        assert_eq!(result.score.value(), 0.0);
    }

    #[test]
    fn adjudication_band_flags_for_followup() {
        let candidates = vec![Supplier { common_name_score: 0.0, ..supplier("s1", "ABC Cleaning Services") }];
        let result = best_match("ABC Cleaning", &candidates, 0.50);
        assert!(result.needs_adjudication || result.score.value() >= 95.0);
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("  Robert'); DROP TABLE Suppliers;--  ");
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }
}
