//! Enrichment Orchestrator (§4.7): drives each Record through the enabled
//! stages, writes every transition to the store, and backs the progressive
//! API. `classify ∥ supplier_match` run concurrently; `address_validate`
//! then `merchant_enrich` follow (§5 ordering guarantee).
//!
//! BSC is reached only through [`MerchantGateway`], a narrow trait over
//! `bsc::Coordinator<St, C>` — EO never depends on which store/HTTP client
//! BSC was wired with, mirroring how `bsc` itself abstracts storage behind
//! `SearchStore`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::av::{self, AddressValidatorConfig, AddressVendor};
use crate::cg::{AdjudicationInput, Classifier};
use crate::db::errors::DbError;
use crate::db::handlers::{BatchRepository, RecordRepository, Stage, SupplierRepository};
use crate::domain::{
    Address, Batch, BatchOptions, Confidence, MatchScore, MatchType, MerchantEnrichment, MerchantEnrichmentStatus, OverallStatus, PayeeType, Record,
    StageStatus, SupplierMatch,
};
use crate::errors::Error;
use crate::fm;
use crate::rl::RateLimiters;
use crate::sc;

/// Batch cannot complete while a Record is below this confidence for
/// `payee_type=Business` without also dispatching merchant enrichment
/// (§4.7 step 4 threshold).
pub const DEFAULT_MERCHANT_CONFIDENCE_THRESHOLD: f64 = 0.80;

/// §4.3: a classification below this confidence must not be auto-labeled
/// `Individual`/`Business` without a fallback path. Distinct from
/// [`DEFAULT_MERCHANT_CONFIDENCE_THRESHOLD`] above even though the default
/// value is the same number — one gates auto-labeling, the other gates
/// merchant-enrichment dispatch, and they are free to diverge per deployment.
pub const CLASSIFY_REVIEW_THRESHOLD: f64 = 0.80;

#[async_trait]
pub trait MerchantGateway: Send + Sync {
    async fn submit(&self, batch_id: Uuid, group: bsc::batch::SubmissionGroup) -> bsc::Result<bsc::AnySearch>;
    async fn open_searches(&self, batch_id: Uuid) -> bsc::Result<Vec<bsc::AnySearch>>;
    async fn cancel_batch(&self, batch_id: Uuid) -> bsc::Result<()>;
}

#[async_trait]
impl<St, C> MerchantGateway for bsc::Coordinator<St, C>
where
    St: bsc::SearchStore + 'static,
    C: bsc::client::BulkSearchClient + 'static,
{
    async fn submit(&self, batch_id: Uuid, group: bsc::batch::SubmissionGroup) -> bsc::Result<bsc::AnySearch> {
        bsc::Coordinator::submit(self, batch_id, group).await
    }

    async fn open_searches(&self, batch_id: Uuid) -> bsc::Result<Vec<bsc::AnySearch>> {
        bsc::Coordinator::open_searches(self, batch_id).await
    }

    async fn cancel_batch(&self, batch_id: Uuid) -> bsc::Result<()> {
        bsc::Coordinator::cancel_batch(self, batch_id).await
    }
}

/// Everything a single orchestration pass needs. Borrowed rather than owned
/// so call sites (API handlers, the background tick, tests) build one
/// inexpensively per operation from process-wide singletons (§5 "Worker
/// counts and rate limits are process-wide").
pub struct Deps<'a> {
    pub pool: &'a PgPool,
    pub classifier: &'a dyn Classifier,
    pub address_vendor: &'a dyn AddressVendor,
    pub rate_limiters: &'a RateLimiters,
    pub address_config: &'a AddressValidatorConfig,
    pub ai_enhance_threshold: f64,
    pub merchant_confidence_threshold: f64,
}

fn compose_address(addr: &Address) -> Option<String> {
    let parts: Vec<&str> = [addr.line1.as_deref(), addr.city.as_deref(), addr.state.as_deref(), addr.zip.as_deref(), addr.country.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

/// Runs `classify` and `supplier_match` concurrently, then `address_validate`
/// if enabled and the record carries an address (§4.7 steps 1-3). Never
/// returns an error for collaborator failures — those are captured as
/// per-stage terminal states, matching §7's propagation policy.
pub async fn process_record(deps: &Deps<'_>, batch: &Batch, record: &Record) -> Result<(), Error> {
    let record_repo = RecordRepository::new(deps.pool);
    let supplier_repo = SupplierRepository::new(deps.pool);

    let classify_fut = run_classify(deps, batch, record);
    let match_fut = run_supplier_match(deps, &supplier_repo, batch, record);
    let (classify_result, match_result) = tokio::join!(classify_fut, match_fut);

    if let Some((payee_type, confidence, sic_code)) = classify_result {
        let stage = if needs_classification_review(payee_type, confidence) { StageStatus::ReviewNeeded } else { StageStatus::Completed };
        record_repo.apply_classification(record.id, payee_type, confidence, sic_code.as_deref(), stage).await.map_err(Error::from)?;
    }

    if let Some(supplier_match) = match_result {
        record_repo.apply_supplier_match(record.id, &supplier_match, StageStatus::Completed).await.map_err(Error::from)?;
    }

    if batch.options.enable_address {
        if let Some(raw) = compose_address(&record.input_address) {
            let validated = deps
                .rate_limiters
                .address_validator
                .submit(|| av::validate_address(deps.address_vendor, deps.classifier, &raw, deps.address_config))
                .await?;
            record_repo.apply_validated_address(record.id, &validated, StageStatus::Completed).await.map_err(Error::from)?;
        } else {
            record_repo
                .apply_validated_address(record.id, &crate::domain::ValidatedAddress::default(), StageStatus::Skipped)
                .await
                .map_err(Error::from)?;
        }
    }

    if record_repo.record_fully_terminal(record.id).await.map_err(Error::from)? {
        BatchRepository::new(deps.pool).increment_processed(batch.id, 1).await.map_err(Error::from)?;
    }

    Ok(())
}

/// §4.3: `Individual`/`Business` labels below [`CLASSIFY_REVIEW_THRESHOLD`]
/// must not be auto-accepted. Other labels (`Unknown`, `Government`, ...)
/// carry their own semantics at low confidence and aren't gated here.
fn needs_classification_review(payee_type: PayeeType, confidence: Confidence) -> bool {
    matches!(payee_type, PayeeType::Individual | PayeeType::Business) && confidence.value() < CLASSIFY_REVIEW_THRESHOLD
}

async fn run_classify(deps: &Deps<'_>, batch: &Batch, record: &Record) -> Option<(PayeeType, Confidence, Option<String>)> {
    if !batch.options.enable_classify {
        return None;
    }
    let input = crate::cg::ClassifyInput { name: record.cleaned_name.clone(), address_context: compose_address(&record.input_address) };
    let outcome = deps.rate_limiters.classifier.submit(|| crate::cg::classify_with_retry(deps.classifier, &input)).await.ok()?;
    Some((outcome.payee_type, outcome.confidence, outcome.sic_code))
}

async fn run_supplier_match(deps: &Deps<'_>, supplier_repo: &SupplierRepository<'_>, batch: &Batch, record: &Record) -> Option<SupplierMatch> {
    if !batch.options.enable_finexio {
        return None;
    }
    let candidates = deps
        .rate_limiters
        .supplier_cache
        .submit(|| async { sc::candidates(supplier_repo, &record.cleaned_name, 10).await })
        .await
        .ok()?
        .ok()?;

    let mut result = fm::best_match(&record.cleaned_name, &candidates, deps.ai_enhance_threshold);

    if result.needs_adjudication {
        if let Some(matched_name) = result.matched_name.clone() {
            let adjudication_input =
                AdjudicationInput { query_name: record.cleaned_name.clone(), candidate_name: matched_name, deterministic_score: result.score.value() / 100.0 };
            let adjudication = deps
                .rate_limiters
                .classifier
                .submit(|| crate::cg::adjudicate_with_fallback(deps.classifier, &adjudication_input))
                .await
                .ok()
                .flatten();
            if let Some(outcome) = adjudication {
                result = fm::apply_adjudication(result, outcome.keep);
            }
        }
    }

    Some(SupplierMatch {
        supplier_id: result.supplier_id,
        matched_name: result.matched_name,
        score: Some(result.score),
        match_type: Some(result.match_type),
        reasoning: Some(result.reasoning),
    })
}

/// Everything merchant enrichment needs for one eligible record: BSC's own
/// `EligibleRecord` plus the query name used later for reconciliation's
/// token-overlap tie-break.
fn to_eligible(record: &Record) -> bsc::batch::EligibleRecord {
    bsc::batch::EligibleRecord {
        record_id: record.id,
        business_name: record.original_name.clone(),
        address_line1: record.input_address.line1.clone(),
        city: record.input_address.city.clone(),
        state: record.input_address.state.clone(),
        zip: record.input_address.zip.clone(),
        country: record.input_address.country.clone(),
    }
}

/// One pass of batch-level work: pull records still needing classify/match,
/// process them, submit any now-eligible merchant group, and recompute
/// completion (§4.7 step 5, §5 back-pressure via `tick_limit`).
pub async fn run_batch_tick(deps: &Deps<'_>, merchant: &dyn MerchantGateway, batch_id: Uuid, tick_limit: i64) -> Result<(), Error> {
    let batch_repo = BatchRepository::new(deps.pool);
    let record_repo = RecordRepository::new(deps.pool);

    let Some(batch) = batch_repo.get(batch_id).await.map_err(Error::from)? else {
        return Ok(());
    };
    if batch.overall_status == OverallStatus::Cancelled {
        return Ok(());
    }

    let pending = record_repo.list_pending_classify(batch_id, tick_limit).await.map_err(Error::from)?;
    for record in &pending {
        if let Err(e) = process_record(deps, &batch, record).await {
            tracing::warn!(record_id = %record.id, error = %e, "record processing failed");
        }
    }

    if batch.options.enable_merchant {
        let eligible_records = record_repo.list_merchant_eligible(batch_id, 3000).await.map_err(Error::from)?;
        let eligible: Vec<Record> = eligible_records.into_iter().filter(|r| r.confidence.value() >= deps.merchant_confidence_threshold).collect();

        if !eligible.is_empty() {
            let bsc_eligible: Vec<bsc::batch::EligibleRecord> = eligible.iter().map(to_eligible).collect();
            let groups = bsc::batch::group_for_submission(&bsc_eligible);
            for group in groups {
                let record_ids: Vec<Uuid> = group.record_id_mapping.keys().copied().collect();
                match deps.rate_limiters.merchant_search.submit(|| merchant.submit(batch_id, group)).await {
                    Ok(Ok(_search)) => {
                        for id in record_ids {
                            record_repo.mark_merchant_in_progress(id).await.map_err(Error::from)?;
                        }
                    }
                    Ok(Err(e)) => tracing::warn!(%batch_id, error = %e, "merchant submission failed"),
                    Err(e) => tracing::warn!(%batch_id, error = %e, "merchant submission rate-limited away"),
                }
            }
        }

        // Records that finished classify/finexio but will never be merchant-
        // eligible (not Business, or Business below threshold) would
        // otherwise keep `merchant` stuck at `pending` forever and block
        // `all_stages_terminal` indefinitely (§8 "Batch completion").
        let ineligible = record_repo.list_merchant_ineligible(batch_id, deps.merchant_confidence_threshold).await.map_err(Error::from)?;
        for id in ineligible {
            record_repo.apply_merchant_enrichment(id, &skipped_enrichment(), StageStatus::Skipped).await.map_err(Error::from)?;
            if record_repo.record_fully_terminal(id).await.map_err(Error::from)? {
                batch_repo.increment_processed(batch_id, 1).await.map_err(Error::from)?;
            }
        }
    }

    recompute_completion(deps, merchant, &batch).await
}

/// Every stage slot recompute_completion drives the batch-level `stage_status`
/// CAS for, keyed by [`Stage::jsonb_key`] so there is one source of truth for
/// the JSON field name.
const STAGES: [Stage; 4] = [Stage::Classify, Stage::Finexio, Stage::Address, Stage::Merchant];

fn stage_enabled(options: &BatchOptions, stage: Stage) -> bool {
    match stage {
        Stage::Classify => options.enable_classify,
        Stage::Finexio => options.enable_finexio,
        Stage::Address => options.enable_address,
        Stage::Merchant => options.enable_merchant,
    }
}

/// CAS a batch-level stage status to `completed`, trying every non-terminal
/// starting point since the caller doesn't track which one the stage is
/// currently in. A mismatch (already `completed`, or some other writer won)
/// is a no-op, not an error.
async fn mark_batch_stage_completed(batch_repo: &BatchRepository<'_>, batch_id: Uuid, stage: Stage) -> Result<(), Error> {
    for expected in [StageStatus::Pending, StageStatus::InProgress] {
        if batch_repo.cas_stage_status(batch_id, stage, expected, StageStatus::Completed).await.map_err(Error::from)? {
            return Ok(());
        }
    }
    Ok(())
}

async fn recompute_completion(deps: &Deps<'_>, merchant: &dyn MerchantGateway, batch: &Batch) -> Result<(), Error> {
    let batch_repo = BatchRepository::new(deps.pool);
    let record_repo = RecordRepository::new(deps.pool);

    for stage in STAGES {
        if !stage_enabled(&batch.options, stage) {
            continue;
        }
        let remaining = record_repo.stage_remaining_count(batch.id, stage.jsonb_key()).await.map_err(Error::from)?;
        if remaining == 0 {
            mark_batch_stage_completed(&batch_repo, batch.id, stage).await?;
        }
    }

    let records_done = record_repo.all_stages_terminal(batch.id).await.map_err(Error::from)?;
    let open_searches = if batch.options.enable_merchant { merchant.open_searches(batch.id).await.map_err(Error::from)? } else { Vec::new() };

    if records_done && open_searches.is_empty() {
        batch_repo.set_overall_status(batch.id, OverallStatus::Completed).await.map_err(Error::from)?;
        batch_repo.set_progress_message(batch.id, "completed").await.map_err(Error::from)?;
    } else {
        batch_repo.set_overall_status(batch.id, OverallStatus::Processing).await.map_err(Error::from)?;
        let processed = record_repo.count_for_batch(batch.id).await.map_err(Error::from)?;
        batch_repo
            .set_progress_message(batch.id, &format!("{} open merchant search(es), {} records tracked", open_searches.len(), processed))
            .await
            .map_err(Error::from)?;
    }
    Ok(())
}

pub async fn cancel_batch(deps: &Deps<'_>, merchant: &dyn MerchantGateway, batch_id: Uuid) -> Result<(), Error> {
    let batch_repo = BatchRepository::new(deps.pool);
    batch_repo.cancel(batch_id).await.map_err(Error::from)?;
    merchant.cancel_batch(batch_id).await.map_err(Error::from)?;
    Ok(())
}

/// Implements [`bsc::ResultReconciler`]: folds a terminal `MerchantSearch`
/// back into its Records (§4.5.2, §4.5.4). Holds an owned `PgPool` rather
/// than borrowing a repository since the background poller needs `'static`.
pub struct RecordReconciler {
    pool: PgPool,
}

impl RecordReconciler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn merchant_enrichment_from_match(m: &bsc::SearchMatch) -> MerchantEnrichment {
    MerchantEnrichment {
        status: MerchantEnrichmentStatus::Matched,
        business_name: Some(m.business_name.clone()),
        tax_id: m.tax_id.clone(),
        mcc: m.mcc.clone(),
        mcc_group: m.mcc_group.clone(),
        address: m.address.clone(),
        phone: m.phone.clone(),
        confidence_band: Some(m.confidence_band),
    }
}

fn no_match_enrichment() -> MerchantEnrichment {
    MerchantEnrichment { status: MerchantEnrichmentStatus::NoMatch, ..Default::default() }
}

fn skipped_enrichment() -> MerchantEnrichment {
    MerchantEnrichment { status: MerchantEnrichmentStatus::Skipped, ..Default::default() }
}

fn error_enrichment() -> MerchantEnrichment {
    MerchantEnrichment { status: MerchantEnrichmentStatus::Error, ..Default::default() }
}

fn query_names_from_payload(search: &bsc::SearchData) -> HashMap<Uuid, String> {
    let items: Vec<bsc::SearchItem> = serde_json::from_value(search.request_payload.clone()).unwrap_or_default();
    let name_by_cid: HashMap<_, _> = items.into_iter().map(|i| (i.client_reference_id, i.business_name)).collect();
    search.record_id_mapping.iter().map(|(rid, cid)| (*rid, name_by_cid.get(cid).cloned().unwrap_or_default())).collect()
}

#[async_trait]
impl bsc::ResultReconciler for RecordReconciler {
    async fn reconcile(&self, search: &bsc::AnySearch) -> bsc::Result<()> {
        let record_repo = RecordRepository::new(&self.pool);
        let map_db = |e: DbError| bsc::BscError::Other(e.into());

        let batch_repo = BatchRepository::new(&self.pool);

        match search {
            bsc::AnySearch::Completed(s) => {
                let query_names = query_names_from_payload(&s.data);
                let reconciled = bsc::reconcile_completed(s, &query_names);
                for r in reconciled {
                    let enrichment = r.best_match.as_ref().map(merchant_enrichment_from_match).unwrap_or_else(no_match_enrichment);
                    record_repo.apply_merchant_enrichment(r.record_id, &enrichment, StageStatus::Completed).await.map_err(map_db)?;
                    self.bump_processed_if_terminal(&record_repo, &batch_repo, s.data.batch_id, r.record_id).await?;
                }
                Ok(())
            }
            bsc::AnySearch::NoResults(s) => {
                for record_id in s.data.record_id_mapping.keys() {
                    record_repo.apply_merchant_enrichment(*record_id, &no_match_enrichment(), StageStatus::Completed).await.map_err(map_db)?;
                    self.bump_processed_if_terminal(&record_repo, &batch_repo, s.data.batch_id, *record_id).await?;
                }
                Ok(())
            }
            bsc::AnySearch::Timeout(s) => {
                for record_id in s.data.record_id_mapping.keys() {
                    record_repo.apply_merchant_enrichment(*record_id, &skipped_enrichment(), StageStatus::Skipped).await.map_err(map_db)?;
                    self.bump_processed_if_terminal(&record_repo, &batch_repo, s.data.batch_id, *record_id).await?;
                }
                Ok(())
            }
            bsc::AnySearch::Failed(s) => {
                for record_id in s.data.record_id_mapping.keys() {
                    record_repo.apply_merchant_enrichment(*record_id, &error_enrichment(), StageStatus::Failed).await.map_err(map_db)?;
                    self.bump_processed_if_terminal(&record_repo, &batch_repo, s.data.batch_id, *record_id).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl RecordReconciler {
    /// Folds a record into the batch's `processed_records` hint exactly once,
    /// at the write that makes its last enabled stage terminal.
    async fn bump_processed_if_terminal(
        &self,
        record_repo: &RecordRepository<'_>,
        batch_repo: &BatchRepository<'_>,
        batch_id: Uuid,
        record_id: Uuid,
    ) -> bsc::Result<()> {
        let map_db = |e: DbError| bsc::BscError::Other(e.into());
        if record_repo.record_fully_terminal(record_id).await.map_err(map_db)? {
            batch_repo.increment_processed(batch_id, 1).await.map_err(map_db)?;
        }
        Ok(())
    }
}

/// Outcome of the ad-hoc single-record path (§4.7 progressive API). `job_id`
/// is always populated (a single classification is a Batch of one, §3
/// "Record owned by exactly one Batch") so `GET /classify-status/{job_id}`
/// can retrieve the same row regardless of whether this call finished within
/// budget.
pub struct SingleOutcome {
    pub job_id: Uuid,
    pub record: Record,
    pub merchant_dispatched: bool,
    pub search_id: Option<bsc::SearchId>,
    pub within_budget: bool,
}

/// Drives one ad-hoc payee through the full pipeline, within
/// `progressive_budget`. If classify/match/address finish in time, the
/// caller gets a complete result; otherwise `within_budget=false` and the
/// caller should report `{job_id, stage, partials}` instead (§4.7 contract).
pub async fn classify_single(
    deps: &Deps<'_>,
    merchant: &dyn MerchantGateway,
    original_name: &str,
    input_address: Address,
    options: BatchOptions,
    progressive_budget: std::time::Duration,
) -> Result<SingleOutcome, Error> {
    let batch_repo = BatchRepository::new(deps.pool);
    let record_repo = RecordRepository::new(deps.pool);

    let batch_id = Uuid::new_v4();
    let record_id = Uuid::new_v4();
    batch_repo.create(batch_id, 1, options.clone()).await.map_err(Error::from)?;
    record_repo
        .insert_batch(batch_id, &[crate::db::handlers::records::NewRecord { id: record_id, original_name: original_name.to_string(), input_address }], &options)
        .await
        .map_err(Error::from)?;

    let batch = batch_repo.get(batch_id).await.map_err(Error::from)?.expect("just created");

    let within_budget = tokio::time::timeout(progressive_budget, async {
        let record = record_repo.get(record_id).await.map_err(Error::from)?.expect("just inserted");
        process_record(deps, &batch, &record).await
    })
    .await
    .is_ok();

    let record = record_repo.get(record_id).await.map_err(Error::from)?.expect("record exists");

    let mut merchant_dispatched = false;
    let mut search_id = None;
    if options.enable_merchant && record.payee_type == PayeeType::Business && record.confidence.value() >= deps.merchant_confidence_threshold {
        let bsc_eligible = vec![to_eligible(&record)];
        let mut groups = bsc::batch::group_for_submission(&bsc_eligible);
        if let Some(group) = groups.pop() {
            if let Ok(search) = merchant.submit(batch_id, group).await {
                record_repo.mark_merchant_in_progress(record_id).await.map_err(Error::from)?;
                merchant_dispatched = true;
                search_id = Some(search.search_id());
            }
        }
    }

    let record = record_repo.get(record_id).await.map_err(Error::from)?.expect("record exists");
    Ok(SingleOutcome { job_id: batch_id, record, merchant_dispatched, search_id, within_budget })
}

/// Stable sort key used when reporting "top k alternates" in API responses
/// (§4.2 "Outputs"): highest score first, then shorter/alphabetical id.
pub fn score_desc(a: MatchScore, b: MatchScore) -> std::cmp::Ordering {
    b.value().partial_cmp(&a.value()).unwrap_or(std::cmp::Ordering::Equal)
}

#[allow(dead_code)]
fn match_type_is_ai(t: MatchType) -> bool {
    matches!(t, MatchType::AiEnhanced)
}

pub type SharedMerchantGateway = Arc<dyn MerchantGateway>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_confidence_business_needs_review() {
        assert!(needs_classification_review(PayeeType::Business, Confidence::new(0.05)));
        assert!(needs_classification_review(PayeeType::Individual, Confidence::new(0.79)));
    }

    #[test]
    fn high_confidence_business_does_not_need_review() {
        assert!(!needs_classification_review(PayeeType::Business, Confidence::new(0.80)));
        assert!(!needs_classification_review(PayeeType::Business, Confidence::new(0.95)));
    }

    #[test]
    fn non_auto_labeled_types_are_never_flagged() {
        assert!(!needs_classification_review(PayeeType::Unknown, Confidence::ZERO));
        assert!(!needs_classification_review(PayeeType::Government, Confidence::new(0.1)));
    }
}
