//! Core domain types (§3): Batch, Record, Supplier, and the newtypes that
//! enforce the score/confidence bounds in the type system rather than by
//! convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A supplier-match score, always in `[0, 100]`. Constructing one clamps
/// rather than panics, matching FM's "combiner MUST clamp" requirement.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchScore(f64);

impl MatchScore {
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 100.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

/// A classification confidence, always in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f64);

impl Confidence {
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub const ZERO: Confidence = Confidence(0.0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
    /// Classification completed but confidence fell below the auto-label
    /// threshold (§4.3: "records with confidence < 0.80 MUST NOT be
    /// auto-labeled ... without a fallback path"). Terminal for batch
    /// completion purposes — the record isn't blocking the pipeline, it's
    /// flagged for a human to confirm the label.
    ReviewNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Received,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "PascalCase")]
pub enum PayeeType {
    Individual,
    Business,
    Government,
    Insurance,
    Banking,
    InternalTransfer,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Prefix,
    Token,
    Phonetic,
    AiEnhanced,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MerchantEnrichmentStatus {
    None,
    Pending,
    Matched,
    NoMatch,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Address {
    pub line1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    pub enable_classify: bool,
    pub enable_finexio: bool,
    pub enable_address: bool,
    pub enable_merchant: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct StageStatuses {
    pub classify: Option<StageStatus>,
    pub finexio: Option<StageStatus>,
    pub address: Option<StageStatus>,
    pub merchant: Option<StageStatus>,
}

impl StageStatuses {
    /// Every stage enabled by `options` is terminal (completed/skipped/failed).
    pub fn all_enabled_terminal(&self, options: &BatchOptions) -> bool {
        let terminal = |s: Option<StageStatus>| matches!(s, Some(StageStatus::Completed | StageStatus::Skipped | StageStatus::Failed | StageStatus::ReviewNeeded));
        (!options.enable_classify || terminal(self.classify))
            && (!options.enable_finexio || terminal(self.finexio))
            && (!options.enable_address || terminal(self.address))
            && (!options.enable_merchant || terminal(self.merchant))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub total_records: i64,
    pub processed_records: i64,
    pub stage_status: StageStatuses,
    pub overall_status: OverallStatus,
    pub options: BatchOptions,
    pub progress_message: Option<String>,
}

impl Batch {
    /// Percentage of this batch's records that have reached a terminal state
    /// on every stage they have enabled (§4.7 batch progress fields). Backed
    /// by `processed_records`, which `db::handlers::records::record_fully_terminal`
    /// increments exactly once per record via `BatchRepository::increment_processed`.
    pub fn merchant_enrichment_progress(&self) -> u8 {
        if self.total_records == 0 {
            return 100;
        }
        ((self.processed_records.min(self.total_records) as f64 / self.total_records as f64) * 100.0) as u8
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupplierMatch {
    pub supplier_id: Option<String>,
    pub matched_name: Option<String>,
    pub score: Option<MatchScore>,
    pub match_type: Option<MatchType>,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatedAddress {
    pub formatted: Option<String>,
    pub components: Option<Address>,
    pub confidence: Option<f64>,
    pub verdict: Option<String>,
    pub enhancement_used: bool,
    pub enhancement_strategy: Option<String>,
    pub enhancement_reasoning: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MerchantEnrichment {
    pub status: MerchantEnrichmentStatus,
    pub business_name: Option<String>,
    pub tax_id: Option<String>,
    pub mcc: Option<String>,
    pub mcc_group: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub confidence_band: Option<bsc::ConfidenceBand>,
}

impl Default for MerchantEnrichmentStatus {
    fn default() -> Self {
        MerchantEnrichmentStatus::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub original_name: String,
    pub cleaned_name: String,
    pub input_address: Address,
    pub payee_type: PayeeType,
    pub confidence: Confidence,
    pub sic_code: Option<String>,
    pub supplier_match: SupplierMatch,
    pub validated_address: Option<ValidatedAddress>,
    pub merchant_enrichment: MerchantEnrichment,
    pub per_stage_status: StageStatuses,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Supplier {
    pub supplier_id: String,
    pub payee_name: String,
    pub normalized_name: String,
    pub business_name: Option<String>,
    pub dba: Option<String>,
    pub legal_name: Option<String>,
    pub ein: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub mcc: Option<String>,
    pub industry: Option<String>,
    pub payment_type: Option<String>,
    pub has_business_indicator: bool,
    pub common_name_score: f64,
    pub name_length: i32,
}
