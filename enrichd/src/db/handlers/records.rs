//! Repository for `records` (§3 Record/PayeeClassification). A Record is
//! owned by exactly one Batch and mutable only by EO or BSC reconciliation
//! (§3 invariant); every write here goes through one stage-scoped method
//! rather than a generic "update the whole row".

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{Address, BatchOptions, Confidence, MerchantEnrichment, PayeeType, Record, StageStatus, StageStatuses, SupplierMatch, ValidatedAddress};
use crate::db::errors::Result;

pub struct RecordRepository<'a> {
    pool: &'a PgPool,
}

struct RecordRow {
    id: Uuid,
    batch_id: Uuid,
    original_name: String,
    cleaned_name: String,
    input_address: Value,
    payee_type: String,
    confidence: f64,
    sic_code: Option<String>,
    supplier_match: Value,
    validated_address: Option<Value>,
    merchant_enrichment: Value,
    per_stage_status: Value,
    created_at: chrono::DateTime<Utc>,
}

fn parse_payee_type(s: &str) -> PayeeType {
    match s {
        "Individual" => PayeeType::Individual,
        "Business" => PayeeType::Business,
        "Government" => PayeeType::Government,
        "Insurance" => PayeeType::Insurance,
        "Banking" => PayeeType::Banking,
        "InternalTransfer" => PayeeType::InternalTransfer,
        _ => PayeeType::Unknown,
    }
}

fn payee_type_str(t: PayeeType) -> &'static str {
    match t {
        PayeeType::Individual => "Individual",
        PayeeType::Business => "Business",
        PayeeType::Government => "Government",
        PayeeType::Insurance => "Insurance",
        PayeeType::Banking => "Banking",
        PayeeType::InternalTransfer => "InternalTransfer",
        PayeeType::Unknown => "Unknown",
    }
}

impl RecordRow {
    fn into_domain(self) -> Record {
        Record {
            id: self.id,
            batch_id: self.batch_id,
            original_name: self.original_name,
            cleaned_name: self.cleaned_name,
            input_address: serde_json::from_value(self.input_address).unwrap_or_default(),
            payee_type: parse_payee_type(&self.payee_type),
            confidence: Confidence::new(self.confidence),
            sic_code: self.sic_code,
            supplier_match: serde_json::from_value(self.supplier_match).unwrap_or_default(),
            validated_address: self.validated_address.and_then(|v| serde_json::from_value(v).ok()),
            merchant_enrichment: serde_json::from_value(self.merchant_enrichment).unwrap_or_default(),
            per_stage_status: serde_json::from_value(self.per_stage_status).unwrap_or_default(),
            created_at: self.created_at,
        }
    }
}

/// One row of a bulk insert from the upload boundary: free-text name plus
/// whatever address parts the column mapping supplied.
pub struct NewRecord {
    pub id: Uuid,
    pub original_name: String,
    pub input_address: Address,
}

impl<'a> RecordRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Initial `per_stage_status` reflects `options` up front: a stage the
    /// batch never enables starts `skipped` rather than `pending`, so it's
    /// never picked up by `list_pending_classify`/`list_merchant_eligible`
    /// and never keeps a finished batch's tick loop busy re-scanning it.
    #[instrument(skip(self, records), fields(batch_id = %batch_id, count = records.len()), err)]
    pub async fn insert_batch(&self, batch_id: Uuid, records: &[NewRecord], options: &BatchOptions) -> Result<()> {
        let created_at = Utc::now();
        let initial_status = |enabled: bool| Some(if enabled { StageStatus::Pending } else { StageStatus::Skipped });
        let pending = serde_json::to_value(StageStatuses {
            classify: initial_status(options.enable_classify),
            finexio: initial_status(options.enable_finexio),
            address: initial_status(options.enable_address),
            merchant: initial_status(options.enable_merchant),
        })
        .unwrap();
        let empty_merchant = serde_json::to_value(MerchantEnrichment::default()).unwrap();
        let empty_supplier_match = serde_json::to_value(SupplierMatch::default()).unwrap();

        let mut tx = self.pool.begin().await?;
        for r in records {
            let cleaned = crate::fm::normalize(&r.original_name);
            let input_address_json = serde_json::to_value(&r.input_address).unwrap();
            sqlx::query!(
                r#"
                INSERT INTO records (id, batch_id, original_name, cleaned_name, input_address, payee_type, confidence,
                                      sic_code, supplier_match, validated_address, merchant_enrichment, per_stage_status, created_at)
                VALUES ($1, $2, $3, $4, $5, 'Unknown', 0.0, NULL, $6, NULL, $7, $8, $9)
                "#,
                r.id,
                batch_id,
                r.original_name,
                cleaned,
                input_address_json,
                empty_supplier_match,
                empty_merchant,
                pending,
                created_at,
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Record>> {
        let row = sqlx::query_as!(
            RecordRow,
            r#"SELECT id, batch_id, original_name, cleaned_name, input_address, payee_type, confidence, sic_code,
                      supplier_match, validated_address, merchant_enrichment, per_stage_status, created_at
               FROM records WHERE id = $1"#,
            id,
        )
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(RecordRow::into_domain))
    }

    pub async fn list_for_batch(&self, batch_id: Uuid, limit: i64, offset: i64) -> Result<Vec<Record>> {
        let rows = sqlx::query_as!(
            RecordRow,
            r#"SELECT id, batch_id, original_name, cleaned_name, input_address, payee_type, confidence, sic_code,
                      supplier_match, validated_address, merchant_enrichment, per_stage_status, created_at
               FROM records WHERE batch_id = $1 ORDER BY created_at ASC LIMIT $2 OFFSET $3"#,
            batch_id,
            limit,
            offset,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(RecordRow::into_domain).collect())
    }

    /// Records not yet picked up for orchestration at all (used by EO to
    /// pull fresh work; §5 "orchestrator pulls records, never busy-waits").
    pub async fn list_pending_classify(&self, batch_id: Uuid, limit: i64) -> Result<Vec<Record>> {
        let rows = sqlx::query_as!(
            RecordRow,
            r#"SELECT id, batch_id, original_name, cleaned_name, input_address, payee_type, confidence, sic_code,
                      supplier_match, validated_address, merchant_enrichment, per_stage_status, created_at
               FROM records
               WHERE batch_id = $1 AND (per_stage_status->>'classify' = 'pending' OR per_stage_status->>'finexio' = 'pending')
               ORDER BY created_at ASC LIMIT $2"#,
            batch_id,
            limit,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(RecordRow::into_domain).collect())
    }

    /// Business records whose classify+finexio stages are terminal and
    /// whose merchant stage is still pending — the set BSC batches up for
    /// submission (§4.7 step 4).
    pub async fn list_merchant_eligible(&self, batch_id: Uuid, limit: i64) -> Result<Vec<Record>> {
        let rows = sqlx::query_as!(
            RecordRow,
            r#"SELECT id, batch_id, original_name, cleaned_name, input_address, payee_type, confidence, sic_code,
                      supplier_match, validated_address, merchant_enrichment, per_stage_status, created_at
               FROM records
               WHERE batch_id = $1
                 AND payee_type = 'Business'
                 AND per_stage_status->>'merchant' = 'pending'
                 AND per_stage_status->>'classify' IN ('completed', 'skipped', 'failed', 'review_needed')
                 AND per_stage_status->>'finexio' IN ('completed', 'skipped', 'failed', 'review_needed')
               ORDER BY created_at ASC LIMIT $2"#,
            batch_id,
            limit,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(RecordRow::into_domain).collect())
    }

    pub async fn apply_classification(&self, id: Uuid, payee_type: PayeeType, confidence: Confidence, sic_code: Option<&str>, stage: crate::domain::StageStatus) -> Result<()> {
        let stage_json = serde_json::to_value(stage).unwrap();
        sqlx::query!(
            r#"
            UPDATE records
            SET payee_type = $2, confidence = $3, sic_code = $4,
                per_stage_status = jsonb_set(per_stage_status, '{classify}', $5)
            WHERE id = $1
            "#,
            id,
            payee_type_str(payee_type),
            confidence.value(),
            sic_code,
            stage_json,
        )
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn apply_supplier_match(&self, id: Uuid, supplier_match: &SupplierMatch, stage: crate::domain::StageStatus) -> Result<()> {
        let match_json = serde_json::to_value(supplier_match).unwrap();
        let stage_json = serde_json::to_value(stage).unwrap();
        sqlx::query!(
            r#"
            UPDATE records
            SET supplier_match = $2, per_stage_status = jsonb_set(per_stage_status, '{finexio}', $3)
            WHERE id = $1
            "#,
            id,
            match_json,
            stage_json,
        )
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn apply_validated_address(&self, id: Uuid, validated: &ValidatedAddress, stage: crate::domain::StageStatus) -> Result<()> {
        let addr_json = serde_json::to_value(validated).unwrap();
        let stage_json = serde_json::to_value(stage).unwrap();
        sqlx::query!(
            r#"
            UPDATE records
            SET validated_address = $2, per_stage_status = jsonb_set(per_stage_status, '{address}', $3)
            WHERE id = $1
            "#,
            id,
            addr_json,
            stage_json,
        )
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Marks the merchant stage `pending` -> `in_progress` as soon as a
    /// record is folded into a submitted BSC search, so EO doesn't pick it
    /// up again while the search is outstanding.
    pub async fn mark_merchant_in_progress(&self, id: Uuid) -> Result<()> {
        let stage_json = serde_json::to_value(crate::domain::StageStatus::InProgress).unwrap();
        sqlx::query!("UPDATE records SET per_stage_status = jsonb_set(per_stage_status, '{merchant}', $2) WHERE id = $1", id, stage_json)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Reconciles BSC's per-record outcome (§4.5.4/§4.5.5). `status` drives
    /// both the `merchant_enrichment.status` field and the stage terminal
    /// state in one write, matching BSC's "idempotent reconciliation"
    /// requirement (re-applying the same outcome is a no-op in effect).
    #[instrument(skip(self, enrichment), fields(record_id = %id), err)]
    pub async fn apply_merchant_enrichment(&self, id: Uuid, enrichment: &MerchantEnrichment, stage: crate::domain::StageStatus) -> Result<()> {
        let enrichment_json = serde_json::to_value(enrichment).unwrap();
        let stage_json = serde_json::to_value(stage).unwrap();
        sqlx::query!(
            r#"
            UPDATE records
            SET merchant_enrichment = $2, per_stage_status = jsonb_set(per_stage_status, '{merchant}', $3)
            WHERE id = $1
            "#,
            id,
            enrichment_json,
            stage_json,
        )
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_for_batch(&self, batch_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar!("SELECT COUNT(*) FROM records WHERE batch_id = $1", batch_id).fetch_one(self.pool).await?;
        Ok(count.unwrap_or(0))
    }

    /// `true` once every Record of this batch has every enabled stage
    /// terminal (§8 "Batch completion" property, Record half of it).
    pub async fn all_stages_terminal(&self, batch_id: Uuid) -> Result<bool> {
        let remaining = sqlx::query_scalar!(
            r#"
            SELECT COUNT(*) FROM records, batches
            WHERE records.batch_id = $1 AND batches.id = $1
              AND (
                (batches.options->>'enable_classify' = 'true' AND records.per_stage_status->>'classify' NOT IN ('completed','skipped','failed','review_needed'))
                OR (batches.options->>'enable_finexio' = 'true' AND records.per_stage_status->>'finexio' NOT IN ('completed','skipped','failed','review_needed'))
                OR (batches.options->>'enable_address' = 'true' AND records.per_stage_status->>'address' NOT IN ('completed','skipped','failed','review_needed'))
                OR (batches.options->>'enable_merchant' = 'true' AND records.per_stage_status->>'merchant' NOT IN ('completed','skipped','failed','review_needed'))
              )
            "#,
            batch_id,
        )
        .fetch_one(self.pool)
        .await?;
        Ok(remaining.unwrap_or(1) == 0)
    }

    /// Single-record version of [`Self::all_stages_terminal`], used by EO to
    /// detect the exact write that makes a record's last enabled stage
    /// terminal so `BatchRepository::increment_processed` is only driven by
    /// that transition.
    pub async fn record_fully_terminal(&self, id: Uuid) -> Result<bool> {
        let remaining = sqlx::query_scalar!(
            r#"
            SELECT COUNT(*) FROM records, batches
            WHERE records.id = $1 AND batches.id = records.batch_id
              AND (
                (batches.options->>'enable_classify' = 'true' AND records.per_stage_status->>'classify' NOT IN ('completed','skipped','failed','review_needed'))
                OR (batches.options->>'enable_finexio' = 'true' AND records.per_stage_status->>'finexio' NOT IN ('completed','skipped','failed','review_needed'))
                OR (batches.options->>'enable_address' = 'true' AND records.per_stage_status->>'address' NOT IN ('completed','skipped','failed','review_needed'))
                OR (batches.options->>'enable_merchant' = 'true' AND records.per_stage_status->>'merchant' NOT IN ('completed','skipped','failed','review_needed'))
              )
            "#,
            id,
        )
        .fetch_one(self.pool)
        .await?;
        Ok(remaining.unwrap_or(1) == 0)
    }

    /// Count of records still outstanding on one named stage across a batch,
    /// used by `recompute_completion` to decide whether to CAS the batch-level
    /// `stage_status` for that stage to `completed`.
    pub async fn stage_remaining_count(&self, batch_id: Uuid, stage_key: &str) -> Result<i64> {
        let remaining = sqlx::query_scalar!(
            r#"SELECT COUNT(*) FROM records WHERE batch_id = $1 AND per_stage_status->>$2 NOT IN ('completed','skipped','failed','review_needed')"#,
            batch_id,
            stage_key,
        )
        .fetch_one(self.pool)
        .await?;
        Ok(remaining.unwrap_or(0))
    }

    /// Count of records in a batch whose Finexio match actually resolved to
    /// a supplier (§4.7 batch progress field `finexio_matched_count`).
    pub async fn count_finexio_matched(&self, batch_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar!(
            r#"SELECT COUNT(*) FROM records WHERE batch_id = $1 AND supplier_match->>'supplier_id' IS NOT NULL"#,
            batch_id,
        )
        .fetch_one(self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    /// Records whose classify+finexio stages are terminal, whose merchant
    /// stage is still `pending`, and that will never become merchant-eligible
    /// (not `payee_type=Business`, or `Business` below the confidence
    /// threshold). Without this, such a record's merchant stage stays
    /// `pending` forever and the batch can never reach
    /// `all_stages_terminal` (§8 "Batch completion" property).
    pub async fn list_merchant_ineligible(&self, batch_id: Uuid, confidence_threshold: f64) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar!(
            r#"
            SELECT id FROM records
            WHERE batch_id = $1
              AND per_stage_status->>'merchant' = 'pending'
              AND per_stage_status->>'classify' IN ('completed','skipped','failed','review_needed')
              AND per_stage_status->>'finexio' IN ('completed','skipped','failed','review_needed')
              AND NOT (payee_type = 'Business' AND confidence >= $2)
            "#,
            batch_id,
            confidence_threshold,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(ids)
    }
}
