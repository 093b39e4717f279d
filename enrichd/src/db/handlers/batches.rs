//! Repository for `batches` (§3 Batch, §4.8): the only writer of Batch rows.
//! Stage-status transitions are compare-and-set so a webhook callback and a
//! poller tick racing on the same batch can't silently clobber each other
//! (§5 "webhook and poller are mutually exclusive writers").

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::db::errors::Result;
use crate::domain::{Batch, BatchOptions, OverallStatus, StageStatus, StageStatuses};

pub struct BatchRepository<'a> {
    pool: &'a PgPool,
}

/// Which stage field a CAS targets. Kept as an enum rather than a free
/// string so the SQL text for every arm is a fixed literal — no stage name
/// is ever interpolated into a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Classify,
    Finexio,
    Address,
    Merchant,
}

impl Stage {
    pub(crate) fn jsonb_key(self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::Finexio => "finexio",
            Stage::Address => "address",
            Stage::Merchant => "merchant",
        }
    }
}

struct BatchRow {
    id: Uuid,
    created_at: chrono::DateTime<Utc>,
    total_records: i64,
    processed_records: i64,
    stage_status: Value,
    overall_status: String,
    options: Value,
    progress_message: Option<String>,
}

impl BatchRow {
    fn into_domain(self) -> Batch {
        Batch {
            id: self.id,
            created_at: self.created_at,
            total_records: self.total_records,
            processed_records: self.processed_records,
            stage_status: serde_json::from_value(self.stage_status).unwrap_or_default(),
            overall_status: parse_overall_status(&self.overall_status),
            options: serde_json::from_value(self.options).unwrap_or(BatchOptions {
                enable_classify: true,
                enable_finexio: true,
                enable_address: true,
                enable_merchant: true,
            }),
            progress_message: self.progress_message,
        }
    }
}

fn parse_overall_status(s: &str) -> OverallStatus {
    match s {
        "received" => OverallStatus::Received,
        "processing" => OverallStatus::Processing,
        "completed" => OverallStatus::Completed,
        "cancelled" => OverallStatus::Cancelled,
        _ => OverallStatus::Failed,
    }
}

fn overall_status_str(s: OverallStatus) -> &'static str {
    match s {
        OverallStatus::Received => "received",
        OverallStatus::Processing => "processing",
        OverallStatus::Completed => "completed",
        OverallStatus::Cancelled => "cancelled",
        OverallStatus::Failed => "failed",
    }
}

fn stage_status_str(s: StageStatus) -> &'static str {
    match s {
        StageStatus::Pending => "pending",
        StageStatus::InProgress => "in_progress",
        StageStatus::Completed => "completed",
        StageStatus::Skipped => "skipped",
        StageStatus::Failed => "failed",
        StageStatus::ReviewNeeded => "review_needed",
    }
}

impl<'a> BatchRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Creates a Batch in `received` with every enabled stage `pending` and
    /// every disabled stage `skipped`. `total_records` is known up front
    /// since the upload boundary has already parsed the file.
    #[instrument(skip(self, options), fields(batch_id = %id), err)]
    pub async fn create(&self, id: Uuid, total_records: i64, options: BatchOptions) -> Result<Batch> {
        let stage_status = StageStatuses {
            classify: Some(if options.enable_classify { StageStatus::Pending } else { StageStatus::Skipped }),
            finexio: Some(if options.enable_finexio { StageStatus::Pending } else { StageStatus::Skipped }),
            address: Some(if options.enable_address { StageStatus::Pending } else { StageStatus::Skipped }),
            merchant: Some(if options.enable_merchant { StageStatus::Pending } else { StageStatus::Skipped }),
        };
        let stage_status_json = serde_json::to_value(stage_status).unwrap();
        let options_json = serde_json::to_value(&options).unwrap();
        let created_at = Utc::now();

        sqlx::query!(
            r#"
            INSERT INTO batches (id, created_at, total_records, processed_records, stage_status, overall_status, options, progress_message)
            VALUES ($1, $2, $3, 0, $4, 'received', $5, NULL)
            "#,
            id,
            created_at,
            total_records,
            stage_status_json,
            options_json,
        )
        .execute(self.pool)
        .await?;

        Ok(Batch { id, created_at, total_records, processed_records: 0, stage_status, overall_status: OverallStatus::Received, options, progress_message: None })
    }

    #[instrument(skip(self), fields(batch_id = %id), err)]
    pub async fn get(&self, id: Uuid) -> Result<Option<Batch>> {
        let row = sqlx::query_as!(
            BatchRow,
            r#"SELECT id, created_at, total_records, processed_records, stage_status, overall_status, options, progress_message FROM batches WHERE id = $1"#,
            id,
        )
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(BatchRow::into_domain))
    }

    /// Batches the background tick still needs to drive: not yet completed,
    /// cancelled, or failed. Used instead of `list` so the daemon never
    /// re-scans a batch that has nothing left to do (§5 "orchestrator pulls
    /// records, never busy-waits").
    pub async fn list_active(&self, limit: i64) -> Result<Vec<Batch>> {
        let rows = sqlx::query_as!(
            BatchRow,
            r#"SELECT id, created_at, total_records, processed_records, stage_status, overall_status, options, progress_message
               FROM batches WHERE overall_status IN ('received', 'processing') ORDER BY created_at ASC LIMIT $1"#,
            limit,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(BatchRow::into_domain).collect())
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Batch>> {
        let rows = sqlx::query_as!(
            BatchRow,
            r#"SELECT id, created_at, total_records, processed_records, stage_status, overall_status, options, progress_message
               FROM batches ORDER BY created_at DESC LIMIT $1 OFFSET $2"#,
            limit,
            offset,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(BatchRow::into_domain).collect())
    }

    /// Compare-and-set one stage's status. Returns `false` (not an error) if
    /// `expected` no longer matches — the caller re-reads and decides
    /// whether to retry, per `CoordinationError` semantics (§7).
    #[instrument(skip(self), fields(batch_id = %batch_id, stage = stage.jsonb_key()), err)]
    pub async fn cas_stage_status(&self, batch_id: Uuid, stage: Stage, expected: StageStatus, new: StageStatus) -> Result<bool> {
        let key = stage.jsonb_key();
        let expected_s = stage_status_str(expected);
        let new_json = serde_json::Value::String(stage_status_str(new).to_string());
        let updated = sqlx::query_scalar!(
            r#"
            UPDATE batches
            SET stage_status = jsonb_set(stage_status, ARRAY[$2], $3)
            WHERE id = $1 AND stage_status ->> $2 = $4
            RETURNING id
            "#,
            batch_id,
            key,
            new_json,
            expected_s,
        )
        .fetch_optional(self.pool)
        .await?;
        Ok(updated.is_some())
    }

    pub async fn set_progress_message(&self, batch_id: Uuid, message: &str) -> Result<()> {
        sqlx::query!("UPDATE batches SET progress_message = $2 WHERE id = $1", batch_id, message).execute(self.pool).await?;
        Ok(())
    }

    pub async fn increment_processed(&self, batch_id: Uuid, by: i64) -> Result<()> {
        sqlx::query!("UPDATE batches SET processed_records = processed_records + $2 WHERE id = $1", batch_id, by).execute(self.pool).await?;
        Ok(())
    }

    /// Sets `overall_status`, but never overwrites `cancelled` (§3 invariant:
    /// cancelled is terminal).
    pub async fn set_overall_status(&self, batch_id: Uuid, status: OverallStatus) -> Result<()> {
        sqlx::query!(
            "UPDATE batches SET overall_status = $2 WHERE id = $1 AND overall_status != 'cancelled'",
            batch_id,
            overall_status_str(status),
        )
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Marks a Batch cancelled. Idempotent; forbids further writes other
    /// than this by convention (every other write path checks
    /// `overall_status != 'cancelled'` first, see [`Self::set_overall_status`]).
    pub async fn cancel(&self, batch_id: Uuid) -> Result<()> {
        sqlx::query!("UPDATE batches SET overall_status = 'cancelled' WHERE id = $1", batch_id).execute(self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_roundtrip() {
        for s in [
            StageStatus::Pending,
            StageStatus::InProgress,
            StageStatus::Completed,
            StageStatus::Skipped,
            StageStatus::Failed,
            StageStatus::ReviewNeeded,
        ] {
            assert!(!stage_status_str(s).is_empty());
        }
    }

    #[test]
    fn overall_status_roundtrip() {
        for s in [OverallStatus::Received, OverallStatus::Processing, OverallStatus::Completed, OverallStatus::Cancelled, OverallStatus::Failed] {
            assert_eq!(parse_overall_status(overall_status_str(s)), s);
        }
    }
}
