//! Repository backing the Supplier Cache (§4.1). Owns the `suppliers` table
//! and its four retrieval indexes; `crate::sc` builds the union/dedupe/cap
//! policy on top of the raw queries exposed here.
//!
//! Every query binds its parameters — never string-interpolates — so
//! punctuation and SQL metacharacters in a payee name can't reach the
//! server as anything but a bound value (§8 boundary test).

use sqlx::PgPool;
use tracing::instrument;

use crate::db::errors::Result;
use crate::domain::Supplier;
use crate::fm::normalize;

pub struct SupplierRepository<'a> {
    pool: &'a PgPool,
}

struct SupplierRow {
    supplier_id: String,
    payee_name: String,
    normalized_name: String,
    business_name: Option<String>,
    dba: Option<String>,
    legal_name: Option<String>,
    ein: Option<String>,
    city: Option<String>,
    state: Option<String>,
    mcc: Option<String>,
    industry: Option<String>,
    payment_type: Option<String>,
    has_business_indicator: bool,
    common_name_score: f64,
    name_length: i32,
}

impl From<SupplierRow> for Supplier {
    fn from(r: SupplierRow) -> Self {
        Supplier {
            supplier_id: r.supplier_id,
            payee_name: r.payee_name,
            normalized_name: r.normalized_name,
            business_name: r.business_name,
            dba: r.dba,
            legal_name: r.legal_name,
            ein: r.ein,
            city: r.city,
            state: r.state,
            mcc: r.mcc,
            industry: r.industry,
            payment_type: r.payment_type,
            has_business_indicator: r.has_business_indicator,
            common_name_score: r.common_name_score,
            name_length: r.name_length,
        }
    }
}

impl<'a> SupplierRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// One row of an out-of-band supplier-network sync (§3 "Supplier rows
    /// are created/updated by an out-of-band sync"). `upsert_batch` applies
    /// every row atomically by `supplier_id`.
    #[instrument(skip(self, rows), fields(count = rows.len()), err)]
    pub async fn upsert_batch(&self, rows: &[Supplier]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for s in rows {
            sqlx::query!(
                r#"
                INSERT INTO suppliers (supplier_id, payee_name, normalized_name, business_name, dba, legal_name, ein,
                                        city, state, mcc, industry, payment_type, has_business_indicator,
                                        common_name_score, name_length)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (supplier_id) DO UPDATE SET
                    payee_name = EXCLUDED.payee_name,
                    normalized_name = EXCLUDED.normalized_name,
                    business_name = EXCLUDED.business_name,
                    dba = EXCLUDED.dba,
                    legal_name = EXCLUDED.legal_name,
                    ein = EXCLUDED.ein,
                    city = EXCLUDED.city,
                    state = EXCLUDED.state,
                    mcc = EXCLUDED.mcc,
                    industry = EXCLUDED.industry,
                    payment_type = EXCLUDED.payment_type,
                    has_business_indicator = EXCLUDED.has_business_indicator,
                    common_name_score = EXCLUDED.common_name_score,
                    name_length = EXCLUDED.name_length
                "#,
                s.supplier_id,
                s.payee_name,
                s.normalized_name,
                s.business_name,
                s.dba,
                s.legal_name,
                s.ein,
                s.city,
                s.state,
                s.mcc,
                s.industry,
                s.payment_type,
                s.has_business_indicator,
                s.common_name_score,
                s.name_length,
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn exact(&self, normalized_query: &str, limit: i64) -> Result<Vec<Supplier>> {
        let rows = sqlx::query_as!(
            SupplierRow,
            r#"SELECT supplier_id, payee_name, normalized_name, business_name, dba, legal_name, ein, city, state, mcc,
                      industry, payment_type, has_business_indicator, common_name_score, name_length
               FROM suppliers WHERE normalized_name = $1 LIMIT $2"#,
            normalized_query,
            limit,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn prefix(&self, normalized_query: &str, limit: i64) -> Result<Vec<Supplier>> {
        // `LIKE` with a trailing-only wildcard on an indexed column (see
        // the `text_pattern_ops` index in migrations) stays sub-linear; no
        // leading wildcard is ever used here.
        let pattern = format!("{normalized_query}%");
        let rows = sqlx::query_as!(
            SupplierRow,
            r#"SELECT supplier_id, payee_name, normalized_name, business_name, dba, legal_name, ein, city, state, mcc,
                      industry, payment_type, has_business_indicator, common_name_score, name_length
               FROM suppliers WHERE normalized_name LIKE $1 LIMIT $2"#,
            pattern,
            limit,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Trigram/substring containment via `pg_trgm`'s `%` similarity
    /// operator, backed by the GIN index in migrations.
    pub async fn trigram(&self, normalized_query: &str, limit: i64) -> Result<Vec<Supplier>> {
        let rows = sqlx::query_as!(
            SupplierRow,
            r#"SELECT supplier_id, payee_name, normalized_name, business_name, dba, legal_name, ein, city, state, mcc,
                      industry, payment_type, has_business_indicator, common_name_score, name_length
               FROM suppliers WHERE normalized_name % $1
               ORDER BY similarity(normalized_name, $1) DESC LIMIT $2"#,
            normalized_query,
            limit,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn first_token(&self, first_token: &str, limit: i64) -> Result<Vec<Supplier>> {
        let rows = sqlx::query_as!(
            SupplierRow,
            r#"SELECT supplier_id, payee_name, normalized_name, business_name, dba, legal_name, ein, city, state, mcc,
                      industry, payment_type, has_business_indicator, common_name_score, name_length
               FROM suppliers WHERE split_part(normalized_name, ' ', 1) = $1 LIMIT $2"#,
            first_token,
            limit,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn row_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar!("SELECT COUNT(*) FROM suppliers").fetch_one(self.pool).await?;
        Ok(count.unwrap_or(0))
    }
}

/// Normalizes the same way `crate::fm::normalize` does, so the cache's
/// retrieval indexes and FM's scoring agree on what "normalized" means
/// (§4.1 retrieval strategy, §4.2 step 1).
pub fn normalize_for_lookup(name: &str) -> String {
    normalize(name)
}
