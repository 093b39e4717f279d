//! PostgreSQL-backed `SearchStore`.
//!
//! State transitions are compare-and-set via `UPDATE ... WHERE state = $prev
//! RETURNING *`, the same shape used for request-state CAS: no separate
//! locking table, the `state` column's previous value is the optimistic
//! concurrency token. `(batch_id, content_hash)` carries a unique index so
//! concurrent submits race on `INSERT ... ON CONFLICT DO NOTHING` rather
//! than a check-then-insert window.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BscError, Result};
use crate::manager::{AnySearch, SearchStore};
use crate::search::{Search, SearchData};
use crate::state::{Completed, Failed, NoResults, Polling, Submitted, Timeout, WebhookReceived};
use crate::types::{SearchId, SearchMatch};

pub struct PostgresSearchStore {
    pool: PgPool,
}

impl PostgresSearchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn migrator() -> sqlx::migrate::Migrator {
        sqlx::migrate!("./migrations")
    }
}

struct SearchRow {
    search_id: Uuid,
    batch_id: Uuid,
    content_hash: String,
    record_id_mapping: Value,
    request_payload: Value,
    response_payload: Option<Value>,
    state: String,
    poll_attempts: i32,
    max_poll_attempts: i32,
    submitted_at: chrono::DateTime<chrono::Utc>,
    last_polled_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    error: Option<String>,
}

fn decode_mapping(v: &Value) -> crate::types::RecordIdMapping {
    serde_json::from_value(v.clone()).unwrap_or_default()
}

fn row_to_any(row: SearchRow) -> Result<AnySearch> {
    let data = SearchData {
        search_id: SearchId(row.search_id),
        batch_id: row.batch_id,
        content_hash: row.content_hash,
        record_id_mapping: decode_mapping(&row.record_id_mapping),
        request_payload: row.request_payload,
    };
    Ok(match row.state.as_str() {
        "submitted" => AnySearch::Submitted(Search { data, state: Submitted { submitted_at: row.submitted_at } }),
        "polling" => AnySearch::Polling(Search {
            data,
            state: Polling {
                submitted_at: row.submitted_at,
                poll_attempts: row.poll_attempts as u32,
                max_poll_attempts: row.max_poll_attempts as u32,
                last_polled_at: row.last_polled_at.unwrap_or(row.submitted_at),
            },
        }),
        "webhook_received" => AnySearch::WebhookReceived(Search {
            data,
            state: WebhookReceived {
                submitted_at: row.submitted_at,
                poll_attempts: row.poll_attempts as u32,
                received_at: row.last_polled_at.unwrap_or(row.submitted_at),
            },
        }),
        "completed" => {
            let matches: Vec<SearchMatch> = row
                .response_payload
                .as_ref()
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            AnySearch::Completed(Search {
                data,
                state: Completed { submitted_at: row.submitted_at, completed_at: row.completed_at.unwrap_or(row.submitted_at), matches },
            })
        }
        "no_results" => AnySearch::NoResults(Search {
            data,
            state: NoResults { submitted_at: row.submitted_at, completed_at: row.completed_at.unwrap_or(row.submitted_at) },
        }),
        "failed" => AnySearch::Failed(Search {
            data,
            state: Failed {
                submitted_at: row.submitted_at,
                failed_at: row.completed_at.unwrap_or(row.submitted_at),
                error: row.error.unwrap_or_default(),
            },
        }),
        "timeout" => AnySearch::Timeout(Search {
            data,
            state: Timeout {
                submitted_at: row.submitted_at,
                timed_out_at: row.completed_at.unwrap_or(row.submitted_at),
                poll_attempts: row.poll_attempts as u32,
            },
        }),
        other => return Err(BscError::Other(anyhow::anyhow!("unknown search state in storage: {other}"))),
    })
}

#[async_trait]
impl SearchStore for PostgresSearchStore {
    async fn find_by_content_hash(&self, batch_id: Uuid, content_hash: &str) -> Result<Option<AnySearch>> {
        let row = sqlx::query_as!(
            SearchRow,
            r#"
            SELECT search_id, batch_id, content_hash, record_id_mapping, request_payload,
                   response_payload, state, poll_attempts, max_poll_attempts,
                   submitted_at, last_polled_at, completed_at, error
            FROM merchant_searches
            WHERE batch_id = $1 AND content_hash = $2
            "#,
            batch_id,
            content_hash,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_any).transpose()
    }

    async fn create_submitted(&self, data: SearchData) -> Result<Search<Submitted>> {
        let submitted_at = chrono::Utc::now();
        let mapping = serde_json::to_value(&data.record_id_mapping).unwrap_or(Value::Null);
        let inserted = sqlx::query_scalar!(
            r#"
            INSERT INTO merchant_searches
                (search_id, batch_id, content_hash, record_id_mapping, request_payload, state,
                 poll_attempts, max_poll_attempts, submitted_at)
            VALUES ($1, $2, $3, $4, $5, 'submitted', 0, 0, $6)
            ON CONFLICT (batch_id, content_hash) DO NOTHING
            RETURNING search_id
            "#,
            data.search_id.0,
            data.batch_id,
            data.content_hash,
            mapping,
            data.request_payload,
            submitted_at,
        )
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            let existing = self
                .find_by_content_hash(data.batch_id, &data.content_hash)
                .await?
                .ok_or_else(|| BscError::Other(anyhow::anyhow!("duplicate insert raced but no row found")))?;
            return Err(BscError::DuplicateSubmission { batch_id: data.batch_id, existing: existing.search_id() });
        }

        Ok(Search { data, state: Submitted { submitted_at } })
    }

    async fn discard(&self, search_id: SearchId) -> Result<()> {
        sqlx::query!("DELETE FROM merchant_searches WHERE search_id = $1 AND state = 'submitted'", search_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_id(&self, search_id: SearchId) -> Result<Option<AnySearch>> {
        let row = sqlx::query_as!(
            SearchRow,
            r#"
            SELECT search_id, batch_id, content_hash, record_id_mapping, request_payload,
                   response_payload, state, poll_attempts, max_poll_attempts,
                   submitted_at, last_polled_at, completed_at, error
            FROM merchant_searches WHERE search_id = $1
            "#,
            search_id.0,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_any).transpose()
    }

    async fn list_open_for_batch(&self, batch_id: Uuid) -> Result<Vec<AnySearch>> {
        let rows = sqlx::query_as!(
            SearchRow,
            r#"
            SELECT search_id, batch_id, content_hash, record_id_mapping, request_payload,
                   response_payload, state, poll_attempts, max_poll_attempts,
                   submitted_at, last_polled_at, completed_at, error
            FROM merchant_searches
            WHERE batch_id = $1 AND state NOT IN ('completed', 'no_results', 'failed', 'timeout')
            "#,
            batch_id,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_any).collect()
    }

    async fn list_due_for_poll(&self, limit: usize) -> Result<Vec<AnySearch>> {
        let rows = sqlx::query_as!(
            SearchRow,
            r#"
            SELECT search_id, batch_id, content_hash, record_id_mapping, request_payload,
                   response_payload, state, poll_attempts, max_poll_attempts,
                   submitted_at, last_polled_at, completed_at, error
            FROM merchant_searches
            WHERE state IN ('submitted', 'polling')
            ORDER BY last_polled_at NULLS FIRST
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
            limit as i64,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_any).collect()
    }

    async fn persist_submitted(&self, search: &Search<Submitted>) -> Result<()> {
        // Only reachable on first create; CAS is the insert's uniqueness.
        let _ = search;
        Ok(())
    }

    async fn persist_polling(&self, prev_state_name: &'static str, search: &Search<Polling>) -> Result<()> {
        let updated = sqlx::query_scalar!(
            r#"
            UPDATE merchant_searches
            SET state = 'polling', poll_attempts = $1, max_poll_attempts = $2, last_polled_at = $3
            WHERE search_id = $4 AND state = $5
            RETURNING search_id
            "#,
            search.state.poll_attempts as i32,
            search.state.max_poll_attempts as i32,
            search.state.last_polled_at,
            search.search_id().0,
            prev_state_name,
        )
        .fetch_optional(&self.pool)
        .await?;
        updated.ok_or_else(|| BscError::CasConflict(search.search_id())).map(|_| ())
    }

    async fn persist_webhook_received(&self, prev_state_name: &'static str, search: &Search<WebhookReceived>) -> Result<()> {
        let updated = sqlx::query_scalar!(
            r#"
            UPDATE merchant_searches
            SET state = 'webhook_received', poll_attempts = $1, last_polled_at = $2
            WHERE search_id = $3 AND state = $4
            RETURNING search_id
            "#,
            search.state.poll_attempts as i32,
            search.state.received_at,
            search.search_id().0,
            prev_state_name,
        )
        .fetch_optional(&self.pool)
        .await?;
        updated.ok_or_else(|| BscError::CasConflict(search.search_id())).map(|_| ())
    }

    async fn persist_completed(&self, prev_state_name: &'static str, search: &Search<Completed>) -> Result<()> {
        let payload = serde_json::to_value(&search.state.matches).unwrap_or(Value::Null);
        let updated = sqlx::query_scalar!(
            r#"
            UPDATE merchant_searches
            SET state = 'completed', response_payload = $1, completed_at = $2
            WHERE search_id = $3 AND state = $4 AND completed_at IS NULL
            RETURNING search_id
            "#,
            payload,
            search.state.completed_at,
            search.search_id().0,
            prev_state_name,
        )
        .fetch_optional(&self.pool)
        .await?;
        updated.ok_or_else(|| BscError::CasConflict(search.search_id())).map(|_| ())
    }

    async fn persist_no_results(&self, prev_state_name: &'static str, search: &Search<NoResults>) -> Result<()> {
        let updated = sqlx::query_scalar!(
            r#"
            UPDATE merchant_searches
            SET state = 'no_results', completed_at = $1
            WHERE search_id = $2 AND state = $3 AND completed_at IS NULL
            RETURNING search_id
            "#,
            search.state.completed_at,
            search.search_id().0,
            prev_state_name,
        )
        .fetch_optional(&self.pool)
        .await?;
        updated.ok_or_else(|| BscError::CasConflict(search.search_id())).map(|_| ())
    }

    async fn persist_failed(&self, prev_state_name: &'static str, search: &Search<Failed>) -> Result<()> {
        let updated = sqlx::query_scalar!(
            r#"
            UPDATE merchant_searches
            SET state = 'failed', error = $1, completed_at = $2
            WHERE search_id = $3 AND state = $4
            RETURNING search_id
            "#,
            search.state.error,
            search.state.failed_at,
            search.search_id().0,
            prev_state_name,
        )
        .fetch_optional(&self.pool)
        .await?;
        updated.ok_or_else(|| BscError::CasConflict(search.search_id())).map(|_| ())
    }

    async fn persist_timeout(&self, prev_state_name: &'static str, search: &Search<Timeout>) -> Result<()> {
        let updated = sqlx::query_scalar!(
            r#"
            UPDATE merchant_searches
            SET state = 'timeout', poll_attempts = $1, completed_at = $2
            WHERE search_id = $3 AND state = $4
            RETURNING search_id
            "#,
            search.state.poll_attempts as i32,
            search.state.timed_out_at,
            search.search_id().0,
            prev_state_name,
        )
        .fetch_optional(&self.pool)
        .await?;
        updated.ok_or_else(|| BscError::CasConflict(search.search_id())).map(|_| ())
    }

    async fn dedup_webhook_event(&self, event_id: Uuid, search_id: SearchId, payload: Value) -> Result<bool> {
        let inserted = sqlx::query_scalar!(
            r#"
            INSERT INTO webhook_events (event_id, search_id, payload, received_at, processed)
            VALUES ($1, $2, $3, NOW(), false)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
            event_id,
            search_id.0,
            payload,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.is_some())
    }

    async fn cancel_batch_searches(&self, batch_id: Uuid) -> Result<()> {
        sqlx::query!(
            r#"
            UPDATE merchant_searches
            SET state = 'failed', error = 'batch cancelled', completed_at = NOW()
            WHERE batch_id = $1 AND state NOT IN ('completed', 'no_results', 'failed', 'timeout')
            "#,
            batch_id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_state_names_match_all_markers() {
        for name in ["submitted", "polling", "webhook_received", "completed", "no_results", "failed", "timeout"] {
            assert!(!name.is_empty());
        }
    }
}
