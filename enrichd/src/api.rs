//! HTTP surface (§6 EXTERNAL INTERFACES): one handler per endpoint, wired
//! onto the already-complete orchestrator/repository/BSC layers. Mirrors the
//! control-plane's `api::handlers` convention of thin handlers that extract
//! `State<AppState>` plus request data and delegate straight to a module
//! function — no business logic lives here.

use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bsc::SearchStore as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::handlers::{BatchRepository, RecordRepository};
use crate::domain::{Address, Batch, BatchOptions, Record};
use crate::eo::{self, Deps};
use crate::errors::{Error, Result};
use crate::upload;
use crate::webhook;
use crate::AppState;

fn deps(state: &AppState) -> Deps<'_> {
    Deps {
        pool: &state.db,
        classifier: state.classifier.as_ref(),
        address_vendor: state.address_vendor.as_ref(),
        rate_limiters: state.rate_limiters.as_ref(),
        address_config: state.address_config.as_ref(),
        ai_enhance_threshold: state.config.ai_enhance_threshold,
        merchant_confidence_threshold: eo::DEFAULT_MERCHANT_CONFIDENCE_THRESHOLD,
    }
}

fn default_options(state: &AppState) -> BatchOptions {
    BatchOptions {
        enable_classify: state.config.enable_classify,
        enable_finexio: state.config.enable_finexio,
        enable_address: state.config.enable_address,
        enable_merchant: state.config.enable_merchant,
    }
}

// ---- POST /classify-single ----

#[derive(Debug, Deserialize)]
pub struct ClassifySingleRequest {
    pub payee: String,
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub options: Option<RequestOptions>,
}

/// Mirrors `matching_options` in `/upload/process` (§6) so both entry points
/// accept the same four toggles under the names external callers know them by.
#[derive(Debug, Deserialize)]
pub struct RequestOptions {
    #[serde(default = "default_true")]
    pub enable_finexio: bool,
    #[serde(default = "default_true")]
    pub enable_mastercard: bool,
    #[serde(default = "default_true")]
    pub enable_google_address_validation: bool,
    #[serde(default = "default_true")]
    pub enable_openai: bool,
}

fn default_true() -> bool {
    true
}

impl RequestOptions {
    fn into_batch_options(self) -> BatchOptions {
        BatchOptions {
            enable_classify: self.enable_openai,
            enable_finexio: self.enable_finexio,
            enable_address: self.enable_google_address_validation,
            enable_merchant: self.enable_mastercard,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ClassifySingleResponse {
    Complete { job_id: Uuid, record: RecordView },
    Partial { job_id: Uuid, stage: &'static str, partials: RecordView },
}

pub async fn classify_single(State(state): State<AppState>, Json(req): Json<ClassifySingleRequest>) -> Result<Json<ClassifySingleResponse>> {
    if req.payee.trim().is_empty() {
        return Err(Error::InputError { message: "payee must not be empty".to_string() });
    }
    let options = req.options.map(RequestOptions::into_batch_options).unwrap_or_else(|| default_options(&state));
    let budget = Duration::from_millis(state.config.progressive_budget_ms);
    let d = deps(&state);

    let outcome = eo::classify_single(&d, state.merchant.as_ref(), &req.payee, req.address, options, budget).await?;
    let view = RecordView::from_record(&outcome.record);

    if outcome.within_budget {
        Ok(Json(ClassifySingleResponse::Complete { job_id: outcome.job_id, record: view }))
    } else {
        let stage = if outcome.merchant_dispatched { "merchant" } else { "classify" };
        Ok(Json(ClassifySingleResponse::Partial { job_id: outcome.job_id, stage, partials: view }))
    }
}

// ---- GET /classify-status/{job_id} ----

pub async fn classify_status(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Result<Json<RecordView>> {
    let record_repo = RecordRepository::new(&state.db);
    let records = record_repo.list_for_batch(job_id, 1, 0).await.map_err(Error::from)?;
    let record = records.into_iter().next().ok_or(Error::Database(crate::db::errors::DbError::NotFound))?;
    Ok(Json(RecordView::from_record(&record)))
}

// ---- View types shared by classify-single/status/classifications ----

#[derive(Debug, Serialize)]
pub struct RecordView {
    pub record_id: Uuid,
    pub batch_id: Uuid,
    pub original_name: String,
    pub payee_type: crate::domain::PayeeType,
    pub confidence: f64,
    pub sic_code: Option<String>,
    pub supplier_match: crate::domain::SupplierMatch,
    pub validated_address: Option<crate::domain::ValidatedAddress>,
    pub merchant_enrichment: crate::domain::MerchantEnrichment,
    pub per_stage_status: crate::domain::StageStatuses,
}

impl RecordView {
    fn from_record(r: &Record) -> Self {
        Self {
            record_id: r.id,
            batch_id: r.batch_id,
            original_name: r.original_name.clone(),
            payee_type: r.payee_type,
            confidence: r.confidence.value(),
            sic_code: r.sic_code.clone(),
            supplier_match: r.supplier_match.clone(),
            validated_address: r.validated_address.clone(),
            merchant_enrichment: r.merchant_enrichment.clone(),
            per_stage_status: r.per_stage_status,
        }
    }
}

// ---- POST /upload/preview ----

fn is_supported_upload_content_type(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or("").trim();
    base == "text/csv" || base == "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
}

#[derive(Debug, Serialize)]
pub struct UploadPreviewResponse {
    pub headers: Vec<String>,
    pub preview_rows: Vec<Vec<String>>,
    pub temp_file_name: String,
}

pub async fn upload_preview(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<UploadPreviewResponse>> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut content_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| Error::InputError { message: format!("malformed multipart upload: {e}") })? {
        if field.name() == Some("file") {
            content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.map_err(|e| Error::InputError { message: format!("failed to read upload: {e}") })?;
            file_bytes = Some(bytes.to_vec());
        }
    }

    let bytes = file_bytes.ok_or(Error::InputError { message: "missing 'file' field in multipart upload".to_string() })?;
    let content_type = content_type.unwrap_or_default();
    if !is_supported_upload_content_type(&content_type) {
        return Err(Error::InputError { message: format!("unsupported upload content type '{content_type}'") });
    }
    if content_type.starts_with("application/vnd.openxmlformats") {
        return Err(Error::InputError { message: "XLSX uploads are not supported; export to CSV first".to_string() });
    }

    let preview = upload::parse_preview(&bytes)?;
    let temp_file_name = state.upload_cache.store(bytes);
    Ok(Json(UploadPreviewResponse { headers: preview.headers, preview_rows: preview.preview_rows, temp_file_name }))
}

// ---- POST /upload/process ----

#[derive(Debug, Deserialize)]
pub struct ProcessUploadRequest {
    pub temp_file_name: String,
    pub payee_column: String,
    #[serde(default)]
    pub address_line1_column: Option<String>,
    #[serde(default)]
    pub city_column: Option<String>,
    #[serde(default)]
    pub state_column: Option<String>,
    #[serde(default)]
    pub zip_column: Option<String>,
    #[serde(default)]
    pub country_column: Option<String>,
    #[serde(default)]
    pub matching_options: Option<RequestOptions>,
}

#[derive(Debug, Serialize)]
pub struct ProcessUploadResponse {
    pub batch_id: Uuid,
    pub total_records: i64,
}

pub async fn upload_process(State(state): State<AppState>, Json(req): Json<ProcessUploadRequest>) -> Result<Json<ProcessUploadResponse>> {
    let bytes = state.upload_cache.take(&req.temp_file_name).ok_or(Error::InputError { message: "temp_file_name not found or already consumed".to_string() })?;

    let mapping = upload::ColumnMapping {
        payee_column: req.payee_column,
        address_line1_column: req.address_line1_column,
        city_column: req.city_column,
        state_column: req.state_column,
        zip_column: req.zip_column,
        country_column: req.country_column,
    };
    let rows = upload::parse_rows(&bytes, &mapping)?;
    if rows.is_empty() {
        return Err(Error::InputError { message: "upload contained no payee rows".to_string() });
    }

    let options = req.matching_options.map(RequestOptions::into_batch_options).unwrap_or_else(|| default_options(&state));
    let batch_id = Uuid::new_v4();
    let batch_repo = BatchRepository::new(&state.db);
    let record_repo = RecordRepository::new(&state.db);

    batch_repo.create(batch_id, rows.len() as i64, options).await.map_err(Error::from)?;
    let new_records: Vec<crate::db::handlers::records::NewRecord> =
        rows.into_iter().map(|r| crate::db::handlers::records::NewRecord { id: Uuid::new_v4(), original_name: r.original_name, input_address: r.input_address }).collect();
    let total_records = new_records.len() as i64;
    record_repo.insert_batch(batch_id, &new_records, &options).await.map_err(Error::from)?;

    Ok(Json(ProcessUploadResponse { batch_id, total_records }))
}

// ---- GET /upload/batches, GET /upload/batches/{id} ----

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_batches(State(state): State<AppState>, Query(q): Query<PageQuery>) -> Result<Json<Vec<Batch>>> {
    let batch_repo = BatchRepository::new(&state.db);
    let batches = batch_repo.list(q.limit, q.offset).await.map_err(Error::from)?;
    Ok(Json(batches))
}

/// `get_batch`'s response: the stored Batch plus the two progress fields
/// (§4.7) that aren't persisted columns but are cheap to derive on read.
#[derive(Debug, Serialize)]
pub struct BatchView {
    #[serde(flatten)]
    pub batch: Batch,
    pub merchant_enrichment_progress: u8,
    pub finexio_matched_count: i64,
}

pub async fn get_batch(State(state): State<AppState>, Path(batch_id): Path<Uuid>) -> Result<Json<BatchView>> {
    let batch_repo = BatchRepository::new(&state.db);
    let record_repo = RecordRepository::new(&state.db);
    let batch = batch_repo.get(batch_id).await.map_err(Error::from)?.ok_or(Error::Database(crate::db::errors::DbError::NotFound))?;
    let finexio_matched_count = record_repo.count_finexio_matched(batch_id).await.map_err(Error::from)?;
    let merchant_enrichment_progress = batch.merchant_enrichment_progress();
    Ok(Json(BatchView { batch, merchant_enrichment_progress, finexio_matched_count }))
}

// ---- GET /classifications/{batch_id} ----

pub async fn list_classifications(State(state): State<AppState>, Path(batch_id): Path<Uuid>, Query(q): Query<PageQuery>) -> Result<Json<Vec<RecordView>>> {
    let record_repo = RecordRepository::new(&state.db);
    let records = record_repo.list_for_batch(batch_id, q.limit, q.offset).await.map_err(Error::from)?;
    Ok(Json(records.iter().map(RecordView::from_record).collect()))
}

// ---- GET /download/{batch_id} ----

pub async fn download_batch(State(state): State<AppState>, Path(batch_id): Path<Uuid>) -> Result<Response> {
    let record_repo = RecordRepository::new(&state.db);
    let mut writer = csv::Writer::from_writer(vec![]);
    writer
        .write_record([
            "original_name",
            "payee_type",
            "confidence",
            "sic_code",
            "finexio_supplier_id",
            "finexio_matched_name",
            "finexio_score",
            "address_formatted",
            "address_verdict",
            "merchant_status",
            "merchant_business_name",
            "merchant_tax_id",
            "merchant_mcc",
        ])
        .map_err(|e| Error::Other(e.into()))?;

    let mut offset = 0i64;
    const PAGE: i64 = 1000;
    loop {
        let records = record_repo.list_for_batch(batch_id, PAGE, offset).await.map_err(Error::from)?;
        if records.is_empty() {
            break;
        }
        for r in &records {
            writer
                .write_record([
                    r.original_name.as_str(),
                    serde_json::to_string(&r.payee_type).unwrap_or_default().trim_matches('"'),
                    &r.confidence.value().to_string(),
                    r.sic_code.as_deref().unwrap_or(""),
                    r.supplier_match.supplier_id.as_deref().unwrap_or(""),
                    r.supplier_match.matched_name.as_deref().unwrap_or(""),
                    &r.supplier_match.score.map(|s| s.value().to_string()).unwrap_or_default(),
                    r.validated_address.as_ref().and_then(|a| a.formatted.as_deref()).unwrap_or(""),
                    r.validated_address.as_ref().and_then(|a| a.verdict.as_deref()).unwrap_or(""),
                    serde_json::to_string(&r.merchant_enrichment.status).unwrap_or_default().trim_matches('"'),
                    r.merchant_enrichment.business_name.as_deref().unwrap_or(""),
                    r.merchant_enrichment.tax_id.as_deref().unwrap_or(""),
                    r.merchant_enrichment.mcc.as_deref().unwrap_or(""),
                ])
                .map_err(|e| Error::Other(e.into()))?;
        }
        if records.len() < PAGE as usize {
            break;
        }
        offset += PAGE;
    }

    let csv_bytes = writer.into_inner().map_err(|e| Error::Other(anyhow::anyhow!(e.to_string())))?;
    let filename = format!("batch-{batch_id}.csv");
    let content_disposition = format!("attachment; filename=\"{filename}\"");
    Ok((StatusCode::OK, [("content-type", "text/csv".to_string()), ("content-disposition", content_disposition)], csv_bytes).into_response())
}

// ---- POST /webhooks/mastercard ----

pub async fn webhook_mastercard(State(state): State<AppState>, headers: axum::http::HeaderMap, body: axum::body::Bytes) -> Result<StatusCode> {
    let signature = headers
        .get("X-Mastercard-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::InputError { message: "missing webhook signature header".to_string() })?;
    webhook::verify_signature(&state.config.merchant_search.webhook_secret, &body, signature)?;

    let payload: webhook::WebhookPayload = serde_json::from_slice(&body).map_err(|e| Error::InputError { message: format!("malformed webhook payload: {e}") })?;
    let payload_json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);

    let is_new = state.search_store.dedup_webhook_event(payload.event_id, bsc::SearchId(payload.search_id), payload_json).await.map_err(Error::from)?;
    if !is_new {
        return Ok(StatusCode::OK);
    }

    let poller = state.poller.clone();
    let search_id = bsc::SearchId(payload.search_id);
    tokio::spawn(async move {
        if let Err(e) = poller.handle_webhook(search_id).await {
            tracing::warn!(%search_id, error = %e, "failed to drive webhook-triggered state transition");
        }
    });

    Ok(StatusCode::OK)
}

// ---- health ----

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn health_live() -> StatusCode {
    StatusCode::OK
}

pub async fn health_ready(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed: database unreachable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
