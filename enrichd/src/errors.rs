//! Error taxonomy for the enrichment pipeline.
//!
//! Six kinds, matching the pipeline's propagation policy: only `InputError`
//! and `SystemUnavailable` ever surface synchronously to an HTTP caller.
//! Every other kind is captured into Record/Batch state by the orchestrator
//! instead of bubbling up — a classifier timeout fails one record's
//! `classify` stage, it does not fail the request that asked about the batch.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error as ThisError;

use crate::db::errors::DbError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed request: bad CSV, missing required field, out-of-range
    /// parameter. Always the caller's fault, always synchronous.
    #[error("{message}")]
    InputError { message: String },

    /// A stage failed in a way that's worth retrying (rate limit, timeout,
    /// 5xx from a collaborator). Captured per-record, never surfaced
    /// synchronously.
    #[error("transient failure in {stage}: {message}")]
    StageTransient { stage: &'static str, message: String },

    /// A stage failed in a way retrying won't fix (malformed response,
    /// permanent 4xx). Captured per-record.
    #[error("permanent failure in {stage}: {message}")]
    StagePermanent { stage: &'static str, message: String },

    /// The orchestrator or rate limiter detected an inconsistent internal
    /// state (e.g. a CAS conflict it could not resolve by re-reading).
    #[error("coordination error: {0}")]
    CoordinationError(String),

    /// A durability or uniqueness invariant was violated (duplicate
    /// `event_id`, duplicate submission slipping past the unique index).
    #[error("integrity error: {0}")]
    IntegrityError(String),

    /// The service itself cannot currently serve requests (pool exhausted,
    /// migrations not applied). Synchronous, retryable by the caller.
    #[error("service unavailable: {0}")]
    SystemUnavailable(String),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Bsc(#[from] bsc::BscError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InputError { .. } => StatusCode::BAD_REQUEST,
            Error::StageTransient { .. } | Error::StagePermanent { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::CoordinationError(_) | Error::IntegrityError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::SystemUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } | DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Bsc(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            Error::Bsc(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Error::InputError { message } => message.clone(),
            Error::SystemUnavailable(message) => message.clone(),
            Error::Database(DbError::NotFound) => "resource not found".to_string(),
            Error::Database(DbError::PoolExhausted) => "service temporarily overloaded, please retry".to_string(),
            _ => "internal error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::InputError { .. } => tracing::debug!("client error: {self}"),
            Error::SystemUnavailable(_) | Error::Database(DbError::PoolExhausted) => tracing::warn!("{self}"),
            Error::StageTransient { .. } | Error::StagePermanent { .. } => tracing::warn!("{self}"),
            _ => tracing::error!("{self:#}"),
        }
        let status = self.status_code();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            use axum::http::header::RETRY_AFTER;
            return (status, [(RETRY_AFTER, "30")], self.user_message()).into_response();
        }
        (status, self.user_message()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
