use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Process-wide count of errors returned to callers, exposed via `/metrics`
/// and `cache stats`.
pub static ERROR_COUNT: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("malformed name: {0}")]
    MalformedName(String),

    #[error("unknown base image: {0}")]
    UnknownBase(String),

    #[error("entry too large for this tier")]
    OversizeRejected,

    #[error("cache capacity exceeded")]
    CapacityExceeded,

    #[error("entry cannot be made persistent: {0}")]
    NotPersistable(String),

    #[error("cache directory is insecure: {0}")]
    InsecureCacheDir(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("decoder error: {0}")]
    DecoderError(String),

    #[error("internal tier error: {0}")]
    InternalTierError(String),

    #[error("bad query: {0}")]
    BadQuery(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::MalformedName(_) => "malformed_name",
            AppError::UnknownBase(_) => "unknown_base",
            AppError::OversizeRejected => "oversize_rejected",
            AppError::CapacityExceeded => "capacity_exceeded",
            AppError::NotPersistable(_) => "not_persistable",
            AppError::InsecureCacheDir(_) => "insecure_cache_dir",
            AppError::IoError(_) => "io_error",
            AppError::DecoderError(_) => "decoder_error",
            AppError::InternalTierError(_) => "internal_tier_error",
            AppError::BadQuery(_) => "bad_query",
            AppError::Other(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::MalformedName(_) => StatusCode::BAD_REQUEST,
            AppError::UnknownBase(_) => StatusCode::NOT_FOUND,
            AppError::OversizeRejected => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::CapacityExceeded => StatusCode::INSUFFICIENT_STORAGE,
            AppError::NotPersistable(_) => StatusCode::CONFLICT,
            AppError::InsecureCacheDir(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::IoError(_) => StatusCode::BAD_GATEWAY,
            AppError::DecoderError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InternalTierError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadQuery(_) => StatusCode::BAD_REQUEST,
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        } else {
            tracing::warn!(error = %self, kind = self.kind(), "request rejected");
        }
        let body = ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}
