use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::models::ErrorResponse;
use crate::jobs::model::ErrorCategory;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("payload invalid: {0}")]
    InvalidPayload(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("unsupported job type: {0}")]
    UnsupportedJobType(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("tier does not permit this: {0}")]
    Forbidden(String),
    #[error("insufficient credits: balance {balance_usd:.4} would fall below floor {floor_usd:.4}")]
    InsufficientCredits { balance_usd: f64, floor_usd: f64 },
    #[error("too many concurrent jobs for this tier (cap {cap})")]
    ConcurrencyCapExceeded { cap: usize },
    #[error("monthly quota exceeded: spent {spent_usd:.4} of {quota_usd:.4}")]
    TierQuotaExceeded { spent_usd: f64, quota_usd: f64 },
    #[error("tier does not include required feature: {feature}")]
    TierFeatureRequired { feature: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedJobType(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::ConcurrencyCapExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::TierQuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::TierFeatureRequired { .. } => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::UnsupportedJobType(_) => "UNSUPPORTED_JOB_TYPE",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            ApiError::ConcurrencyCapExceeded { .. } => "CONCURRENCY_CAP_EXCEEDED",
            ApiError::TierQuotaExceeded { .. } => "TIER_QUOTA_EXCEEDED",
            ApiError::TierFeatureRequired { .. } => "TIER_FEATURE_REQUIRED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The `JobResult`/`Job` error taxonomy this response corresponds to, so
    /// tier-quota/tier-feature rejections are classified the same way a
    /// failed job would be (spec §4.D).
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ApiError::TierQuotaExceeded { .. } => Some(ErrorCategory::TierQuota),
            ApiError::TierFeatureRequired { .. } => Some(ErrorCategory::TierFeature),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            category: self.category(),
        };

        (status, Json(json!(body))).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(value: serde_json::Error) -> Self {
        ApiError::InvalidPayload(value.to_string())
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(value: crate::store::StoreError) -> Self {
        ApiError::Internal(value.to_string())
    }
}

impl From<crate::jobs::error::JobError> for ApiError {
    fn from(value: crate::jobs::error::JobError) -> Self {
        ApiError::Internal(value.to_string())
    }
}

impl From<crate::accounting::AccountingError> for ApiError {
    fn from(value: crate::accounting::AccountingError) -> Self {
        match value {
            crate::accounting::AccountingError::InsufficientCredits { balance_usd, floor_usd } => {
                ApiError::InsufficientCredits { balance_usd, floor_usd }
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
