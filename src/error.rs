use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::settlement::models::SettlementStatus;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("External error: {0}")]
    ExternalError(String),
}

/// Settlement lifecycle errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("No transactions for user {user_id} between {start} and {end}")]
    NoTransactions {
        user_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Settlement not found: {0}")]
    NotFound(Uuid),

    #[error("Dispute not found: {0}")]
    DisputeNotFound(Uuid),

    #[error("Settlement {id} is {current}, expected {expected}")]
    InvalidState {
        id: Uuid,
        current: SettlementStatus,
        expected: String,
    },

    #[error("No payout account available for user {0}")]
    MissingAccount(String),

    #[error("Payout failed for settlement {id}: {message}")]
    Payout {
        id: Uuid,
        message: String,
        retry_scheduled: bool,
    },

    #[error("Settlement {id} failed unexpectedly: {message}")]
    Unexpected { id: Uuid, message: String },

    #[error("Concurrent modification of settlement {0}")]
    Conflict(Uuid),

    #[error("Calculation error: {0}")]
    Calculation(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            AppError::Settlement(SettlementError::NoTransactions { user_id, start, end }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "NO_TRANSACTIONS",
                Some(serde_json::json!({
                    "user_id": user_id,
                    "start_date": start,
                    "end_date": end,
                })),
            ),
            AppError::Settlement(SettlementError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "SETTLEMENT_NOT_FOUND",
                Some(serde_json::json!({ "settlement_id": id })),
            ),
            AppError::Settlement(SettlementError::DisputeNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "DISPUTE_NOT_FOUND",
                Some(serde_json::json!({ "dispute_id": id })),
            ),
            AppError::Settlement(SettlementError::InvalidState { id, current, expected }) => (
                StatusCode::CONFLICT,
                "INVALID_STATE",
                Some(serde_json::json!({
                    "settlement_id": id,
                    "current": current,
                    "expected": expected,
                })),
            ),
            AppError::Settlement(SettlementError::MissingAccount(user_id)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "MISSING_ACCOUNT",
                Some(serde_json::json!({ "user_id": user_id })),
            ),
            AppError::Settlement(SettlementError::Payout { id, retry_scheduled, .. }) => (
                StatusCode::BAD_GATEWAY,
                "PAYOUT_FAILED",
                Some(serde_json::json!({
                    "settlement_id": id,
                    "retry_scheduled": retry_scheduled,
                })),
            ),
            AppError::Settlement(SettlementError::Unexpected { id, .. }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SETTLEMENT_FAILED",
                Some(serde_json::json!({ "settlement_id": id })),
            ),
            AppError::Settlement(SettlementError::Conflict(id)) => (
                StatusCode::CONFLICT,
                "CONCURRENT_MODIFICATION",
                Some(serde_json::json!({ "settlement_id": id })),
            ),
            AppError::Settlement(SettlementError::Calculation(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "CALCULATION_ERROR", None)
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", None),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT", None),
            AppError::ExternalError(_) => (StatusCode::BAD_GATEWAY, "EXTERNAL_ERROR", None),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", None),
            AppError::Config(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
            }
        };

        // Storage and configuration details stay in the logs
        let message = match &self {
            AppError::Database(_) => "A database error occurred".to_string(),
            AppError::Config(_) | AppError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            AppError::Timeout(format!("HTTP request timed out: {}", error))
        } else {
            AppError::ExternalError(format!("HTTP request error: {:?}", error))
        }
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization error: {}", error))
    }
}

impl From<csv::Error> for AppError {
    fn from(error: csv::Error) -> Self {
        AppError::Internal(format!("CSV rendering error: {}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        SettlementError::Calculation(format!("Decimal error: {}", error)).into()
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
