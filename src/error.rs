use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire ledger
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyError),

    #[error("Funding error: {0}")]
    Funding(#[from] FundingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Rejections raised before any write happens
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("{field} must be a non-negative integer, got {value}")]
    NegativeAmount { field: &'static str, value: i64 },

    #[error("{field} must be positive, got {value}")]
    NonPositiveAmount { field: &'static str, value: i64 },

    #[error("cents_per_credit must be positive, got {0}")]
    InvalidCentsPerCredit(i64),

    #[error("malformed pool slug: {0:?}")]
    InvalidSlug(String),

    #[error("pool slug {slug:?} is scoped to owner {scoped}, not {requested}")]
    OwnerMismatch {
        slug: String,
        scoped: i64,
        requested: i64,
    },

    #[error("debit of {requested} credits exceeds pool balance {available}")]
    InsufficientPoolBalance { requested: i64, available: i64 },
}

/// Write stage of earn-shift funding that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingStage {
    WalletInsert,
    PoolDebit,
    DonorReceipt,
}

impl FundingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundingStage::WalletInsert => "wallet_insert",
            FundingStage::PoolDebit => "pool_debit",
            FundingStage::DonorReceipt => "donor_receipt",
        }
    }
}

impl fmt::Display for FundingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed write during earn-shift funding, tagged with where it failed
#[derive(Error, Debug)]
#[error("{stage} failed for event {event_id} user {user_id} (wallet tx {wallet_tx_id:?}): {source}")]
pub struct FundingError {
    pub stage: FundingStage,
    pub event_id: i64,
    pub user_id: i64,
    pub wallet_tx_id: Option<i64>,
    #[source]
    pub source: Box<AppError>,
}

impl AppError {
    /// Stage tag when this error came out of a funding write
    pub fn funding_stage(&self) -> Option<FundingStage> {
        match self {
            AppError::Funding(err) => Some(err.stage),
            _ => None,
        }
    }
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
        let (status, error_code, message, details) = match self {
            AppError::Policy(err) => (
                StatusCode::BAD_REQUEST,
                "POLICY_VIOLATION",
                err.to_string(),
                None,
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg,
                None,
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::Funding(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "FUNDING_FAILED",
                "Shift funding failed and was rolled back".to_string(),
                Some(serde_json::json!({
                    "stage": err.stage,
                    "event_id": err.event_id,
                    "user_id": err.user_id,
                })),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let detail = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        AppError::InvalidInput(format!("Validation failed: {}", detail))
    }
}

/// Result type alias for the ledger
pub type AppResult<T> = Result<T, AppError>;
