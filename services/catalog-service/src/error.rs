// =============================================================================
// ERROR MODULE
// =============================================================================
// This module defines custom error types and their HTTP responses.
//
// TWO LEVELS OF ERRORS:
// - AppError: fails a whole request and becomes an HTTP response
// - RowError: fails one spreadsheet row; the import records it in the import
//   log and moves on to the next row. A RowError never aborts a batch.
//
// A derived field that cannot be computed is NOT an error anywhere: it is a
// None value that renders as an empty cell.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// =============================================================================
// REQUEST-LEVEL ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // DATABASE ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // -------------------------------------------------------------------------
    // BUSINESS LOGIC ERRORS
    // -------------------------------------------------------------------------
    /// Product (or other resource) not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input failed a catalog rule (required field, discount range)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Malformed request (bad query parameter, missing upload, ...)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// SKU or NM ID already owned by another product
    #[error("Conflict: {0}")]
    Conflict(String),

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            // 404 Not Found: Resource doesn't exist
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),

            // 422: well-formed input that breaks a catalog rule
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),

            // 400 Bad Request: Client sent invalid data
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // 409 Conflict: unique identifier taken
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // 500 Internal Server Error
            // Don't expose internal details; the driver error goes to the log
            AppError::Database(err) => {
                tracing::error!(error = %err, "Database query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }

            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            error_code = error_code,
            message = %message,
            "Request failed"
        );

        let body = ErrorResponse::new(error_code, message);

        (status, Json(body)).into_response()
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================
pub type AppResult<T> = Result<T, AppError>;

// =============================================================================
// CONVERSION HELPERS
// =============================================================================

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(violation) = err.downcast_ref::<UniqueViolation>() {
            return AppError::Conflict(violation.to_string());
        }
        match err.downcast::<sqlx::Error>() {
            Ok(db_err) => AppError::Database(db_err),
            // {:#} keeps the .context() chain in the message
            Err(err) => AppError::Internal(format!("{err:#}")),
        }
    }
}

impl From<RowError> for AppError {
    fn from(err: RowError) -> Self {
        match err {
            RowError::Validation(msg) => AppError::Validation(msg),
            RowError::Coercion { .. } | RowError::Unreadable(_) => AppError::BadRequest(err.to_string()),
            RowError::Storage(msg) => AppError::Internal(msg),
        }
    }
}

/// A write hit a unique identifier owned by another product.
///
/// Raised by the repository in place of the driver's constraint error, so
/// callers never see database wording.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field} '{value}' is already used by another product")]
pub struct UniqueViolation {
    pub field: &'static str,
    pub value: String,
}

// =============================================================================
// ROW-LEVEL ERROR TYPE
// =============================================================================
/// Why a single import row was rejected.
///
/// The Display text is what the user sees in the import summary, next to
/// the row number.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowError {
    /// Missing required field, empty key column, discount out of range
    #[error("{0}")]
    Validation(String),

    /// A cell could not be converted to the field's type
    #[error("column '{column}': '{value}' is not {expected}")]
    Coercion {
        column: String,
        value: String,
        expected: &'static str,
    },

    /// The spreadsheet reader could not decode the row
    #[error("unreadable row: {0}")]
    Unreadable(String),

    /// The repository refused to persist the row
    #[error("could not be saved: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercion_message_names_column_and_value() {
        let err = RowError::Coercion {
            column: "Цена до скидки".into(),
            value: "abc".into(),
            expected: "a number",
        };
        assert_eq!(err.to_string(), "column 'Цена до скидки': 'abc' is not a number");
    }

    #[test]
    fn row_validation_maps_to_unprocessable_entity() {
        let response = AppError::from(RowError::Validation("required field 'title' is empty".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn not_found_maps_to_404() {
        let response = AppError::NotFound("SKU not found: X".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unique_violation_maps_to_conflict_without_driver_text() {
        let err = anyhow::Error::new(UniqueViolation { field: "sku", value: "A-1".into() })
            .context("Failed to save product A-1");
        let app_err = AppError::from(err);
        assert!(matches!(app_err, AppError::Conflict(_)));

        let response = app_err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("sku 'A-1' is already used by another product"));
        assert!(!body.contains("constraint"));
    }

    #[test]
    fn driver_errors_become_opaque_database_errors() {
        let err = anyhow::Error::new(sqlx::Error::RowNotFound).context("Failed to fetch product");
        let app_err = AppError::from(err);
        assert!(matches!(app_err, AppError::Database(_)));
        assert_eq!(app_err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);

        let other = AppError::from(anyhow::anyhow!("disk full"));
        assert!(matches!(other, AppError::Internal(msg) if msg == "disk full"));
    }
}
