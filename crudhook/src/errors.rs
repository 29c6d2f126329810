//! # Error Handling for CRUD Resources
//!
//! Every failure inside a CRUD operation is a [`CrudError`]. Hooks return it to
//! abort an operation, the entity manager produces it for persistence failures,
//! and the generated router turns it into an HTTP response.
//!
//! Two response mappings exist:
//!
//! - the **default** mapping ([`IntoResponse`] on `CrudError`, used by search and
//!   create) keeps the semantic status of each kind and sends a sanitized JSON body;
//! - the **intercepted** mapping ([`Intercepted`], used by get, update and delete)
//!   sends `404` for missing entities, `409` for uniqueness clashes and `400` for
//!   everything else, with an empty body.
//!
//! Internal details (database errors, storage failures) are logged through
//! `tracing` and never sent to clients.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sea_orm::{DbErr, SqlErr};
use serde::Serialize;

/// Error raised by hooks, the entity manager and the CRUD orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum CrudError {
    /// The addressed entity does not exist.
    #[error("{}", not_found_message(.resource, .id))]
    NotFound {
        /// Resource or entity name
        resource: String,
        /// Optional key that was looked up
        id: Option<String>,
    },

    /// A uniqueness constraint was violated.
    #[error("{message}")]
    Conflict {
        /// User-facing message
        message: String,
    },

    /// The request payload or query is malformed.
    #[error("{message}")]
    Validation {
        /// User-facing message
        message: String,
    },

    /// A hook decided the response status itself.
    #[error("{message}")]
    Http {
        /// Status to answer with
        status: StatusCode,
        /// User-facing message
        message: String,
    },

    /// Failure reported by Sea-ORM that has no more specific kind.
    #[error("database error: {0}")]
    Database(DbErr),

    /// Blob storage failure (uploaded file cleanup).
    #[error("storage error: {0}")]
    Storage(String),

    /// Anything else.
    #[error("{message}")]
    Internal {
        /// User-facing message
        message: String,
        /// Internal details (logged, not sent to the client)
        internal: Option<String>,
    },
}

fn not_found_message(resource: &str, id: &Option<String>) -> String {
    match id {
        Some(id) => format!("{resource} with ID '{id}' not found"),
        None => format!("{resource} not found"),
    }
}

impl CrudError {
    /// Create a not-found error for `resource`.
    pub fn not_found(resource: impl Into<String>, id: Option<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id,
        }
    }

    /// Create a uniqueness conflict.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an error carrying an explicit HTTP status.
    ///
    /// ```rust,ignore
    /// return Err(CrudError::http(StatusCode::FORBIDDEN, "not your post"));
    /// ```
    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Create an internal error with optional details kept server-side.
    pub fn internal(message: impl Into<String>, internal: Option<String>) -> Self {
        Self::Internal {
            message: message.into(),
            internal,
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Whether this error reports a missing entity.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Status used by the default mapping (search and create).
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Http { status, .. } => *status,
            Self::Database(_) | Self::Storage(_) | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Status used by the intercepted mapping (get, update and delete).
    #[must_use]
    pub fn intercepted_status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Message safe to show to API clients.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Database(_) => "A database error occurred".to_string(),
            Self::Storage(_) => "A storage error occurred".to_string(),
            _ => self.to_string(),
        }
    }

    fn log_internal(&self) {
        match self {
            Self::Database(internal) => {
                tracing::error!(error = ?internal, "Database error occurred");
            }
            Self::Storage(details) => {
                tracing::error!(details = %details, "Storage error occurred");
            }
            Self::Internal {
                internal: Some(details),
                ..
            } => {
                tracing::error!(details = %details, "Internal error occurred");
            }
            _ => {
                tracing::debug!(
                    error = %self.user_message(),
                    status = %self.status_code(),
                    "CRUD error"
                );
            }
        }
    }
}

/// Converts Sea-ORM errors.
///
/// - `DbErr::RecordNotFound` → [`CrudError::NotFound`]
/// - unique constraint violations → [`CrudError::Conflict`]
/// - everything else → [`CrudError::Database`]
impl From<DbErr> for CrudError {
    fn from(err: DbErr) -> Self {
        if let DbErr::RecordNotFound(msg) = &err {
            let resource = msg.split_whitespace().next().unwrap_or("Resource");
            return Self::not_found(resource, None);
        }
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(message)) => Self::Conflict { message },
            _ => Self::Database(err),
        }
    }
}

impl From<serde_json::Error> for CrudError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for CrudError {
    fn into_response(self) -> Response {
        self.log_internal();
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.user_message(),
        };
        (status, Json(body)).into_response()
    }
}

/// A [`CrudError`] rendered with the intercepted mapping: status only, empty body.
#[derive(Debug)]
pub struct Intercepted(pub CrudError);

impl From<CrudError> for Intercepted {
    fn from(err: CrudError) -> Self {
        Self(err)
    }
}

impl IntoResponse for Intercepted {
    fn into_response(self) -> Response {
        self.0.log_internal();
        self.0.intercepted_status().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = CrudError::not_found("post", Some("7".to_string()));
        assert_eq!(err.to_string(), "post with ID '7' not found");
        assert_eq!(CrudError::not_found("post", None).to_string(), "post not found");
    }

    #[test]
    fn test_default_status_codes() {
        let cases = vec![
            (CrudError::not_found("x", None), StatusCode::NOT_FOUND),
            (CrudError::conflict("dup"), StatusCode::CONFLICT),
            (CrudError::validation("bad"), StatusCode::BAD_REQUEST),
            (
                CrudError::http(StatusCode::FORBIDDEN, "no"),
                StatusCode::FORBIDDEN,
            ),
            (
                CrudError::Database(DbErr::Custom("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (CrudError::storage("s3"), StatusCode::INTERNAL_SERVER_ERROR),
            (
                CrudError::internal("oops", None),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "{err:?}");
        }
    }

    #[test]
    fn test_intercepted_status_collapses_to_400() {
        assert_eq!(
            CrudError::not_found("x", None).intercepted_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CrudError::conflict("dup").intercepted_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CrudError::http(StatusCode::FORBIDDEN, "no").intercepted_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CrudError::internal("oops", None).intercepted_status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_database_details_are_sanitized() {
        let err = CrudError::Database(DbErr::Custom("password=hunter2".into()));
        assert_eq!(err.user_message(), "A database error occurred");
    }

    #[test]
    fn test_record_not_found_conversion() {
        let err: CrudError = DbErr::RecordNotFound("post not found".to_string()).into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_custom_dberr_becomes_database() {
        let err: CrudError = DbErr::Custom("anything".to_string()).into();
        assert!(matches!(err, CrudError::Database(_)));
    }

    #[test]
    fn test_intercepted_response_has_empty_body() {
        let response = Intercepted(CrudError::conflict("dup")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
