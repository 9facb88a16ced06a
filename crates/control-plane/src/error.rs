use axum::http::{HeaderMap, StatusCode};
use sqlx::{Error as SqlxError, error::DatabaseError};
use tracing::error;

/// Application error type for HTTP handlers and domain services.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub headers: Option<Box<HeaderMap>>,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

const DB_UNAVAILABLE_MESSAGE: &str = "database temporarily unavailable";

impl AppError {
    fn with_status(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            headers: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, "unauthorized", msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, "forbidden", msg)
    }

    /// Generic permission failure used by every authorization check.
    pub fn permission_denied() -> Self {
        Self::forbidden("You don't have permission to do this action")
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, "conflict", msg)
    }

    /// Deleting a service instance that still has bound apps.
    ///
    /// Rendered as a 200 response carrying a single JSON-stream error frame.
    pub fn bound(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::OK, "bound", msg)
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_GATEWAY, "upstream", msg)
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, "not_supported", msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", msg)
    }

    pub fn internal(msg: &str) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(Box::new(headers));
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,
    SerializationFailure,
    Deadlock,
    Busy,
}

fn map_anyhow_error(err: &anyhow::Error) -> Option<AppError> {
    let sqlx_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())?;
    map_sqlx_error(sqlx_err)
}

fn map_sqlx_error(err: &SqlxError) -> Option<AppError> {
    match err {
        SqlxError::RowNotFound => Some(AppError::not_found("resource not found")),
        SqlxError::Database(db_err) => map_database_error(db_err.as_ref()),
        SqlxError::PoolTimedOut | SqlxError::PoolClosed => {
            Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE))
        }
        SqlxError::Io(_) => Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE)),
        _ => None,
    }
}

fn map_database_error(err: &dyn DatabaseError) -> Option<AppError> {
    let kind = classify_db_error(err.code().as_deref(), err.message())?;
    match kind {
        DbErrorKind::UniqueViolation => Some(AppError::conflict("resource already exists")),
        DbErrorKind::ForeignKeyViolation => Some(AppError::bad_request("invalid reference")),
        DbErrorKind::NotNullViolation => Some(AppError::bad_request("missing required field")),
        DbErrorKind::CheckViolation => Some(AppError::bad_request("invalid request")),
        DbErrorKind::SerializationFailure | DbErrorKind::Deadlock | DbErrorKind::Busy => {
            Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE))
        }
    }
}

fn classify_db_error(code: Option<&str>, message: &str) -> Option<DbErrorKind> {
    let code = code.unwrap_or_default();
    let message = message.to_ascii_lowercase();

    if matches!(code, "2067" | "1555") || message.contains("unique constraint") {
        return Some(DbErrorKind::UniqueViolation);
    }

    if code == "787" || message.contains("foreign key constraint") {
        return Some(DbErrorKind::ForeignKeyViolation);
    }

    if code == "1299" || message.contains("not null constraint") {
        return Some(DbErrorKind::NotNullViolation);
    }

    if code == "275" || message.contains("check constraint") {
        return Some(DbErrorKind::CheckViolation);
    }

    if message.contains("serialization failure") {
        return Some(DbErrorKind::SerializationFailure);
    }

    if message.contains("deadlock") {
        return Some(DbErrorKind::Deadlock);
    }

    if message.contains("database is locked") || message.contains("database is busy") {
        return Some(DbErrorKind::Busy);
    }

    None
}

/// True when the error chain carries a SQLite uniqueness violation.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    let Some(SqlxError::Database(db_err)) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    else {
        return false;
    };

    matches!(
        classify_db_error(db_err.code().as_deref(), db_err.message()),
        Some(DbErrorKind::UniqueViolation)
    )
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(mapped) = map_anyhow_error(&err) {
            if mapped.status.is_server_error() {
                crate::telemetry::record_internal_error_metrics(&err);
                error!(?err, "internal error");
            }
            return mapped;
        }

        crate::telemetry::record_internal_error_metrics(&err);
        error!(?err, "internal error");
        AppError::internal("internal server error")
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::from(anyhow::Error::new(err))
    }
}
