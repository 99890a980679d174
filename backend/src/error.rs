//! Standardized error handling for the CRM API
//!
//! Synchronous failures (validation, approval locks, workflow conflicts)
//! surface through `AppError`. Automation failures use their own error types
//! and are only logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "VALIDATION_ERROR", "RECORD_LOCKED")
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldErrorKind {
    MissingRequiredField,
    InvalidType,
    InvalidFormat,
}

/// One field-level validation failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub kind: FieldErrorKind,
    pub message: String,
}

impl FieldError {
    pub fn missing(field: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: FieldErrorKind::MissingRequiredField,
            message: format!("{} is required", field),
        }
    }

    pub fn invalid_type(field: &str, expected: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: FieldErrorKind::InvalidType,
            message: format!("{} must be a {}", field, expected),
        }
    }

    pub fn invalid_format(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            kind: FieldErrorKind::InvalidFormat,
            message: message.into(),
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    // Write-blocking record errors
    ValidationError { errors: Vec<FieldError> },
    DanglingReference { field: String, target: String, id: String },
    RecordLocked { record_id: Uuid },
    ConcurrentModification { record_id: Uuid },

    // Approval errors
    NotPending { status: String },
    InvalidStep { step: usize, steps: usize },
    ConfigConflict(String),

    // Authorization / resource errors
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    BadRequest(String),

    // Server errors
    InternalError(String),
    DatabaseError(String),
    ExternalServiceError { service: String, message: String },
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationError { .. } | Self::DanglingReference { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::RecordLocked { .. } => StatusCode::LOCKED,
            Self::ConcurrentModification { .. } | Self::ConfigConflict(_) | Self::NotPending { .. } => {
                StatusCode::CONFLICT
            }
            Self::InvalidStep { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ExternalServiceError { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DanglingReference { .. } => "DANGLING_REFERENCE",
            Self::RecordLocked { .. } => "RECORD_LOCKED",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::NotPending { .. } => "NOT_PENDING",
            Self::InvalidStep { .. } => "INVALID_STEP",
            Self::ConfigConflict(_) => "CONFIG_CONFLICT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::ValidationError { .. } => "Validation failed".to_string(),
            Self::DanglingReference { field, target, id } => {
                format!("Field '{}' references missing {} '{}'", field, target, id)
            }
            Self::RecordLocked { record_id } => {
                format!("Record {} is locked pending approval", record_id)
            }
            Self::ConcurrentModification { record_id } => {
                format!("Record {} was modified concurrently, reload and retry", record_id)
            }
            Self::NotPending { status } => format!("Record approval is {}, not pending", status),
            Self::InvalidStep { step, steps } => {
                format!("Approval step {} is out of range for a {}-step workflow", step, steps)
            }
            Self::ConfigConflict(msg) => msg.clone(),
            Self::Unauthorized(msg) | Self::Forbidden(msg) => msg.clone(),
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::BadRequest(msg) => msg.clone(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
            Self::ExternalServiceError { service, message } => {
                tracing::error!("External service error ({}): {}", service, message);
                format!("External service '{}' is unavailable", service)
            }
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::ValidationError { errors } => serde_json::to_value(errors).ok(),
            Self::DanglingReference { field, target, id } => Some(serde_json::json!({
                "field": field,
                "target": target,
                "id": id,
            })),
            _ => None,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValidationError { errors } => {
                let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
                write!(f, "{}: {}", self.error_code(), fields.join(", "))
            }
            Self::InternalError(msg) | Self::DatabaseError(msg) => {
                write!(f, "{}: {}", self.error_code(), msg)
            }
            Self::ExternalServiceError { service, message } => {
                write!(f, "{}: {} ({})", self.error_code(), message, service)
            }
            _ => write!(f, "{}: {}", self.error_code(), self.message()),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Some(details) = self.details() {
            error = error.with_details(details);
        }

        (status, Json(error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::DatabaseError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError(format!("Serialization error: {}", err))
    }
}

/// Result type alias for handlers and services
pub type ApiResult<T> = Result<T, AppError>;

/// Collects field errors so a single response can report all of them
#[derive(Debug, Default)]
pub struct ValidationBuilder {
    errors: Vec<FieldError>,
}

impl ValidationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: FieldError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn build(self) -> Option<AppError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(AppError::ValidationError { errors: self.errors })
        }
    }
}
