//! Error handling for the GSM runtime.
//!
//! This module provides:
//! - A single crate-wide error type carrying a stable [`ErrorCode`]
//! - HTTP status mapping for the admin and module HTTP surface
//! - User-facing messages kept apart from internal diagnostics
//! - Severity-driven logging and an error counter
//!
//! # Usage
//!
//! ```rust,ignore
//! use gsm_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn read_manifest(bytes: &[u8]) -> Result<Manifest> {
//!     serde_json::from_slice(bytes).with_error_code(ErrorCode::InvalidManifest)
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::cloud::CloudError;
use crate::modules::ModuleError;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for GSM operations.
pub type Result<T> = std::result::Result<T, GsmError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and are returned to HTTP clients verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Module Errors (1000-1099)
    ModuleNotFound,
    NoModuleMapping,
    ModuleExecutionFailed,
    ModuleTimeout,
    ArchiveNotFound,
    ArchiveCorrupt,
    ChecksumMismatch,
    InvalidManifest,

    // Queue Errors (1100-1199)
    QueueDoesNotExist,

    // Backend Errors (2000-2099)
    BackendError,
    BackendUnavailable,
    RecordNotFound,

    // Resource Errors (2100-2199)
    MemoryExhausted,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Authentication (4000-4099)
    Unauthorized,
    Forbidden,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ModuleNotFound => 1000,
            Self::NoModuleMapping => 1001,
            Self::ModuleExecutionFailed => 1002,
            Self::ModuleTimeout => 1003,
            Self::ArchiveNotFound => 1004,
            Self::ArchiveCorrupt => 1005,
            Self::ChecksumMismatch => 1006,
            Self::InvalidManifest => 1007,

            Self::QueueDoesNotExist => 1100,

            Self::BackendError => 2000,
            Self::BackendUnavailable => 2001,
            Self::RecordNotFound => 2002,

            Self::MemoryExhausted => 2100,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::Unauthorized => 4000,
            Self::Forbidden => 4001,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::ModuleNotFound
            | Self::NoModuleMapping
            | Self::ArchiveNotFound
            | Self::RecordNotFound => StatusCode::NOT_FOUND,

            Self::ArchiveCorrupt
            | Self::ChecksumMismatch
            | Self::InvalidManifest
            | Self::ValidationError
            | Self::InvalidInput
            | Self::DeserializationError => StatusCode::UNPROCESSABLE_ENTITY,

            Self::ModuleTimeout => StatusCode::GATEWAY_TIMEOUT,

            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,

            Self::BackendUnavailable | Self::QueueDoesNotExist | Self::MemoryExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            Self::ModuleExecutionFailed
            | Self::BackendError
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable
                | Self::BackendError
                | Self::QueueDoesNotExist
                | Self::ModuleTimeout
                | Self::ArchiveNotFound
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "module",
            1100..=1199 => "queue",
            2000..=2099 => "backend",
            2100..=2199 => "resource",
            2200..=2299 => "serialization",
            4000..=4099 => "authentication",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (unknown mapping, bad input)
    Low,
    /// Operational issues (timeouts, missing queues)
    Medium,
    /// System errors (backend failures, module defects)
    High,
    /// Errors that threaten the process
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ModuleNotFound
            | ErrorCode::NoModuleMapping
            | ErrorCode::RecordNotFound
            | ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::InvalidManifest
            | ErrorCode::Unauthorized
            | ErrorCode::Forbidden => Self::Low,

            ErrorCode::ModuleTimeout
            | ErrorCode::QueueDoesNotExist
            | ErrorCode::ArchiveNotFound
            | ErrorCode::ArchiveCorrupt
            | ErrorCode::ChecksumMismatch
            | ErrorCode::DeserializationError => Self::Medium,

            ErrorCode::ModuleExecutionFailed
            | ErrorCode::BackendError
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::BackendUnavailable
            | ErrorCode::MemoryExhausted
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (plugin, queue, host)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty() && self.entity_id.is_none() && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the runtime.
#[derive(Error, Debug)]
pub struct GsmError {
    code: ErrorCode,

    /// Message safe to expose to HTTP clients
    user_message: Cow<'static, str>,

    /// Detailed message for logs only
    internal_message: Option<String>,

    details: ErrorDetails,

    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for GsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl GsmError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error at a level chosen by its severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "gsm_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response body returned to HTTP clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&GsmError> for ErrorResponse {
    fn from(error: &GsmError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for GsmError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the failure as an internal error with the given message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the failure with a specific error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| GsmError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| GsmError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| GsmError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| GsmError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations
// ═══════════════════════════════════════════════════════════════════════════════

impl From<CloudError> for GsmError {
    fn from(error: CloudError) -> Self {
        let (code, user_msg) = match &error {
            CloudError::QueueDoesNotExist(_) => {
                (ErrorCode::QueueDoesNotExist, "Queue does not exist")
            }
            CloudError::NotFound(_) => (ErrorCode::RecordNotFound, "Record not found"),
            CloudError::Unavailable(_) => {
                (ErrorCode::BackendUnavailable, "Cloud backend is unavailable")
            }
            CloudError::Serialization(_) => {
                (ErrorCode::SerializationError, "Failed to encode backend record")
            }
            CloudError::Backend(_) => (ErrorCode::BackendError, "Cloud backend error"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<ModuleError> for GsmError {
    fn from(error: ModuleError) -> Self {
        let code = match &error {
            ModuleError::InvalidInput(_) => ErrorCode::InvalidInput,
            ModuleError::NotSupported(_) => ErrorCode::NoModuleMapping,
            ModuleError::Failed(_) | ModuleError::Panicked(_) => ErrorCode::ModuleExecutionFailed,
        };

        Self::new(code, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for GsmError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::BackendUnavailable, "Unable to connect to Redis")
        } else if error.is_timeout() {
            (ErrorCode::BackendError, "Redis operation timed out")
        } else {
            (ErrorCode::BackendError, "A Redis error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for GsmError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<toml::de::Error> for GsmError {
    fn from(error: toml::de::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidManifest,
            "Module manifest is not valid TOML",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for GsmError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::ModuleTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for GsmError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            ErrorKind::PermissionDenied => (ErrorCode::Forbidden, "Permission denied"),
            ErrorKind::TimedOut => (ErrorCode::ModuleTimeout, "Operation timed out"),
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for GsmError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<GsmError>() {
            Ok(gsm_error) => gsm_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for GsmError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::MissingConfiguration, "Required configuration not found")
            }
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration file is invalid")
            }
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl GsmError {
    /// No live module answers to `(plugin_id, module_class)`.
    pub fn module_not_found(plugin_id: i64, module_class: impl Into<String>) -> Self {
        let module_class = module_class.into();
        Self::new(
            ErrorCode::ModuleNotFound,
            format!(
                "no module loaded for plugin {} with class {}",
                plugin_id, module_class
            ),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("module", format!("{}:{}", plugin_id, module_class)),
        )
    }

    /// HTTP path did not resolve to any module.
    pub fn no_module_mapping(path: &str, known: &[String]) -> Self {
        Self::new(
            ErrorCode::NoModuleMapping,
            format!(
                "no module mapping defined for: {} supported mappings are: {}",
                path,
                known.join(", ")
            ),
        )
        .with_context("mappings", known)
    }

    pub fn module_timeout(module: impl Into<String>, timeout_secs: u64) -> Self {
        let module = module.into();
        Self::new(
            ErrorCode::ModuleTimeout,
            format!("Module {} did not finish within {}s", module, timeout_secs),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("module", module)
                .with_context("timeout_secs", timeout_secs),
        )
    }

    /// The backend holds no archive under `archive`.
    pub fn archive_not_found(archive: impl Into<String>) -> Self {
        let archive = archive.into();
        Self::new(
            ErrorCode::ArchiveNotFound,
            format!("Module archive {} not found", archive),
        )
        .with_details(ErrorDetails::new().with_entity("archive", archive))
    }

    pub fn archive_corrupt(archive: impl Into<String>, reason: impl Into<String>) -> Self {
        let archive = archive.into();
        Self::with_internal(
            ErrorCode::ArchiveCorrupt,
            format!("Module archive {} could not be read", archive),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("archive", archive))
    }

    pub fn checksum_mismatch(archive: impl Into<String>, expected: &str, actual: &str) -> Self {
        let archive = archive.into();
        Self::with_internal(
            ErrorCode::ChecksumMismatch,
            format!("Checksum mismatch for archive {}", archive),
            format!("expected {} got {}", expected, actual),
        )
        .with_details(ErrorDetails::new().with_entity("archive", archive))
    }

    pub fn invalid_manifest(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidManifest,
            format!("Invalid module manifest: {}", reason.into()),
        )
    }

    pub fn memory_exhausted(available: u64, threshold: u64) -> Self {
        Self::new(
            ErrorCode::MemoryExhausted,
            "Insufficient memory to accept work",
        )
        .with_context("available_bytes", available)
        .with_context("threshold_bytes", threshold)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::ModuleNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::NoModuleMapping.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::ModuleTimeout.http_status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ErrorCode::BackendUnavailable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::InternalError.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::QueueDoesNotExist.is_retryable());
        assert!(ErrorCode::BackendUnavailable.is_retryable());
        assert!(!ErrorCode::ModuleNotFound.is_retryable());
        assert!(!ErrorCode::Unauthorized.is_retryable());
    }

    #[test]
    fn test_module_not_found() {
        let error = GsmError::module_not_found(20, "com.acme.Orders");
        assert_eq!(error.code(), ErrorCode::ModuleNotFound);
        assert!(error.user_message().contains("com.acme.Orders"));
        assert_eq!(
            error.details().entity_id.as_deref(),
            Some("20:com.acme.Orders")
        );
    }

    #[test]
    fn test_no_module_mapping_lists_known_paths() {
        let known = vec!["/1/v1.0".to_string(), "/2/v3.5".to_string()];
        let error = GsmError::no_module_mapping("/9/v1.0/x", &known);
        assert_eq!(
            error.user_message(),
            "no module mapping defined for: /9/v1.0/x supported mappings are: /1/v1.0, /2/v3.5"
        );
    }

    #[test]
    fn test_archive_errors() {
        let missing = GsmError::archive_not_found("7_orders-1.0");
        assert_eq!(missing.code(), ErrorCode::ArchiveNotFound);
        assert_eq!(missing.http_status(), StatusCode::NOT_FOUND);
        assert!(missing.is_retryable());
        assert_eq!(missing.details().entity_id.as_deref(), Some("7_orders-1.0"));

        let tampered = GsmError::checksum_mismatch("7_orders-1.0", "abc", "def");
        assert_eq!(tampered.code(), ErrorCode::ChecksumMismatch);
        assert_eq!(tampered.http_status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(tampered.internal_message(), Some("expected abc got def"));
    }

    #[test]
    fn test_from_cloud_error() {
        let error: GsmError = CloudError::QueueDoesNotExist("gsm-global".into()).into();
        assert_eq!(error.code(), ErrorCode::QueueDoesNotExist);

        let error: GsmError = CloudError::Unavailable("down".into()).into();
        assert_eq!(error.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_error_response_serialization() {
        let error = GsmError::validation("pluginId must be positive");
        let response = ErrorResponse::from(&error);

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("VALIDATION_ERROR"));
        assert!(json.contains("pluginId must be positive"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::NoModuleMapping),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ModuleTimeout),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ModuleExecutionFailed),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::MemoryExhausted),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u8> = None;
        let error = missing.context("virtual host not configured").unwrap_err();
        assert_eq!(error.code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_error_display() {
        let error = GsmError::with_internal(
            ErrorCode::BackendError,
            "Cloud backend error",
            "connection reset by peer",
        );

        let display = format!("{}", error);
        assert!(display.contains("BackendError"));
        assert!(display.contains("Cloud backend error"));
        assert!(display.contains("connection reset"));
    }
}
