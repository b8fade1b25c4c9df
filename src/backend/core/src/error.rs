//! Error handling for Apex Ledger.
//!
//! This module provides:
//! - A single error type carrying a machine-readable [`ErrorCode`]
//! - User-friendly vs detailed internal messages
//! - Classification helpers driving the command and read-model retry paths
//! - Error logging with tracing integration and metrics counters
//!
//! # Usage
//!
//! ```rust,ignore
//! use apex_ledger::error::{LedgerError, Result, ErrorContext};
//!
//! fn load() -> Result<()> {
//!     read_checkpoint()
//!         .context("Failed to read projection checkpoint")?;
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// Name of the unique constraint guarding `(aggregate_id, version)` in the event log.
pub const AGGREGATE_VERSION_CONSTRAINT: &str = "events_aggregate_version_key";

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by collaborators (HTTP controllers,
/// schedulers) for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Write path (1000-1099)
    ConcurrencyConflict,
    InvariantViolation,
    AggregateNotFound,
    AggregateAlreadyExists,
    InvalidStateTransition,

    // Dispatch (1100-1199)
    UnregisteredHandler,
    DuplicateHandler,

    // Projection (1200-1299)
    ProjectorFailure,
    TransientStoreFailure,

    // Storage (2000-2099)
    DatabaseError,
    DuplicateRecord,

    // Serialization (2200-2299)
    SerializationError,

    // Validation (4100-4199)
    ValidationError,

    // Configuration (5000-5099)
    ConfigurationError,

    // Internal (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ConcurrencyConflict => 1000,
            Self::InvariantViolation => 1001,
            Self::AggregateNotFound => 1002,
            Self::AggregateAlreadyExists => 1003,
            Self::InvalidStateTransition => 1004,

            Self::UnregisteredHandler => 1100,
            Self::DuplicateHandler => 1101,

            Self::ProjectorFailure => 1200,
            Self::TransientStoreFailure => 1201,

            Self::DatabaseError => 2000,
            Self::DuplicateRecord => 2001,

            Self::SerializationError => 2200,

            Self::ValidationError => 4100,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Stable string form, matching the serde representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
            Self::AggregateNotFound => "AGGREGATE_NOT_FOUND",
            Self::AggregateAlreadyExists => "AGGREGATE_ALREADY_EXISTS",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::UnregisteredHandler => "UNREGISTERED_HANDLER",
            Self::DuplicateHandler => "DUPLICATE_HANDLER",
            Self::ProjectorFailure => "PROJECTOR_FAILURE",
            Self::TransientStoreFailure => "TRANSIENT_STORE_FAILURE",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::DuplicateRecord => "DUPLICATE_RECORD",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether a caller may retry the failed operation.
    ///
    /// Conflicts are retryable only after reloading the aggregate; transient
    /// store failures are retryable as-is.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict | Self::TransientStoreFailure)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "write",
            1100..=1199 => "dispatch",
            1200..=1299 => "projection",
            2000..=2099 => "storage",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity used to pick the log level of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected rejections (conflicts, validation)
    Low,
    /// Recoverable failures worth a warning
    Medium,
    /// Failures that abort an operation
    High,
    /// Misconfiguration or broken invariants
    Critical,
}

impl ErrorSeverity {
    /// Determine severity from an error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ConcurrencyConflict
            | ErrorCode::AggregateNotFound
            | ErrorCode::AggregateAlreadyExists
            | ErrorCode::InvalidStateTransition
            | ErrorCode::ValidationError => Self::Low,

            ErrorCode::TransientStoreFailure
            | ErrorCode::ProjectorFailure
            | ErrorCode::DuplicateRecord => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::SerializationError
            | ErrorCode::InternalError => Self::High,

            ErrorCode::InvariantViolation
            | ErrorCode::UnregisteredHandler
            | ErrorCode::DuplicateHandler
            | ErrorCode::ConfigurationError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured details attached to an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Type of entity involved (e.g. "agent", "projection")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Identifier of the entity involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Free-form structured context
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
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
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Apex Ledger.
#[derive(Error, Debug)]
pub struct LedgerError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to command callers)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl LedgerError {
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

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    /// The stored version of an aggregate did not match the expected version.
    pub fn concurrency_conflict(
        aggregate_id: impl Into<String>,
        expected: u64,
        actual: Option<u64>,
    ) -> Self {
        let aggregate_id = aggregate_id.into();
        let message = match actual {
            Some(actual) => format!(
                "Concurrency conflict on {}: expected version {}, found {}",
                aggregate_id, expected, actual
            ),
            None => format!(
                "Concurrency conflict on {}: version {} was already written",
                aggregate_id, expected
            ),
        };
        Self::new(ErrorCode::ConcurrencyConflict, message)
            .with_details(
                ErrorDetails::new()
                    .with_entity("aggregate", &aggregate_id)
                    .with_context("expected_version", expected)
                    .with_context("actual_version", actual),
            )
    }

    /// An internal consistency rule of the log or an aggregate was broken.
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_internal(ErrorCode::InvariantViolation, "Event log invariant violated", message)
    }

    /// No handler is registered for a command type.
    pub fn unregistered_handler(command_type: impl Into<String>) -> Self {
        let command_type = command_type.into();
        Self::new(
            ErrorCode::UnregisteredHandler,
            format!("No handler registered for command type {}", command_type),
        )
        .with_details(ErrorDetails::new().with_entity("command_type", command_type))
    }

    /// A handler is already registered for a command type.
    pub fn duplicate_handler(command_type: impl Into<String>) -> Self {
        let command_type = command_type.into();
        Self::new(
            ErrorCode::DuplicateHandler,
            format!("A handler is already registered for {}", command_type),
        )
        .with_details(ErrorDetails::new().with_entity("command_type", command_type))
    }

    /// A projector failed to apply an event.
    pub fn projector_failure(projection: &str, position: u64, cause: &LedgerError) -> Self {
        Self::with_internal(
            ErrorCode::ProjectorFailure,
            format!("Projection {} failed at position {}", projection, position),
            cause.to_string(),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("projection", projection)
                .with_context("position", position)
                .with_context("cause_code", cause.code().as_str()),
        )
    }

    /// A transient transport failure (connection drop, timeout).
    pub fn transient(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::TransientStoreFailure,
            "The store is temporarily unavailable",
            message,
        )
    }

    /// The aggregate a command targets does not exist.
    pub fn aggregate_not_found(aggregate_type: &str, aggregate_id: impl Into<String>) -> Self {
        let aggregate_id = aggregate_id.into();
        Self::new(
            ErrorCode::AggregateNotFound,
            format!("{} not found: {}", aggregate_type, aggregate_id),
        )
        .with_details(ErrorDetails::new().with_entity(aggregate_type, aggregate_id))
    }

    /// A create command targeted an aggregate that already has history.
    pub fn aggregate_already_exists(aggregate_type: &str, aggregate_id: impl Into<String>) -> Self {
        let aggregate_id = aggregate_id.into();
        Self::new(
            ErrorCode::AggregateAlreadyExists,
            format!("{} already exists: {}", aggregate_type, aggregate_id),
        )
        .with_details(ErrorDetails::new().with_entity(aggregate_type, aggregate_id))
    }

    /// A command is not allowed from the aggregate's current state.
    pub fn invalid_state_transition(from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid state transition: {:?} -> {:?}", from, to),
        )
        .with_context("from_state", format!("{:?}", from))
        .with_context("to_state", format!("{:?}", to))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.details = std::mem::take(&mut self.details).with_context(key, value);
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

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// True only for transport-level failures that a bounded retry may absorb.
    pub fn is_transient(&self) -> bool {
        self.code == ErrorCode::TransientStoreFailure
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::ConcurrencyConflict
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.as_str();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "ledger_errors_total",
            "code" => self.code.as_str(),
            "category" => self.code.category(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| LedgerError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| LedgerError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| LedgerError::internal(message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| LedgerError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLSTATE classes Postgres uses for failures that may succeed on retry.
fn is_transient_sqlstate(code: &str) -> bool {
    // 08: connection exception, 40001: serialization failure, 40P01: deadlock,
    // 57P01..57P03: server shutdown / cannot connect now.
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01" | "57P02" | "57P03")
}

impl From<sqlx::Error> for LedgerError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::Database(db_err) => {
                if db_err.constraint() == Some(AGGREGATE_VERSION_CONSTRAINT) {
                    return Self::with_internal(
                        ErrorCode::ConcurrencyConflict,
                        "The aggregate was modified by a concurrent command",
                        db_err.message().to_string(),
                    )
                    .with_source(error);
                }
                if db_err.is_unique_violation() {
                    (ErrorCode::DuplicateRecord, "A record with this identifier already exists")
                } else if db_err.code().as_deref().map(is_transient_sqlstate).unwrap_or(false) {
                    (ErrorCode::TransientStoreFailure, "The store is temporarily unavailable")
                } else {
                    (ErrorCode::DatabaseError, "A database error occurred")
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => (
                ErrorCode::TransientStoreFailure,
                "The store is temporarily unavailable",
            ),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => (
                ErrorCode::SerializationError,
                "Failed to decode a stored row",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "Failed to apply database migrations",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error occurred",
            error.to_string(),
        )
    }
}
