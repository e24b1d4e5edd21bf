//! Error types for Silicon Tuner

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for tuner operations
pub type Result<T> = std::result::Result<T, TunerError>;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum TunerError {
    /// A single inventory field could not be read. Never aborts collection.
    #[error("Probe failed for {field}: {reason}")]
    ProbeFailure { field: String, reason: String },

    /// No CPU could be identified at all; classification cannot proceed
    #[error("Hardware enumeration failed: {0}")]
    EnumerationFailed(String),

    /// Accelerator backend missing or unreachable
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Unknown device, profile or store key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requested configuration outside device capability bounds
    #[error("{field} = {requested} is out of range [{min}, {max}]")]
    OutOfRange {
        field: String,
        requested: f64,
        min: f64,
        max: f64,
    },

    /// A tuning category could not be applied
    #[error("Apply failed for {category}: {reason}")]
    ApplyFailure { category: String, reason: String },

    /// Monitoring sample missed for a device
    #[error("Status for GPU {index} is stale")]
    Stale { index: u32 },

    /// Another configuration request holds the device
    #[error("Configuration already in progress for GPU {index}")]
    Conflict { index: u32 },

    /// Backend call exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Feature switched off in configuration
    #[error("Disabled: {0}")]
    Disabled(String),

    /// Tuning plan key inserted twice
    #[error("Duplicate tuning key: {0}")]
    DuplicateKey(String),

    /// Invalid per-device state transition
    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    /// External command failed
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TunerError {
    /// Build a field-level probe failure
    pub fn probe(field: impl Into<String>, reason: impl ToString) -> Self {
        TunerError::ProbeFailure {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a category-level apply failure
    pub fn apply(category: impl ToString, reason: impl ToString) -> Self {
        TunerError::ApplyFailure {
            category: category.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error leaves no usable output for the caller
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunerError::EnumerationFailed(_) | TunerError::Configuration(_)
        )
    }
}
