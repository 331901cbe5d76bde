//! Custom error types for the library.
//!
//! This module defines the primary error type, `LabError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different kinds of failures that come up in lab work: configuration
//! problems, instrument communication failures, malformed responses, safety-limit
//! violations, and persistence errors.
//!
//! Instrument drivers report failures through `anyhow` at the transport seam and
//! attach context there; the structured variants below exist so that callers who
//! need to react to a *kind* of failure (a tripped safety limit, a reload that
//! failed after a successful save) can match on it. `#[from]` conversions let
//! `?` flow through the crate.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument '{id}' error: {message}")]
    Instrument { id: String, message: String },

    #[error("Failed to parse response from '{id}': '{response}'")]
    Parse { id: String, response: String },

    #[error("Safety limit '{limit}' violated: {value} exceeds bound {bound}")]
    SafetyLimit {
        limit: String,
        value: f64,
        bound: f64,
    },

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The save itself succeeded; only the read-back check failed. The files
    /// written locally are left in place.
    #[error("Reloading failed, but the measurement was saved: {0}")]
    ReloadAfterSave(String),

    #[error("Saved document does not match after reload: {0}")]
    RoundTripMismatch(String),

    #[error("Measurement aborted")]
    Aborted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LabError {
    /// Construct an instrument error with an owned id and message.
    pub fn instrument(id: impl Into<String>, message: impl Into<String>) -> Self {
        LabError::Instrument {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Construct a safety-limit violation.
    pub fn safety(limit: impl Into<String>, value: f64, bound: f64) -> Self {
        LabError::SafetyLimit {
            limit: limit.into(),
            value,
            bound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_limit_message_names_the_limit() {
        let err = LabError::safety("piezo z Vmax", 132.0, 120.0);
        let msg = err.to_string();
        assert!(msg.contains("piezo z Vmax"));
        assert!(msg.contains("132"));
        assert!(msg.contains("120"));
    }

    #[test]
    fn anyhow_errors_pass_through() {
        let inner = anyhow::anyhow!("port went away");
        let err: LabError = inner.into();
        assert!(err.to_string().contains("port went away"));
    }

    #[test]
    fn reload_after_save_is_distinguishable() {
        let err = LabError::ReloadAfterSave("bad json".into());
        assert!(matches!(err, LabError::ReloadAfterSave(_)));
        assert!(err.to_string().contains("was saved"));
    }
}
