//! Experimental metadata structures and handling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Captures metadata for one experimental run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// Name of the procedure that produced the run.
    pub procedure: String,
    /// Free-form description of the run.
    pub description: String,
    /// Configuration of the instruments used (id -> summary string).
    pub instrument_config: HashMap<String, String>,
    /// User-defined experimental parameters.
    pub parameters: HashMap<String, serde_json::Value>,
    /// Environmental conditions (e.g. mixing-chamber temperature, field).
    pub environment: HashMap<String, f64>,
    /// Version of the acquisition software.
    pub software_version: String,
    /// Machine the run was taken on.
    pub hostname: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            procedure: String::new(),
            description: String::new(),
            instrument_config: HashMap::new(),
            parameters: HashMap::new(),
            environment: HashMap::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            started_at: Utc::now(),
        }
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn procedure(mut self, name: &str) -> Self {
        self.inner.procedure = name.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.inner.description = description.to_string();
        self
    }

    pub fn instrument_config(mut self, id: &str, summary: &str) -> Self {
        self.inner
            .instrument_config
            .insert(id.to_string(), summary.to_string());
        self
    }

    pub fn parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.inner.parameters.insert(key.to_string(), value);
        self
    }

    pub fn environment(mut self, key: &str, value: f64) -> Self {
        self.inner.environment.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Metadata {
        self.inner
    }
}
