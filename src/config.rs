//! Configuration management.
//!
//! Settings are loaded from TOML files in the `config/` directory via the
//! `config` crate. Each lab machine keeps its own profile named after its
//! hostname (`config/<hostname>.toml`), falling back to `config/default.toml`,
//! so a measurement script runs unchanged on any setup computer and picks up
//! the right serial ports, addresses, and limits.

use crate::error::{LabError, LabResult};
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub storage: StorageSettings,
    /// Per-instrument tables: port, baud rate, TCP address, limits, etc.
    #[serde(default)]
    pub instruments: HashMap<String, toml::Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Local directory for measurement data.
    pub data_dir: String,
    /// Network-mounted mirror; saves are copied there best-effort.
    pub mirror_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from `config/<name>` (extension resolved by the config crate).
    pub fn new(config_name: Option<&str>) -> LabResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(LabError::Config)?;

        s.try_deserialize().map_err(LabError::Config)
    }

    /// Load the profile for this machine, falling back to the default profile.
    ///
    /// Mirrors the per-machine setup scripts of old: each setup computer keeps
    /// its own instrument addresses under its hostname.
    pub fn for_host() -> LabResult<Self> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !host.is_empty() && Path::new(&format!("config/{host}.toml")).exists() {
            Self::new(Some(&host))
        } else {
            Self::new(None)
        }
    }

    /// Load settings from an explicit file path.
    pub fn from_file(path: &Path) -> LabResult<Self> {
        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(LabError::Config)?;
        s.try_deserialize().map_err(LabError::Config)
    }

    /// Look up the configuration table for one instrument.
    pub fn instrument(&self, id: &str) -> LabResult<&toml::Value> {
        self.instruments.get(id).ok_or_else(|| {
            LabError::Configuration(format!("Instrument '{id}' not found in settings"))
        })
    }

    /// Fetch a required string field from an instrument table.
    pub fn instrument_str(&self, id: &str, key: &str) -> LabResult<String> {
        self.instrument(id)?
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                LabError::Configuration(format!("Missing '{key}' in config for instrument '{id}'"))
            })
    }

    /// Fetch a numeric field from an instrument table, with a default.
    pub fn instrument_f64_or(&self, id: &str, key: &str, default: f64) -> f64 {
        self.instruments
            .get(id)
            .and_then(|t| t.get(key))
            .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
            .unwrap_or(default)
    }
}
