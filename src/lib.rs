//! # cryodaq
//!
//! Instrumentation control and data acquisition for a condensed-matter
//! physics lab: scanning-SQUID microscopy, transport, and noise
//! measurements in a dilution refrigerator.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML settings with per-machine profiles (data directory,
//!   mirror share, instrument addresses). See `config::Settings`.
//! - **`error`**: The `LabError` enum; drivers and procedures return
//!   `anyhow::Result` with `LabError` variants at the seams that callers
//!   match on (safety limits, aborts, persistence failures).
//! - **`instrument`**: Drivers for the bench: SR830 lock-in, VNA, Keithley
//!   2400 source-meter, magnet supply, Attocube positioner console,
//!   Lakeshore 372 bridge, the DAQ card abstraction, and the piezo scanner
//!   built on it. All hardware sits behind `transport::Transport` or
//!   `daq::DaqBackend`, with mocks for hardware-free work.
//! - **`measurement`**: The `Procedure` trait and the acquisition routines:
//!   SQUID I-V, touchdown, plane fit, constant-height scan, transport
//!   sweep, and noise spectrum. The `Runner` handles aborts, cleanup, and
//!   saving.
//! - **`metadata`**: Run metadata attached to every saved document.
//! - **`save`**: The document tree, its JSON + array-sidecar split with
//!   save-then-reload verification, and checksum-verified mirroring to a
//!   network share.

pub mod config;
pub mod error;
pub mod instrument;
pub mod measurement;
pub mod metadata;
pub mod save;

pub use error::{LabError, LabResult};
pub use measurement::{Procedure, RunContext, Runner};
pub use save::{DocNode, Document, LoadOptions, Saver};

/// Initialize env_logger with sensible defaults.
///
/// Call once at startup; safe to call again (subsequent calls are no-ops).
pub fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    let _ = env_logger::Builder::from_env(env).try_init();
}
