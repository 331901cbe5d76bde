//! Instrument drivers and the traits they share.
//!
//! Every driver wraps one physical device behind typed async accessors. The
//! command tables live in the drivers; the wire plumbing lives in
//! [`transport`] (SCPI-style ask/write over serial or TCP) and
//! [`serial`] (blocking serial I/O pushed through `spawn_blocking`).
//!
//! Capability traits keep procedure code hardware-agnostic: a touchdown only
//! needs *something* that reads a capacitance-proportional value, so it takes
//! a `Readable`, not a concrete lock-in.

pub mod attocube;
pub mod daq;
pub mod keithley2400;
pub mod lakeshore372;
pub mod magnet;
pub mod piezos;
pub mod serial;
pub mod srs830;
pub mod transport;
pub mod vna;

use anyhow::Result;
use async_trait::async_trait;

/// Trait for any scientific instrument.
///
/// Drivers are constructed directly from a transport or connection; this trait
/// covers the lifecycle pieces that are common to all of them.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Returns the name of the instrument.
    fn name(&self) -> String;

    /// Puts the instrument into a safe idle state and releases the connection.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: a single scalar readout.
///
/// Implemented by anything a procedure might sample per point: a lock-in's R
/// output, a positioner's capacitance, a temperature channel.
#[async_trait]
pub trait Readable: Send + Sync {
    async fn read(&self) -> Result<f64>;
}

/// Capability: a scalar set-point with read-back.
///
/// # Contract
/// - `set` validates against the device's limits before touching hardware
/// - `get` returns the device's own notion of the value, not a cached copy
#[async_trait]
pub trait Settable: Send + Sync {
    async fn set(&self, value: f64) -> Result<()>;
    async fn get(&self) -> Result<f64>;
}
