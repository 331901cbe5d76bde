//! Stanford Research Systems SR830 lock-in amplifier driver.
//!
//! Reference: SR830 Operating Manual, remote programming chapter.
//!
//! Protocol overview:
//! - Format: ASCII command/response (GPIB command set, also spoken over the
//!   RS-232 port and GPIB-ethernet bridges)
//! - Terminator: LF
//! - Settings use index codes into fixed tables: `SENS n`, `OFLT n`
//! - Multi-channel snapshot: `SNAP? 1,2,3,4` returns X,Y,R,theta CSV

use crate::instrument::transport::Transport;
use crate::instrument::{Instrument, Readable};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Full-scale sensitivities in volts, indexed by the SR830 `SENS` code.
pub const SENSITIVITIES: [f64; 27] = [
    2e-9, 5e-9, 10e-9, 20e-9, 50e-9, 100e-9, 200e-9, 500e-9, 1e-6, 2e-6, 5e-6, 10e-6, 20e-6,
    50e-6, 100e-6, 200e-6, 500e-6, 1e-3, 2e-3, 5e-3, 10e-3, 20e-3, 50e-3, 100e-3, 200e-3, 500e-3,
    1.0,
];

/// Time constants in seconds, indexed by the SR830 `OFLT` code.
pub const TIME_CONSTANTS: [f64; 20] = [
    10e-6, 30e-6, 100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3, 300e-3, 1.0, 3.0, 10.0, 30.0,
    100.0, 300.0, 1e3, 3e3, 10e3, 30e3,
];

/// One simultaneous read of the four demodulator outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockinSnapshot {
    pub x: f64,
    pub y: f64,
    pub r: f64,
    pub theta_deg: f64,
}

/// Driver for the SR830 digital lock-in amplifier.
pub struct Srs830 {
    transport: Arc<dyn Transport>,
    id: String,
}

impl Srs830 {
    pub fn new(id: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            id: id.to_string(),
        }
    }

    pub async fn identify(&self) -> Result<String> {
        self.transport.ask("*IDN?").await
    }

    /// Set the sensitivity to the smallest full-scale range that covers
    /// `volts`, then read it back to confirm the instrument took it.
    pub async fn set_sensitivity(&self, volts: f64) -> Result<()> {
        let code = sensitivity_code(volts)
            .ok_or_else(|| anyhow!("Requested sensitivity {volts} V exceeds 1 V full scale"))?;
        self.transport.write(&format!("SENS {code}")).await?;
        let readback = self.sensitivity().await?;
        if readback != SENSITIVITIES[code] {
            return Err(anyhow!(
                "{}: sensitivity readback {} V does not match requested code {}",
                self.id,
                readback,
                code
            ));
        }
        Ok(())
    }

    /// Current full-scale sensitivity in volts.
    pub async fn sensitivity(&self) -> Result<f64> {
        let code = self.ask_code("SENS?").await?;
        SENSITIVITIES
            .get(code)
            .copied()
            .ok_or_else(|| anyhow!("{}: sensitivity code {} out of table", self.id, code))
    }

    /// Set the time constant to the smallest table entry >= `seconds`.
    pub async fn set_time_constant(&self, seconds: f64) -> Result<()> {
        let code = TIME_CONSTANTS
            .iter()
            .position(|&tc| tc >= seconds)
            .ok_or_else(|| anyhow!("Requested time constant {seconds} s exceeds 30 ks"))?;
        self.transport.write(&format!("OFLT {code}")).await
    }

    /// Current time constant in seconds.
    pub async fn time_constant(&self) -> Result<f64> {
        let code = self.ask_code("OFLT?").await?;
        TIME_CONSTANTS
            .get(code)
            .copied()
            .ok_or_else(|| anyhow!("{}: time constant code {} out of table", self.id, code))
    }

    /// Set the internal reference frequency in Hz (0.001 Hz - 102 kHz).
    pub async fn set_reference_frequency(&self, hz: f64) -> Result<()> {
        if !(0.001..=102_000.0).contains(&hz) {
            return Err(anyhow!(
                "Reference frequency {hz} Hz out of range (0.001 Hz - 102 kHz)"
            ));
        }
        self.transport.write(&format!("FREQ {hz}")).await
    }

    pub async fn reference_frequency(&self) -> Result<f64> {
        self.ask_f64("FREQ?").await
    }

    /// Set the sine output amplitude in volts (0.004 - 5.0 V).
    pub async fn set_amplitude(&self, volts: f64) -> Result<()> {
        if !(0.004..=5.0).contains(&volts) {
            return Err(anyhow!("Sine amplitude {volts} V out of range (4 mV - 5 V)"));
        }
        self.transport.write(&format!("SLVL {volts}")).await
    }

    pub async fn amplitude(&self) -> Result<f64> {
        self.ask_f64("SLVL?").await
    }

    /// Read X, Y, R, theta in one snapshot so the four values are coherent.
    pub async fn snap(&self) -> Result<LockinSnapshot> {
        let response = self.transport.ask("SNAP? 1,2,3,4").await?;
        let fields: Vec<f64> = response
            .split(',')
            .map(|f| f.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("{}: unparseable SNAP response '{response}'", self.id))?;
        if fields.len() != 4 {
            return Err(anyhow!(
                "{}: expected 4 fields in SNAP response, got {}",
                self.id,
                fields.len()
            ));
        }
        Ok(LockinSnapshot {
            x: fields[0],
            y: fields[1],
            r: fields[2],
            theta_deg: fields[3],
        })
    }

    /// Bump the sensitivity until R sits below 90% of full scale.
    ///
    /// Walks at most the length of the table, so a noisy signal cannot wedge
    /// the loop.
    pub async fn auto_gain(&self) -> Result<f64> {
        for _ in 0..SENSITIVITIES.len() {
            let sens = self.sensitivity().await?;
            let r = self.snap().await?.r;
            if r.abs() <= 0.9 * sens {
                return Ok(sens);
            }
            let code = sensitivity_code(sens)
                .and_then(|c| if c + 1 < SENSITIVITIES.len() { Some(c + 1) } else { None })
                .ok_or_else(|| anyhow!("{}: signal overloads 1 V full scale", self.id))?;
            self.transport.write(&format!("SENS {code}")).await?;
        }
        self.sensitivity().await
    }

    async fn ask_code(&self, query: &str) -> Result<usize> {
        let response = self.transport.ask(query).await?;
        response
            .trim()
            .parse::<usize>()
            .with_context(|| format!("{}: unparseable code response '{response}'", self.id))
    }

    async fn ask_f64(&self, query: &str) -> Result<f64> {
        let response = self.transport.ask(query).await?;
        response
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{}: unparseable response '{response}'", self.id))
    }
}

/// Smallest `SENS` code whose full scale covers `volts`.
pub fn sensitivity_code(volts: f64) -> Option<usize> {
    SENSITIVITIES.iter().position(|&s| s >= volts)
}

impl Instrument for Srs830 {
    fn name(&self) -> String {
        self.id.clone()
    }
}

#[async_trait]
impl Readable for Srs830 {
    /// Reads the magnitude output R.
    async fn read(&self) -> Result<f64> {
        self.ask_f64("OUTP? 3").await
    }
}
