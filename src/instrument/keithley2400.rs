//! Keithley 2400-class source-meter driver.
//!
//! Reference: Model 2400 SourceMeter User's Manual, SCPI command reference.
//!
//! Protocol overview:
//! - Standard SCPI over GPIB/RS-232, LF terminated
//! - `:SOUR:FUNC VOLT|CURR`, `:SOUR:VOLT <v>`, `:SENS:CURR:PROT <a>`
//! - `:READ?` returns a CSV reading; first field is the measured value of the
//!   active sense function

use crate::instrument::transport::Transport;
use crate::instrument::Instrument;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Hard limits of the 2400 source ranges.
const MAX_SOURCE_VOLTAGE: f64 = 210.0;
const MAX_SOURCE_CURRENT: f64 = 1.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFunction {
    Voltage,
    Current,
}

/// Driver for a Keithley 2400 source-meter used as gate/bias supply.
pub struct Keithley2400 {
    transport: Arc<dyn Transport>,
    id: String,
}

impl Keithley2400 {
    pub fn new(id: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            id: id.to_string(),
        }
    }

    pub async fn identify(&self) -> Result<String> {
        self.transport.ask("*IDN?").await
    }

    pub async fn set_source_function(&self, function: SourceFunction) -> Result<()> {
        let cmd = match function {
            SourceFunction::Voltage => ":SOUR:FUNC VOLT",
            SourceFunction::Current => ":SOUR:FUNC CURR",
        };
        self.transport.write(cmd).await
    }

    /// Set the source voltage level. Rejected above the instrument's 210 V range.
    pub async fn set_voltage(&self, volts: f64) -> Result<()> {
        if volts.abs() > MAX_SOURCE_VOLTAGE {
            return Err(crate::error::LabError::safety(
                format!("{} source voltage", self.id),
                volts,
                MAX_SOURCE_VOLTAGE,
            )
            .into());
        }
        self.transport.write(&format!(":SOUR:VOLT {volts}")).await
    }

    pub async fn set_current(&self, amps: f64) -> Result<()> {
        if amps.abs() > MAX_SOURCE_CURRENT {
            return Err(crate::error::LabError::safety(
                format!("{} source current", self.id),
                amps,
                MAX_SOURCE_CURRENT,
            )
            .into());
        }
        self.transport.write(&format!(":SOUR:CURR {amps}")).await
    }

    /// Set the current compliance limit in amps.
    pub async fn set_compliance_current(&self, amps: f64) -> Result<()> {
        if amps <= 0.0 || amps > MAX_SOURCE_CURRENT {
            return Err(anyhow!("Compliance current {amps} A out of range"));
        }
        self.transport
            .write(&format!(":SENS:CURR:PROT {amps}"))
            .await
    }

    /// Whether the source hit its compliance limit on the last reading.
    pub async fn in_compliance(&self) -> Result<bool> {
        let response = self.transport.ask(":SENS:CURR:PROT:TRIP?").await?;
        Ok(response.trim() == "1")
    }

    pub async fn set_output(&self, on: bool) -> Result<()> {
        let cmd = if on { ":OUTP ON" } else { ":OUTP OFF" };
        self.transport.write(cmd).await
    }

    pub async fn output(&self) -> Result<bool> {
        let response = self.transport.ask(":OUTP?").await?;
        Ok(response.trim() == "1")
    }

    /// Take one reading of the active sense function.
    ///
    /// `:READ?` replies with a CSV record; the first field is the value.
    pub async fn read_measurement(&self) -> Result<f64> {
        let response = self.transport.ask(":READ?").await?;
        let first = response
            .split(',')
            .next()
            .ok_or_else(|| anyhow!("{}: empty :READ? response", self.id))?;
        first
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{}: unparseable reading '{response}'", self.id))
    }

    /// Staircase voltage sweep: step the source through `levels`, waiting
    /// `delay` at each step for settling, and record the measured current.
    pub async fn staircase_sweep(&self, levels: &[f64], delay: Duration) -> Result<Vec<f64>> {
        let mut readings = Vec::with_capacity(levels.len());
        for &level in levels {
            self.set_voltage(level).await?;
            tokio::time::sleep(delay).await;
            readings.push(self.read_measurement().await?);
        }
        Ok(readings)
    }
}

#[async_trait]
impl Instrument for Keithley2400 {
    fn name(&self) -> String {
        self.id.clone()
    }

    /// Ramp the source to zero and disable the output.
    async fn shutdown(&self) -> Result<()> {
        self.set_voltage(0.0).await?;
        self.set_output(false).await
    }
}
