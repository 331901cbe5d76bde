//! Lakeshore 372 AC resistance bridge / temperature controller driver.
//!
//! Protocol overview:
//! - ASCII over GPIB or ethernet, LF terminated
//! - `RDGK? <ch>` kelvin reading, `RDGR? <ch>` resistance reading
//! - `SCAN <ch>,<autoscan>` scanner channel select
//! - `RANGE 0,<code>` sample heater range
//!
//! Channels are plain arguments rather than per-channel accessors, and the
//! heater range is a typed enum over the instrument's code table.

use crate::instrument::transport::Transport;
use crate::instrument::Instrument;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

const NUM_CHANNELS: u8 = 16;

/// Sample heater range codes (`RANGE` command, output 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterRange {
    Off,
    Range31uA,
    Range100uA,
    Range316uA,
    Range1mA,
    Range3_16mA,
    Range10mA,
    Range31_6mA,
    Range100mA,
}

impl HeaterRange {
    pub fn code(self) -> u8 {
        match self {
            HeaterRange::Off => 0,
            HeaterRange::Range31uA => 1,
            HeaterRange::Range100uA => 2,
            HeaterRange::Range316uA => 3,
            HeaterRange::Range1mA => 4,
            HeaterRange::Range3_16mA => 5,
            HeaterRange::Range10mA => 6,
            HeaterRange::Range31_6mA => 7,
            HeaterRange::Range100mA => 8,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => HeaterRange::Off,
            1 => HeaterRange::Range31uA,
            2 => HeaterRange::Range100uA,
            3 => HeaterRange::Range316uA,
            4 => HeaterRange::Range1mA,
            5 => HeaterRange::Range3_16mA,
            6 => HeaterRange::Range10mA,
            7 => HeaterRange::Range31_6mA,
            8 => HeaterRange::Range100mA,
            other => return Err(anyhow!("Unknown heater range code {other}")),
        })
    }
}

/// Driver for the Lakeshore 372 on the dilution refrigerator.
pub struct Lakeshore372 {
    transport: Arc<dyn Transport>,
    id: String,
}

impl Lakeshore372 {
    pub fn new(id: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            id: id.to_string(),
        }
    }

    pub async fn identify(&self) -> Result<String> {
        self.transport.ask("*IDN?").await
    }

    fn check_channel(&self, channel: u8) -> Result<()> {
        if channel == 0 || channel > NUM_CHANNELS {
            return Err(anyhow!(
                "{}: channel {channel} out of range (1-{NUM_CHANNELS})",
                self.id
            ));
        }
        Ok(())
    }

    /// Kelvin reading of one input channel.
    pub async fn temperature(&self, channel: u8) -> Result<f64> {
        self.check_channel(channel)?;
        let response = self.transport.ask(&format!("RDGK? {channel}")).await?;
        response
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{}: unparseable kelvin reading '{response}'", self.id))
    }

    /// Resistance reading of one input channel, in ohms.
    pub async fn resistance(&self, channel: u8) -> Result<f64> {
        self.check_channel(channel)?;
        let response = self.transport.ask(&format!("RDGR? {channel}")).await?;
        response
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{}: unparseable resistance reading '{response}'", self.id))
    }

    /// Select the scanner channel. `autoscan` resumes the scan cycle after.
    pub async fn select_channel(&self, channel: u8, autoscan: bool) -> Result<()> {
        self.check_channel(channel)?;
        let auto = u8::from(autoscan);
        self.transport.write(&format!("SCAN {channel},{auto}")).await
    }

    pub async fn set_heater_range(&self, range: HeaterRange) -> Result<()> {
        self.transport
            .write(&format!("RANGE 0,{}", range.code()))
            .await
    }

    pub async fn heater_range(&self) -> Result<HeaterRange> {
        let response = self.transport.ask("RANGE? 0").await?;
        let code: u8 = response
            .trim()
            .parse()
            .with_context(|| format!("{}: unparseable range '{response}'", self.id))?;
        HeaterRange::from_code(code)
    }
}

impl Instrument for Lakeshore372 {
    fn name(&self) -> String {
        self.id.clone()
    }
}
