//! Vector network analyzer driver (HP/Agilent 872x-class).
//!
//! Protocol overview:
//! - SCPI-flavored ASCII over GPIB, LF terminated
//! - Sweep setup: `SENS:FREQ:STAR/STOP`, `SENS:SWE:POIN`
//! - Averaging: `SENS:AVER ON`, `SENS:AVER:COUN n`
//! - Trace read: `CALC:DATA? FDATA` returns comma-separated formatted points

use crate::instrument::transport::Transport;
use crate::instrument::Instrument;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

const MIN_FREQ_HZ: f64 = 50e6;
const MAX_FREQ_HZ: f64 = 40.0e9;
const MAX_POINTS: usize = 1601;
const MIN_POWER_DBM: f64 = -80.0;
const MAX_POWER_DBM: f64 = 10.0;

/// Driver for a vector network analyzer measuring S21 through a cryostat line.
pub struct Vna {
    transport: Arc<dyn Transport>,
    id: String,
}

impl Vna {
    pub fn new(id: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            id: id.to_string(),
        }
    }

    pub async fn identify(&self) -> Result<String> {
        self.transport.ask("*IDN?").await
    }

    /// Configure a linear frequency sweep.
    pub async fn set_sweep(&self, start_hz: f64, stop_hz: f64, points: usize) -> Result<()> {
        if !(MIN_FREQ_HZ..=MAX_FREQ_HZ).contains(&start_hz)
            || !(MIN_FREQ_HZ..=MAX_FREQ_HZ).contains(&stop_hz)
        {
            return Err(anyhow!(
                "Sweep range {start_hz}-{stop_hz} Hz outside instrument limits"
            ));
        }
        if start_hz >= stop_hz {
            return Err(anyhow!("Sweep start must be below stop"));
        }
        if points < 2 || points > MAX_POINTS {
            return Err(anyhow!("Sweep points {points} out of range (2-{MAX_POINTS})"));
        }
        self.transport
            .write(&format!("SENS:FREQ:STAR {start_hz}"))
            .await?;
        self.transport
            .write(&format!("SENS:FREQ:STOP {stop_hz}"))
            .await?;
        self.transport
            .write(&format!("SENS:SWE:POIN {points}"))
            .await
    }

    /// Set the source power in dBm.
    pub async fn set_power(&self, dbm: f64) -> Result<()> {
        if !(MIN_POWER_DBM..=MAX_POWER_DBM).contains(&dbm) {
            return Err(anyhow!(
                "Power {dbm} dBm out of range ({MIN_POWER_DBM} to {MAX_POWER_DBM})"
            ));
        }
        self.transport.write(&format!("SOUR:POW {dbm}")).await
    }

    /// Enable sweep averaging with the given factor (1 disables).
    pub async fn set_averaging(&self, factor: usize) -> Result<()> {
        if factor <= 1 {
            return self.transport.write("SENS:AVER OFF").await;
        }
        if factor > 999 {
            return Err(anyhow!("Averaging factor {factor} out of range (max 999)"));
        }
        self.transport.write("SENS:AVER ON").await?;
        self.transport
            .write(&format!("SENS:AVER:COUN {factor}"))
            .await
    }

    /// Restart averaging before a fresh trace.
    pub async fn restart_averaging(&self) -> Result<()> {
        self.transport.write("SENS:AVER:CLE").await
    }

    /// Read the formatted S21 magnitude trace in dB.
    pub async fn s21_db(&self) -> Result<Vec<f64>> {
        let response = self.transport.ask("CALC:DATA? FDATA").await?;
        parse_trace(&self.id, &response)
    }

    /// Sweep frequencies currently configured, computed from the endpoints.
    pub async fn frequencies(&self) -> Result<Vec<f64>> {
        let start: f64 = self.ask_f64("SENS:FREQ:STAR?").await?;
        let stop: f64 = self.ask_f64("SENS:FREQ:STOP?").await?;
        let points: usize = self
            .transport
            .ask("SENS:SWE:POIN?")
            .await?
            .trim()
            .parse()
            .context("unparseable point count")?;
        Ok(crate::measurement::grid::linspace(start, stop, points))
    }

    async fn ask_f64(&self, query: &str) -> Result<f64> {
        let response = self.transport.ask(query).await?;
        response
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{}: unparseable response '{response}'", self.id))
    }
}

fn parse_trace(id: &str, response: &str) -> Result<Vec<f64>> {
    response
        .split(',')
        .map(|f| {
            f.trim()
                .parse::<f64>()
                .with_context(|| format!("{id}: unparseable trace field '{f}'"))
        })
        .collect()
}

impl Instrument for Vna {
    fn name(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::transport::MockTransport;

    #[tokio::test]
    async fn trace_parses_csv_floats() {
        let mock =
            Arc::new(MockTransport::new().with_response("CALC:DATA? FDATA", "-3.2,-3.5, -4.1"));
        let vna = Vna::new("vna", mock);
        assert_eq!(vna.s21_db().await.unwrap(), vec![-3.2, -3.5, -4.1]);
    }

    #[tokio::test]
    async fn sweep_validation() {
        let mock = Arc::new(MockTransport::new());
        let vna = Vna::new("vna", mock);
        assert!(vna.set_sweep(1e9, 2e9, 1).await.is_err());
        assert!(vna.set_sweep(2e9, 1e9, 201).await.is_err());
        assert!(vna.set_sweep(1e3, 2e9, 201).await.is_err());
        assert!(vna.set_sweep(1e9, 2e9, 201).await.is_ok());
    }

    #[tokio::test]
    async fn frequencies_match_sweep_setup() {
        let mock = Arc::new(
            MockTransport::new()
                .with_response("SENS:FREQ:STAR?", "1e9")
                .with_response("SENS:FREQ:STOP?", "2e9")
                .with_response("SENS:SWE:POIN?", "3"),
        );
        let vna = Vna::new("vna", mock);
        assert_eq!(vna.frequencies().await.unwrap(), vec![1e9, 1.5e9, 2e9]);
    }

    #[tokio::test]
    async fn averaging_off_for_unit_factor() {
        let mock = Arc::new(MockTransport::new());
        let vna = Vna::new("vna", mock.clone());
        vna.set_averaging(1).await.unwrap();
        assert_eq!(mock.sent(), vec!["SENS:AVER OFF".to_string()]);
    }
}
