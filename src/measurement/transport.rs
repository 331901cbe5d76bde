//! Gate-voltage transport sweep: source-meter staircase with lock-in readout.
//!
//! The Keithley steps its source voltage through a staircase; at each level
//! the measured (leakage) current and a full lock-in snapshot are recorded.
//! The sweep always ends with the source ramped back to zero.

use crate::instrument::keithley2400::{Keithley2400, SourceFunction};
use crate::instrument::srs830::Srs830;
use crate::instrument::Instrument;
use crate::measurement::grid::linspace;
use crate::measurement::{Procedure, RunContext};
use crate::save::Document;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransportSweepConfig {
    pub start_v: f64,
    pub stop_v: f64,
    pub npoints: usize,
    /// Settling time at each level before reading.
    pub settle: Duration,
    /// Compliance current for the source-meter.
    pub compliance_a: f64,
}

impl Default for TransportSweepConfig {
    fn default() -> Self {
        Self {
            start_v: 0.0,
            stop_v: 1.0,
            npoints: 101,
            settle: Duration::from_millis(100),
            compliance_a: 1e-6,
        }
    }
}

pub struct TransportSweep {
    source: Arc<Keithley2400>,
    lockin: Arc<Srs830>,
    pub config: TransportSweepConfig,
    /// Source voltage axis.
    pub levels: Vec<f64>,
    /// Source-meter current at each level.
    pub current: Vec<f64>,
    /// Lock-in channels at each level.
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub r: Vec<f64>,
    pub theta_deg: Vec<f64>,
}

impl TransportSweep {
    pub fn new(source: Arc<Keithley2400>, lockin: Arc<Srs830>, config: TransportSweepConfig) -> Self {
        Self {
            source,
            lockin,
            config,
            levels: Vec::new(),
            current: Vec::new(),
            x: Vec::new(),
            y: Vec::new(),
            r: Vec::new(),
            theta_deg: Vec::new(),
        }
    }
}

#[async_trait]
impl Procedure for TransportSweep {
    fn name(&self) -> &str {
        "transport_sweep"
    }

    async fn run(&mut self, ctx: &RunContext) -> Result<()> {
        let cfg = self.config.clone();
        if cfg.npoints < 2 {
            return Err(anyhow!("Transport sweep needs at least 2 points"));
        }
        self.levels = linspace(cfg.start_v, cfg.stop_v, cfg.npoints);
        self.current.clear();
        self.x.clear();
        self.y.clear();
        self.r.clear();
        self.theta_deg.clear();

        self.source
            .set_source_function(SourceFunction::Voltage)
            .await?;
        self.source.set_compliance_current(cfg.compliance_a).await?;
        self.source.set_output(true).await?;
        info!(
            "Transport sweep {:.3} V -> {:.3} V in {} steps",
            cfg.start_v, cfg.stop_v, cfg.npoints
        );

        for &level in &self.levels.clone() {
            ctx.check()?;
            self.source.set_voltage(level).await?;
            tokio::time::sleep(cfg.settle).await;

            let current = self
                .source
                .read_measurement()
                .await
                .context("Source-meter reading failed")?;
            if self.source.in_compliance().await? {
                warn!("Source hit compliance at {level:.3} V");
            }
            let snap = self.lockin.snap().await.context("Lock-in snapshot failed")?;
            debug!("V = {level:.3}: I = {current:.3e}, R = {:.3e}", snap.r);

            self.current.push(current);
            self.x.push(snap.x);
            self.y.push(snap.y);
            self.r.push(snap.r);
            self.theta_deg.push(snap.theta_deg);
        }

        self.source.shutdown().await
    }

    fn document(&self) -> Document {
        let mut doc = Document::new("TransportSweep");
        doc.set_f64("start_v", self.config.start_v);
        doc.set_f64("stop_v", self.config.stop_v);
        doc.set_int("npoints", self.config.npoints as i64);
        doc.set_f64("settle_s", self.config.settle.as_secs_f64());
        doc.set_f64("compliance_a", self.config.compliance_a);
        doc.set_array1("levels", &self.levels);
        doc.set_array1("current", &self.current);
        doc.set_array1("x", &self.x);
        doc.set_array1("y", &self.y);
        doc.set_array1("r", &self.r);
        doc.set_array1("theta_deg", &self.theta_deg);
        doc
    }

    fn restore(&mut self, doc: &Document) -> Result<()> {
        self.levels = doc.array1("levels").context("missing levels")?.to_vec();
        self.current = doc.array1("current").context("missing current")?.to_vec();
        self.x = doc.array1("x").context("missing x")?.to_vec();
        self.y = doc.array1("y").context("missing y")?.to_vec();
        self.r = doc.array1("r").context("missing r")?.to_vec();
        self.theta_deg = doc
            .array1("theta_deg")
            .context("missing theta_deg")?
            .to_vec();
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Err(e) = self.source.shutdown().await {
            warn!("Failed to shut the source down during cleanup: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::transport::MockTransport;

    fn sweep(npoints: usize) -> (TransportSweep, Arc<MockTransport>) {
        let smu_mock = Arc::new(
            MockTransport::new()
                .with_response(":READ?", "2.5e-9,0,0")
                .with_response(":SENS:CURR:PROT:TRIP?", "0"),
        );
        let lockin_mock = Arc::new(
            MockTransport::new().with_response("SNAP? 1,2,3,4", "1.0e-6,2.0e-6,2.236e-6,63.4"),
        );
        let source = Arc::new(Keithley2400::new("gate", smu_mock.clone()));
        let lockin = Arc::new(Srs830::new("lockin", lockin_mock));
        let cfg = TransportSweepConfig {
            npoints,
            settle: Duration::from_millis(0),
            ..TransportSweepConfig::default()
        };
        (TransportSweep::new(source, lockin, cfg), smu_mock)
    }

    #[tokio::test]
    async fn records_every_level_and_shuts_down() {
        let (mut ts, smu_mock) = sweep(5);
        ts.run(&RunContext::new()).await.unwrap();

        assert_eq!(ts.levels.len(), 5);
        assert_eq!(ts.current, vec![2.5e-9; 5]);
        assert_eq!(ts.r, vec![2.236e-6; 5]);
        assert!((ts.levels[4] - 1.0).abs() < 1e-12);

        let sent = smu_mock.sent();
        assert!(sent.contains(&":OUTP ON".to_string()));
        assert_eq!(sent.last(), Some(&":OUTP OFF".to_string()));
    }

    #[tokio::test]
    async fn abort_leaves_partial_arrays() {
        let (mut ts, _) = sweep(5);
        let ctx = RunContext::new();
        ctx.request_abort();
        assert!(ts.run(&ctx).await.is_err());
        assert!(ts.current.is_empty());
    }

    #[tokio::test]
    async fn document_round_trips_all_channels() {
        let (mut ts, _) = sweep(3);
        ts.run(&RunContext::new()).await.unwrap();
        let doc = ts.document();

        let (mut fresh, _) = sweep(3);
        fresh.restore(&doc).unwrap();
        assert_eq!(fresh.levels, ts.levels);
        assert_eq!(fresh.theta_deg, ts.theta_deg);
    }
}
