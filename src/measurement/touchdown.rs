//! Capacitive touchdown: find the z voltage where the scanner tip meets the
//! sample surface.
//!
//! The z piezo is stepped upward while a capacitance-proportional signal is
//! sampled at each step. Far from the surface the signal drifts linearly; on
//! contact it kinks upward. A baseline line is fit to the approach, contact is
//! declared after several consecutive samples exceed the baseline by a
//! threshold, and the touchdown voltage is the intersection of the baseline
//! with a line fit through the contact samples. The z piezo is always ramped
//! back to zero afterwards, touchdown or not.

use crate::instrument::piezos::Piezos;
use crate::instrument::Readable;
use crate::measurement::{Procedure, RunContext};
use crate::save::Document;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TouchdownConfig {
    /// Piezo axis label for z.
    pub z_axis: String,
    /// Starting z voltage of the approach.
    pub z_start_v: f64,
    /// Give up if no touchdown before this voltage.
    pub z_max_v: f64,
    /// Voltage increment per step.
    pub step_v: f64,
    pub sample_rate_hz: f64,
    /// Capacitance excess over the baseline that counts as contact.
    pub threshold: f64,
    /// Number of initial samples used for the baseline fit.
    pub baseline_points: usize,
    /// Consecutive above-threshold samples required to declare contact.
    pub confirm_points: usize,
}

impl Default for TouchdownConfig {
    fn default() -> Self {
        Self {
            z_axis: "z".to_string(),
            z_start_v: 0.0,
            z_max_v: 100.0,
            step_v: 1.0,
            sample_rate_hz: 1000.0,
            threshold: 0.05,
            baseline_points: 10,
            confirm_points: 3,
        }
    }
}

/// Least-squares line `y = slope * x + intercept`.
fn linear_fit(x: &[f64], y: &[f64]) -> Result<(f64, f64)> {
    if x.len() < 2 || x.len() != y.len() {
        return Err(anyhow!("Line fit needs at least 2 matched samples"));
    }
    let n = x.len() as f64;
    let sx: f64 = x.iter().sum();
    let sy: f64 = y.iter().sum();
    let sxx: f64 = x.iter().map(|v| v * v).sum();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let det = n * sxx - sx * sx;
    if det.abs() < 1e-12 {
        return Err(anyhow!("Line fit is degenerate"));
    }
    let slope = (n * sxy - sx * sy) / det;
    Ok((slope, (sy - slope * sx) / n))
}

pub struct Touchdown {
    piezos: Arc<Piezos>,
    capacitance: Arc<dyn Readable>,
    pub config: TouchdownConfig,
    /// z voltages visited during the approach.
    pub z_voltages: Vec<f64>,
    /// Capacitance signal at each z voltage.
    pub capacitances: Vec<f64>,
    /// Detected touchdown voltage, if contact was found.
    pub touchdown_v: Option<f64>,
}

impl Touchdown {
    pub fn new(
        piezos: Arc<Piezos>,
        capacitance: Arc<dyn Readable>,
        config: TouchdownConfig,
    ) -> Self {
        Self {
            piezos,
            capacitance,
            config,
            z_voltages: Vec::new(),
            capacitances: Vec::new(),
            touchdown_v: None,
        }
    }

    /// Locate the contact kink in the recorded trace.
    ///
    /// Separated out so a saved trace can be re-analyzed with different
    /// thresholds after the fact.
    pub fn analyze(&self) -> Result<Option<f64>> {
        let cfg = &self.config;
        if self.z_voltages.len() <= cfg.baseline_points + cfg.confirm_points {
            return Ok(None);
        }

        let (slope, intercept) = linear_fit(
            &self.z_voltages[..cfg.baseline_points],
            &self.capacitances[..cfg.baseline_points],
        )?;

        let mut run_start = None;
        let mut run_len = 0;
        let mut contact = None;
        for (i, (&z, &c)) in self
            .z_voltages
            .iter()
            .zip(&self.capacitances)
            .enumerate()
            .skip(cfg.baseline_points)
        {
            if c - (slope * z + intercept) > cfg.threshold {
                if run_len == 0 {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len >= cfg.confirm_points {
                    contact = run_start;
                    break;
                }
            } else {
                run_len = 0;
                run_start = None;
            }
        }

        let Some(start) = contact else {
            return Ok(None);
        };
        let (contact_slope, contact_intercept) =
            linear_fit(&self.z_voltages[start..], &self.capacitances[start..])?;
        if (contact_slope - slope).abs() < 1e-12 {
            return Err(anyhow!("Contact line is parallel to the baseline"));
        }
        Ok(Some(
            (intercept - contact_intercept) / (contact_slope - slope),
        ))
    }
}

#[async_trait]
impl Procedure for Touchdown {
    fn name(&self) -> &str {
        "touchdown"
    }

    async fn run(&mut self, ctx: &RunContext) -> Result<()> {
        let cfg = self.config.clone();
        if cfg.step_v <= 0.0 || cfg.z_max_v <= cfg.z_start_v {
            return Err(anyhow!("Touchdown needs step_v > 0 and z_max_v > z_start_v"));
        }
        self.z_voltages.clear();
        self.capacitances.clear();
        self.touchdown_v = None;

        self.piezos
            .sweep_to(&cfg.z_axis, cfg.z_start_v, cfg.sample_rate_hz)
            .await
            .context("Failed to reach the approach start")?;

        let mut z = cfg.z_start_v;
        while z <= cfg.z_max_v {
            ctx.check()?;
            self.piezos
                .sweep_to(&cfg.z_axis, z, cfg.sample_rate_hz)
                .await?;
            let c = self.capacitance.read().await.context("Capacitance read failed")?;
            self.z_voltages.push(z);
            self.capacitances.push(c);
            debug!("Touchdown step z = {z:.2} V, C = {c:.4}");

            if let Some(td) = self.analyze()? {
                info!("Touchdown at z = {td:.2} V");
                self.touchdown_v = Some(td);
                break;
            }
            z += cfg.step_v;
        }

        // Retract before reporting either outcome.
        self.piezos
            .sweep_to(&cfg.z_axis, 0.0, cfg.sample_rate_hz)
            .await
            .context("Failed to retract the z piezo")?;

        if self.touchdown_v.is_none() {
            return Err(anyhow!(
                "No touchdown detected up to z = {} V",
                cfg.z_max_v
            ));
        }
        Ok(())
    }

    fn document(&self) -> Document {
        let mut doc = Document::new("Touchdown");
        doc.set_str("z_axis", &self.config.z_axis);
        doc.set_f64("z_start_v", self.config.z_start_v);
        doc.set_f64("z_max_v", self.config.z_max_v);
        doc.set_f64("step_v", self.config.step_v);
        doc.set_f64("threshold", self.config.threshold);
        doc.set_int("baseline_points", self.config.baseline_points as i64);
        doc.set_int("confirm_points", self.config.confirm_points as i64);
        doc.set_array1("z_voltages", &self.z_voltages);
        doc.set_array1("capacitances", &self.capacitances);
        doc.set_opt_f64("touchdown_v", self.touchdown_v);
        doc
    }

    fn restore(&mut self, doc: &Document) -> Result<()> {
        self.config.threshold = doc.f64("threshold").context("missing threshold")?;
        self.z_voltages = doc
            .array1("z_voltages")
            .context("missing z_voltages")?
            .to_vec();
        self.capacitances = doc
            .array1("capacitances")
            .context("missing capacitances")?
            .to_vec();
        self.touchdown_v = doc.f64("touchdown_v");
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Err(e) = self
            .piezos
            .sweep_to(&self.config.z_axis, 0.0, self.config.sample_rate_hz)
            .await
        {
            warn!("Failed to retract z piezo during cleanup: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::daq::{DaqBackend, MockDaq};
    use crate::instrument::piezos::PiezoAxis;
    use std::collections::BTreeMap;

    /// Capacitance bridge simulator: flat baseline below the contact voltage,
    /// steep linear rise above it. Reads the z piezo voltage off the mock DAQ.
    struct CapSim {
        daq: Arc<MockDaq>,
        gain: f64,
        contact_v: f64,
    }

    #[async_trait]
    impl Readable for CapSim {
        async fn read(&self) -> Result<f64> {
            let z = self.daq.output("ao2").await? * self.gain;
            Ok(if z < self.contact_v {
                1.0 + 1e-4 * z
            } else {
                1.0 + 1e-4 * z + 0.1 * (z - self.contact_v)
            })
        }
    }

    fn rig(contact_v: f64) -> (Arc<Piezos>, Arc<CapSim>) {
        let daq = Arc::new(MockDaq::new());
        let mut axes = BTreeMap::new();
        axes.insert(
            "z".to_string(),
            PiezoAxis {
                out_channel: "ao2".to_string(),
                gain: 15.0,
                v_max: 120.0,
                bipolar: false,
            },
        );
        let piezos = Arc::new(Piezos::new(daq.clone(), axes).with_step(1.0));
        let cap = Arc::new(CapSim {
            daq,
            gain: 15.0,
            contact_v,
        });
        (piezos, cap)
    }

    #[tokio::test]
    async fn finds_the_contact_voltage() {
        let (piezos, cap) = rig(42.0);
        let mut td = Touchdown::new(piezos.clone(), cap, TouchdownConfig::default());
        td.run(&RunContext::new()).await.unwrap();

        let found = td.touchdown_v.unwrap();
        assert!((found - 42.0).abs() < 1.5, "touchdown at {found}");
        // The stage is retracted after the run.
        assert_eq!(piezos.voltage("z").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn no_contact_is_an_error_and_still_retracts() {
        let (piezos, cap) = rig(1e9);
        let cfg = TouchdownConfig {
            z_max_v: 50.0,
            ..TouchdownConfig::default()
        };
        let mut td = Touchdown::new(piezos.clone(), cap, cfg);
        assert!(td.run(&RunContext::new()).await.is_err());
        assert_eq!(piezos.voltage("z").await.unwrap(), 0.0);
        assert!(!td.z_voltages.is_empty());
    }

    #[tokio::test]
    async fn abort_mid_approach_leaves_partial_trace() {
        let (piezos, cap) = rig(80.0);
        let ctx = RunContext::new();
        ctx.request_abort();
        let mut td = Touchdown::new(piezos, cap, TouchdownConfig::default());
        assert!(td.run(&ctx).await.is_err());
        assert!(td.touchdown_v.is_none());
    }

    #[test]
    fn linear_fit_recovers_a_line() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.0, 5.0, 7.0];
        let (slope, intercept) = linear_fit(&x, &y).unwrap();
        assert!((slope - 2.0).abs() < 1e-12);
        assert!((intercept - 1.0).abs() < 1e-12);
    }

    #[test]
    fn analyze_ignores_short_traces() {
        let (piezos, cap) = rig(10.0);
        let td = Touchdown::new(piezos, cap, TouchdownConfig::default());
        assert_eq!(td.analyze().unwrap(), None);
    }
}
