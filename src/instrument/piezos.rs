//! Piezo scanner stage driven through DAQ analog outputs.
//!
//! Each axis is a DAQ output channel run through a high-voltage amplifier with
//! a fixed gain. All motion goes through `sweep`: a linearly interpolated,
//! simultaneous multi-axis ramp that is validated against the per-axis voltage
//! limit *before* anything is sent to hardware (`check_lim`). Jumping a piezo
//! instead of ramping it can crash the scanner into the sample.

use crate::instrument::daq::{DaqBackend, SendReceive};
use crate::measurement::grid::linspace;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One piezo axis: DAQ channel, amplifier gain, and safe voltage range.
#[derive(Debug, Clone)]
pub struct PiezoAxis {
    /// DAQ analog output channel driving this axis.
    pub out_channel: String,
    /// High-voltage amplifier gain (piezo volts per DAQ volt).
    pub gain: f64,
    /// Maximum piezo voltage magnitude.
    pub v_max: f64,
    /// Whether the piezo may be driven negative.
    pub bipolar: bool,
}

/// Result of a piezo sweep.
#[derive(Debug, Clone)]
pub struct SweepResult {
    /// Commanded piezo-voltage waveforms, per axis label.
    pub outputs: BTreeMap<String, Vec<f64>>,
    /// Sampled DAQ inputs recorded during the ramp.
    pub received: BTreeMap<String, Vec<f64>>,
    pub sample_rate_hz: f64,
}

/// The scanner stage: named axes on one DAQ card.
pub struct Piezos {
    daq: Arc<dyn DaqBackend>,
    axes: BTreeMap<String, PiezoAxis>,
    /// Maximum piezo-voltage change per sample during a sweep.
    step_v: f64,
}

impl Piezos {
    pub fn new(daq: Arc<dyn DaqBackend>, axes: BTreeMap<String, PiezoAxis>) -> Self {
        Self {
            daq,
            axes,
            step_v: 0.05,
        }
    }

    /// Override the per-sample voltage step used to size ramps.
    pub fn with_step(mut self, step_v: f64) -> Self {
        self.step_v = step_v;
        self
    }

    pub fn axis(&self, label: &str) -> Result<&PiezoAxis> {
        self.axes
            .get(label)
            .ok_or_else(|| anyhow!("Unknown piezo axis '{label}'"))
    }

    pub fn axis_labels(&self) -> Vec<String> {
        self.axes.keys().cloned().collect()
    }

    /// Current piezo voltage of one axis.
    pub async fn voltage(&self, label: &str) -> Result<f64> {
        let axis = self.axis(label)?;
        Ok(self.daq.output(&axis.out_channel).await? * axis.gain)
    }

    /// Validate a piezo-voltage waveform against an axis' limits.
    ///
    /// Called before every ramp; nothing reaches the DAQ if any sample is out
    /// of range.
    pub fn check_lim(&self, label: &str, waveform: &[f64]) -> Result<()> {
        let axis = self.axis(label)?;
        for &v in waveform {
            if v.abs() > axis.v_max {
                return Err(crate::error::LabError::safety(
                    format!("piezo {label} Vmax"),
                    v,
                    axis.v_max,
                )
                .into());
            }
            if !axis.bipolar && v < 0.0 {
                return Err(crate::error::LabError::safety(
                    format!("piezo {label} unipolar"),
                    v,
                    0.0,
                )
                .into());
            }
        }
        Ok(())
    }

    /// Ramp one or more axes to new piezo voltages, simultaneously and
    /// linearly, recording `inputs` along the way.
    ///
    /// The ramp length is sized so no axis moves more than `step_v` per
    /// sample; every axis gets the same number of points so the motion stays
    /// collinear in voltage space.
    pub async fn sweep(
        &self,
        targets: &BTreeMap<String, f64>,
        inputs: &[String],
        sample_rate_hz: f64,
    ) -> Result<SweepResult> {
        if targets.is_empty() {
            return Err(anyhow!("sweep requires at least one target axis"));
        }

        let mut current = BTreeMap::new();
        for label in targets.keys() {
            current.insert(label.clone(), self.voltage(label).await?);
        }

        let max_delta = targets
            .iter()
            .map(|(label, &target)| (target - current[label]).abs())
            .fold(0.0, f64::max);
        let npoints = ((max_delta / self.step_v).ceil() as usize).max(1) + 1;

        let mut piezo_waves = BTreeMap::new();
        let mut daq_waves = BTreeMap::new();
        for (label, &target) in targets {
            let axis = self.axis(label)?;
            let wave = linspace(current[label], target, npoints);
            self.check_lim(label, &wave)?;
            daq_waves.insert(
                axis.out_channel.clone(),
                wave.iter().map(|v| v / axis.gain).collect(),
            );
            piezo_waves.insert(label.clone(), wave);
        }

        let SendReceive {
            received,
            sample_rate_hz,
        } = self
            .daq
            .send_receive(&daq_waves, inputs, sample_rate_hz)
            .await?;

        Ok(SweepResult {
            outputs: piezo_waves,
            received,
            sample_rate_hz,
        })
    }

    /// Play explicit piezo-voltage waveforms (equal length, one per axis),
    /// recording `inputs` along the way. Used by scans whose trajectories are
    /// not straight lines in voltage space; every waveform still goes through
    /// `check_lim` first.
    pub async fn sweep_waveforms(
        &self,
        waveforms: &BTreeMap<String, Vec<f64>>,
        inputs: &[String],
        sample_rate_hz: f64,
    ) -> Result<SweepResult> {
        if waveforms.is_empty() {
            return Err(anyhow!("sweep_waveforms requires at least one axis"));
        }
        let mut daq_waves = BTreeMap::new();
        for (label, wave) in waveforms {
            let axis = self.axis(label)?;
            self.check_lim(label, wave)?;
            daq_waves.insert(
                axis.out_channel.clone(),
                wave.iter().map(|v| v / axis.gain).collect(),
            );
        }

        let SendReceive {
            received,
            sample_rate_hz,
        } = self
            .daq
            .send_receive(&daq_waves, inputs, sample_rate_hz)
            .await?;

        Ok(SweepResult {
            outputs: waveforms.clone(),
            received,
            sample_rate_hz,
        })
    }

    /// Ramp a single axis, recording nothing.
    pub async fn sweep_to(&self, label: &str, target_v: f64, sample_rate_hz: f64) -> Result<()> {
        let mut targets = BTreeMap::new();
        targets.insert(label.to_string(), target_v);
        self.sweep(&targets, &[], sample_rate_hz).await.map(|_| ())
    }

    /// Ramp every axis back to zero volts. The safe parking state, and the
    /// cleanup path procedures use on abort.
    pub async fn zero(&self, sample_rate_hz: f64) -> Result<()> {
        let targets: BTreeMap<String, f64> =
            self.axes.keys().map(|label| (label.clone(), 0.0)).collect();
        self.sweep(&targets, &[], sample_rate_hz).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LabError;
    use crate::instrument::daq::MockDaq;

    fn scanner() -> Piezos {
        let mut axes = BTreeMap::new();
        for (label, channel) in [("x", "ao0"), ("y", "ao1")] {
            axes.insert(
                label.to_string(),
                PiezoAxis {
                    out_channel: channel.to_string(),
                    gain: 15.0,
                    v_max: 120.0,
                    bipolar: true,
                },
            );
        }
        axes.insert(
            "z".to_string(),
            PiezoAxis {
                out_channel: "ao2".to_string(),
                gain: 15.0,
                v_max: 120.0,
                bipolar: false,
            },
        );
        Piezos::new(Arc::new(MockDaq::new()), axes).with_step(1.0)
    }

    #[test]
    fn check_lim_rejects_over_vmax() {
        let p = scanner();
        let err = p.check_lim("x", &[0.0, 60.0, 121.0]).unwrap_err();
        assert!(matches!(
            err.downcast::<LabError>().unwrap(),
            LabError::SafetyLimit { .. }
        ));
    }

    #[test]
    fn check_lim_rejects_negative_on_unipolar_axis() {
        let p = scanner();
        assert!(p.check_lim("z", &[-1.0]).is_err());
        assert!(p.check_lim("x", &[-1.0]).is_ok());
    }

    #[tokio::test]
    async fn sweep_produces_endpoint_inclusive_ramps() {
        let p = scanner();
        let mut targets = BTreeMap::new();
        targets.insert("x".to_string(), 10.0);
        targets.insert("y".to_string(), -5.0);
        let result = p.sweep(&targets, &[], 1000.0).await.unwrap();

        let x = &result.outputs["x"];
        let y = &result.outputs["y"];
        assert_eq!(x.len(), y.len());
        assert_eq!(x.len(), 11); // 10 V at 1 V/sample
        assert_eq!(*x.first().unwrap(), 0.0);
        assert_eq!(*x.last().unwrap(), 10.0);
        assert_eq!(*y.last().unwrap(), -5.0);
        // Linear: constant increments.
        let dx = x[1] - x[0];
        assert!(x.windows(2).all(|w| (w[1] - w[0] - dx).abs() < 1e-12));
    }

    #[tokio::test]
    async fn sweep_moves_the_daq_in_amplifier_units() {
        let p = scanner();
        p.sweep_to("x", 30.0, 1000.0).await.unwrap();
        assert_eq!(p.voltage("x").await.unwrap(), 30.0);
    }

    #[tokio::test]
    async fn zero_parks_all_axes() {
        let p = scanner();
        p.sweep_to("x", 30.0, 1000.0).await.unwrap();
        p.sweep_to("y", -12.0, 1000.0).await.unwrap();
        p.zero(1000.0).await.unwrap();
        assert_eq!(p.voltage("x").await.unwrap(), 0.0);
        assert_eq!(p.voltage("y").await.unwrap(), 0.0);
        assert_eq!(p.voltage("z").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn sweep_refuses_out_of_range_target_before_moving() {
        let p = scanner();
        let mut targets = BTreeMap::new();
        targets.insert("x".to_string(), 130.0);
        assert!(p.sweep(&targets, &[], 1000.0).await.is_err());
        assert_eq!(p.voltage("x").await.unwrap(), 0.0);
    }
}
