//! DAQ card abstraction (NI-style analog I/O).
//!
//! Real NI hardware is driver-bound and OS-specific, so the card sits behind
//! the `DaqBackend` trait: named analog output/input channels, single-point
//! access, and a synchronized `send_receive` that plays output waveforms while
//! sampling inputs at the same rate. Procedures only see the trait; tests and
//! hardware-free development use [`MockDaq`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Analog output range of the card, in volts.
pub const OUTPUT_LIMIT_V: f64 = 10.0;

/// Result of a synchronized output/input operation.
#[derive(Debug, Clone)]
pub struct SendReceive {
    /// Sampled input waveforms, one per requested input channel.
    pub received: BTreeMap<String, Vec<f64>>,
    pub sample_rate_hz: f64,
}

/// Validate a single output sample against the card's range.
pub fn check_output_range(channel: &str, volts: f64) -> Result<()> {
    if volts.abs() > OUTPUT_LIMIT_V {
        return Err(crate::error::LabError::safety(
            format!("DAQ output {channel}"),
            volts,
            OUTPUT_LIMIT_V,
        )
        .into());
    }
    Ok(())
}

/// Trait for DAQ hardware backends.
///
/// # Contract
/// - Output writes are validated against [`OUTPUT_LIMIT_V`] before touching
///   hardware
/// - `send_receive` requires all output waveforms to have equal length; the
///   received waveforms have that same length
/// - `output` returns the last written value of an output channel (cards hold
///   their output between writes)
#[async_trait]
pub trait DaqBackend: Send + Sync {
    fn name(&self) -> String;

    /// Set one analog output channel.
    async fn write_output(&self, channel: &str, volts: f64) -> Result<()>;

    /// Last written value of an analog output channel.
    async fn output(&self, channel: &str) -> Result<f64>;

    /// Single-point read of an analog input channel.
    async fn read_input(&self, channel: &str) -> Result<f64>;

    /// Play output waveforms while sampling inputs at the same clock.
    async fn send_receive(
        &self,
        outputs: &BTreeMap<String, Vec<f64>>,
        inputs: &[String],
        sample_rate_hz: f64,
    ) -> Result<SendReceive>;

    /// Sample one input channel for `npoints` at `sample_rate_hz`.
    async fn read_waveform(
        &self,
        channel: &str,
        npoints: usize,
        sample_rate_hz: f64,
    ) -> Result<Vec<f64>>;
}

type Transfer = dyn Fn(&HashMap<String, f64>, &str) -> f64 + Send + Sync;

/// Software stand-in for a DAQ card.
///
/// Inputs are computed from the current output state through a configurable
/// transfer function, so procedures see physically plausible responses;
/// `read_waveform` returns an optional test tone plus noise.
pub struct MockDaq {
    outputs: Mutex<HashMap<String, f64>>,
    transfer: Box<Transfer>,
    tone: Option<(f64, f64)>,
    noise_amplitude: f64,
}

impl Default for MockDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDaq {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            // Default: every input sees an attenuated sum of the outputs.
            transfer: Box::new(|outputs, _| outputs.values().sum::<f64>() * 0.1),
            tone: None,
            noise_amplitude: 0.0,
        }
    }

    /// Replace the output-to-input transfer function.
    pub fn with_transfer<F>(mut self, transfer: F) -> Self
    where
        F: Fn(&HashMap<String, f64>, &str) -> f64 + Send + Sync + 'static,
    {
        self.transfer = Box::new(transfer);
        self
    }

    /// Inject a sine tone (frequency in Hz, amplitude in volts) into
    /// `read_waveform`.
    pub fn with_tone(mut self, frequency_hz: f64, amplitude_v: f64) -> Self {
        self.tone = Some((frequency_hz, amplitude_v));
        self
    }

    pub fn with_noise(mut self, amplitude_v: f64) -> Self {
        self.noise_amplitude = amplitude_v;
        self
    }

    fn state(&self) -> HashMap<String, f64> {
        self.outputs.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DaqBackend for MockDaq {
    fn name(&self) -> String {
        "mock_daq".to_string()
    }

    async fn write_output(&self, channel: &str, volts: f64) -> Result<()> {
        check_output_range(channel, volts)?;
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.insert(channel.to_string(), volts);
        }
        Ok(())
    }

    async fn output(&self, channel: &str) -> Result<f64> {
        Ok(*self.state().get(channel).unwrap_or(&0.0))
    }

    async fn read_input(&self, channel: &str) -> Result<f64> {
        Ok((self.transfer)(&self.state(), channel))
    }

    async fn send_receive(
        &self,
        outputs: &BTreeMap<String, Vec<f64>>,
        inputs: &[String],
        sample_rate_hz: f64,
    ) -> Result<SendReceive> {
        if sample_rate_hz <= 0.0 {
            return Err(anyhow!("Sample rate must be positive"));
        }
        let npoints = outputs
            .values()
            .next()
            .map(Vec::len)
            .ok_or_else(|| anyhow!("send_receive requires at least one output waveform"))?;
        if outputs.values().any(|w| w.len() != npoints) {
            return Err(anyhow!("All output waveforms must have equal length"));
        }
        for (channel, waveform) in outputs {
            for &v in waveform {
                check_output_range(channel, v)?;
            }
        }

        let mut received: BTreeMap<String, Vec<f64>> = inputs
            .iter()
            .map(|ch| (ch.clone(), Vec::with_capacity(npoints)))
            .collect();

        for i in 0..npoints {
            {
                let mut state = self
                    .outputs
                    .lock()
                    .map_err(|_| anyhow!("mock output state poisoned"))?;
                for (channel, waveform) in outputs {
                    state.insert(channel.clone(), waveform[i]);
                }
            }
            let state = self.state();
            for channel in inputs {
                received
                    .get_mut(channel)
                    .map(|w| w.push((self.transfer)(&state, channel)));
            }
        }

        Ok(SendReceive {
            received,
            sample_rate_hz,
        })
    }

    async fn read_waveform(
        &self,
        channel: &str,
        npoints: usize,
        sample_rate_hz: f64,
    ) -> Result<Vec<f64>> {
        if sample_rate_hz <= 0.0 {
            return Err(anyhow!("Sample rate must be positive"));
        }
        let state = self.state();
        let base = (self.transfer)(&state, channel);
        let mut rng = rand::thread_rng();
        Ok((0..npoints)
            .map(|i| {
                let t = i as f64 / sample_rate_hz;
                let tone = self
                    .tone
                    .map(|(f, a)| a * (2.0 * std::f64::consts::PI * f * t).sin())
                    .unwrap_or(0.0);
                let noise = if self.noise_amplitude > 0.0 {
                    rng.gen_range(-self.noise_amplitude..self.noise_amplitude)
                } else {
                    0.0
                };
                base + tone + noise
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LabError;

    #[tokio::test]
    async fn outputs_hold_their_value() {
        let daq = MockDaq::new();
        daq.write_output("ao0", 1.5).await.unwrap();
        assert_eq!(daq.output("ao0").await.unwrap(), 1.5);
        assert_eq!(daq.output("ao1").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn output_range_enforced() {
        let daq = MockDaq::new();
        let err = daq.write_output("ao0", 11.0).await.unwrap_err();
        assert!(matches!(
            err.downcast::<LabError>().unwrap(),
            LabError::SafetyLimit { .. }
        ));
    }

    #[tokio::test]
    async fn send_receive_shapes_and_transfer() {
        let daq = MockDaq::new().with_transfer(|outputs, _| outputs.get("ao0").copied().unwrap_or(0.0) * 2.0);
        let mut outputs = BTreeMap::new();
        outputs.insert("ao0".to_string(), vec![0.0, 0.5, 1.0]);
        let result = daq
            .send_receive(&outputs, &["ai0".to_string()], 1000.0)
            .await
            .unwrap();
        assert_eq!(result.received["ai0"], vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn send_receive_rejects_ragged_waveforms() {
        let daq = MockDaq::new();
        let mut outputs = BTreeMap::new();
        outputs.insert("ao0".to_string(), vec![0.0, 0.5]);
        outputs.insert("ao1".to_string(), vec![0.0]);
        assert!(daq
            .send_receive(&outputs, &["ai0".to_string()], 1000.0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn waveform_carries_the_tone() {
        let daq = MockDaq::new().with_tone(100.0, 1.0);
        let wave = daq.read_waveform("ai0", 8, 800.0).await.unwrap();
        assert_eq!(wave.len(), 8);
        // 100 Hz sampled at 800 Hz: second sample sits at sin(pi/4).
        assert!((wave[1] - (std::f64::consts::PI / 4.0).sin()).abs() < 1e-12);
    }
}
