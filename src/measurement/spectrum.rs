//! DAQ noise spectrum via Welch's method.
//!
//! Acquires a long time trace from one DAQ input, splits it into Hann-windowed
//! overlapping segments, FFTs each, and averages the one-sided power spectral
//! densities. Units are V^2/Hz; [`WelchPsd::asd`] gives the usual V/sqrt(Hz)
//! amplitude spectral density.

use crate::instrument::daq::DaqBackend;
use crate::measurement::{Procedure, RunContext};
use crate::save::Document;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::info;
use num_complex::Complex;
use rustfft::FftPlanner;
use std::sync::Arc;

/// One-sided Welch PSD estimator.
pub struct WelchPsd {
    window_size: usize,
    overlap: usize,
    sample_rate_hz: f64,
    hann: Vec<f64>,
}

impl WelchPsd {
    pub fn new(window_size: usize, overlap: usize, sample_rate_hz: f64) -> Result<Self> {
        if window_size < 2 || overlap >= window_size || sample_rate_hz <= 0.0 {
            return Err(anyhow!("Invalid Welch parameters"));
        }
        let hann = (0..window_size)
            .map(|i| {
                0.5 * (1.0
                    - (2.0 * std::f64::consts::PI * i as f64 / (window_size - 1) as f64).cos())
            })
            .collect();
        Ok(Self {
            window_size,
            overlap,
            sample_rate_hz,
            hann,
        })
    }

    /// Frequency axis of the one-sided spectrum, DC to Nyquist-adjacent.
    pub fn frequencies(&self) -> Vec<f64> {
        let df = self.sample_rate_hz / self.window_size as f64;
        (0..self.window_size / 2).map(|i| i as f64 * df).collect()
    }

    /// Averaged one-sided PSD of `samples`, in V^2/Hz.
    ///
    /// `psd[k] = 2 |X_k|^2 / (fs * sum(w^2))`, averaged over segments; the DC
    /// bin skips the factor of two.
    pub fn psd(&self, samples: &[f64]) -> Result<Vec<f64>> {
        if samples.len() < self.window_size {
            return Err(anyhow!(
                "Need at least {} samples, got {}",
                self.window_size,
                samples.len()
            ));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(self.window_size);
        let window_power: f64 = self.hann.iter().map(|w| w * w).sum();
        let scale = 1.0 / (self.sample_rate_hz * window_power);
        let num_bins = self.window_size / 2;
        let step = self.window_size - self.overlap;

        let mut accum = vec![0.0; num_bins];
        let mut segments = 0usize;
        let mut start = 0;
        while start + self.window_size <= samples.len() {
            let mut buffer: Vec<Complex<f64>> = samples[start..start + self.window_size]
                .iter()
                .zip(&self.hann)
                .map(|(&v, &w)| Complex::new(v * w, 0.0))
                .collect();
            fft.process(&mut buffer);

            for (i, acc) in accum.iter_mut().enumerate() {
                let power = buffer[i].norm_sqr() * scale;
                *acc += if i == 0 { power } else { 2.0 * power };
            }
            segments += 1;
            start += step;
        }

        for acc in &mut accum {
            *acc /= segments as f64;
        }
        Ok(accum)
    }

    /// Amplitude spectral density, V/sqrt(Hz).
    pub fn asd(psd: &[f64]) -> Vec<f64> {
        psd.iter().map(|p| p.sqrt()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct DaqSpectrumConfig {
    pub input_channel: String,
    pub sample_rate_hz: f64,
    /// Total samples to acquire.
    pub total_samples: usize,
    /// FFT segment length; a power of two keeps the FFT fast.
    pub window_size: usize,
    /// Samples shared between consecutive segments.
    pub overlap: usize,
}

impl Default for DaqSpectrumConfig {
    fn default() -> Self {
        Self {
            input_channel: "ai0".to_string(),
            sample_rate_hz: 10_000.0,
            total_samples: 65_536,
            window_size: 4096,
            overlap: 2048,
        }
    }
}

/// Noise spectrum of one DAQ input channel.
pub struct DaqSpectrum {
    daq: Arc<dyn DaqBackend>,
    pub config: DaqSpectrumConfig,
    /// Raw time trace.
    pub timetrace: Vec<f64>,
    /// One-sided frequency axis.
    pub frequencies: Vec<f64>,
    /// Averaged PSD, V^2/Hz.
    pub psd: Vec<f64>,
}

impl DaqSpectrum {
    pub fn new(daq: Arc<dyn DaqBackend>, config: DaqSpectrumConfig) -> Self {
        Self {
            daq,
            config,
            timetrace: Vec::new(),
            frequencies: Vec::new(),
            psd: Vec::new(),
        }
    }
}

#[async_trait]
impl Procedure for DaqSpectrum {
    fn name(&self) -> &str {
        "daq_spectrum"
    }

    async fn run(&mut self, ctx: &RunContext) -> Result<()> {
        let cfg = self.config.clone();
        let welch = WelchPsd::new(cfg.window_size, cfg.overlap, cfg.sample_rate_hz)?;
        if cfg.total_samples < cfg.window_size {
            return Err(anyhow!("total_samples must cover at least one window"));
        }

        // Acquire in window-sized chunks so aborts land between DAQ reads.
        self.timetrace.clear();
        while self.timetrace.len() < cfg.total_samples {
            ctx.check()?;
            let want = cfg.window_size.min(cfg.total_samples - self.timetrace.len());
            let chunk = self
                .daq
                .read_waveform(&cfg.input_channel, want, cfg.sample_rate_hz)
                .await
                .context("DAQ waveform read failed")?;
            self.timetrace.extend(chunk);
        }

        self.frequencies = welch.frequencies();
        self.psd = welch.psd(&self.timetrace)?;
        info!(
            "Spectrum: {} samples, {} bins to {:.0} Hz",
            self.timetrace.len(),
            self.psd.len(),
            self.frequencies.last().copied().unwrap_or(0.0)
        );
        Ok(())
    }

    fn document(&self) -> Document {
        let mut doc = Document::new("DaqSpectrum");
        doc.set_str("input_channel", &self.config.input_channel);
        doc.set_f64("sample_rate_hz", self.config.sample_rate_hz);
        doc.set_int("total_samples", self.config.total_samples as i64);
        doc.set_int("window_size", self.config.window_size as i64);
        doc.set_int("overlap", self.config.overlap as i64);
        doc.set_array1("timetrace", &self.timetrace);
        doc.set_array1("frequencies", &self.frequencies);
        doc.set_array1("psd", &self.psd);
        doc
    }

    fn restore(&mut self, doc: &Document) -> Result<()> {
        self.config.sample_rate_hz = doc.f64("sample_rate_hz").context("missing sample_rate_hz")?;
        self.timetrace = doc.array1("timetrace").context("missing timetrace")?.to_vec();
        self.frequencies = doc
            .array1("frequencies")
            .context("missing frequencies")?
            .to_vec();
        self.psd = doc.array1("psd").context("missing psd")?.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::daq::MockDaq;

    #[test]
    fn psd_peak_lands_on_the_tone_frequency() {
        let fs = 1024.0;
        let welch = WelchPsd::new(256, 128, fs).unwrap();
        let tone = 128.0; // bin 32 exactly
        let samples: Vec<f64> = (0..2048)
            .map(|i| (2.0 * std::f64::consts::PI * tone * i as f64 / fs).sin())
            .collect();

        let psd = welch.psd(&samples).unwrap();
        let freqs = welch.frequencies();
        let peak = psd
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(freqs[peak], tone);
    }

    #[test]
    fn psd_integrates_to_the_signal_power() {
        // Parseval: integrating the one-sided PSD recovers the mean square of
        // a sine, A^2/2.
        let fs = 1024.0;
        let welch = WelchPsd::new(512, 0, fs).unwrap();
        let amplitude = 0.5;
        let samples: Vec<f64> = (0..4096)
            .map(|i| amplitude * (2.0 * std::f64::consts::PI * 64.0 * i as f64 / fs).sin())
            .collect();

        let psd = welch.psd(&samples).unwrap();
        let df = fs / 512.0;
        let power: f64 = psd.iter().map(|p| p * df).sum();
        assert!((power - amplitude * amplitude / 2.0).abs() < 0.01);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(WelchPsd::new(0, 0, 1000.0).is_err());
        assert!(WelchPsd::new(256, 256, 1000.0).is_err());
        assert!(WelchPsd::new(256, 0, -1.0).is_err());
    }

    #[tokio::test]
    async fn procedure_finds_the_mock_tone() {
        let daq = Arc::new(MockDaq::new().with_tone(100.0, 1.0));
        let cfg = DaqSpectrumConfig {
            sample_rate_hz: 1000.0,
            total_samples: 4096,
            window_size: 1000,
            overlap: 500,
            ..DaqSpectrumConfig::default()
        };
        let mut spec = DaqSpectrum::new(daq, cfg);
        spec.run(&RunContext::new()).await.unwrap();

        let peak = spec
            .psd
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert!((spec.frequencies[peak] - 100.0).abs() < 2.0);
        assert_eq!(spec.timetrace.len(), 4096);
    }

    #[tokio::test]
    async fn document_round_trips_the_spectrum() {
        let daq = Arc::new(MockDaq::new().with_tone(50.0, 0.1));
        let cfg = DaqSpectrumConfig {
            sample_rate_hz: 1000.0,
            total_samples: 1024,
            window_size: 256,
            overlap: 128,
            ..DaqSpectrumConfig::default()
        };
        let mut spec = DaqSpectrum::new(daq.clone(), cfg.clone());
        spec.run(&RunContext::new()).await.unwrap();
        let doc = spec.document();

        let mut fresh = DaqSpectrum::new(daq, cfg);
        fresh.restore(&doc).unwrap();
        assert_eq!(fresh.psd, spec.psd);
        assert_eq!(fresh.frequencies, spec.frequencies);
    }
}
