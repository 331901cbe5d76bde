//! SQUID I-V characteristic.
//!
//! Bias current is sourced through a bias resistor from a DAQ analog output;
//! the SQUID voltage comes back through a preamp into an analog input. An
//! optional modulation coil (its own output and resistor) is stepped through
//! a list of currents, giving a family of I-V traces.

use crate::instrument::daq::DaqBackend;
use crate::measurement::grid::linspace;
use crate::measurement::{Procedure, RunContext};
use crate::save::Document;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SquidIvConfig {
    /// DAQ output sourcing the bias current.
    pub bias_channel: String,
    /// DAQ output for the modulation coil, if any.
    pub mod_channel: Option<String>,
    /// DAQ input reading the amplified SQUID voltage.
    pub input_channel: String,
    /// Bias resistor converting output volts to bias amps.
    pub r_bias_ohm: f64,
    /// Modulation-coil resistor.
    pub r_mod_ohm: f64,
    /// Preamp gain dividing the measured voltage.
    pub preamp_gain: f64,
    /// Bias sweep endpoint; the sweep runs `-i_max_a .. +i_max_a`.
    pub i_max_a: f64,
    pub npoints: usize,
    /// Modulation currents for the outer loop. Empty means one trace at zero
    /// modulation.
    pub mod_currents_a: Vec<f64>,
    pub sample_rate_hz: f64,
}

impl Default for SquidIvConfig {
    fn default() -> Self {
        Self {
            bias_channel: "ao0".to_string(),
            mod_channel: None,
            input_channel: "ai0".to_string(),
            r_bias_ohm: 2000.0,
            r_mod_ohm: 2000.0,
            preamp_gain: 500.0,
            i_max_a: 100e-6,
            npoints: 201,
            mod_currents_a: Vec::new(),
            sample_rate_hz: 1000.0,
        }
    }
}

/// The I-V procedure and its acquired data.
pub struct SquidIv {
    daq: Arc<dyn DaqBackend>,
    pub config: SquidIvConfig,
    /// Bias sweep axis, in amps.
    pub bias_currents: Vec<f64>,
    /// Modulation currents actually used (one entry per trace).
    pub mod_currents: Vec<f64>,
    /// SQUID voltage traces, one row per modulation current.
    pub voltages: Vec<Vec<f64>>,
}

impl SquidIv {
    pub fn new(daq: Arc<dyn DaqBackend>, config: SquidIvConfig) -> Self {
        Self {
            daq,
            config,
            bias_currents: Vec::new(),
            mod_currents: Vec::new(),
            voltages: Vec::new(),
        }
    }

    async fn park_outputs(&self) -> Result<()> {
        self.daq.write_output(&self.config.bias_channel, 0.0).await?;
        if let Some(ch) = &self.config.mod_channel {
            self.daq.write_output(ch, 0.0).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Procedure for SquidIv {
    fn name(&self) -> &str {
        "squid_iv"
    }

    async fn run(&mut self, ctx: &RunContext) -> Result<()> {
        let cfg = &self.config;
        if cfg.npoints < 2 {
            return Err(anyhow!("I-V sweep needs at least 2 points"));
        }
        if cfg.preamp_gain <= 0.0 || cfg.r_bias_ohm <= 0.0 {
            return Err(anyhow!("Preamp gain and bias resistor must be positive"));
        }

        self.bias_currents = linspace(-cfg.i_max_a, cfg.i_max_a, cfg.npoints);
        self.mod_currents = if cfg.mod_currents_a.is_empty() {
            vec![0.0]
        } else {
            cfg.mod_currents_a.clone()
        };
        self.voltages.clear();

        let bias_wave: Vec<f64> = self
            .bias_currents
            .iter()
            .map(|i| i * cfg.r_bias_ohm)
            .collect();

        for &i_mod in &self.mod_currents.clone() {
            ctx.check()?;
            if let Some(ch) = &self.config.mod_channel {
                self.daq
                    .write_output(ch, i_mod * self.config.r_mod_ohm)
                    .await
                    .context("Failed to set modulation current")?;
            }
            debug!("I-V trace at I_mod = {:.3e} A", i_mod);

            let mut outputs = BTreeMap::new();
            outputs.insert(self.config.bias_channel.clone(), bias_wave.clone());
            let result = self
                .daq
                .send_receive(
                    &outputs,
                    &[self.config.input_channel.clone()],
                    self.config.sample_rate_hz,
                )
                .await
                .context("Bias sweep failed")?;

            let raw = result
                .received
                .get(&self.config.input_channel)
                .ok_or_else(|| anyhow!("DAQ returned no data for the input channel"))?;
            self.voltages
                .push(raw.iter().map(|v| v / self.config.preamp_gain).collect());
        }

        self.park_outputs().await
    }

    fn document(&self) -> Document {
        let mut doc = Document::new("SquidIv");
        doc.set_str("bias_channel", &self.config.bias_channel);
        doc.set_str("input_channel", &self.config.input_channel);
        match &self.config.mod_channel {
            Some(ch) => doc.set_str("mod_channel", ch),
            None => doc.set("mod_channel", crate::save::DocNode::Null),
        }
        doc.set_f64("r_bias_ohm", self.config.r_bias_ohm);
        doc.set_f64("r_mod_ohm", self.config.r_mod_ohm);
        doc.set_f64("preamp_gain", self.config.preamp_gain);
        doc.set_f64("i_max_a", self.config.i_max_a);
        doc.set_int("npoints", self.config.npoints as i64);
        doc.set_f64("sample_rate_hz", self.config.sample_rate_hz);
        doc.set_array1("bias_currents", &self.bias_currents);
        doc.set_array1("mod_currents", &self.mod_currents);
        doc.set_array2("voltages", &self.voltages);
        doc
    }

    fn restore(&mut self, doc: &Document) -> Result<()> {
        self.config.r_bias_ohm = doc.f64("r_bias_ohm").context("missing r_bias_ohm")?;
        self.config.preamp_gain = doc.f64("preamp_gain").context("missing preamp_gain")?;
        self.bias_currents = doc
            .array1("bias_currents")
            .context("missing bias_currents")?
            .to_vec();
        self.mod_currents = doc
            .array1("mod_currents")
            .context("missing mod_currents")?
            .to_vec();
        self.voltages = doc.array2("voltages").context("missing voltages")?.to_vec();
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Err(e) = self.park_outputs().await {
            log::warn!("Failed to zero SQUID bias outputs: {e:#}");
        }
    }
}
