//! Constant-height raster scan over a fitted sample plane.
//!
//! Each scan line is acquired out-and-back: x ramps across the line while z
//! tracks `plane.offset(scan_height)`, DAQ inputs are sampled the whole way,
//! and the return half is recorded too. Lines are acquired at an upsampled
//! rate and interpolated back onto the commanded pixel grid, which also
//! deskews the descending-x return data.

use crate::instrument::piezos::Piezos;
use crate::measurement::grid::{interp1, linspace, LineDirection};
use crate::measurement::plane::Plane;
use crate::measurement::{Procedure, RunContext};
use crate::save::{DocNode, Document};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ScanplaneConfig {
    pub x_axis: String,
    pub y_axis: String,
    pub z_axis: String,
    /// Scan extents, in piezo volts.
    pub x_range_v: (f64, f64),
    pub y_range_v: (f64, f64),
    /// Pixels per line and number of lines.
    pub nx: usize,
    pub ny: usize,
    /// Height offset added to the plane; negative scans below the touchdown
    /// surface (i.e. pressed in), positive lifts off.
    pub scan_height_v: f64,
    /// Acquired samples per pixel along a line.
    pub upsample: usize,
    /// DAQ input channels recorded during lines.
    pub inputs: Vec<String>,
    pub sample_rate_hz: f64,
}

impl Default for ScanplaneConfig {
    fn default() -> Self {
        Self {
            x_axis: "x".to_string(),
            y_axis: "y".to_string(),
            z_axis: "z".to_string(),
            x_range_v: (-50.0, 50.0),
            y_range_v: (-50.0, 50.0),
            nx: 64,
            ny: 64,
            scan_height_v: 2.0,
            upsample: 10,
            inputs: vec!["ai0".to_string()],
            sample_rate_hz: 1000.0,
        }
    }
}

pub struct Scanplane {
    piezos: Arc<Piezos>,
    pub config: ScanplaneConfig,
    /// The surface being followed.
    pub plane: Plane,
    /// Commanded pixel grid.
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
    /// Per-channel images, `ny` rows of `nx` pixels, forward direction.
    pub images: BTreeMap<String, Vec<Vec<f64>>>,
    /// Same, acquired on the return half of each line.
    pub images_back: BTreeMap<String, Vec<Vec<f64>>>,
}

impl Scanplane {
    pub fn new(piezos: Arc<Piezos>, plane: Plane, config: ScanplaneConfig) -> Self {
        Self {
            piezos,
            config,
            plane,
            xs: Vec::new(),
            ys: Vec::new(),
            images: BTreeMap::new(),
            images_back: BTreeMap::new(),
        }
    }

    /// Build the x and z waveforms for one line at height `y`.
    fn line_waveforms(&self, y: f64, direction: LineDirection) -> BTreeMap<String, Vec<f64>> {
        let cfg = &self.config;
        let surface = self.plane.offset(cfg.scan_height_v);
        let n = cfg.nx * cfg.upsample;
        let (x0, x1) = match direction {
            LineDirection::Forward => (cfg.x_range_v.0, cfg.x_range_v.1),
            LineDirection::Back => (cfg.x_range_v.1, cfg.x_range_v.0),
        };
        let x_wave = linspace(x0, x1, n);
        let z_wave: Vec<f64> = x_wave.iter().map(|&x| surface.z(x, y)).collect();
        let mut waves = BTreeMap::new();
        waves.insert(cfg.x_axis.clone(), x_wave);
        waves.insert(cfg.y_axis.clone(), vec![y; n]);
        waves.insert(cfg.z_axis.clone(), z_wave);
        waves
    }

    async fn acquire_line(
        &self,
        y: f64,
        direction: LineDirection,
    ) -> Result<BTreeMap<String, Vec<f64>>> {
        let cfg = &self.config;
        let waves = self.line_waveforms(y, direction);
        let x_wave = waves[&cfg.x_axis].clone();

        let result = self
            .piezos
            .sweep_waveforms(&waves, &cfg.inputs, cfg.sample_rate_hz)
            .await
            .context("Scan line failed")?;

        // Resample each channel from the acquired x positions onto the pixel
        // grid; interp1 handles the descending x of return lines.
        let mut row = BTreeMap::new();
        for channel in &cfg.inputs {
            let raw = result
                .received
                .get(channel)
                .ok_or_else(|| anyhow!("DAQ returned no data for '{channel}'"))?;
            let resampled = interp1(&x_wave, raw, &self.xs)
                .with_context(|| format!("Resampling channel '{channel}'"))?;
            row.insert(channel.clone(), resampled);
        }
        Ok(row)
    }
}

#[async_trait]
impl Procedure for Scanplane {
    fn name(&self) -> &str {
        "scanplane"
    }

    async fn run(&mut self, ctx: &RunContext) -> Result<()> {
        let cfg = self.config.clone();
        if cfg.nx < 2 || cfg.ny < 1 || cfg.upsample == 0 {
            return Err(anyhow!("Scan needs nx >= 2, ny >= 1, upsample >= 1"));
        }
        if cfg.inputs.is_empty() {
            return Err(anyhow!("Scan needs at least one input channel"));
        }

        self.xs = linspace(cfg.x_range_v.0, cfg.x_range_v.1, cfg.nx);
        self.ys = linspace(cfg.y_range_v.0, cfg.y_range_v.1, cfg.ny);
        self.images = cfg
            .inputs
            .iter()
            .map(|ch| (ch.clone(), Vec::with_capacity(cfg.ny)))
            .collect();
        self.images_back = self.images.clone();

        let surface = self.plane.offset(cfg.scan_height_v);
        info!(
            "Scanplane: {}x{} pixels at height {:+.2} V",
            cfg.nx, cfg.ny, cfg.scan_height_v
        );

        for iy in 0..cfg.ny {
            ctx.check()?;
            let y = self.ys[iy];

            // Ramp to the line start at the correct height before acquiring.
            let mut start = BTreeMap::new();
            start.insert(cfg.x_axis.clone(), cfg.x_range_v.0);
            start.insert(cfg.y_axis.clone(), y);
            start.insert(cfg.z_axis.clone(), surface.z(cfg.x_range_v.0, y));
            self.piezos
                .sweep(&start, &[], cfg.sample_rate_hz)
                .await
                .context("Failed to reach the line start")?;

            let forward = self.acquire_line(y, LineDirection::Forward).await?;
            let back = self.acquire_line(y, LineDirection::Back).await?;
            for channel in &cfg.inputs {
                if let Some(img) = self.images.get_mut(channel) {
                    img.push(forward[channel].clone());
                }
                if let Some(img) = self.images_back.get_mut(channel) {
                    img.push(back[channel].clone());
                }
            }
        }

        self.piezos
            .zero(cfg.sample_rate_hz)
            .await
            .context("Failed to park the scanner after the scan")
    }

    fn document(&self) -> Document {
        let cfg = &self.config;
        let mut doc = Document::new("Scanplane");
        doc.set_f64("x_min_v", cfg.x_range_v.0);
        doc.set_f64("x_max_v", cfg.x_range_v.1);
        doc.set_f64("y_min_v", cfg.y_range_v.0);
        doc.set_f64("y_max_v", cfg.y_range_v.1);
        doc.set_int("nx", cfg.nx as i64);
        doc.set_int("ny", cfg.ny as i64);
        doc.set_f64("scan_height_v", cfg.scan_height_v);
        doc.set_int("upsample", cfg.upsample as i64);
        doc.set_f64("sample_rate_hz", cfg.sample_rate_hz);

        let mut plane = Document::new("Plane");
        plane.set_f64("a", self.plane.a);
        plane.set_f64("b", self.plane.b);
        plane.set_f64("c", self.plane.c);
        doc.set_object("plane", plane);

        doc.set_array1("xs", &self.xs);
        doc.set_array1("ys", &self.ys);
        let to_dict = |images: &BTreeMap<String, Vec<Vec<f64>>>| {
            DocNode::Dict(
                images
                    .iter()
                    .map(|(ch, img)| (ch.clone(), DocNode::Array2(img.clone())))
                    .collect(),
            )
        };
        doc.set("images", to_dict(&self.images));
        doc.set("images_back", to_dict(&self.images_back));
        doc
    }

    fn restore(&mut self, doc: &Document) -> Result<()> {
        let plane = doc.object("plane").context("missing plane")?;
        self.plane = Plane {
            a: plane.f64("a").context("plane missing a")?,
            b: plane.f64("b").context("plane missing b")?,
            c: plane.f64("c").context("plane missing c")?,
        };
        self.xs = doc.array1("xs").context("missing xs")?.to_vec();
        self.ys = doc.array1("ys").context("missing ys")?.to_vec();

        let from_dict = |node: Option<&DocNode>| -> Result<BTreeMap<String, Vec<Vec<f64>>>> {
            let DocNode::Dict(map) = node.context("missing image dictionary")? else {
                anyhow::bail!("image field is not a dictionary");
            };
            map.iter()
                .map(|(ch, node)| match node {
                    DocNode::Array2(img) => Ok((ch.clone(), img.clone())),
                    // Empty images reload as null slots.
                    DocNode::Null => Ok((ch.clone(), Vec::new())),
                    _ => Err(anyhow!("image '{ch}' is not a 2-D array")),
                })
                .collect()
        };
        self.images = from_dict(doc.get("images"))?;
        self.images_back = from_dict(doc.get("images_back"))?;
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Err(e) = self.piezos.zero(self.config.sample_rate_hz).await {
            warn!("Failed to park the scanner during cleanup: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::daq::{DaqBackend, MockDaq, SendReceive};
    use crate::instrument::piezos::PiezoAxis;

    fn rig() -> Arc<Piezos> {
        // Input reflects the x output, so images have a known gradient.
        let daq = Arc::new(
            MockDaq::new()
                .with_transfer(|outputs, _| outputs.get("ao0").copied().unwrap_or(0.0)),
        );
        let mut axes = BTreeMap::new();
        for (label, channel, bipolar) in
            [("x", "ao0", true), ("y", "ao1", true), ("z", "ao2", false)]
        {
            axes.insert(
                label.to_string(),
                PiezoAxis {
                    out_channel: channel.to_string(),
                    gain: 15.0,
                    v_max: 150.0,
                    bipolar,
                },
            );
        }
        Arc::new(Piezos::new(daq, axes).with_step(5.0))
    }

    fn flat_plane() -> Plane {
        Plane {
            a: 0.0,
            b: 0.0,
            c: 40.0,
        }
    }

    fn small_config() -> ScanplaneConfig {
        ScanplaneConfig {
            nx: 8,
            ny: 4,
            upsample: 4,
            x_range_v: (0.0, 70.0),
            y_range_v: (0.0, 30.0),
            ..ScanplaneConfig::default()
        }
    }

    #[tokio::test]
    async fn images_have_grid_shape_and_follow_the_input() {
        let mut scan = Scanplane::new(rig(), flat_plane(), small_config());
        scan.run(&RunContext::new()).await.unwrap();

        let img = &scan.images["ai0"];
        assert_eq!(img.len(), 4);
        assert!(img.iter().all(|row| row.len() == 8));
        // The mock input is x / gain; each row is monotonic in x.
        for row in img {
            assert!(row.windows(2).all(|w| w[1] >= w[0]));
        }
        // Forward and back rows agree for a static signal.
        for (f, b) in scan.images["ai0"].iter().zip(&scan.images_back["ai0"]) {
            for (a, c) in f.iter().zip(b) {
                assert!((a - c).abs() < 1e-9);
            }
        }
    }

    #[tokio::test]
    async fn scanner_is_parked_after_the_scan() {
        let piezos = rig();
        let mut scan = Scanplane::new(piezos.clone(), flat_plane(), small_config());
        scan.run(&RunContext::new()).await.unwrap();
        for axis in ["x", "y", "z"] {
            assert_eq!(piezos.voltage(axis).await.unwrap(), 0.0);
        }
    }

    #[tokio::test]
    async fn refuses_a_plane_outside_the_piezo_range() {
        let plane = Plane {
            a: 0.0,
            b: 0.0,
            c: 200.0, // beyond v_max
        };
        let mut scan = Scanplane::new(rig(), plane, small_config());
        assert!(scan.run(&RunContext::new()).await.is_err());
    }

    /// Delegates to [`MockDaq`] but drops the tail of every received
    /// waveform, like a card that stops its input task early.
    struct ShortReadDaq(MockDaq);

    #[async_trait]
    impl DaqBackend for ShortReadDaq {
        fn name(&self) -> String {
            self.0.name()
        }

        async fn write_output(&self, channel: &str, volts: f64) -> Result<()> {
            self.0.write_output(channel, volts).await
        }

        async fn output(&self, channel: &str) -> Result<f64> {
            self.0.output(channel).await
        }

        async fn read_input(&self, channel: &str) -> Result<f64> {
            self.0.read_input(channel).await
        }

        async fn send_receive(
            &self,
            outputs: &BTreeMap<String, Vec<f64>>,
            inputs: &[String],
            sample_rate_hz: f64,
        ) -> Result<SendReceive> {
            let mut result = self.0.send_receive(outputs, inputs, sample_rate_hz).await?;
            for wave in result.received.values_mut() {
                wave.truncate(wave.len() / 2);
            }
            Ok(result)
        }

        async fn read_waveform(
            &self,
            channel: &str,
            npoints: usize,
            sample_rate_hz: f64,
        ) -> Result<Vec<f64>> {
            self.0.read_waveform(channel, npoints, sample_rate_hz).await
        }
    }

    #[tokio::test]
    async fn short_daq_reads_error_instead_of_panicking() {
        let daq = Arc::new(ShortReadDaq(MockDaq::new()));
        let mut axes = BTreeMap::new();
        for (label, channel) in [("x", "ao0"), ("y", "ao1"), ("z", "ao2")] {
            axes.insert(
                label.to_string(),
                PiezoAxis {
                    out_channel: channel.to_string(),
                    gain: 15.0,
                    v_max: 150.0,
                    bipolar: true,
                },
            );
        }
        let piezos = Arc::new(Piezos::new(daq, axes).with_step(5.0));

        let mut scan = Scanplane::new(piezos, flat_plane(), small_config());
        let err = scan.run(&RunContext::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("Resampling channel"));
    }

    #[tokio::test]
    async fn document_round_trips_images() {
        let mut scan = Scanplane::new(rig(), flat_plane(), small_config());
        scan.run(&RunContext::new()).await.unwrap();
        let doc = scan.document();

        let mut fresh = Scanplane::new(rig(), flat_plane(), small_config());
        fresh.restore(&doc).unwrap();
        assert_eq!(fresh.images, scan.images);
        assert_eq!(fresh.plane, scan.plane);
        assert_eq!(fresh.xs, scan.xs);
    }
}
