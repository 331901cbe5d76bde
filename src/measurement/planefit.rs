//! Sample-tilt determination: touchdowns on a grid, fit to a plane.
//!
//! Runs a [`Touchdown`] at each point of an x-y grid and fits the plane
//! `z = a x + b y + c` through the contact voltages. Scan procedures then
//! follow `plane.offset(scan_height)` to keep a constant tip-sample distance.
//! An edges-only mode visits just the grid perimeter for a quick tilt check.

use crate::instrument::piezos::Piezos;
use crate::instrument::Readable;
use crate::measurement::grid::{grid_points, linspace};
use crate::measurement::plane::Plane;
use crate::measurement::touchdown::{Touchdown, TouchdownConfig};
use crate::measurement::{Procedure, RunContext};
use crate::save::{DocNode, Document};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PlanefitConfig {
    pub x_axis: String,
    pub y_axis: String,
    /// Grid extents, in piezo volts.
    pub x_range_v: (f64, f64),
    pub y_range_v: (f64, f64),
    pub nx: usize,
    pub ny: usize,
    /// Visit only the grid perimeter.
    pub edges_only: bool,
    pub sample_rate_hz: f64,
    pub touchdown: TouchdownConfig,
}

impl Default for PlanefitConfig {
    fn default() -> Self {
        Self {
            x_axis: "x".to_string(),
            y_axis: "y".to_string(),
            x_range_v: (-50.0, 50.0),
            y_range_v: (-50.0, 50.0),
            nx: 3,
            ny: 3,
            edges_only: false,
            sample_rate_hz: 1000.0,
            touchdown: TouchdownConfig::default(),
        }
    }
}

pub struct Planefit {
    piezos: Arc<Piezos>,
    capacitance: Arc<dyn Readable>,
    pub config: PlanefitConfig,
    /// Touchdown positions and contact voltages, one entry per visited point.
    pub x_points: Vec<f64>,
    pub y_points: Vec<f64>,
    pub z_points: Vec<f64>,
    pub plane: Option<Plane>,
}

impl Planefit {
    pub fn new(
        piezos: Arc<Piezos>,
        capacitance: Arc<dyn Readable>,
        config: PlanefitConfig,
    ) -> Self {
        Self {
            piezos,
            capacitance,
            config,
            x_points: Vec::new(),
            y_points: Vec::new(),
            z_points: Vec::new(),
            plane: None,
        }
    }
}

#[async_trait]
impl Procedure for Planefit {
    fn name(&self) -> &str {
        "planefit"
    }

    async fn run(&mut self, ctx: &RunContext) -> Result<()> {
        let cfg = self.config.clone();
        if cfg.nx < 2 || cfg.ny < 2 {
            return Err(anyhow!("Plane fit grid needs at least 2x2 points"));
        }
        self.x_points.clear();
        self.y_points.clear();
        self.z_points.clear();
        self.plane = None;

        let xs = linspace(cfg.x_range_v.0, cfg.x_range_v.1, cfg.nx);
        let ys = linspace(cfg.y_range_v.0, cfg.y_range_v.1, cfg.ny);
        let points = grid_points(&xs, &ys, cfg.edges_only);
        info!("Plane fit over {} touchdowns", points.len());

        for point in points {
            ctx.check()?;
            let mut targets = BTreeMap::new();
            targets.insert(cfg.x_axis.clone(), point.x);
            targets.insert(cfg.y_axis.clone(), point.y);
            self.piezos
                .sweep(&targets, &[], cfg.sample_rate_hz)
                .await
                .context("Failed to move to the touchdown position")?;

            let mut td = Touchdown::new(
                Arc::clone(&self.piezos),
                Arc::clone(&self.capacitance),
                cfg.touchdown.clone(),
            );
            td.run(ctx)
                .await
                .with_context(|| format!("Touchdown at ({:.1}, {:.1}) failed", point.x, point.y))?;
            let z = td
                .touchdown_v
                .ok_or_else(|| anyhow!("Touchdown reported success without a voltage"))?;

            self.x_points.push(point.x);
            self.y_points.push(point.y);
            self.z_points.push(z);
        }

        let samples: Vec<(f64, f64, f64)> = self
            .x_points
            .iter()
            .zip(&self.y_points)
            .zip(&self.z_points)
            .map(|((&x, &y), &z)| (x, y, z))
            .collect();
        let plane = Plane::fit(&samples)?;
        info!(
            "Fitted plane: z = {:.4} x + {:.4} y + {:.2}",
            plane.a, plane.b, plane.c
        );
        self.plane = Some(plane);
        Ok(())
    }

    fn document(&self) -> Document {
        let mut doc = Document::new("Planefit");
        doc.set_str("x_axis", &self.config.x_axis);
        doc.set_str("y_axis", &self.config.y_axis);
        doc.set_f64("x_min_v", self.config.x_range_v.0);
        doc.set_f64("x_max_v", self.config.x_range_v.1);
        doc.set_f64("y_min_v", self.config.y_range_v.0);
        doc.set_f64("y_max_v", self.config.y_range_v.1);
        doc.set_int("nx", self.config.nx as i64);
        doc.set_int("ny", self.config.ny as i64);
        doc.set_bool("edges_only", self.config.edges_only);
        doc.set_array1("x_points", &self.x_points);
        doc.set_array1("y_points", &self.y_points);
        doc.set_array1("z_points", &self.z_points);
        match &self.plane {
            Some(plane) => {
                let mut p = Document::new("Plane");
                p.set_f64("a", plane.a);
                p.set_f64("b", plane.b);
                p.set_f64("c", plane.c);
                doc.set_object("plane", p);
            }
            None => doc.set("plane", DocNode::Null),
        }
        doc
    }

    fn restore(&mut self, doc: &Document) -> Result<()> {
        self.x_points = doc.array1("x_points").context("missing x_points")?.to_vec();
        self.y_points = doc.array1("y_points").context("missing y_points")?.to_vec();
        self.z_points = doc.array1("z_points").context("missing z_points")?.to_vec();
        self.plane = match doc.object("plane") {
            Some(p) => Some(Plane {
                a: p.f64("a").context("plane missing a")?,
                b: p.f64("b").context("plane missing b")?,
                c: p.f64("c").context("plane missing c")?,
            }),
            None => None,
        };
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Err(e) = self.piezos.zero(self.config.sample_rate_hz).await {
            warn!("Failed to zero piezos during cleanup: {e:#}");
        }
    }
}
