//! Full mock-backed pipeline: plane fit on a tilted sample, then a
//! constant-height scan over the fitted plane, driven through the `Runner`
//! so every stage is saved and reloadable.

use async_trait::async_trait;
use cryodaq::instrument::daq::{DaqBackend, MockDaq};
use cryodaq::instrument::piezos::{PiezoAxis, Piezos};
use cryodaq::instrument::Readable;
use cryodaq::measurement::plane::Plane;
use cryodaq::measurement::planefit::{Planefit, PlanefitConfig};
use cryodaq::measurement::scanplane::{Scanplane, ScanplaneConfig};
use cryodaq::save::{LoadOptions, Saver};
use cryodaq::{Procedure, RunContext, Runner};
use std::collections::BTreeMap;
use std::sync::Arc;

const GAIN: f64 = 15.0;

/// Capacitance signal for a sample tilted by a known plane: flat until the z
/// piezo reaches the surface, then rising.
struct TiltedSample {
    daq: Arc<MockDaq>,
    plane: Plane,
}

#[async_trait]
impl Readable for TiltedSample {
    async fn read(&self) -> anyhow::Result<f64> {
        let x = self.daq.output("ao0").await? * GAIN;
        let y = self.daq.output("ao1").await? * GAIN;
        let z = self.daq.output("ao2").await? * GAIN;
        let contact = self.plane.z(x, y);
        Ok(if z < contact {
            1.0
        } else {
            1.0 + 0.2 * (z - contact)
        })
    }
}

fn rig(plane: Plane) -> (Arc<Piezos>, Arc<TiltedSample>) {
    let daq = Arc::new(MockDaq::new().with_transfer(|outputs, _| {
        // The recorded input mirrors the x position.
        outputs.get("ao0").copied().unwrap_or(0.0)
    }));
    let mut axes = BTreeMap::new();
    for (label, channel, bipolar) in [("x", "ao0", true), ("y", "ao1", true), ("z", "ao2", false)]
    {
        axes.insert(
            label.to_string(),
            PiezoAxis {
                out_channel: channel.to_string(),
                gain: GAIN,
                v_max: 150.0,
                bipolar,
            },
        );
    }
    let piezos = Arc::new(Piezos::new(daq.clone(), axes).with_step(2.0));
    (piezos, Arc::new(TiltedSample { daq, plane }))
}

#[tokio::test]
async fn planefit_then_scanplane_with_saves() {
    let truth = Plane {
        a: 0.04,
        b: -0.02,
        c: 45.0,
    };
    let (piezos, sample) = rig(truth);
    let dir = tempfile::tempdir().unwrap();
    let runner = Runner::new(Saver::new(dir.path()));

    // Stage 1: fit the sample tilt from a touchdown grid.
    let pf_cfg = PlanefitConfig {
        x_range_v: (-40.0, 40.0),
        y_range_v: (-40.0, 40.0),
        nx: 3,
        ny: 3,
        ..PlanefitConfig::default()
    };
    let mut pf = Planefit::new(Arc::clone(&piezos), Arc::clone(&sample) as Arc<dyn Readable>, pf_cfg);
    runner.run(&mut pf).await.unwrap();
    let fitted = pf.plane.expect("plane fit produced no plane");
    assert!((fitted.a - truth.a).abs() < 0.03);
    assert!((fitted.c - truth.c).abs() < 3.0);

    // Stage 2: scan above the fitted surface.
    let scan_cfg = ScanplaneConfig {
        x_range_v: (-30.0, 30.0),
        y_range_v: (-30.0, 30.0),
        nx: 8,
        ny: 4,
        upsample: 4,
        scan_height_v: 3.0,
        ..ScanplaneConfig::default()
    };
    let mut scan = Scanplane::new(Arc::clone(&piezos), fitted, scan_cfg);
    let paths = runner.run(&mut scan).await.unwrap();

    let img = &scan.images["ai0"];
    assert_eq!(img.len(), 4);
    assert!(img.iter().all(|row| row.len() == 8));

    // The scanner parks at zero after each stage.
    for axis in ["x", "y", "z"] {
        assert_eq!(piezos.voltage(axis).await.unwrap(), 0.0);
    }

    // Stage 3: the saved scan restores into a fresh procedure.
    let stem = paths
        .json
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap()
        .to_string();
    let saver = Saver::new(dir.path());
    let doc = saver.load(&stem, &LoadOptions::default()).unwrap();
    assert_eq!(doc.class, "Scanplane");

    let (piezos2, _) = rig(truth);
    let mut restored = Scanplane::new(
        piezos2,
        Plane {
            a: 0.0,
            b: 0.0,
            c: 0.0,
        },
        ScanplaneConfig::default(),
    );
    restored.restore(&doc).unwrap();
    assert_eq!(restored.images, scan.images);
    assert_eq!(restored.plane, scan.plane);
    assert_eq!(restored.xs, scan.xs);
}

#[tokio::test]
async fn aborted_scan_still_parks_and_saves() {
    let (piezos, _) = rig(Plane {
        a: 0.0,
        b: 0.0,
        c: 40.0,
    });
    let dir = tempfile::tempdir().unwrap();
    let runner = Runner::new(Saver::new(dir.path()));

    let ctx = RunContext::new();
    ctx.request_abort();
    let mut scan = Scanplane::new(
        piezos.clone(),
        Plane {
            a: 0.0,
            b: 0.0,
            c: 40.0,
        },
        ScanplaneConfig {
            nx: 4,
            ny: 2,
            upsample: 2,
            ..ScanplaneConfig::default()
        },
    );
    let err = runner.run_with_context(&mut scan, &ctx).await.unwrap_err();
    assert!(err
        .downcast_ref::<cryodaq::LabError>()
        .is_some_and(|e| matches!(e, cryodaq::LabError::Aborted)));

    // Cleanup parked the stage and the partial document was written.
    assert_eq!(piezos.voltage("z").await.unwrap(), 0.0);
    let saved: Vec<_> = dir.path().read_dir().unwrap().collect();
    assert_eq!(saved.len(), 2);
}
