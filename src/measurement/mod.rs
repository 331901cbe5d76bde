//! Measurement procedures and the run loop.
//!
//! A [`Procedure`] is one acquisition routine: an I-V sweep, a touchdown, a
//! plane fit, a scan. Procedures hold their own parameters and results, run
//! against instrument handles injected at construction, and can render their
//! full state as a [`Document`] for persistence (and restore it from one).
//!
//! The [`Runner`] drives a procedure to completion: it wires up Ctrl-C as an
//! abort request, always calls the procedure's `cleanup` (which parks
//! actuators in a safe state), and saves whatever state the procedure has,
//! including partial data from an aborted run.

pub mod grid;
pub mod plane;
pub mod planefit;
pub mod scanplane;
pub mod spectrum;
pub mod squid_iv;
pub mod touchdown;
pub mod transport;

use crate::error::LabError;
use crate::metadata::Metadata;
use crate::save::{DocNode, Document, SavedPaths, Saver};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative abort channel handed to a running procedure.
///
/// Procedures call [`RunContext::check`] at loop boundaries; an abort request
/// surfaces as [`LabError::Aborted`] and unwinds through the normal error
/// path, so cleanup and the partial save still happen.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    abort: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for requesting an abort from another task (e.g. a signal
    /// handler).
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Error out of the current loop if an abort was requested.
    pub fn check(&self) -> Result<()> {
        if self.aborted() {
            Err(LabError::Aborted.into())
        } else {
            Ok(())
        }
    }
}

/// One acquisition routine.
#[async_trait]
pub trait Procedure: Send {
    /// Short name used in filenames and logs (e.g. `"scanplane"`).
    fn name(&self) -> &str;

    /// Execute the measurement. Long loops must call `ctx.check()` between
    /// hardware operations so aborts take effect promptly.
    async fn run(&mut self, ctx: &RunContext) -> Result<()>;

    /// Full state (parameters and whatever data exists so far) as a document.
    fn document(&self) -> Document;

    /// Restore state from a previously saved document.
    fn restore(&mut self, doc: &Document) -> Result<()>;

    /// Leave the hardware in a safe state. Called after every run, successful
    /// or not; implementations must tolerate being called mid-measurement.
    async fn cleanup(&mut self) {}
}

/// Timestamped filename stem: `2026-08-26_143210_scanplane`.
pub fn filename_stem(name: &str) -> String {
    format!("{}_{}", Local::now().format("%Y-%m-%d_%H%M%S"), name)
}

/// Drives procedures: abort wiring, cleanup, save.
pub struct Runner {
    saver: Saver,
    metadata: Option<Metadata>,
}

impl Runner {
    pub fn new(saver: Saver) -> Self {
        Self {
            saver,
            metadata: None,
        }
    }

    /// Attach run metadata; it is embedded in every saved document under the
    /// `metadata` key.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn stamped_document(&self, procedure: &dyn Procedure) -> Result<Document> {
        let mut doc = procedure.document();
        if let Some(meta) = &self.metadata {
            let value = serde_json::to_value(meta).map_err(LabError::from)?;
            doc.set("metadata", DocNode::from_json(&value, &[])?);
        }
        Ok(doc)
    }

    /// Run to completion (or abort), clean up, and save.
    ///
    /// Ctrl-C requests an abort and waits for the procedure to notice it, so
    /// in-flight hardware operations finish rather than being cut off.
    /// Partial data from a failed or aborted run is still saved; the save
    /// paths are returned alongside the original failure.
    pub async fn run(&self, procedure: &mut dyn Procedure) -> Result<SavedPaths> {
        let ctx = RunContext::new();
        info!("Starting procedure '{}'", procedure.name());

        let abort = ctx.abort_handle();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; requesting abort");
                abort.store(true, Ordering::SeqCst);
            }
        });

        let outcome = procedure.run(&ctx).await;
        watcher.abort();

        procedure.cleanup().await;

        match &outcome {
            Ok(()) => info!("Procedure '{}' finished", procedure.name()),
            Err(e) => error!("Procedure '{}' failed: {e:#}", procedure.name()),
        }

        let stem = filename_stem(procedure.name());
        let doc = self.stamped_document(procedure)?;
        let paths = self.saver.save(&stem, &doc)?;

        outcome.map(|()| paths)
    }

    /// Run without the Ctrl-C watcher, with a caller-supplied context.
    /// Used by composite procedures that drive sub-procedures.
    pub async fn run_with_context(
        &self,
        procedure: &mut dyn Procedure,
        ctx: &RunContext,
    ) -> Result<SavedPaths> {
        let outcome = procedure.run(ctx).await;
        procedure.cleanup().await;
        let stem = filename_stem(procedure.name());
        let doc = self.stamped_document(procedure)?;
        let paths = self.saver.save(&stem, &doc)?;
        outcome.map(|()| paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::LoadOptions;

    struct CountToTen {
        count: i64,
        abort_at: Option<i64>,
        cleaned_up: bool,
    }

    #[async_trait]
    impl Procedure for CountToTen {
        fn name(&self) -> &str {
            "count_to_ten"
        }

        async fn run(&mut self, ctx: &RunContext) -> Result<()> {
            for _ in 0..10 {
                ctx.check()?;
                self.count += 1;
                if Some(self.count) == self.abort_at {
                    ctx.request_abort();
                }
            }
            Ok(())
        }

        fn document(&self) -> Document {
            let mut doc = Document::new("CountToTen");
            doc.set_int("count", self.count);
            doc
        }

        fn restore(&mut self, doc: &Document) -> Result<()> {
            self.count = doc
                .int("count")
                .ok_or_else(|| anyhow::anyhow!("document has no 'count'"))?;
            Ok(())
        }

        async fn cleanup(&mut self) {
            self.cleaned_up = true;
        }
    }

    fn proc(abort_at: Option<i64>) -> CountToTen {
        CountToTen {
            count: 0,
            abort_at,
            cleaned_up: false,
        }
    }

    #[tokio::test]
    async fn runner_saves_and_cleans_up_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(Saver::new(dir.path()));
        let mut p = proc(None);
        let paths = runner.run(&mut p).await.unwrap();
        assert!(p.cleaned_up);
        assert!(paths.json.exists());
    }

    #[tokio::test]
    async fn abort_surfaces_but_partial_state_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(Saver::new(dir.path()));
        let ctx = RunContext::new();
        let mut p = proc(Some(3));
        let err = runner.run_with_context(&mut p, &ctx).await.unwrap_err();
        assert!(matches!(
            err.downcast::<LabError>().unwrap(),
            LabError::Aborted
        ));
        assert!(p.cleaned_up);
        assert_eq!(p.count, 3);

        // The partial document made it to disk.
        let saved = dir.path().read_dir().unwrap().count();
        assert_eq!(saved, 2); // json + array sidecar
    }

    #[tokio::test]
    async fn restore_round_trips_through_the_saver() {
        let dir = tempfile::tempdir().unwrap();
        let saver = Saver::new(dir.path());
        let mut p = proc(None);
        p.run(&RunContext::new()).await.unwrap();
        saver.save("count", &p.document()).unwrap();

        let mut fresh = proc(None);
        let doc = saver.load("count", &LoadOptions::default()).unwrap();
        fresh.restore(&doc).unwrap();
        assert_eq!(fresh.count, 10);
    }

    #[test]
    fn filename_stem_embeds_the_name() {
        let stem = filename_stem("squid_iv");
        assert!(stem.ends_with("_squid_iv"));
        assert_eq!(stem.len(), "2026-08-26_143210_squid_iv".len());
    }
}
