//! One complete remaster run.
//!
//! This is the only place the cleanup ledger lives. It is created before the
//! first resource is acquired and drained exactly once after the pipeline
//! stops, whatever the reason: success, a fatal stage error, a provisioning
//! failure, or a cancellation from the signal guard.
//!
//! A run whose token was cancelled never reports success, even when the
//! signal landed after the last stage had already finished.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::cleanup::CleanupLedger;
use crate::config::RunConfig;
use crate::error::{RemasterError, Result};
use crate::manifest::{self, RunManifest};
use crate::pipeline::{PipelineStage, RemasterPipeline, Toolchain};
use crate::signal::CancelToken;
use crate::workspace;

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stages: Vec<PipelineStage>,
    pub manifest: Option<RunManifest>,
    /// Cleanup actions that failed while draining. Never fatal.
    pub cleanup_failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub write_manifest: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            write_manifest: true,
        }
    }
}

/// Provision, run the pipeline, and drain the ledger.
pub fn remaster(
    config: &RunConfig,
    tools: &Toolchain,
    cancel: &CancelToken,
    settings: RunSettings,
) -> Result<RunReport> {
    let started = OffsetDateTime::now_utc();
    let mut ledger = CleanupLedger::new();

    let result = run_stages(config, tools, cancel, settings, &mut ledger, started);

    let cleanup_failures = ledger.drain_all();
    if cleanup_failures > 0 {
        warn!("{} cleanup step(s) failed", cleanup_failures);
    }

    let (stages, manifest) = result?;
    if cancel.is_cancelled() {
        return Err(RemasterError::Interrupted {
            during: "finalization".into(),
        });
    }
    Ok(RunReport {
        stages,
        manifest,
        cleanup_failures,
    })
}

fn run_stages(
    config: &RunConfig,
    tools: &Toolchain,
    cancel: &CancelToken,
    settings: RunSettings,
    ledger: &mut CleanupLedger,
    started: OffsetDateTime,
) -> Result<(Vec<PipelineStage>, Option<RunManifest>)> {
    let workspace = workspace::provision(config, ledger, Arc::clone(&tools.mounter))?;

    info!("Input ISO: {}", config.input_image.display());
    info!("Output: {}", config.output_image.display());
    info!(
        "Workdir: {} ({})",
        workspace.root.display(),
        if config.work_dir_user_supplied {
            "kept"
        } else {
            "temporary"
        }
    );

    let mut pipeline = RemasterPipeline::new(config, &workspace, tools, cancel.clone());
    pipeline.run()?;
    let stages = pipeline.completed().to_vec();

    if cancel.is_cancelled() {
        return Err(RemasterError::Interrupted {
            during: PipelineStage::RepackImage.to_string(),
        });
    }

    let manifest = if settings.write_manifest {
        Some(manifest::write_for(config, &stages, started)?)
    } else {
        None
    };
    Ok((stages, manifest))
}
