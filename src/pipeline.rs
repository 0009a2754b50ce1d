//! The remastering pipeline.
//!
//! Stages run strictly in order and never retry:
//!
//! ```text
//! MountSource ─▶ StageContents ─▶ PatchRoot ─▶ RepackImage ─▶ Done
//!      │               │              │             │
//!      └───────────────┴──────────────┴─────────────┴──▶ Aborted
//! ```
//!
//! A failing stage moves the pipeline to `Aborted` and returns the error;
//! releasing what earlier stages acquired is the cleanup ledger's job, not
//! the pipeline's. The cancel token is checked before every stage.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::artifact::{Patcher, Repackager, Stager};
use crate::config::RunConfig;
use crate::error::{RemasterError, Result};
use crate::mount::Mounter;
use crate::signal::CancelToken;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    MountSource,
    StageContents,
    PatchRoot,
    RepackImage,
    Done,
    Aborted,
}

impl PipelineStage {
    /// The stages that do work, in execution order.
    pub const ORDER: [PipelineStage; 4] = [
        PipelineStage::MountSource,
        PipelineStage::StageContents,
        PipelineStage::PatchRoot,
        PipelineStage::RepackImage,
    ];

    /// Forward transition on success. Terminal states stay put.
    pub fn next(self) -> PipelineStage {
        match self {
            PipelineStage::MountSource => PipelineStage::StageContents,
            PipelineStage::StageContents => PipelineStage::PatchRoot,
            PipelineStage::PatchRoot => PipelineStage::RepackImage,
            PipelineStage::RepackImage => PipelineStage::Done,
            PipelineStage::Done => PipelineStage::Done,
            PipelineStage::Aborted => PipelineStage::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Aborted)
    }

    fn describe(self) -> &'static str {
        match self {
            PipelineStage::MountSource => "Mounting ISO...",
            PipelineStage::StageContents => "Copying ISO contents...",
            PipelineStage::PatchRoot => "Patching root filesystem...",
            PipelineStage::RepackImage => "Writing final image...",
            PipelineStage::Done => "Completed successfully.",
            PipelineStage::Aborted => "Aborted.",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::MountSource => "MountSource",
            PipelineStage::StageContents => "StageContents",
            PipelineStage::PatchRoot => "PatchRoot",
            PipelineStage::RepackImage => "RepackImage",
            PipelineStage::Done => "Done",
            PipelineStage::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// External collaborators the stages delegate to.
pub struct Toolchain {
    pub mounter: Arc<dyn Mounter>,
    pub stager: Box<dyn Stager>,
    pub patcher: Box<dyn Patcher>,
    pub repackager: Box<dyn Repackager>,
}

pub struct RemasterPipeline<'a> {
    config: &'a RunConfig,
    workspace: &'a Workspace,
    tools: &'a Toolchain,
    cancel: CancelToken,
    stage: PipelineStage,
    completed: Vec<PipelineStage>,
}

impl<'a> RemasterPipeline<'a> {
    pub fn new(
        config: &'a RunConfig,
        workspace: &'a Workspace,
        tools: &'a Toolchain,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            workspace,
            tools,
            cancel,
            stage: PipelineStage::MountSource,
            completed: Vec::new(),
        }
    }

    /// Current state.
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Stages that finished successfully, in order.
    pub fn completed(&self) -> &[PipelineStage] {
        &self.completed
    }

    /// Drive every remaining stage. Returns the first failure.
    pub fn run(&mut self) -> Result<()> {
        while !self.stage.is_terminal() {
            let stage = self.stage;

            if self.cancel.is_cancelled() {
                return self.abort(
                    stage,
                    RemasterError::Interrupted {
                        during: stage.to_string(),
                    },
                );
            }

            info!("[{}] {}", stage, stage.describe());
            if let Err(e) = self.execute(stage) {
                return self.abort(stage, e);
            }

            self.completed.push(stage);
            self.stage = stage.next();
        }

        info!("{}", self.stage.describe());
        Ok(())
    }

    fn execute(&self, stage: PipelineStage) -> Result<()> {
        let ws = self.workspace;
        let cancel = &self.cancel;
        match stage {
            PipelineStage::MountSource => {
                self.tools
                    .mounter
                    .mount_loop(&self.config.input_image, &ws.mount_point, cancel)
            }
            PipelineStage::StageContents => {
                self.tools
                    .stager
                    .stage(&ws.mount_point, &ws.extraction_root, cancel)
            }
            PipelineStage::PatchRoot => {
                self.tools
                    .patcher
                    .patch(&ws.extraction_root, &ws.chroot_root, cancel)
            }
            PipelineStage::RepackImage => self.tools.repackager.repack(
                &self.config.input_image,
                &ws.extraction_root,
                &self.config.output_image,
                cancel,
            ),
            PipelineStage::Done | PipelineStage::Aborted => Ok(()),
        }
    }

    fn abort(&mut self, stage: PipelineStage, err: RemasterError) -> Result<()> {
        debug!("[{}] aborting: {}", stage, err);
        self.stage = PipelineStage::Aborted;
        Err(err)
    }
}
