//! Remaster bootable ISO images.
//!
//! A run loop-mounts a source image, copies its contents into a writable
//! tree, customizes the live root filesystem inside a chroot, and writes a
//! new image. Every privileged resource acquired along the way is released
//! exactly once, in reverse order, whether the run succeeds, fails, or is
//! interrupted by a signal.
//!
//! # Architecture
//!
//! ```text
//! preflight ──▶ config::resolve ──▶ run::remaster
//!                                       │
//!                                       ├── workspace::provision ──▶ CleanupLedger
//!                                       ├── RemasterPipeline
//!                                       │     MountSource   (Mounter)
//!                                       │     StageContents (Stager)
//!                                       │     PatchRoot     (Patcher)
//!                                       │     RepackImage   (Repackager)
//!                                       ├── manifest::write_for
//!                                       └── CleanupLedger::drain_all
//! ```
//!
//! Every external program goes through [`process::Cmd`], which observes the
//! [`signal::CancelToken`] armed by [`signal::SignalGuard`].
//!
//! # Example
//!
//! ```rust,ignore
//! use iso_remaster::{config, run, signal::CancelToken, Toolchain};
//!
//! let config = config::resolve("ubuntu.iso", None, None)?;
//! let report = run::remaster(&config, &tools, &CancelToken::new(), Default::default())?;
//! ```

pub mod artifact;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod manifest;
pub mod mount;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod run;
pub mod signal;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use cleanup::{CleanupAction, CleanupLedger};
pub use config::{RemasterOptions, RunConfig};
pub use error::{RemasterError, Result};
pub use pipeline::{PipelineStage, RemasterPipeline, Toolchain};
pub use workspace::Workspace;
