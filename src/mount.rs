//! Loop and bind mounts.
//!
//! Unmounting is always lazy and forced (`umount -lf`) and never observes
//! the cancel token: it runs from the cleanup ledger, usually while a
//! cancellation is already unwinding.

use std::path::Path;

use crate::error::Result;
use crate::process::Cmd;
use crate::signal::CancelToken;

/// Attaches and detaches filesystems for the pipeline.
pub trait Mounter: Send + Sync {
    /// Loop-mount a disk image read-only at `target`.
    fn mount_loop(&self, image: &Path, target: &Path, cancel: &CancelToken) -> Result<()>;

    /// Bind-mount `source` onto `target`.
    fn bind(&self, source: &Path, target: &Path, cancel: &CancelToken) -> Result<()>;

    /// Force a lazy unmount of `target`. Failing here is expected when
    /// nothing was ever mounted.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Host `mount`/`umount` binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopMounter;

impl Mounter for LoopMounter {
    fn mount_loop(&self, image: &Path, target: &Path, cancel: &CancelToken) -> Result<()> {
        Cmd::new("mount")
            .args(["-o", "loop,ro"])
            .arg_path(image)
            .arg_path(target)
            .error_msg(format!("loop-mounting {}", image.display()))
            .cancel_on(cancel)
            .run()?;
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path, cancel: &CancelToken) -> Result<()> {
        Cmd::new("mount")
            .arg("--bind")
            .arg_path(source)
            .arg_path(target)
            .error_msg(format!("bind-mounting {}", source.display()))
            .cancel_on(cancel)
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg("-lf")
            .arg_path(target)
            .error_msg(format!("unmounting {}", target.display()))
            .run()?;
        Ok(())
    }
}
