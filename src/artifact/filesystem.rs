//! Staging the mounted image into a writable tree.

use std::path::Path;

use crate::artifact::Stager;
use crate::error::Result;
use crate::process::Cmd;
use crate::signal::CancelToken;

/// `cp -a <mount>/. <root>`: preserves ownership, modes, timestamps and
/// symlinks, and copies dotfiles at the top level.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyStager;

impl Stager for CopyStager {
    fn stage(&self, mount_point: &Path, extraction_root: &Path, cancel: &CancelToken) -> Result<()> {
        Cmd::new("cp")
            .arg("-a")
            .arg_path(&mount_point.join("."))
            .arg_path(extraction_root)
            .error_msg(format!(
                "copying image contents from {}",
                mount_point.display()
            ))
            .cancel_on(cancel)
            .run()?;
        Ok(())
    }
}
