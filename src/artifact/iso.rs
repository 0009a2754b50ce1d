//! Output image authoring with `xorriso`.
//!
//! The patched tree is mapped over the root of the input image and written
//! as a new image. `-boot_image any replay` carries the input's El Torito
//! and hybrid MBR/GPT boot setup over, so the result boots the same way the
//! source did without this crate knowing which bootloader it uses.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::artifact::Repackager;
use crate::error::{RemasterError, Result};
use crate::process::Cmd;
use crate::signal::CancelToken;

/// Longest volume id ISO 9660 allows.
pub const MAX_VOLUME_LABEL: usize = 32;

#[derive(Debug, Default, Clone)]
pub struct XorrisoRepackager {
    volume_label: Option<String>,
}

impl XorrisoRepackager {
    pub fn new(volume_label: Option<String>) -> Self {
        Self { volume_label }
    }
}

impl Repackager for XorrisoRepackager {
    fn repack(
        &self,
        input_image: &Path,
        extraction_root: &Path,
        output_image: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        prepare_output(output_image)?;

        info!("Writing final image to {}", output_image.display());

        let mut cmd = Cmd::new("xorriso")
            .arg("-indev")
            .arg_path(input_image)
            .arg("-outdev")
            .arg_path(output_image);
        if let Some(label) = &self.volume_label {
            cmd = cmd.args(["-volid", volume_label(label).as_str()]);
        }
        cmd.args(["-boot_image", "any", "replay"])
            .arg("-map")
            .arg_path(extraction_root)
            .arg("/")
            .error_msg(format!("writing {}", output_image.display()))
            .cancel_on(cancel)
            .run()?;
        Ok(())
    }
}

/// xorriso appends a session to an existing output instead of replacing it,
/// so a stale file from an earlier run must go first.
fn prepare_output(output_image: &Path) -> Result<()> {
    if let Some(parent) = output_image.parent() {
        fs::create_dir_all(parent).map_err(|source| RemasterError::Filesystem {
            context: format!("creating output directory {}", parent.display()),
            source,
        })?;
    }
    if output_image.exists() {
        info!("Replacing existing {}", output_image.display());
        fs::remove_file(output_image).map_err(|source| RemasterError::Filesystem {
            context: format!("removing stale {}", output_image.display()),
            source,
        })?;
    }
    Ok(())
}

/// Upper-case and truncate a label to what ISO 9660 accepts.
pub fn volume_label(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .take(MAX_VOLUME_LABEL)
        .collect()
}
