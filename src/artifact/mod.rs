//! Collaborators that produce the remastered artifact.
//!
//! The pipeline only sequences these; what each one does to the tree is
//! behind a trait so runs can be driven by fakes in tests:
//! - [`Stager`] - copies the mounted image into a writable tree ([`filesystem`])
//! - [`Patcher`] - unpacks and customizes the root filesystem ([`squashfs`])
//! - [`Repackager`] - authors the output image ([`iso`])

pub mod filesystem;
pub mod iso;
pub mod squashfs;

use std::path::Path;

use crate::error::Result;
use crate::signal::CancelToken;

pub use filesystem::CopyStager;
pub use iso::XorrisoRepackager;
pub use squashfs::{SquashfsOptions, SquashfsPatcher};

/// Copies the contents of the mounted image into the extraction root.
pub trait Stager {
    fn stage(&self, mount_point: &Path, extraction_root: &Path, cancel: &CancelToken)
        -> Result<()>;
}

/// Customizes the staged tree, using `chroot_root` as scratch space for the
/// unpacked root filesystem.
pub trait Patcher {
    fn patch(&self, extraction_root: &Path, chroot_root: &Path, cancel: &CancelToken)
        -> Result<()>;
}

/// Writes the output image from the patched extraction root.
pub trait Repackager {
    fn repack(
        &self,
        input_image: &Path,
        extraction_root: &Path,
        output_image: &Path,
        cancel: &CancelToken,
    ) -> Result<()>;
}
