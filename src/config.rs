//! Run configuration and path resolution.
//!
//! Raw command-line strings are turned into a [`RunConfig`] once at startup.
//! After that every path is absolute and nothing about the run changes.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::artifact::SquashfsOptions;
use crate::error::{RemasterError, Result};

/// Required suffix of the output image.
pub const OUTPUT_SUFFIX: &str = ".img";

/// Appended to the input stem when no output path is given.
pub const DEFAULT_OUTPUT_TAG: &str = "-custom";

/// Prefix of the auto-generated working directory under the temp root.
pub const WORKDIR_PREFIX: &str = "iso-remaster";

/// Validated, immutable settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub input_image: PathBuf,
    pub output_image: PathBuf,
    pub work_dir: PathBuf,
    /// User-supplied workdirs are never removed, only unmounted.
    pub work_dir_user_supplied: bool,
}

impl RunConfig {
    pub fn is_ephemeral(&self) -> bool {
        !self.work_dir_user_supplied
    }
}

/// Settings for the patch and repack stages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemasterOptions {
    /// Shell script copied into the chroot and run there.
    pub patch_script: Option<PathBuf>,
    pub squashfs: SquashfsOptions,
    /// Volume label for the output image. `None` keeps the input's label.
    pub volume_label: Option<String>,
}

/// Resolve raw path arguments relative to the current directory.
pub fn resolve(input: &str, output: Option<&str>, work_dir: Option<&str>) -> Result<RunConfig> {
    let cwd = std::env::current_dir().map_err(|e| RemasterError::InvalidInput {
        path: PathBuf::from(input),
        reason: format!("cannot resolve current directory: {e}"),
    })?;
    resolve_in(&cwd, input, output, work_dir)
}

/// Resolve raw path arguments against an explicit base directory.
pub fn resolve_in(
    cwd: &Path,
    input: &str,
    output: Option<&str>,
    work_dir: Option<&str>,
) -> Result<RunConfig> {
    let input_image = resolve_input(cwd, input)?;
    let output_image = resolve_output(cwd, &input_image, output)?;
    let (work_dir, work_dir_user_supplied) = resolve_work_dir(cwd, work_dir);

    let config = RunConfig {
        input_image,
        output_image,
        work_dir,
        work_dir_user_supplied,
    };
    debug!("Resolved configuration: {:?}", config);
    Ok(config)
}

fn resolve_input(cwd: &Path, raw: &str) -> Result<PathBuf> {
    if raw.trim().is_empty() {
        return Err(RemasterError::InvalidInput {
            path: PathBuf::from(raw),
            reason: "input image is required".into(),
        });
    }

    let path = absolutize(cwd, raw);
    if !path.exists() {
        return Err(RemasterError::InvalidInput {
            path,
            reason: "file not found".into(),
        });
    }
    if !path.is_file() {
        return Err(RemasterError::InvalidInput {
            path,
            reason: "not a regular file".into(),
        });
    }
    Ok(path)
}

fn resolve_output(cwd: &Path, input: &Path, raw: Option<&str>) -> Result<PathBuf> {
    let path = match raw.filter(|s| !s.trim().is_empty()) {
        Some(raw) => absolutize(cwd, raw),
        None => cwd.join(default_output_name(input)?),
    };

    let ends_with_suffix = path
        .file_name()
        .map(|name| name.to_string_lossy().ends_with(OUTPUT_SUFFIX))
        .unwrap_or(false);
    if !ends_with_suffix {
        return Err(RemasterError::InvalidOutput {
            path,
            reason: format!("output must end in {OUTPUT_SUFFIX}"),
        });
    }
    Ok(path)
}

fn default_output_name(input: &Path) -> Result<String> {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RemasterError::InvalidOutput {
            path: input.to_path_buf(),
            reason: "cannot derive an output name from the input".into(),
        })?;
    Ok(format!("{stem}{DEFAULT_OUTPUT_TAG}{OUTPUT_SUFFIX}"))
}

fn resolve_work_dir(cwd: &Path, raw: Option<&str>) -> (PathBuf, bool) {
    match raw.filter(|s| !s.trim().is_empty()) {
        Some(raw) => (absolutize(cwd, raw), true),
        None => (ephemeral_work_dir(), false),
    }
}

/// Process-unique working directory under the OS temp root.
pub fn ephemeral_work_dir() -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", WORKDIR_PREFIX, std::process::id()))
}

fn absolutize(cwd: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
