//! Preflight checks run before anything touches the filesystem.
//!
//! Remastering loop-mounts images and enters a chroot, so the process must
//! run as root, and every host tool the pipeline shells out to must exist.
//! Checking up front turns a half-finished run into a single clear error.
//!
//! # Example
//!
//! ```rust,ignore
//! use iso_remaster::preflight::{check_host_tools, require_root};
//!
//! require_root()?;
//! check_host_tools()?;
//! ```

use tracing::debug;

use crate::error::{RemasterError, Result};
use crate::process;

/// Host tools the pipeline invokes.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("cp", "coreutils"),
    ("chroot", "coreutils"),
    ("unsquashfs", "squashfs-tools"),
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "xorriso"),
];

/// Fail with `PrivilegeRequired` unless the effective uid is 0.
pub fn require_root() -> Result<()> {
    check_euid(effective_uid())
}

fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

fn check_euid(euid: u32) -> Result<()> {
    if euid != 0 {
        return Err(RemasterError::PrivilegeRequired { euid });
    }
    debug!("Running as root");
    Ok(())
}

/// Check that specific tools are available.
///
/// Reports every missing tool at once rather than the first one.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<(String, String)> = tools
        .iter()
        .filter(|(tool, _)| !process::exists(tool))
        .map(|(tool, package)| (tool.to_string(), package.to_string()))
        .collect();

    if !missing.is_empty() {
        return Err(RemasterError::MissingTools { missing });
    }
    Ok(())
}

/// Check every tool in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_root_is_rejected() {
        let err = check_euid(1000).unwrap_err();
        assert!(matches!(err, RemasterError::PrivilegeRequired { euid: 1000 }));
    }

    #[test]
    fn test_root_is_accepted() {
        assert!(check_euid(0).is_ok());
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_reports_all_missing() {
        let tools = &[
            ("ls", "coreutils"),
            ("nonexistent_command_xyz", "fake-package"),
            ("nonexistent_command_abc", "other-package"),
        ];
        match check_required_tools(tools).unwrap_err() {
            RemasterError::MissingTools { missing } => {
                assert_eq!(missing.len(), 2);
                assert_eq!(missing[0].1, "fake-package");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_required_tools_list() {
        for (tool, package) in REQUIRED_TOOLS {
            assert!(!tool.is_empty());
            assert!(!package.is_empty());
        }
    }
}
