//! Error taxonomy for a remaster run.
//!
//! Every variant is fatal for the current run. Failed actions in the run's
//! own cleanup ledger are logged and skipped instead of surfacing here; a
//! scoped session that cannot release what it bound reports
//! [`RemasterError::TeardownFailed`] so nothing later touches the tree.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

pub type Result<T, E = RemasterError> = std::result::Result<T, E>;

/// Exit status used when a run is cancelled by a termination signal.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Exit status used for every other fatal error.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Error)]
pub enum RemasterError {
    #[error("invalid input image '{}': {reason}", .path.display())]
    InvalidInput { path: PathBuf, reason: String },

    #[error("invalid output image '{}': {reason}", .path.display())]
    InvalidOutput { path: PathBuf, reason: String },

    #[error("failed to provision workspace directory '{}'", .path.display())]
    ProvisioningFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: `{program}` {}", describe_status(.status))]
    ExternalCommandFailed {
        program: String,
        /// `None` when the program could not be launched at all.
        status: Option<ExitStatus>,
        context: String,
    },

    #[error("this program must be run as root (effective uid {euid})")]
    PrivilegeRequired { euid: u32 },

    #[error("missing required host tools:\n{}", format_missing(.missing))]
    MissingTools { missing: Vec<(String, String)> },

    #[error("interrupted by termination signal during {during}")]
    Interrupted { during: String },

    #[error("{context}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {failures} teardown step(s) failed")]
    TeardownFailed { context: String, failures: usize },

    #[error("failed to write run manifest for '{}'", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl RemasterError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RemasterError::Interrupted { .. } => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RemasterError::Interrupted { .. })
    }
}

fn describe_status(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => format!("exited with {status}"),
        None => "could not be launched".to_string(),
    }
}

fn format_missing(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect::<Vec<_>>()
        .join("\n")
}
