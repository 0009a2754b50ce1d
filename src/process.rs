//! Synchronous external command execution.
//!
//! Every privileged tool the pipeline touches (mount, cp, unsquashfs,
//! xorriso, ...) goes through [`Cmd`]. Output is never captured: the child
//! inherits our stdout and stderr so the operator sees tool diagnostics in
//! real time.
//!
//! # Example
//!
//! ```rust,ignore
//! use iso_remaster::process::Cmd;
//!
//! Cmd::new("cp")
//!     .args(["-a"])
//!     .arg_path(&source)
//!     .arg_path(&dest)
//!     .error_msg("copying image contents")
//!     .run()?;
//! ```

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{RemasterError, Result};
use crate::signal::CancelToken;

/// How often a running child is checked against the cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Check whether a program can be found on `PATH`.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Builder for one external program invocation.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
    cancel: Option<CancelToken>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
            cancel: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Context attached to the failure if the command does not succeed.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the exit status instead of failing on a non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Kill the child and fail with `Interrupted` once `token` is cancelled.
    pub fn cancel_on(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Render the invocation the way it is logged.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Run to completion, blocking the calling thread.
    pub fn run(self) -> Result<ExitStatus> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(RemasterError::Interrupted {
                    during: self.program.clone(),
                });
            }
        }

        info!("Running: {}", self.display());

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                debug!("spawning {} failed: {}", self.program, e);
                return Err(self.failure(None));
            }
        };

        let status = match self.wait(&mut child) {
            Ok(status) => status,
            Err(e) => {
                // The child may still be alive if waiting itself failed.
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        if status.success() || self.allow_fail {
            if !status.success() {
                debug!("{} exited with {} (allowed)", self.program, status);
            }
            return Ok(status);
        }

        Err(self.failure(Some(status)))
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus> {
        let Some(token) = &self.cancel else {
            return child.wait().map_err(|e| {
                debug!("waiting on {} failed: {}", self.program, e);
                self.failure(None)
            });
        };

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    debug!("polling {} failed: {}", self.program, e);
                    return Err(self.failure(None));
                }
            }

            if token.is_cancelled() {
                warn!("Cancellation requested; killing {}", self.program);
                if let Err(e) = child.kill() {
                    debug!("kill {} failed: {}", self.program, e);
                }
                let _ = child.wait();
                return Err(RemasterError::Interrupted {
                    during: self.program.clone(),
                });
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    fn failure(&self, status: Option<ExitStatus>) -> RemasterError {
        RemasterError::ExternalCommandFailed {
            program: self.program.clone(),
            status,
            context: self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("running {}", self.program)),
        }
    }
}
