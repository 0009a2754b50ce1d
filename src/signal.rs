//! Termination signal interception.
//!
//! SIGINT, SIGTERM and SIGHUP never kill the process outright. The first one
//! cancels the shared [`CancelToken`]; the pipeline observes it at stage
//! boundaries and [`crate::process::Cmd`] observes it while a child runs, so
//! the run unwinds through the same error path as any fatal abort and the
//! cleanup ledger drains before exit.
//!
//! Further signals while the first is still unwinding are only logged: the
//! process never exits from the handler, so teardown always runs to the end.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` if this call was the first.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Process-wide signal listener. Only one may be armed per process.
#[derive(Debug)]
pub struct SignalGuard {
    token: CancelToken,
    received: Arc<AtomicUsize>,
}

impl SignalGuard {
    /// Install the handler. It runs on a dedicated thread owned by `ctrlc`
    /// and only touches the token and the signal counter.
    pub fn arm(token: CancelToken) -> Result<Self> {
        let received = Arc::new(AtomicUsize::new(0));

        let handler_token = token.clone();
        let handler_received = Arc::clone(&received);
        ctrlc::set_handler(move || {
            let count = handler_received.fetch_add(1, Ordering::SeqCst) + 1;
            on_signal(&handler_token, count);
        })
        .context("installing termination signal handler")?;

        Ok(Self { token, received })
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Number of termination signals seen so far.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

fn on_signal(token: &CancelToken, count: usize) {
    if token.cancel() {
        warn!("Termination signal received; aborting after cleanup");
    } else {
        warn!(
            "Termination signal #{} received; cleanup already in progress",
            count
        );
    }
}
