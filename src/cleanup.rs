//! LIFO ledger of teardown actions.
//!
//! Resources register their release as they are acquired. Draining runs the
//! actions newest-first so teardown mirrors acquisition, continues past any
//! action that fails, and empties the ledger so a second drain is a no-op.
//!
//! ```rust,ignore
//! let mut ledger = CleanupLedger::new();
//! ledger.register("remove workdir", move || remove_tree(&root));
//! ledger.register("unmount iso", move || unmount(&mount_point));
//! ledger.drain_all(); // unmount, then remove
//! ```

use anyhow::Result;
use tracing::{debug, info, warn};

type Teardown = Box<dyn FnOnce() -> Result<()> + Send>;

/// One registered teardown operation.
pub struct CleanupAction {
    label: String,
    teardown: Teardown,
}

impl CleanupAction {
    pub fn new<F>(label: impl Into<String>, teardown: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            label: label.into(),
            teardown: Box::new(teardown),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn run(self) -> Result<()> {
        (self.teardown)()
    }
}

impl std::fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupAction")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct CleanupLedger {
    actions: Vec<CleanupAction>,
}

impl CleanupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown. The most recent registration drains first.
    pub fn register<F>(&mut self, label: impl Into<String>, teardown: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.push(CleanupAction::new(label, teardown));
    }

    pub fn push(&mut self, action: CleanupAction) {
        debug!("Registered cleanup: {}", action.label());
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every registered action once, newest first.
    ///
    /// Failures are logged and skipped. Returns how many actions failed.
    pub fn drain_all(&mut self) -> usize {
        if self.actions.is_empty() {
            return 0;
        }

        info!("Running cleanup...");
        let mut failed = 0;
        while let Some(action) = self.actions.pop() {
            let label = action.label.clone();
            debug!("Cleanup: {}", label);
            if let Err(e) = action.run() {
                failed += 1;
                warn!("Cleanup step '{}' failed: {:#}", label, e);
            }
        }
        info!("Cleanup complete.");
        failed
    }
}

impl Drop for CleanupLedger {
    fn drop(&mut self) {
        self.drain_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Teardown) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |name: &'static str| -> Teardown {
            let sink = Arc::clone(&sink);
            Box::new(move || {
                sink.lock().unwrap().push(name);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_drains_in_reverse_registration_order() {
        let (log, make) = recorder();
        let mut ledger = CleanupLedger::new();
        ledger.register("a", make("A"));
        ledger.register("b", make("B"));
        ledger.register("c", make("C"));

        assert_eq!(ledger.drain_all(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_second_drain_is_noop() {
        let (log, make) = recorder();
        let mut ledger = CleanupLedger::new();
        ledger.register("a", make("A"));

        ledger.drain_all();
        assert!(ledger.is_empty());
        ledger.drain_all();

        assert_eq!(*log.lock().unwrap(), vec!["A"]);
    }

    #[test]
    fn test_failure_does_not_block_remaining_actions() {
        let (log, make) = recorder();
        let mut ledger = CleanupLedger::new();
        ledger.register("a", make("A"));
        ledger.register("broken", || bail!("umount: not mounted"));
        ledger.register("c", make("C"));

        assert_eq!(ledger.drain_all(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["C", "A"]);
    }

    #[test]
    fn test_drop_drains_remaining_actions() {
        let (log, make) = recorder();
        {
            let mut ledger = CleanupLedger::new();
            ledger.register("a", make("A"));
            ledger.register("b", make("B"));
        }
        assert_eq!(*log.lock().unwrap(), vec!["B", "A"]);
    }

    #[test]
    fn test_drop_after_drain_runs_nothing_twice() {
        let (log, make) = recorder();
        {
            let mut ledger = CleanupLedger::new();
            ledger.register("a", make("A"));
            ledger.drain_all();
        }
        assert_eq!(*log.lock().unwrap(), vec!["A"]);
    }
}
