//! The "current process" slot of a runner, used for cancellation.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug)]
struct TrackedProcess {
    id: u64,
    command: String,
    pid: Option<u32>,
    cancel: Arc<Notify>,
}

/// Tracks the single command a [`ProcessRunner`](super::ProcessRunner) is
/// currently running and lets another task cancel it.
///
/// The handle is owned by one runner and shared through `Arc`; there is no
/// process-wide registry.
#[derive(Debug, Default)]
pub struct ProcessHandle {
    current: Mutex<Option<TrackedProcess>>,
    next_id: Mutex<u64>,
}

impl ProcessHandle {
    /// Creates an empty handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly spawned process and returns its tracking id and
    /// the notifier its run loop waits on.
    pub(crate) fn track(&self, command: &str, pid: Option<u32>) -> (u64, Arc<Notify>) {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let cancel = Arc::new(Notify::new());
        let previous = self.current.lock().replace(TrackedProcess {
            id,
            command: command.to_string(),
            pid,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            debug!(command = %previous.command, "Replacing tracked process");
        }
        (id, cancel)
    }

    /// Clears the slot if it still holds the process with `id`.
    pub(crate) fn release(&self, id: u64) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|p| p.id == id) {
            *current = None;
        }
    }

    /// Requests termination of the current process.
    ///
    /// The runner sends a graceful terminate signal to the process group and
    /// escalates to a forceful kill after the grace period. Returns false when
    /// nothing is running.
    pub fn cancel(&self) -> bool {
        let current = self.current.lock();
        match current.as_ref() {
            Some(process) => {
                info!(command = %process.command, pid = ?process.pid, "Cancelling running process");
                process.cancel.notify_one();
                true
            }
            None => false,
        }
    }

    /// Returns true while a process is tracked.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Returns the command line of the tracked process.
    #[must_use]
    pub fn current_command(&self) -> Option<String> {
        self.current.lock().as_ref().map(|p| p.command.clone())
    }
}
