//! Install state and the cell that serializes lifecycle operations.

use std::fmt;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, watch};

/// Lifecycle state of a helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum InstallState {
    /// No helper artifacts are present.
    NotInstalled,
    /// An install is in progress.
    Installing,
    /// Descriptor and binary are present with the expected identity and the
    /// helper is running.
    Installed,
    /// Installed, but the helper process is not running. Install restarts
    /// it.
    Stopped,
    /// An uninstall is in progress.
    Uninstalling,
    /// The last operation failed, or the on-disk state is inconsistent.
    Failed(String),
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInstalled => write!(f, "not installed"),
            Self::Installing => write!(f, "installing"),
            Self::Installed => write!(f, "installed"),
            Self::Stopped => write!(f, "installed, not running"),
            Self::Uninstalling => write!(f, "uninstalling"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Shared install state plus the process-wide operation lock.
///
/// Controllers hold the guard from [`begin_operation`](Self::begin_operation)
/// for the whole of an install or uninstall, so the two never interleave.
/// Observers follow transitions through [`subscribe`](Self::subscribe).
#[derive(Debug)]
pub struct InstallStateCell {
    tx: watch::Sender<InstallState>,
    operation: Mutex<()>,
}

impl InstallStateCell {
    /// Create a cell starting at `initial`.
    #[must_use]
    pub fn new(initial: InstallState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            operation: Mutex::new(()),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn current(&self) -> InstallState {
        self.tx.borrow().clone()
    }

    /// Subscribe to state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<InstallState> {
        self.tx.subscribe()
    }

    /// Wait for exclusive use of the lifecycle.
    pub async fn begin_operation(&self) -> MutexGuard<'_, ()> {
        self.operation.lock().await
    }

    /// Returns the guard if no operation is running.
    #[must_use]
    pub fn try_begin_operation(&self) -> Option<MutexGuard<'_, ()>> {
        self.operation.try_lock().ok()
    }

    pub(crate) fn set(&self, state: InstallState) {
        self.tx.send_replace(state);
    }
}

impl Default for InstallStateCell {
    fn default() -> Self {
        Self::new(InstallState::NotInstalled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let cell = InstallStateCell::default();
        let mut rx = cell.subscribe();

        cell.set(InstallState::Installing);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), InstallState::Installing);

        cell.set(InstallState::Installed);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), InstallState::Installed);
        assert_eq!(cell.current(), InstallState::Installed);
    }

    #[tokio::test]
    async fn test_operations_are_exclusive() {
        let cell = InstallStateCell::default();
        let guard = cell.begin_operation().await;
        assert!(cell.try_begin_operation().is_none());
        drop(guard);
        assert!(cell.try_begin_operation().is_some());
    }

    #[test]
    fn test_failed_state_serializes_reason() {
        let rendered = toml::Value::try_from(InstallState::Failed("stop_service: busy".into()))
            .unwrap()
            .to_string();
        assert!(rendered.contains("failed"));
        assert!(rendered.contains("stop_service: busy"));
    }
}
