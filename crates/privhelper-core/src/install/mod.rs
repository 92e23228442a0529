//! Helper install lifecycle.
//!
//! [`HelperLifecycle`] ties together the shared [`InstallStateCell`], the
//! [`RegistrationController`] and the [`UninstallController`] over one
//! [`ServiceRegistrar`]. Install and uninstall hold the same operation guard,
//! so they never interleave inside a process; the optional lock file extends
//! that across processes.
//!
//! Status is always recomputed from the registrar's
//! [`inspect`](ServiceRegistrar::inspect), never from a cached flag.

mod descriptor;
mod fs_registrar;
mod layout;
mod lock;
mod registrar;
mod registration;
mod state;
mod uninstall;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

pub use descriptor::{AcceptRules, DescriptorError, ServiceDescriptor};
pub use fs_registrar::{FsServiceRegistrar, ProcessLauncher, ServiceLauncher};
pub use layout::ServiceLayout;
pub use lock::LifecycleLock;
pub use registrar::{ArtifactStatus, RegistrarError, ServiceRegistrar, UNKNOWN_OS_CODE, require_bless};
pub use registration::{InstallError, RegistrationController};
pub use state::{InstallState, InstallStateCell};
pub use uninstall::{StepFailure, UninstallController, UninstallError, UninstallStep};

use crate::authorization::AuthorizationGrant;
use crate::identity::ServiceIdentity;

/// Install, uninstall and status for one registrar.
pub struct HelperLifecycle {
    registrar: Arc<dyn ServiceRegistrar>,
    state: Arc<InstallStateCell>,
    registration: RegistrationController,
    uninstall: UninstallController,
}

impl HelperLifecycle {
    /// Create a lifecycle over `registrar`, starting at `NotInstalled`.
    #[must_use]
    pub fn new(registrar: Arc<dyn ServiceRegistrar>) -> Self {
        let state = Arc::new(InstallStateCell::default());
        Self {
            registration: RegistrationController::new(registrar.clone(), state.clone()),
            uninstall: UninstallController::new(registrar.clone(), state.clone()),
            registrar,
            state,
        }
    }

    /// Serialize operations across processes through the lock at `path`.
    #[must_use]
    pub fn with_lock_file(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            registration: self.registration.with_lock_file(path.clone()),
            uninstall: self.uninstall.with_lock_file(path),
            ..self
        }
    }

    /// See [`RegistrationController::install`].
    ///
    /// # Errors
    ///
    /// Returns [`InstallError`] as documented there.
    pub async fn install(
        &self,
        identity: &ServiceIdentity,
        grant: &AuthorizationGrant,
    ) -> Result<(), InstallError> {
        self.registration.install(identity, grant).await
    }

    /// See [`UninstallController::uninstall`].
    ///
    /// # Errors
    ///
    /// Returns [`UninstallError`] as documented there.
    pub async fn uninstall(
        &self,
        identity: &ServiceIdentity,
        grant: &AuthorizationGrant,
    ) -> Result<(), UninstallError> {
        self.uninstall.uninstall(identity, grant).await
    }

    /// Current state as seen by this process, without touching disk.
    #[must_use]
    pub fn state(&self) -> InstallState {
        self.state.current()
    }

    /// Follow state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<InstallState> {
        self.state.subscribe()
    }

    /// Derive the state of `identity` from the artifacts on disk.
    ///
    /// While an install or uninstall is running the transitional state is
    /// returned as is. Otherwise the shared state is updated to match what
    /// was found.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrarError`] if an artifact exists but cannot be read.
    pub async fn status(&self, identity: &ServiceIdentity) -> Result<InstallState, RegistrarError> {
        let Some(_operation) = self.state.try_begin_operation() else {
            return Ok(self.state.current());
        };
        let artifacts = self.registrar.inspect(&identity.label).await?;
        let state = classify(&artifacts, identity);
        debug!(%identity, ?artifacts, %state, "Inspected helper status");
        self.state.set(state.clone());
        Ok(state)
    }
}

/// Map inspected artifacts to an [`InstallState`] for `identity`.
#[must_use]
pub fn classify(artifacts: &ArtifactStatus, identity: &ServiceIdentity) -> InstallState {
    let expected = identity.code_identity;
    match (artifacts.descriptor_identity, artifacts.binary_identity) {
        (None, None) if artifacts.running => {
            InstallState::Failed("helper process running without installed artifacts".to_string())
        },
        (None, None) => InstallState::NotInstalled,
        (Some(d), Some(b)) if d == expected && b == expected && artifacts.running => {
            InstallState::Installed
        },
        (Some(d), Some(b)) if d == expected && b == expected => InstallState::Stopped,
        (_, Some(found)) if found != expected => InstallState::Failed(format!(
            "installed binary {} does not match expected {}",
            found.short(),
            expected.short()
        )),
        (Some(_), Some(_)) => {
            InstallState::Failed("descriptor does not match installed binary".to_string())
        },
        (Some(_), None) => InstallState::Failed("descriptor present without binary".to_string()),
        (None, Some(_)) => InstallState::Failed("binary present without descriptor".to_string()),
    }
}
