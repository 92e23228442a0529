//! Registration controller: `NotInstalled | Stopped | Failed → Installing → Installed`.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::lock::LifecycleLock;
use super::registrar::{RegistrarError, ServiceRegistrar, UNKNOWN_OS_CODE};
use super::state::{InstallState, InstallStateCell};
use crate::authorization::{AuthorizationGrant, Right};
use crate::identity::{CodeIdentity, ServiceIdentity};

/// Install failures.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The grant does not cover the bless right. State is unchanged.
    #[error("authorization rejected: grant does not cover '{required}'")]
    AuthorizationRejected {
        /// Right the install needs.
        required: Right,
    },

    /// The registration primitive failed.
    #[error("registration failed (code {code}): {reason}")]
    RegistrationFailed {
        /// OS error number, or `-1` when none applies.
        code: i32,
        /// What went wrong.
        reason: String,
    },

    /// A helper with a different code identity is installed under the label.
    #[error("identity mismatch: expected {expected}, found {found}")]
    IdentityMismatch {
        /// Identity being installed.
        expected: CodeIdentity,
        /// Identity on disk.
        found: CodeIdentity,
    },
}

impl From<RegistrarError> for InstallError {
    fn from(err: RegistrarError) -> Self {
        match err {
            RegistrarError::Unauthorized { required } => Self::AuthorizationRejected { required },
            RegistrarError::IdentityMismatch { expected, found } => {
                Self::IdentityMismatch { expected, found }
            },
            other => Self::RegistrationFailed {
                code: other.os_code(),
                reason: other.to_string(),
            },
        }
    }
}

/// Drives installs through a [`ServiceRegistrar`].
pub struct RegistrationController {
    registrar: Arc<dyn ServiceRegistrar>,
    state: Arc<InstallStateCell>,
    lock_path: Option<PathBuf>,
}

impl RegistrationController {
    /// Create a controller sharing `state` with its uninstall counterpart.
    #[must_use]
    pub fn new(registrar: Arc<dyn ServiceRegistrar>, state: Arc<InstallStateCell>) -> Self {
        Self {
            registrar,
            state,
            lock_path: None,
        }
    }

    /// Also take the cross-process lock at `path` for each install.
    #[must_use]
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    /// Install the helper for `identity` using `grant`.
    ///
    /// Installing an identity that is already installed and running is a
    /// no-op success. If it is installed but not running it is started again
    /// without touching the artifacts. A different identity under the same
    /// label fails with [`InstallError::IdentityMismatch`].
    ///
    /// # Errors
    ///
    /// - [`InstallError::AuthorizationRejected`] if the grant is for another
    ///   right (state unchanged)
    /// - [`InstallError::IdentityMismatch`] if another helper owns the label
    /// - [`InstallError::RegistrationFailed`] if placing or starting the
    ///   helper fails (state becomes `Failed`)
    pub async fn install(
        &self,
        identity: &ServiceIdentity,
        grant: &AuthorizationGrant,
    ) -> Result<(), InstallError> {
        let required = Right::bless();
        if !grant.covers(&required) {
            warn!(
                label = %identity.label,
                granted = %grant.right(),
                "Install refused: grant does not cover bless right"
            );
            return Err(InstallError::AuthorizationRejected { required });
        }

        let _operation = self.state.begin_operation().await;
        let _lock = match &self.lock_path {
            Some(path) => Some(LifecycleLock::acquire(path).await.map_err(|e| {
                self.fail(InstallError::RegistrationFailed {
                    code: e.raw_os_error().unwrap_or(UNKNOWN_OS_CODE),
                    reason: format!("failed to take lifecycle lock: {e}"),
                })
            })?),
            None => None,
        };

        let status = self
            .registrar
            .inspect(&identity.label)
            .await
            .map_err(|e| self.fail(e.into()))?;

        if let Some(found) = status.binary_identity {
            if found != identity.code_identity {
                return Err(self.fail(InstallError::IdentityMismatch {
                    expected: identity.code_identity,
                    found,
                }));
            }
            if status.is_complete() && status.running {
                info!(%identity, "Helper already installed");
                self.state.set(InstallState::Installed);
                return Ok(());
            }
            if status.is_complete() {
                return self.restart(identity, grant).await;
            }
            debug!(%identity, "Repairing partial install");
        }

        self.state.set(InstallState::Installing);
        info!(%identity, "Installing helper");

        match self.registrar.register(identity, grant).await {
            Ok(()) => {
                self.state.set(InstallState::Installed);
                info!(%identity, "Helper installed");
                Ok(())
            },
            Err(e) => {
                warn!(%identity, "Helper install failed: {e}");
                Err(self.fail(e.into()))
            },
        }
    }

    /// Artifacts are in place but nothing is serving them.
    async fn restart(
        &self,
        identity: &ServiceIdentity,
        grant: &AuthorizationGrant,
    ) -> Result<(), InstallError> {
        self.state.set(InstallState::Installing);
        info!(%identity, "Helper installed but not running, starting it");
        match self.registrar.start(&identity.label, grant).await {
            Ok(()) => {
                self.state.set(InstallState::Installed);
                info!(%identity, "Helper restarted");
                Ok(())
            },
            Err(e) => {
                warn!(%identity, "Helper restart failed: {e}");
                Err(self.fail(e.into()))
            },
        }
    }

    fn fail(&self, err: InstallError) -> InstallError {
        self.state.set(InstallState::Failed(err.to_string()));
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::tests::grant_for;
    use crate::install::fs_registrar::ServiceLauncher;
    use crate::install::fs_registrar::tests::fixture;

    fn controller(registrar: Arc<dyn ServiceRegistrar>) -> (RegistrationController, Arc<InstallStateCell>) {
        let state = Arc::new(InstallStateCell::default());
        (RegistrationController::new(registrar, state.clone()), state)
    }

    #[tokio::test]
    async fn test_install_reaches_installed() {
        let fx = fixture();
        let (controller, state) = controller(fx.registrar.clone());
        let mut rx = state.subscribe();

        controller
            .install(&fx.identity, &grant_for(&Right::bless()))
            .await
            .unwrap();

        assert_eq!(state.current(), InstallState::Installed);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), InstallState::Installed);
    }

    #[tokio::test]
    async fn test_wrong_right_rejected_without_state_change() {
        let fx = fixture();
        let (controller, state) = controller(fx.registrar.clone());

        let err = controller
            .install(&fx.identity, &grant_for(&Right::new("privhelper.other")))
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::AuthorizationRejected { .. }));
        assert_eq!(state.current(), InstallState::NotInstalled);
        assert!(!fx.layout.binary_path(&fx.identity.label).exists());
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let fx = fixture();
        let (controller, state) = controller(fx.registrar.clone());

        controller
            .install(&fx.identity, &grant_for(&Right::bless()))
            .await
            .unwrap();
        let first_descriptor =
            std::fs::read_to_string(fx.layout.descriptor_path(&fx.identity.label)).unwrap();

        controller
            .install(&fx.identity, &grant_for(&Right::bless()))
            .await
            .unwrap();
        let second_descriptor =
            std::fs::read_to_string(fx.layout.descriptor_path(&fx.identity.label)).unwrap();

        assert_eq!(state.current(), InstallState::Installed);
        assert_eq!(first_descriptor, second_descriptor, "second install rewrote the descriptor");
        assert_eq!(std::fs::read_dir(&fx.layout.binary_dir).unwrap().count(), 1);
        assert_eq!(std::fs::read_dir(&fx.layout.descriptor_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_install_restarts_a_dead_helper() {
        let fx = fixture();
        let (controller, state) = controller(fx.registrar.clone());
        let grant = grant_for(&Right::bless());
        controller.install(&fx.identity, &grant).await.unwrap();
        let descriptor =
            std::fs::read_to_string(fx.layout.descriptor_path(&fx.identity.label)).unwrap();

        // Crash: artifacts stay, process is gone.
        fx.launcher.stop(&fx.identity.label).await.unwrap();

        controller.install(&fx.identity, &grant).await.unwrap();

        assert_eq!(state.current(), InstallState::Installed);
        assert_eq!(fx.launcher.starts.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(fx.registrar.inspect(&fx.identity.label).await.unwrap().running);
        assert_eq!(
            std::fs::read_to_string(fx.layout.descriptor_path(&fx.identity.label)).unwrap(),
            descriptor,
            "restart must not rewrite the descriptor"
        );
    }

    #[tokio::test]
    async fn test_different_identity_is_mismatch() {
        let fx = fixture();
        let (controller, state) = controller(fx.registrar.clone());
        controller
            .install(&fx.identity, &grant_for(&Right::bless()))
            .await
            .unwrap();

        let other = ServiceIdentity::new(
            fx.identity.label.clone(),
            CodeIdentity::of_bytes(b"a different helper"),
        );
        let err = controller
            .install(&other, &grant_for(&Right::bless()))
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::IdentityMismatch { .. }));
        assert!(matches!(state.current(), InstallState::Failed(_)));
    }

    #[tokio::test]
    async fn test_registrar_failure_marks_failed() {
        let fx = fixture();
        let (controller, state) = controller(fx.registrar.clone());
        // Identity that the bundle binary does not hash to.
        let wrong = ServiceIdentity::new(
            fx.identity.label.clone(),
            CodeIdentity::of_bytes(b"not the bundle"),
        );

        let err = controller
            .install(&wrong, &grant_for(&Right::bless()))
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::IdentityMismatch { .. }));
        match state.current() {
            InstallState::Failed(reason) => assert!(reason.contains("identity mismatch")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lock_file_is_taken() {
        let fx = fixture();
        let lock_path = fx.layout.lock_path(&fx.identity.label);
        let (controller, _state) = controller(fx.registrar.clone());
        let controller = controller.with_lock_file(&lock_path);

        controller
            .install(&fx.identity, &grant_for(&Right::bless()))
            .await
            .unwrap();

        assert!(lock_path.exists());
        assert!(LifecycleLock::try_acquire(&lock_path).is_ok());
    }

    #[test]
    fn test_registrar_error_mapping() {
        let err: InstallError = RegistrarError::Launch {
            reason: "spawn failed".into(),
            code: Some(2),
        }
        .into();
        assert!(matches!(err, InstallError::RegistrationFailed { code: 2, .. }));
    }
}
