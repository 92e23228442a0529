//! Uninstall controller.
//!
//! Uninstall runs four steps in order and keeps going past failures so that
//! as much as possible is removed in one pass:
//!
//! ```text
//! stop_service → remove_descriptor → remove_binary → verify_absent
//! ```
//!
//! Every step is idempotent, so re-running uninstall after a partial failure
//! (or on a system where nothing is installed) converges on `NotInstalled`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::lock::LifecycleLock;
use super::registrar::{RegistrarError, ServiceRegistrar};
use super::state::{InstallState, InstallStateCell};
use crate::authorization::{AuthorizationGrant, Right};
use crate::identity::{ServiceIdentity, ServiceLabel};

/// One step of an uninstall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallStep {
    /// Stop the running helper.
    StopService,
    /// Remove the service descriptor.
    RemoveDescriptor,
    /// Remove the helper binary.
    RemoveBinary,
    /// Confirm nothing is left behind.
    VerifyAbsent,
}

impl UninstallStep {
    /// All steps in execution order.
    pub const ALL: [Self; 4] = [
        Self::StopService,
        Self::RemoveDescriptor,
        Self::RemoveBinary,
        Self::VerifyAbsent,
    ];

    /// Stable step name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StopService => "stop_service",
            Self::RemoveDescriptor => "remove_descriptor",
            Self::RemoveBinary => "remove_binary",
            Self::VerifyAbsent => "verify_absent",
        }
    }
}

impl fmt::Display for UninstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Which step.
    pub step: UninstallStep,
    /// Why.
    pub reason: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.reason)
    }
}

/// Uninstall failures.
#[derive(Debug, Error)]
pub enum UninstallError {
    /// The grant does not cover the bless right. Nothing was touched.
    #[error("authorization rejected: grant does not cover '{required}'")]
    AuthorizationRejected {
        /// Right the uninstall needs.
        required: Right,
    },

    /// The cross-process lifecycle lock could not be taken.
    #[error("failed to take lifecycle lock: {0}")]
    Lock(#[source] std::io::Error),

    /// One or more steps failed. The first entry is the first failing step.
    #[error("uninstall failed at {}", describe(.failures))]
    StepsFailed {
        /// Failures in step order.
        failures: Vec<StepFailure>,
    },
}

impl UninstallError {
    /// Returns the first step that failed, if any step ran.
    #[must_use]
    pub fn failed_step(&self) -> Option<UninstallStep> {
        match self {
            Self::StepsFailed { failures } => failures.first().map(|f| f.step),
            _ => None,
        }
    }
}

fn describe(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Drives uninstalls through a [`ServiceRegistrar`].
pub struct UninstallController {
    registrar: Arc<dyn ServiceRegistrar>,
    state: Arc<InstallStateCell>,
    lock_path: Option<PathBuf>,
}

impl UninstallController {
    /// Create a controller sharing `state` with its install counterpart.
    #[must_use]
    pub fn new(registrar: Arc<dyn ServiceRegistrar>, state: Arc<InstallStateCell>) -> Self {
        Self {
            registrar,
            state,
            lock_path: None,
        }
    }

    /// Also take the cross-process lock at `path` for each uninstall.
    #[must_use]
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    /// Remove every artifact installed under `identity`'s label.
    ///
    /// Succeeds when nothing is installed. The grant is borrowed; releasing it
    /// stays with the caller.
    ///
    /// # Errors
    ///
    /// - [`UninstallError::AuthorizationRejected`] if the grant is for another
    ///   right
    /// - [`UninstallError::StepsFailed`] naming every failed step; state
    ///   becomes `Failed` with the first one
    pub async fn uninstall(
        &self,
        identity: &ServiceIdentity,
        grant: &AuthorizationGrant,
    ) -> Result<(), UninstallError> {
        let label = &identity.label;
        let required = Right::bless();
        if !grant.covers(&required) {
            warn!(%label, granted = %grant.right(), "Uninstall refused: grant does not cover bless right");
            return Err(UninstallError::AuthorizationRejected { required });
        }

        let _operation = self.state.begin_operation().await;
        let _lock = match &self.lock_path {
            Some(path) => Some(LifecycleLock::acquire(path).await.map_err(|e| {
                self.state
                    .set(InstallState::Failed(format!("failed to take lifecycle lock: {e}")));
                UninstallError::Lock(e)
            })?),
            None => None,
        };

        self.state.set(InstallState::Uninstalling);
        info!(%label, "Uninstalling helper");

        let mut failures = Vec::new();
        for step in UninstallStep::ALL {
            if let Err(reason) = self.run_step(step, label, grant).await {
                warn!(%label, %step, "Uninstall step failed: {reason}");
                failures.push(StepFailure { step, reason });
            }
        }

        match failures.first() {
            None => {
                self.state.set(InstallState::NotInstalled);
                info!(%label, "Helper uninstalled");
                Ok(())
            },
            Some(first) => {
                self.state.set(InstallState::Failed(first.to_string()));
                Err(UninstallError::StepsFailed { failures })
            },
        }
    }

    async fn run_step(
        &self,
        step: UninstallStep,
        label: &ServiceLabel,
        grant: &AuthorizationGrant,
    ) -> Result<(), String> {
        let result: Result<(), RegistrarError> = match step {
            UninstallStep::StopService => self.registrar.stop(label, grant).await,
            UninstallStep::RemoveDescriptor => self.registrar.remove_descriptor(label, grant).await,
            UninstallStep::RemoveBinary => self.registrar.remove_binary(label, grant).await,
            UninstallStep::VerifyAbsent => {
                let status = self.registrar.inspect(label).await.map_err(|e| e.to_string())?;
                if status.is_absent() {
                    return Ok(());
                }
                return Err(format!("still present: {}", status.remaining().join(", ")));
            },
        };
        result.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::authorization::tests::grant_for;
    use crate::install::fs_registrar::tests::fixture;
    use crate::install::registrar::ArtifactStatus;

    fn controller(registrar: Arc<dyn ServiceRegistrar>) -> (UninstallController, Arc<InstallStateCell>) {
        let state = Arc::new(InstallStateCell::new(InstallState::Installed));
        (UninstallController::new(registrar, state.clone()), state)
    }

    #[tokio::test]
    async fn test_uninstall_leaves_nothing_behind() {
        let fx = fixture();
        let grant = grant_for(&Right::bless());
        fx.registrar.register(&fx.identity, &grant).await.unwrap();

        let (controller, state) = controller(fx.registrar.clone());
        controller.uninstall(&fx.identity, &grant).await.unwrap();

        assert_eq!(state.current(), InstallState::NotInstalled);
        assert!(!fx.layout.binary_path(&fx.identity.label).exists());
        assert!(!fx.layout.descriptor_path(&fx.identity.label).exists());
        assert!(fx.registrar.inspect(&fx.identity.label).await.unwrap().is_absent());
    }

    #[tokio::test]
    async fn test_uninstall_when_absent_succeeds() {
        let fx = fixture();
        let (controller, state) = controller(fx.registrar.clone());
        let grant = grant_for(&Right::bless());

        controller.uninstall(&fx.identity, &grant).await.unwrap();
        controller.uninstall(&fx.identity, &grant).await.unwrap();
        assert_eq!(state.current(), InstallState::NotInstalled);
    }

    #[tokio::test]
    async fn test_wrong_right_rejected() {
        let fx = fixture();
        let (controller, state) = controller(fx.registrar.clone());

        let err = controller
            .uninstall(&fx.identity, &grant_for(&Right::new("privhelper.other")))
            .await
            .unwrap_err();
        assert!(matches!(err, UninstallError::AuthorizationRejected { .. }));
        assert_eq!(state.current(), InstallState::Installed);
    }

    /// Registrar whose descriptor removal fails until told otherwise.
    struct StubbornRegistrar {
        descriptor_present: AtomicBool,
        binary_present: AtomicBool,
        refuse_descriptor: AtomicBool,
    }

    #[async_trait]
    impl ServiceRegistrar for StubbornRegistrar {
        async fn register(
            &self,
            _identity: &ServiceIdentity,
            _grant: &AuthorizationGrant,
        ) -> Result<(), RegistrarError> {
            Ok(())
        }

        async fn start(&self, _label: &ServiceLabel, _grant: &AuthorizationGrant) -> Result<(), RegistrarError> {
            Ok(())
        }

        async fn stop(&self, _label: &ServiceLabel, _grant: &AuthorizationGrant) -> Result<(), RegistrarError> {
            Ok(())
        }

        async fn remove_descriptor(
            &self,
            _label: &ServiceLabel,
            _grant: &AuthorizationGrant,
        ) -> Result<(), RegistrarError> {
            if self.refuse_descriptor.load(Ordering::SeqCst) {
                return Err(RegistrarError::io(
                    "remove descriptor",
                    "/etc/privhelper/daemons/x.toml",
                    std::io::Error::from_raw_os_error(1),
                ));
            }
            self.descriptor_present.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn remove_binary(
            &self,
            _label: &ServiceLabel,
            _grant: &AuthorizationGrant,
        ) -> Result<(), RegistrarError> {
            self.binary_present.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn inspect(&self, _label: &ServiceLabel) -> Result<ArtifactStatus, RegistrarError> {
            let id = crate::identity::CodeIdentity::of_bytes(b"helper");
            Ok(ArtifactStatus {
                descriptor_identity: self.descriptor_present.load(Ordering::SeqCst).then_some(id),
                binary_identity: self.binary_present.load(Ordering::SeqCst).then_some(id),
                running: false,
            })
        }
    }

    #[tokio::test]
    async fn test_failing_step_is_named_and_retry_converges() {
        let registrar = Arc::new(StubbornRegistrar {
            descriptor_present: AtomicBool::new(true),
            binary_present: AtomicBool::new(true),
            refuse_descriptor: AtomicBool::new(true),
        });
        let (controller, state) = controller(registrar.clone());
        let identity = ServiceIdentity::new(
            ServiceLabel::new("com.example.helper").unwrap(),
            crate::identity::CodeIdentity::of_bytes(b"helper"),
        );
        let grant = grant_for(&Right::bless());

        let err = controller.uninstall(&identity, &grant).await.unwrap_err();
        assert_eq!(err.failed_step(), Some(UninstallStep::RemoveDescriptor));
        let UninstallError::StepsFailed { failures } = &err else {
            panic!("expected StepsFailed");
        };
        // Later steps still ran; verification then saw the leftover descriptor.
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[1].step, UninstallStep::VerifyAbsent);
        assert!(!registrar.binary_present.load(Ordering::SeqCst));
        match state.current() {
            InstallState::Failed(reason) => assert!(reason.starts_with("remove_descriptor")),
            other => panic!("expected Failed, got {other:?}"),
        }

        registrar.refuse_descriptor.store(false, Ordering::SeqCst);
        controller.uninstall(&identity, &grant).await.unwrap();
        assert_eq!(state.current(), InstallState::NotInstalled);
    }

    #[test]
    fn test_step_names() {
        let names: Vec<_> = UninstallStep::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            ["stop_service", "remove_descriptor", "remove_binary", "verify_absent"]
        );
    }
}
