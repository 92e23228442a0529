//! The registration primitive the controllers drive.
//!
//! A [`ServiceRegistrar`] places, starts, stops and removes helper artifacts.
//! Every mutating call takes the caller's [`AuthorizationGrant`] and refuses
//! grants that do not cover the bless right. [`inspect`](ServiceRegistrar::inspect)
//! reads ground truth and needs no grant.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use super::descriptor::DescriptorError;
use crate::authorization::{AuthorizationGrant, Right};
use crate::identity::{CodeIdentity, ServiceIdentity, ServiceLabel};

/// Generic failure code for errors without an OS error number.
pub const UNKNOWN_OS_CODE: i32 = -1;

/// Registrar failures.
#[derive(Debug, Error)]
pub enum RegistrarError {
    /// The grant does not cover the bless right.
    #[error("grant does not cover '{required}'")]
    Unauthorized {
        /// Right the operation needs.
        required: Right,
    },

    /// The binary to install does not hash to the expected identity.
    #[error("code identity mismatch: expected {expected}, found {found}")]
    IdentityMismatch {
        /// Expected digest.
        expected: CodeIdentity,
        /// Actual digest.
        found: CodeIdentity,
    },

    /// A filesystem operation failed.
    #[error("{context} ({}): {source}", path.display())]
    Io {
        /// What was being done.
        context: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The descriptor could not be read or written.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// Starting or stopping the helper process failed.
    #[error("launcher error: {reason}")]
    Launch {
        /// What went wrong.
        reason: String,
        /// OS error number, if any.
        code: Option<i32>,
    },
}

impl RegistrarError {
    /// Build an I/O error with context.
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// Returns the OS error number behind this failure, or
    /// [`UNKNOWN_OS_CODE`].
    #[must_use]
    pub fn os_code(&self) -> i32 {
        match self {
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(UNKNOWN_OS_CODE),
            Self::Descriptor(DescriptorError::Io { source, .. }) => {
                source.raw_os_error().unwrap_or(UNKNOWN_OS_CODE)
            },
            Self::Launch { code, .. } => code.unwrap_or(UNKNOWN_OS_CODE),
            _ => UNKNOWN_OS_CODE,
        }
    }
}

/// Ground-truth view of a helper's artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactStatus {
    /// Identity recorded in the descriptor, if a descriptor exists.
    pub descriptor_identity: Option<CodeIdentity>,
    /// Digest of the installed binary, if one exists.
    pub binary_identity: Option<CodeIdentity>,
    /// The helper process is running.
    pub running: bool,
}

impl ArtifactStatus {
    /// No artifact of any kind remains.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        self.descriptor_identity.is_none() && self.binary_identity.is_none() && !self.running
    }

    /// Descriptor and binary are both present and agree.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(
            (self.descriptor_identity, self.binary_identity),
            (Some(d), Some(b)) if d == b
        )
    }

    /// Describe what is left behind, for failure messages.
    #[must_use]
    pub fn remaining(&self) -> Vec<&'static str> {
        let mut left = Vec::new();
        if self.descriptor_identity.is_some() {
            left.push("descriptor");
        }
        if self.binary_identity.is_some() {
            left.push("binary");
        }
        if self.running {
            left.push("running process");
        }
        left
    }
}

/// Places and removes helper artifacts.
#[async_trait]
pub trait ServiceRegistrar: Send + Sync {
    /// Install and start the helper for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrarError`] on any failure; partial artifacts may
    /// remain.
    async fn register(
        &self,
        identity: &ServiceIdentity,
        grant: &AuthorizationGrant,
    ) -> Result<(), RegistrarError>;

    /// Start an installed helper that is not running, from its descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrarError`] if the descriptor is unreadable or the
    /// helper does not come up.
    async fn start(
        &self,
        label: &ServiceLabel,
        grant: &AuthorizationGrant,
    ) -> Result<(), RegistrarError>;

    /// Stop the running helper. Succeeds if it is not running.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrarError`] if the process could not be stopped.
    async fn stop(&self, label: &ServiceLabel, grant: &AuthorizationGrant)
    -> Result<(), RegistrarError>;

    /// Remove the descriptor. Succeeds if it is absent.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrarError`] if the descriptor could not be removed.
    async fn remove_descriptor(
        &self,
        label: &ServiceLabel,
        grant: &AuthorizationGrant,
    ) -> Result<(), RegistrarError>;

    /// Remove the installed binary. Succeeds if it is absent.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrarError`] if the binary could not be removed.
    async fn remove_binary(
        &self,
        label: &ServiceLabel,
        grant: &AuthorizationGrant,
    ) -> Result<(), RegistrarError>;

    /// Read the on-disk state of `label`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrarError`] if an artifact exists but cannot be read.
    async fn inspect(&self, label: &ServiceLabel) -> Result<ArtifactStatus, RegistrarError>;
}

/// Fail unless `grant` covers the bless right.
///
/// # Errors
///
/// Returns [`RegistrarError::Unauthorized`].
pub fn require_bless(grant: &AuthorizationGrant) -> Result<(), RegistrarError> {
    let required = Right::bless();
    if grant.covers(&required) {
        Ok(())
    } else {
        Err(RegistrarError::Unauthorized { required })
    }
}
