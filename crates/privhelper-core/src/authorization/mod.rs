//! Credential negotiation: obtaining scoped, OS-verified consent.
//!
//! The [`CredentialNegotiator`] asks a [`TrustStore`] for an authorization
//! covering one [`Right`]. The result is an [`AuthorizationGrant`], an RAII
//! handle that frees the underlying authorization exactly once.
//!
//! ```text
//! CredentialNegotiator::acquire_grant(right, interactive)
//!        │
//!        ▼
//!   TrustStore::create_authorization(right, flags) ──► GrantHandle
//!        │
//!        ▼
//!   AuthorizationGrant { right, handle }  ── drop / release ──►
//!                                   TrustStore::free_authorization(handle)
//! ```
//!
//! # Invariants
//!
//! - A grant covers exactly the right it was requested for
//! - A grant is freed exactly once, on every exit path
//! - Non-interactive acquisition never prompts; it fails with
//!   [`AuthError::UserInteractionRequired`] when consent would be needed

mod policy;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

pub use policy::{
    AuthorizationRule, AuthorizationRules, CallerInfo, Consent, ConsentPrompt, ConsentRequest,
    PolicyTrustStore, RuleDecision, TerminalPrompt,
};

/// Identifier of an authorization right.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Right(String);

impl Right {
    /// The right required to install or remove a privileged helper.
    pub const BLESS_PRIVILEGED_HELPER: &'static str = "privhelper.service.bless";

    /// Create a right from its identifier.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The right required to install or remove a privileged helper.
    #[must_use]
    pub fn bless() -> Self {
        Self::new(Self::BLESS_PRIVILEGED_HELPER)
    }

    /// Returns the right identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Flags passed to the trust store when creating an authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct AuthorizationFlags {
    /// The trust store may prompt the user.
    pub interaction_allowed: bool,
    /// Obtain the right now rather than on first use.
    pub pre_authorize: bool,
    /// The right may be gained rather than only confirmed as already held.
    pub extend_rights: bool,
}

impl AuthorizationFlags {
    /// Flags for an interactive acquisition (all set).
    #[must_use]
    pub const fn interactive() -> Self {
        Self {
            interaction_allowed: true,
            pre_authorize: true,
            extend_rights: true,
        }
    }

    /// Flags for a non-interactive acquisition.
    #[must_use]
    pub const fn non_interactive() -> Self {
        Self {
            interaction_allowed: false,
            pre_authorize: true,
            extend_rights: true,
        }
    }
}

/// Opaque handle to an authorization held by a [`TrustStore`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct GrantHandle(u64);

impl GrantHandle {
    /// Wrap a store-specific handle value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the store-specific handle value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Credential negotiation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The trust store refused the right.
    #[error("authorization for '{right}' denied")]
    Denied {
        /// Requested right.
        right: Right,
    },

    /// Consent requires a prompt but interaction was not allowed.
    #[error("authorization for '{right}' requires user interaction")]
    UserInteractionRequired {
        /// Requested right.
        right: Right,
    },

    /// The trust store could not be consulted.
    #[error("authorization system unavailable: {reason}")]
    SystemUnavailable {
        /// What went wrong.
        reason: String,
    },

    /// The user dismissed the consent prompt.
    #[error("authorization cancelled by user")]
    Cancelled,
}

impl AuthError {
    /// Returns `true` if asking again (possibly interactively) may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UserInteractionRequired { .. } | Self::SystemUnavailable { .. } | Self::Cancelled
        )
    }
}

/// The OS-level authorization service.
///
/// Implementations hand out handles for rights and take them back. They are
/// shared behind an `Arc` and must be safe to call from any thread.
pub trait TrustStore: Send + Sync {
    /// Create an authorization covering `right`.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] describing why consent was not obtained.
    fn create_authorization(
        &self,
        right: &Right,
        flags: AuthorizationFlags,
    ) -> Result<GrantHandle, AuthError>;

    /// Free an authorization previously returned by `create_authorization`.
    fn free_authorization(&self, handle: GrantHandle);
}

/// Proof of consent for exactly one [`Right`].
///
/// Dropping the grant frees it. [`release`](Self::release) frees it early;
/// it consumes the grant so a second free is impossible.
pub struct AuthorizationGrant {
    right: Right,
    handle: Option<GrantHandle>,
    store: Arc<dyn TrustStore>,
}

impl AuthorizationGrant {
    /// Returns the right this grant covers.
    #[must_use]
    pub const fn right(&self) -> &Right {
        &self.right
    }

    /// Returns `true` if this grant covers `right`.
    #[must_use]
    pub fn covers(&self, right: &Right) -> bool {
        self.handle.is_some() && self.right == *right
    }

    /// Free the authorization now.
    pub fn release(mut self) {
        self.free();
    }

    fn free(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(right = %self.right, handle = handle.raw(), "Releasing authorization");
            self.store.free_authorization(handle);
        }
    }
}

impl Drop for AuthorizationGrant {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for AuthorizationGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationGrant")
            .field("right", &self.right)
            .field("held", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

/// Negotiates grants with a [`TrustStore`].
#[derive(Clone)]
pub struct CredentialNegotiator {
    store: Arc<dyn TrustStore>,
}

impl CredentialNegotiator {
    /// Create a negotiator over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self { store }
    }

    /// Acquire a grant covering `right`.
    ///
    /// With `interactive == false` the trust store is told not to prompt;
    /// a right that needs consent then fails with
    /// [`AuthError::UserInteractionRequired`].
    ///
    /// This call may block on a consent prompt. Async callers should run it
    /// on a blocking thread.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Denied`], [`AuthError::UserInteractionRequired`],
    /// [`AuthError::SystemUnavailable`] or [`AuthError::Cancelled`].
    pub fn acquire_grant(
        &self,
        right: &Right,
        interactive: bool,
    ) -> Result<AuthorizationGrant, AuthError> {
        let flags = if interactive {
            AuthorizationFlags::interactive()
        } else {
            AuthorizationFlags::non_interactive()
        };

        let handle = self.store.create_authorization(right, flags)?;
        info!(right = %right, interactive, "Authorization granted");

        Ok(AuthorizationGrant {
            right: right.clone(),
            handle: Some(handle),
            store: Arc::clone(&self.store),
        })
    }
}

impl fmt::Debug for CredentialNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialNegotiator").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Trust store that records every create and free call.
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub(crate) outcome: Mutex<Option<AuthError>>,
        pub(crate) created: Mutex<Vec<(Right, AuthorizationFlags)>>,
        pub(crate) freed: Mutex<Vec<u64>>,
    }

    impl RecordingStore {
        pub(crate) fn failing(err: AuthError) -> Self {
            Self {
                outcome: Mutex::new(Some(err)),
                ..Self::default()
            }
        }
    }

    impl TrustStore for RecordingStore {
        fn create_authorization(
            &self,
            right: &Right,
            flags: AuthorizationFlags,
        ) -> Result<GrantHandle, AuthError> {
            if let Some(err) = self.outcome.lock().unwrap().clone() {
                return Err(err);
            }
            let mut created = self.created.lock().unwrap();
            created.push((right.clone(), flags));
            Ok(GrantHandle::new(created.len() as u64))
        }

        fn free_authorization(&self, handle: GrantHandle) {
            self.freed.lock().unwrap().push(handle.raw());
        }
    }

    /// Grant over a permissive in-memory store, for controller tests.
    pub(crate) fn grant_for(right: &Right) -> AuthorizationGrant {
        CredentialNegotiator::new(Arc::new(RecordingStore::default()))
            .acquire_grant(right, true)
            .unwrap()
    }

    #[test]
    fn test_grant_covers_only_requested_right() {
        let grant = grant_for(&Right::bless());
        assert!(grant.covers(&Right::bless()));
        assert!(!grant.covers(&Right::new("privhelper.other")));
    }

    #[test]
    fn test_grant_freed_once_on_drop() {
        let store = Arc::new(RecordingStore::default());
        let negotiator = CredentialNegotiator::new(store.clone());

        let grant = negotiator.acquire_grant(&Right::bless(), true).unwrap();
        drop(grant);

        assert_eq!(*store.freed.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_release_frees_once() {
        let store = Arc::new(RecordingStore::default());
        let negotiator = CredentialNegotiator::new(store.clone());

        let grant = negotiator.acquire_grant(&Right::bless(), true).unwrap();
        grant.release();

        assert_eq!(store.freed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_grant_freed_on_early_return() {
        fn use_grant(negotiator: &CredentialNegotiator) -> Result<(), &'static str> {
            let _grant = negotiator.acquire_grant(&Right::bless(), true).unwrap();
            Err("bail")
        }

        let store = Arc::new(RecordingStore::default());
        let negotiator = CredentialNegotiator::new(store.clone());
        assert!(use_grant(&negotiator).is_err());
        assert_eq!(store.freed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_flags_follow_interactive_mode() {
        let store = Arc::new(RecordingStore::default());
        let negotiator = CredentialNegotiator::new(store.clone());

        let _a = negotiator.acquire_grant(&Right::bless(), true).unwrap();
        let _b = negotiator.acquire_grant(&Right::bless(), false).unwrap();

        let created = store.created.lock().unwrap();
        assert_eq!(created[0].1, AuthorizationFlags::interactive());
        assert!(!created[1].1.interaction_allowed);
        assert!(created[1].1.extend_rights);
    }

    #[test]
    fn test_store_failure_propagates_without_free() {
        let store = Arc::new(RecordingStore::failing(AuthError::Cancelled));
        let negotiator = CredentialNegotiator::new(store.clone());

        let err = negotiator.acquire_grant(&Right::bless(), true).unwrap_err();
        assert_eq!(err, AuthError::Cancelled);
        assert!(store.freed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AuthError::Cancelled.is_retryable());
        assert!(
            AuthError::UserInteractionRequired {
                right: Right::bless()
            }
            .is_retryable()
        );
        assert!(
            !AuthError::Denied {
                right: Right::bless()
            }
            .is_retryable()
        );
    }
}
