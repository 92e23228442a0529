//! Rule-file backed trust store.
//!
//! Rights are granted according to a TOML rule file, evaluated top to bottom;
//! the first rule naming the right and matching the caller decides:
//!
//! ```toml
//! [[rule]]
//! right = "privhelper.service.bless"
//! decision = "auth_admin"   # allow | auth_admin | deny
//! gids = [27]               # any of the caller's groups
//! uids = []                 # or the caller's uid
//! ```
//!
//! `auth_admin` asks the operator through a [`ConsentPrompt`]. An unlisted
//! right or caller is denied.

use std::collections::HashSet;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AuthError, AuthorizationFlags, GrantHandle, Right, TrustStore};

/// Outcome a rule assigns to a matching request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDecision {
    /// Grant without asking.
    Allow,
    /// Grant after operator consent.
    AuthAdmin,
    /// Refuse.
    Deny,
}

/// One entry of the rule file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationRule {
    /// Right this rule applies to.
    pub right: Right,
    /// Decision for matching callers.
    pub decision: RuleDecision,
    /// Matching caller uids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uids: Vec<u32>,
    /// Matching caller group ids (primary or supplementary).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gids: Vec<u32>,
    /// Match every caller.
    #[serde(default)]
    pub any_caller: bool,
}

impl AuthorizationRule {
    fn matches(&self, right: &Right, caller: &CallerInfo) -> bool {
        if self.right != *right {
            return false;
        }
        self.any_caller
            || self.uids.contains(&caller.uid)
            || caller.gids.iter().any(|gid| self.gids.contains(gid))
    }
}

/// Parsed rule file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationRules {
    /// Rules in evaluation order.
    #[serde(default, rename = "rule")]
    pub rules: Vec<AuthorizationRule>,
}

impl AuthorizationRules {
    /// Load rules from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SystemUnavailable`] if the file cannot be read or
    /// parsed.
    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| AuthError::SystemUnavailable {
                reason: format!("failed to read rules file {}: {e}", path.display()),
            })?;
        Self::from_toml(&content)
    }

    /// Parse rules from TOML.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SystemUnavailable`] if the document is invalid.
    pub fn from_toml(content: &str) -> Result<Self, AuthError> {
        toml::from_str(content).map_err(|e| AuthError::SystemUnavailable {
            reason: format!("invalid authorization rules: {e}"),
        })
    }

    /// Returns the decision of the first rule matching `right` and `caller`.
    #[must_use]
    pub fn decide(&self, right: &Right, caller: &CallerInfo) -> Option<RuleDecision> {
        self.rules
            .iter()
            .find(|rule| rule.matches(right, caller))
            .map(|rule| rule.decision)
    }

    /// Returns `true` if any rule mentions `right`.
    #[must_use]
    pub fn mentions(&self, right: &Right) -> bool {
        self.rules.iter().any(|rule| rule.right == *right)
    }
}

/// The requesting process as seen by the trust store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerInfo {
    /// Real uid.
    pub uid: u32,
    /// Primary and supplementary group ids.
    pub gids: Vec<u32>,
}

impl CallerInfo {
    /// Describe the current process.
    #[must_use]
    pub fn current() -> Self {
        use nix::unistd::{getgid, getgroups, getuid};

        let mut gids = vec![getgid().as_raw()];
        match getgroups() {
            Ok(groups) => gids.extend(groups.into_iter().map(nix::unistd::Gid::as_raw)),
            Err(e) => warn!("failed to read supplementary groups: {e}"),
        }
        gids.sort_unstable();
        gids.dedup();

        Self {
            uid: getuid().as_raw(),
            gids,
        }
    }
}

/// What the operator is asked to approve.
#[derive(Debug)]
pub struct ConsentRequest<'a> {
    /// Requested right.
    pub right: &'a Right,
    /// Requesting caller.
    pub caller: &'a CallerInfo,
}

/// Operator answer to a consent prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    /// Approved.
    Approved,
    /// Explicitly declined.
    Declined,
    /// Dismissed without an answer.
    Aborted,
}

/// Source of operator consent.
pub trait ConsentPrompt: Send + Sync {
    /// Ask the operator to approve `request`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if no prompt could be shown.
    fn confirm(&self, request: &ConsentRequest<'_>) -> io::Result<Consent>;
}

/// Prompts on the controlling terminal (stderr for the question, stdin for
/// the answer).
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl ConsentPrompt for TerminalPrompt {
    fn confirm(&self, request: &ConsentRequest<'_>) -> io::Result<Consent> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no terminal available for consent prompt",
            ));
        }

        let mut stderr = io::stderr().lock();
        write!(
            stderr,
            "Allow uid {} to obtain '{}'? [y/N] ",
            request.caller.uid, request.right
        )?;
        stderr.flush()?;

        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer)? == 0 {
            return Ok(Consent::Aborted);
        }
        match answer.trim() {
            "y" | "Y" | "yes" | "YES" => Ok(Consent::Approved),
            _ => Ok(Consent::Declined),
        }
    }
}

/// [`TrustStore`] evaluating [`AuthorizationRules`] for a fixed caller.
pub struct PolicyTrustStore {
    rules: AuthorizationRules,
    caller: CallerInfo,
    prompt: Arc<dyn ConsentPrompt>,
    next_handle: AtomicU64,
    outstanding: Mutex<HashSet<u64>>,
}

impl PolicyTrustStore {
    /// Create a store for `caller`.
    #[must_use]
    pub fn new(rules: AuthorizationRules, caller: CallerInfo, prompt: Arc<dyn ConsentPrompt>) -> Self {
        Self {
            rules,
            caller,
            prompt,
            next_handle: AtomicU64::new(1),
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    /// Load rules from `path` for the current process.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SystemUnavailable`] if the rules cannot be loaded.
    pub fn from_file(path: &Path, prompt: Arc<dyn ConsentPrompt>) -> Result<Self, AuthError> {
        let rules = AuthorizationRules::from_file(path)?;
        Ok(Self::new(rules, CallerInfo::current(), prompt))
    }

    /// Number of authorizations created and not yet freed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().map_or(0, |set| set.len())
    }

    fn issue(&self) -> Result<GrantHandle, AuthError> {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.outstanding
            .lock()
            .map_err(|_| AuthError::SystemUnavailable {
                reason: "authorization table poisoned".to_string(),
            })?
            .insert(raw);
        Ok(GrantHandle::new(raw))
    }
}

impl TrustStore for PolicyTrustStore {
    fn create_authorization(
        &self,
        right: &Right,
        flags: AuthorizationFlags,
    ) -> Result<GrantHandle, AuthError> {
        let denied = || AuthError::Denied {
            right: right.clone(),
        };

        match self.rules.decide(right, &self.caller) {
            None => {
                debug!(right = %right, uid = self.caller.uid, "No rule matches, denying");
                Err(denied())
            },
            Some(RuleDecision::Deny) => Err(denied()),
            Some(RuleDecision::Allow) => self.issue(),
            Some(RuleDecision::AuthAdmin) => {
                if !flags.extend_rights {
                    return Err(denied());
                }
                if !flags.interaction_allowed {
                    return Err(AuthError::UserInteractionRequired {
                        right: right.clone(),
                    });
                }
                let request = ConsentRequest {
                    right,
                    caller: &self.caller,
                };
                match self.prompt.confirm(&request) {
                    Ok(Consent::Approved) => self.issue(),
                    Ok(Consent::Declined) => Err(denied()),
                    Ok(Consent::Aborted) => Err(AuthError::Cancelled),
                    Err(e) => Err(AuthError::SystemUnavailable {
                        reason: format!("consent prompt failed: {e}"),
                    }),
                }
            },
        }
    }

    fn free_authorization(&self, handle: GrantHandle) {
        let removed = self
            .outstanding
            .lock()
            .is_ok_and(|mut set| set.remove(&handle.raw()));
        if !removed {
            warn!(handle = handle.raw(), "Freeing unknown authorization handle");
        }
    }
}
