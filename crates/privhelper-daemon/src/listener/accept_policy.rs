//! Connection acceptance.
//!
//! Every accepted stream is judged by an [`AcceptPolicy`] before the
//! handshake, with only kernel-reported peer credentials as input. Nothing
//! the client sends can influence the decision.
//!
//! # Invariants
//!
//! - An empty [`AcceptRules`] accepts nobody
//! - Each configured dimension must match: when uids or gids are listed the
//!   peer must match one of them, and when client identities are listed the
//!   peer's executable must hash to one of them
//! - A peer whose executable cannot be resolved fails the identity check
//! - The identity check is bound to the process that connected: its start
//!   time, taken with the credentials at accept, must still match after the
//!   executable is hashed
//! - uid, gid and digest comparisons are constant-time
//!
//! # Security Considerations
//!
//! `SO_PEERCRED` names the process that called `connect`, not the one that
//! holds the socket now. Two gaps follow, and [`AcceptPolicy::confirm`]
//! narrows both by re-checking after the handshake, before any request is
//! dispatched:
//!
//! - pid reuse: the peer exits and its pid is recycled before the check;
//!   the start-time pin catches this
//! - exec after connect: the peer execs another binary before the check; a
//!   later identity check sees the change if it happens after admission
//!
//! What remains is a peer that forks, leaves the socket with the child and
//! execs an authorized binary in the parent before admission. No pid-based
//! check can tell that apart, so authorized-client identities are a second
//! factor on top of the uid and gid rules, never the only one.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use privhelper_core::CodeIdentity;
use privhelper_core::install::AcceptRules;
use privhelper_core::process::{PROC_ROOT, ProcStat};
use subtle::{Choice, ConstantTimeEq};

use crate::protocol::PeerCredentials;

/// Verdict of an [`AcceptPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptDecision {
    /// Hand the connection to the handshake.
    Accept,
    /// Drop the connection.
    Reject {
        /// Logged, never sent to the peer.
        reason: String,
    },
}

impl AcceptDecision {
    /// Rejection with `reason`.
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    /// Returns `true` for [`AcceptDecision::Accept`].
    #[must_use]
    pub const fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Decides whether a peer may talk to the helper.
pub trait AcceptPolicy: Send + Sync {
    /// Judge a connecting peer.
    fn evaluate(&self, peer: &PeerCredentials) -> AcceptDecision;

    /// Re-judge an admitted peer once its handshake completed, before its
    /// first request is dispatched.
    fn confirm(&self, _peer: &PeerCredentials) -> AcceptDecision {
        AcceptDecision::Accept
    }
}

/// Rejects every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl AcceptPolicy for DenyAll {
    fn evaluate(&self, _peer: &PeerCredentials) -> AcceptDecision {
        AcceptDecision::reject("no accept rules configured")
    }
}

/// Maps a peer pid to the code identity of its executable.
pub trait PeerExecutableResolver: Send + Sync {
    /// Digest of the executable running as `pid`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the executable cannot be read.
    fn code_identity(&self, pid: u32) -> io::Result<CodeIdentity>;

    /// Kernel start time of `pid`, `None` if it is gone.
    fn start_time(&self, pid: u32) -> Option<u64>;
}

/// Resolves executables through `/proc/<pid>/exe`.
#[derive(Debug, Clone)]
pub struct ProcExecutableResolver {
    proc_root: PathBuf,
}

impl ProcExecutableResolver {
    /// Resolver reading `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root(PROC_ROOT)
    }

    /// Resolver reading an alternative procfs mount.
    #[must_use]
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for ProcExecutableResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerExecutableResolver for ProcExecutableResolver {
    fn code_identity(&self, pid: u32) -> io::Result<CodeIdentity> {
        let exe = self.proc_root.join(pid.to_string()).join("exe");
        CodeIdentity::of_file(&exe)
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        ProcStat::read(&self.proc_root, pid).map(|stat| stat.start_time)
    }
}

/// Policy built from the descriptor's accept rules.
pub struct CallerPolicy {
    rules: AcceptRules,
    resolver: Arc<dyn PeerExecutableResolver>,
}

impl CallerPolicy {
    /// Policy over `rules`, resolving executables through `/proc`.
    #[must_use]
    pub fn from_rules(rules: &AcceptRules) -> Self {
        Self::with_resolver(rules, Arc::new(ProcExecutableResolver::new()))
    }

    /// Policy over `rules` with a custom resolver.
    #[must_use]
    pub fn with_resolver(rules: &AcceptRules, resolver: Arc<dyn PeerExecutableResolver>) -> Self {
        Self {
            rules: rules.clone(),
            resolver,
        }
    }

    fn caller_matches(&self, peer: &PeerCredentials) -> bool {
        let uid = peer.uid.to_ne_bytes();
        let gid = peer.gid.to_ne_bytes();

        let mut matched = Choice::from(0);
        for allowed in &self.rules.allowed_uids {
            matched |= uid.ct_eq(&allowed.to_ne_bytes());
        }
        for allowed in &self.rules.allowed_gids {
            matched |= gid.ct_eq(&allowed.to_ne_bytes());
        }
        matched.unwrap_u8() == 1
    }

    fn client_matches(&self, peer: &PeerCredentials) -> Result<(), String> {
        let (Some(pid), Some(started)) = (peer.pid, peer.start_time) else {
            return Err("peer pid or start time unavailable".to_string());
        };
        let identity = self
            .resolver
            .code_identity(pid)
            .map_err(|e| format!("cannot resolve executable of pid {pid}: {e}"))?;
        // Hashed the right process only if the pid still names it.
        if self.resolver.start_time(pid) != Some(started) {
            return Err(format!("pid {pid} no longer names the connecting process"));
        }

        let mut matched = Choice::from(0);
        for allowed in &self.rules.authorized_clients {
            matched |= identity.as_bytes().ct_eq(allowed.as_bytes());
        }
        if matched.unwrap_u8() == 1 {
            Ok(())
        } else {
            Err(format!("client {} is not authorized", identity.short()))
        }
    }
}

impl AcceptPolicy for CallerPolicy {
    fn evaluate(&self, peer: &PeerCredentials) -> AcceptDecision {
        if self.rules.is_empty() {
            return DenyAll.evaluate(peer);
        }

        let checks_caller =
            !self.rules.allowed_uids.is_empty() || !self.rules.allowed_gids.is_empty();
        if checks_caller && !self.caller_matches(peer) {
            return AcceptDecision::reject(format!(
                "uid {} / gid {} not allowed",
                peer.uid, peer.gid
            ));
        }

        if !self.rules.authorized_clients.is_empty() {
            if let Err(reason) = self.client_matches(peer) {
                return AcceptDecision::reject(reason);
            }
        }

        AcceptDecision::Accept
    }

    fn confirm(&self, peer: &PeerCredentials) -> AcceptDecision {
        if self.rules.authorized_clients.is_empty() {
            return AcceptDecision::Accept;
        }
        match self.client_matches(peer) {
            Ok(()) => AcceptDecision::Accept,
            Err(reason) => AcceptDecision::reject(format!("after handshake: {reason}")),
        }
    }
}

impl std::fmt::Debug for CallerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerPolicy")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}
