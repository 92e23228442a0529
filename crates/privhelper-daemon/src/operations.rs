//! The helper's privileged operation.
//!
//! [`ProtectedFileAccess`] proves the helper really runs with elevated rights:
//! it reads a file only root can read, or, if that file does not exist,
//! writes a marker into a root-only directory.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::protocol::{OperationOutcome, PrivilegedOperation, RequestContext};

/// Default file read by the operation.
pub const DEFAULT_PROTECTED_PATH: &str = "/root/.bashrc";

/// Default marker written when the protected file is missing.
pub const DEFAULT_MARKER_PATH: &str = "/root/privhelper_test.txt";

/// Characters of the protected file echoed back.
const PREVIEW_CHARS: usize = 50;

/// Reads a protected file, or creates a marker where only root may write.
#[derive(Debug, Clone)]
pub struct ProtectedFileAccess {
    protected_path: PathBuf,
    marker_path: PathBuf,
    required_uid: Option<u32>,
}

impl ProtectedFileAccess {
    /// Operation over the given paths, refusing to run unless uid 0.
    #[must_use]
    pub fn new(protected_path: impl Into<PathBuf>, marker_path: impl Into<PathBuf>) -> Self {
        Self {
            protected_path: protected_path.into(),
            marker_path: marker_path.into(),
            required_uid: Some(0),
        }
    }

    /// Change the uid the helper must run as; `None` skips the check.
    #[must_use]
    pub const fn with_required_uid(mut self, uid: Option<u32>) -> Self {
        self.required_uid = uid;
        self
    }

    async fn access(&self, ctx: &RequestContext) -> io::Result<String> {
        match tokio::fs::read(&self.protected_path).await {
            Ok(contents) => {
                let preview: String = String::from_utf8_lossy(&contents)
                    .chars()
                    .take(PREVIEW_CHARS)
                    .collect();
                Ok(format!(
                    "Successfully read protected file. First {PREVIEW_CHARS} chars: {preview}"
                ))
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let content = format!(
                    "privhelper created this file at {} for uid {}\n",
                    Utc::now().to_rfc3339(),
                    ctx.peer.uid
                );
                tokio::fs::write(&self.marker_path, content).await?;
                Ok(format!(
                    "Created test file at: {}",
                    self.marker_path.display()
                ))
            },
            Err(e) => Err(e),
        }
    }
}

impl Default for ProtectedFileAccess {
    fn default() -> Self {
        Self::new(DEFAULT_PROTECTED_PATH, DEFAULT_MARKER_PATH)
    }
}

#[async_trait]
impl PrivilegedOperation for ProtectedFileAccess {
    async fn perform(&self, _payload: &[u8], ctx: &RequestContext) -> OperationOutcome {
        let uid = nix::unistd::getuid().as_raw();
        if let Some(required) = self.required_uid {
            if uid != required {
                warn!(uid, required, "Privileged operation refused");
                return OperationOutcome::failed(format!(
                    "Helper not running as root (uid: {uid})"
                ));
            }
        }

        match self.access(ctx).await {
            Ok(detail) => {
                info!(
                    connection_id = ctx.connection_id,
                    peer_uid = ctx.peer.uid,
                    "Privileged operation completed"
                );
                OperationOutcome::succeeded(detail)
            },
            Err(e) => {
                warn!(connection_id = ctx.connection_id, "Privileged operation failed: {e}");
                OperationOutcome::failed(format!("Error: {e}"))
            },
        }
    }
}
