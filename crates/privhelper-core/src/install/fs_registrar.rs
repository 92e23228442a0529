//! Filesystem-backed registrar.
//!
//! Places the helper binary and descriptor at the [`ServiceLayout`] paths and
//! hands process management to a [`ServiceLauncher`].
//!
//! # Install Sequence
//!
//! 1. Verify the bundle binary hashes to the expected code identity
//! 2. Create the layout directories (refusing symlinks)
//! 3. Copy the binary to a temporary name, re-hash it, chmod 0755, rename
//! 4. Write the descriptor to a temporary name, chmod 0644, rename
//! 5. Start the helper through the launcher
//!
//! # Security Considerations
//!
//! - The installed binary is hashed after the copy so a swap between check
//!   and copy is detected
//! - Renames are atomic, so a reader never sees a half-written artifact
//! - Layout directories that already exist keep their permissions

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::descriptor::{AcceptRules, ServiceDescriptor};
use super::layout::ServiceLayout;
use super::registrar::{ArtifactStatus, RegistrarError, ServiceRegistrar, require_bless};
use crate::authorization::AuthorizationGrant;
use crate::identity::{CodeIdentity, ServiceIdentity, ServiceLabel};
use crate::process::ProcessStamp;

/// Mode of the installed helper binary.
const BINARY_MODE: u32 = 0o755;

/// Mode of the descriptor.
const DESCRIPTOR_MODE: u32 = 0o644;

/// Mode of directories created by the registrar.
const DIRECTORY_MODE: u32 = 0o755;

/// How long to wait for a started helper to bind its socket.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stopped helper gets between SIGTERM and SIGKILL.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting on process or socket state.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Starts and stops the helper process.
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    /// Start the helper described by `descriptor`, stored at
    /// `descriptor_path`, and wait until it is accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrarError::Launch`] if the helper does not come up.
    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        descriptor_path: &Path,
    ) -> Result<(), RegistrarError>;

    /// Stop the helper for `label`. Succeeds if it is not running.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrarError::Launch`] if the helper could not be stopped.
    async fn stop(&self, label: &ServiceLabel) -> Result<(), RegistrarError>;

    /// Returns `true` if the helper for `label` is running.
    async fn is_running(&self, label: &ServiceLabel) -> bool;
}

/// Launches the helper as a detached child process tracked by a pid file.
///
/// The pid file holds a [`ProcessStamp`], not a bare pid. A helper that died
/// without cleaning up leaves a stamp that no longer matches, and such a
/// stamp is discarded rather than signalled: after a crash or reboot the pid
/// may belong to an unrelated process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    layout: ServiceLayout,
    ready_timeout: Duration,
    stop_grace: Duration,
}

impl ProcessLauncher {
    /// Create a launcher using `layout` for pid files.
    #[must_use]
    pub const fn new(layout: ServiceLayout) -> Self {
        Self {
            layout,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Set how long `start` waits for the socket to appear.
    #[must_use]
    pub const fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Set the SIGTERM-to-SIGKILL grace period.
    #[must_use]
    pub const fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// The stamp in the pid file, if it still names a live helper.
    ///
    /// A pid file that is unreadable as a stamp, or whose process is gone or
    /// was replaced by another one with the same pid, is removed.
    fn live_stamp(&self, label: &ServiceLabel) -> Result<Option<ProcessStamp>, RegistrarError> {
        let path = self.layout.pid_path(label);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RegistrarError::io("read pid file", path, e)),
        };

        match content.parse::<ProcessStamp>() {
            Ok(stamp) if stamp.is_live() => return Ok(Some(stamp)),
            Ok(stamp) => debug!(%label, pid = stamp.pid, "Pid file names an exited helper"),
            Err(e) => warn!(%label, "Discarding unverifiable pid file: {e}"),
        }
        remove_if_present("remove stale pid file", &path)?;
        Ok(None)
    }

    async fn wait_for_exit(stamp: &ProcessStamp, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while stamp.is_live() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        true
    }

    /// Send `signal` to the stamped process if it is still that process.
    fn signal(stamp: &ProcessStamp, signal: Signal) -> Result<(), RegistrarError> {
        if !stamp.is_live() {
            return Ok(());
        }
        let pid = i32::try_from(stamp.pid).map_err(|_| RegistrarError::Launch {
            reason: format!("pid {} out of range", stamp.pid),
            code: None,
        })?;
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(RegistrarError::Launch {
                reason: format!("failed to send {signal} to helper {pid}: {e}"),
                code: Some(e as i32),
            }),
        }
    }
}

#[async_trait]
impl ServiceLauncher for ProcessLauncher {
    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        descriptor_path: &Path,
    ) -> Result<(), RegistrarError> {
        use std::os::unix::process::CommandExt;

        // A previous instance may still hold the socket.
        self.stop(&descriptor.label).await?;
        remove_if_present("remove stale socket", &descriptor.socket_path)?;

        let mut command = std::process::Command::new(&descriptor.program);
        command
            .arg("--descriptor")
            .arg(descriptor_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let mut child = command.spawn().map_err(|e| RegistrarError::Launch {
            reason: format!("failed to spawn {}: {e}", descriptor.program.display()),
            code: e.raw_os_error(),
        })?;
        let pid = child.id();
        // Unreaped until we wait on it, so the stat entry is still there.
        let stamp = ProcessStamp::capture(pid).ok_or_else(|| RegistrarError::Launch {
            reason: format!("cannot read start time of helper {pid}"),
            code: None,
        })?;

        let pid_path = self.layout.pid_path(&descriptor.label);
        std::fs::write(&pid_path, format!("{stamp}\n"))
            .map_err(|e| RegistrarError::io("write pid file", &pid_path, e))?;

        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            if descriptor.socket_path.exists() {
                info!(label = %descriptor.label, %pid, "Helper started");
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                let _ = std::fs::remove_file(&pid_path);
                return Err(RegistrarError::Launch {
                    reason: format!("helper {pid} exited during startup ({status})"),
                    code: status.code(),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RegistrarError::Launch {
                    reason: format!(
                        "helper {pid} did not bind {} within {:?}",
                        descriptor.socket_path.display(),
                        self.ready_timeout
                    ),
                    code: None,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn stop(&self, label: &ServiceLabel) -> Result<(), RegistrarError> {
        let Some(stamp) = self.live_stamp(label)? else {
            return Ok(());
        };

        debug!(%label, pid = stamp.pid, "Sending SIGTERM to helper");
        Self::signal(&stamp, Signal::SIGTERM)?;
        if !Self::wait_for_exit(&stamp, self.stop_grace).await {
            warn!(%label, pid = stamp.pid, "Helper ignored SIGTERM, sending SIGKILL");
            Self::signal(&stamp, Signal::SIGKILL)?;
            Self::wait_for_exit(&stamp, self.stop_grace).await;
        }

        remove_if_present("remove pid file", &self.layout.pid_path(label))
    }

    async fn is_running(&self, label: &ServiceLabel) -> bool {
        matches!(self.live_stamp(label), Ok(Some(_)))
    }
}

/// [`ServiceRegistrar`] placing artifacts at [`ServiceLayout`] paths.
pub struct FsServiceRegistrar {
    layout: ServiceLayout,
    source_binary: PathBuf,
    accept: AcceptRules,
    launcher: Arc<dyn ServiceLauncher>,
}

impl FsServiceRegistrar {
    /// Create a registrar installing `source_binary`.
    #[must_use]
    pub fn new(
        layout: ServiceLayout,
        source_binary: impl Into<PathBuf>,
        accept: AcceptRules,
        launcher: Arc<dyn ServiceLauncher>,
    ) -> Self {
        Self {
            layout,
            source_binary: source_binary.into(),
            accept,
            launcher,
        }
    }

    /// Returns the layout.
    #[must_use]
    pub const fn layout(&self) -> &ServiceLayout {
        &self.layout
    }

    fn ensure_directory(path: &Path) -> Result<(), RegistrarError> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(RegistrarError::io(
                        "refusing symlinked directory",
                        path,
                        io::Error::new(io::ErrorKind::InvalidInput, "path is a symlink"),
                    ));
                }
                if !metadata.is_dir() {
                    return Err(RegistrarError::io(
                        "expected a directory",
                        path,
                        io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
                    ));
                }
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(path)
                    .map_err(|e| RegistrarError::io("create directory", path, e))?;
                set_mode(path, DIRECTORY_MODE)
            },
            Err(e) => Err(RegistrarError::io("stat directory", path, e)),
        }
    }

    fn install_binary(&self, identity: &ServiceIdentity) -> Result<PathBuf, RegistrarError> {
        let expected = identity.code_identity;
        let found = CodeIdentity::of_file(&self.source_binary)
            .map_err(|e| RegistrarError::io("hash source binary", &self.source_binary, e))?;
        if found != expected {
            return Err(RegistrarError::IdentityMismatch { expected, found });
        }

        let target = self.layout.binary_path(&identity.label);
        let staging = staging_path(&target);
        std::fs::copy(&self.source_binary, &staging)
            .map_err(|e| RegistrarError::io("copy binary", &staging, e))?;

        let copied = CodeIdentity::of_file(&staging)
            .map_err(|e| RegistrarError::io("hash installed binary", &staging, e))?;
        if copied != expected {
            let _ = std::fs::remove_file(&staging);
            return Err(RegistrarError::IdentityMismatch {
                expected,
                found: copied,
            });
        }

        set_mode(&staging, BINARY_MODE)?;
        std::fs::rename(&staging, &target)
            .map_err(|e| RegistrarError::io("install binary", &target, e))?;
        debug!(path = %target.display(), "Installed helper binary");
        Ok(target)
    }

    fn write_descriptor(&self, descriptor: &ServiceDescriptor) -> Result<PathBuf, RegistrarError> {
        let target = self.layout.descriptor_path(&descriptor.label);
        let staging = staging_path(&target);
        std::fs::write(&staging, descriptor.to_toml()?)
            .map_err(|e| RegistrarError::io("write descriptor", &staging, e))?;
        set_mode(&staging, DESCRIPTOR_MODE)?;
        std::fs::rename(&staging, &target)
            .map_err(|e| RegistrarError::io("install descriptor", &target, e))?;
        debug!(path = %target.display(), "Wrote service descriptor");
        Ok(target)
    }
}

#[async_trait]
impl ServiceRegistrar for FsServiceRegistrar {
    async fn register(
        &self,
        identity: &ServiceIdentity,
        grant: &AuthorizationGrant,
    ) -> Result<(), RegistrarError> {
        require_bless(grant)?;

        for dir in [
            &self.layout.descriptor_dir,
            &self.layout.binary_dir,
            &self.layout.runtime_dir,
            &self.layout.state_dir,
        ] {
            Self::ensure_directory(dir)?;
        }

        let program = self.install_binary(identity)?;
        let descriptor = ServiceDescriptor {
            label: identity.label.clone(),
            program,
            code_identity: identity.code_identity,
            socket_path: self.layout.socket_path(&identity.label),
            installed_at: Utc::now(),
            accept: self.accept.clone(),
        };
        let descriptor_path = self.write_descriptor(&descriptor)?;

        self.launcher.start(&descriptor, &descriptor_path).await
    }

    async fn start(
        &self,
        label: &ServiceLabel,
        grant: &AuthorizationGrant,
    ) -> Result<(), RegistrarError> {
        require_bless(grant)?;
        let path = self.layout.descriptor_path(label);
        let descriptor = ServiceDescriptor::from_file(&path)?;
        self.launcher.start(&descriptor, &path).await
    }

    async fn stop(
        &self,
        label: &ServiceLabel,
        grant: &AuthorizationGrant,
    ) -> Result<(), RegistrarError> {
        require_bless(grant)?;
        self.launcher.stop(label).await
    }

    async fn remove_descriptor(
        &self,
        label: &ServiceLabel,
        grant: &AuthorizationGrant,
    ) -> Result<(), RegistrarError> {
        require_bless(grant)?;
        remove_if_present("remove descriptor", &self.layout.descriptor_path(label))
    }

    async fn remove_binary(
        &self,
        label: &ServiceLabel,
        grant: &AuthorizationGrant,
    ) -> Result<(), RegistrarError> {
        require_bless(grant)?;
        remove_if_present("remove binary", &self.layout.binary_path(label))
    }

    async fn inspect(&self, label: &ServiceLabel) -> Result<ArtifactStatus, RegistrarError> {
        let descriptor_path = self.layout.descriptor_path(label);
        let descriptor_identity = if descriptor_path.exists() {
            Some(ServiceDescriptor::from_file(&descriptor_path)?.code_identity)
        } else {
            None
        };

        let binary_path = self.layout.binary_path(label);
        let binary_identity = match CodeIdentity::of_file(&binary_path) {
            Ok(identity) => Some(identity),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(RegistrarError::io("hash installed binary", binary_path, e)),
        };

        Ok(ArtifactStatus {
            descriptor_identity,
            binary_identity,
            running: self.launcher.is_running(label).await,
        })
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

fn set_mode(path: &Path, mode: u32) -> Result<(), RegistrarError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| RegistrarError::io("set permissions", path, e))
}

fn remove_if_present(context: &'static str, path: &Path) -> Result<(), RegistrarError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "{context}");
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RegistrarError::io(context, path, e)),
    }
}
