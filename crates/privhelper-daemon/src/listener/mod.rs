//! Helper-side service listener.
//!
//! ```text
//!   bind ──► Listening ──stop()──► Draining ──► Stopped
//!               │                      │
//!          accept loop            no new accepts; in-flight requests
//!               │                 finish, idle connections close;
//!               ▼                 stragglers aborted after drain_timeout
//!   peer creds ─► AcceptPolicy ─reject─► drop (warn!)
//!               │ accept
//!               ▼
//!   spawn: handshake ─► AcceptPolicy::confirm ─► request loop ─► RequestHandler
//! ```
//!
//! # Security Considerations
//!
//! - The accept policy runs on kernel-reported credentials before the
//!   handshake, so a rejected peer never reaches handler code
//! - The policy confirms the peer again after the handshake and before the
//!   first dispatch; see [`accept_policy`] for what pid-based identity can
//!   and cannot pin
//! - The socket is mode 0666; the accept policy is the authorization
//!   boundary
//! - An existing runtime directory keeps its permissions; a symlink is
//!   refused
//! - Only a stale socket is removed before binding, never another file type

pub mod accept_policy;
pub mod registry;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use privhelper_core::ServiceLabel;
use privhelper_core::install::ServiceDescriptor;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub use self::accept_policy::{
    AcceptDecision, AcceptPolicy, CallerPolicy, DenyAll, PeerExecutableResolver,
    ProcExecutableResolver,
};
pub use self::registry::{ConnectionId, ConnectionObserver, ConnectionRecord, ConnectionRegistry};
use self::registry::TrackedHandler;
use crate::protocol::connection_handler::{
    ConnectionEnd, HandshakeResult, frame_for_handshake, perform_handshake, serve_requests,
};
use crate::protocol::{
    PeerCredentials, ProtocolError, ProtocolResult, RequestContext, RequestHandler,
};

/// Default cap on concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Default time in-flight connections get to finish after `stop`.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket mode. Any local process may connect; the accept policy decides.
const SOCKET_MODE: u32 = 0o666;

/// Mode of a runtime directory created by the listener.
const DIRECTORY_MODE: u32 = 0o755;

/// Back-off after a failed `accept`.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Label announced in the handshake.
    pub label: ServiceLabel,
    /// Socket to bind.
    pub socket_path: PathBuf,
    /// Concurrent connection cap.
    pub max_connections: usize,
    /// Grace period for in-flight work on `stop`.
    pub drain_timeout: Duration,
    /// Bound on each handshake.
    pub handshake_timeout: Duration,
}

impl ListenerConfig {
    /// Settings with defaults for `label` at `socket_path`.
    #[must_use]
    pub fn new(label: ServiceLabel, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            label,
            socket_path: socket_path.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Settings for the helper described by `descriptor`.
    #[must_use]
    pub fn for_descriptor(descriptor: &ServiceDescriptor) -> Self {
        Self::new(descriptor.label.clone(), &descriptor.socket_path)
    }

    /// Set the connection cap.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the drain timeout.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not accepting; the socket is gone.
    Stopped,
    /// Accepting connections.
    Listening,
    /// Finishing in-flight work; not accepting.
    Draining,
}

/// How one connection task ended, for logging and callbacks.
#[derive(Debug)]
enum ConnectionOutcome {
    Invalidated,
    Interrupted(String),
    HandshakeRefused,
    Revoked {
        peer: PeerCredentials,
        reason: String,
    },
    Drained,
    Aborted,
}

/// State shared by the accept loop and connection tasks.
struct Shared {
    label: ServiceLabel,
    handshake_timeout: Duration,
    policy: Arc<dyn AcceptPolicy>,
    registry: Arc<ConnectionRegistry>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    /// Stop accepting and close idle connections.
    shutdown: CancellationToken,
    /// Abandon connections still running after the drain timeout.
    abort: CancellationToken,
}

/// Accepts and serves connections on the helper's socket.
pub struct ServiceListener {
    config: ListenerConfig,
    listener: UnixListener,
    shared: Arc<Shared>,
    tracker: TaskTracker,
    connection_sem: Arc<Semaphore>,
    next_id: AtomicU64,
    state: watch::Sender<ListenerState>,
    socket_removed: AtomicBool,
}

impl ServiceListener {
    /// Bind the socket and enter [`ListenerState::Listening`].
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime directory is unusable, a non-socket
    /// file occupies the socket path, or binding fails.
    pub fn bind(config: ListenerConfig, policy: Arc<dyn AcceptPolicy>) -> ProtocolResult<Self> {
        if let Some(parent) = config.socket_path.parent() {
            ensure_directory(parent)?;
        }
        cleanup_socket(&config.socket_path)?;

        let listener = UnixListener::bind(&config.socket_path).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!(
                    "failed to bind socket {}: {e}",
                    config.socket_path.display()
                ),
            ))
        })?;
        set_socket_permissions(&config.socket_path)?;

        info!(
            label = %config.label,
            socket = %config.socket_path.display(),
            max_connections = config.max_connections,
            "Service listener bound"
        );

        let (state, _) = watch::channel(ListenerState::Listening);
        Ok(Self {
            shared: Arc::new(Shared {
                label: config.label.clone(),
                handshake_timeout: config.handshake_timeout,
                policy,
                registry: Arc::new(ConnectionRegistry::new()),
                observer: None,
                shutdown: CancellationToken::new(),
                abort: CancellationToken::new(),
            }),
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(1),
            socket_removed: AtomicBool::new(false),
            config,
            listener,
            state,
        })
    }

    /// Attach an observer for connection events.
    ///
    /// Only effective before [`run`](Self::run).
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.observer = Some(observer);
        }
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Bound socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Live connections.
    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Accept and serve connections until [`stop`](Self::stop) is called.
    ///
    /// Each connection is served on its own task; requests on one connection
    /// are handled in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection semaphore is closed.
    pub async fn run(&self, handler: Arc<dyn RequestHandler>) -> ProtocolResult<()> {
        let shutdown = self.shared.shutdown.clone();

        loop {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&self.connection_sem).acquire_owned() => permit.map_err(|_| {
                    ProtocolError::Io(io::Error::other("connection semaphore closed"))
                })?,
            };

            let stream = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        error!(label = %self.config.label, "Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    },
                },
            };

            self.admit(stream, permit, &handler);
        }

        debug!(label = %self.config.label, "Accept loop stopped");
        Ok(())
    }

    /// Judge `stream` and, if accepted, spawn its connection task.
    fn admit(
        &self,
        stream: UnixStream,
        permit: OwnedSemaphorePermit,
        handler: &Arc<dyn RequestHandler>,
    ) {
        let peer = match PeerCredentials::from_stream(&stream) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Dropping connection without peer credentials: {e}");
                return;
            },
        };

        if let AcceptDecision::Reject { reason } = self.shared.policy.evaluate(&peer) {
            warn!(
                uid = peer.uid,
                gid = peer.gid,
                pid = ?peer.pid,
                %reason,
                "Rejected connection"
            );
            if let Some(observer) = &self.shared.observer {
                observer.on_rejected(&peer, &reason);
            }
            return;
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = ConnectionRecord {
            id,
            peer,
            accepted_at: Instant::now(),
            in_flight: false,
        };
        debug!(
            connection = %id,
            uid = peer.uid,
            gid = peer.gid,
            pid = ?peer.pid,
            "Accepted new connection"
        );
        if let Some(observer) = &self.shared.observer {
            observer.on_accepted(&record);
        }
        self.shared.registry.insert(record);

        let handler: Arc<dyn RequestHandler> = Arc::new(TrackedHandler {
            inner: Arc::clone(handler),
            registry: Arc::clone(&self.shared.registry),
            id,
        });
        let shared = Arc::clone(&self.shared);
        self.tracker.spawn(async move {
            let _permit = permit;
            let ctx = RequestContext {
                connection_id: id.get(),
                peer,
            };
            let outcome = tokio::select! {
                () = shared.abort.cancelled() => ConnectionOutcome::Aborted,
                outcome = serve_connection(stream, handler, ctx, &shared) => outcome,
            };
            shared.finish(id, outcome);
        });
    }

    /// Drain and stop.
    ///
    /// New connections are refused immediately. Connections with a request
    /// in progress finish it; idle ones are closed. Anything still running
    /// after the drain timeout is aborted. The socket is removed. Calling
    /// `stop` again is a no-op.
    pub async fn stop(&self) {
        if *self.state.borrow() != ListenerState::Listening {
            return;
        }
        self.state.send_replace(ListenerState::Draining);
        info!(
            label = %self.config.label,
            connections = self.shared.registry.len(),
            "Service listener draining"
        );

        self.shared.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(self.config.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                label = %self.config.label,
                remaining = self.shared.registry.len(),
                "Drain timeout expired, aborting connections"
            );
            self.shared.abort.cancel();
            self.tracker.wait().await;
        }

        self.remove_socket();
        self.state.send_replace(ListenerState::Stopped);
        info!(label = %self.config.label, "Service listener stopped");
    }

    fn remove_socket(&self) {
        if self.socket_removed.swap(true, Ordering::AcqRel) {
            return;
        }
        match std::fs::remove_file(&self.config.socket_path) {
            Ok(()) => debug!(socket = %self.config.socket_path.display(), "Removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => warn!(
                socket = %self.config.socket_path.display(),
                "Failed to remove socket file: {e}"
            ),
        }
    }
}

impl Drop for ServiceListener {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.abort.cancel();
        self.remove_socket();
    }
}

impl std::fmt::Debug for ServiceListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceListener")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn finish(&self, id: ConnectionId, outcome: ConnectionOutcome) {
        self.registry.remove(id);
        match outcome {
            ConnectionOutcome::Invalidated => {
                info!(connection = %id, "Connection invalidated");
                if let Some(observer) = &self.observer {
                    observer.on_invalidated(id);
                }
            },
            ConnectionOutcome::Interrupted(reason) => {
                warn!(connection = %id, %reason, "Connection interrupted");
                if let Some(observer) = &self.observer {
                    observer.on_interrupted(id, &reason);
                }
            },
            ConnectionOutcome::HandshakeRefused => {
                debug!(connection = %id, "Connection closed after failed handshake");
            },
            ConnectionOutcome::Revoked { peer, reason } => {
                warn!(connection = %id, %reason, "Connection revoked after handshake");
                if let Some(observer) = &self.observer {
                    observer.on_rejected(&peer, &reason);
                }
            },
            ConnectionOutcome::Drained => {
                debug!(connection = %id, "Connection closed for shutdown");
            },
            ConnectionOutcome::Aborted => {
                warn!(connection = %id, "Connection aborted after drain timeout");
            },
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    handler: Arc<dyn RequestHandler>,
    ctx: RequestContext,
    shared: &Shared,
) -> ConnectionOutcome {
    let mut stream = frame_for_handshake(stream);

    let handshake = tokio::time::timeout(
        shared.handshake_timeout,
        perform_handshake(&mut stream, &shared.label, &shared.shutdown),
    )
    .await;
    match handshake {
        Ok(Ok(HandshakeResult::Success)) => {
            if let AcceptDecision::Reject { reason } = shared.policy.confirm(&ctx.peer) {
                return ConnectionOutcome::Revoked {
                    peer: ctx.peer,
                    reason,
                };
            }
        },
        Ok(Ok(HandshakeResult::Failed)) => return ConnectionOutcome::HandshakeRefused,
        Ok(Ok(HandshakeResult::ConnectionClosed)) => return ConnectionOutcome::Invalidated,
        Ok(Err(e)) => return ConnectionOutcome::Interrupted(format!("handshake: {e:#}")),
        Err(_) => {
            return ConnectionOutcome::Interrupted(format!(
                "handshake timed out after {:?}",
                shared.handshake_timeout
            ));
        },
    }

    match serve_requests(&mut stream, handler, ctx, &shared.shutdown).await {
        ConnectionEnd::ClientClosed => ConnectionOutcome::Invalidated,
        ConnectionEnd::Interrupted(ProtocolError::Io(e))
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            ) =>
        {
            ConnectionOutcome::Invalidated
        },
        ConnectionEnd::Interrupted(e) if e.is_peer_fault() => {
            ConnectionOutcome::Interrupted(format!("protocol violation: {e}"))
        },
        ConnectionEnd::Interrupted(e) => ConnectionOutcome::Interrupted(e.to_string()),
        ConnectionEnd::Drained => ConnectionOutcome::Drained,
    }
}

fn ensure_directory(path: &Path) -> ProtocolResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "{} is a symlink, refusing to use it as the runtime directory",
                        path.display()
                    ),
                )));
            }
            if !metadata.is_dir() {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", path.display()),
                )));
            }
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            use std::os::unix::fs::PermissionsExt;

            std::fs::create_dir_all(path).map_err(|e| {
                ProtocolError::Io(io::Error::new(
                    e.kind(),
                    format!("failed to create directory {}: {e}", path.display()),
                ))
            })?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIRECTORY_MODE))
                .map_err(|e| {
                    ProtocolError::Io(io::Error::new(
                        e.kind(),
                        format!("failed to set permissions on {}: {e}", path.display()),
                    ))
                })
        },
        Err(e) => Err(ProtocolError::Io(io::Error::new(
            e.kind(),
            format!("failed to stat {}: {e}", path.display()),
        ))),
    }
}

fn set_socket_permissions(path: &Path) -> ProtocolResult<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE)).map_err(|e| {
        ProtocolError::Io(io::Error::new(
            e.kind(),
            format!("failed to set socket permissions on {}: {e}", path.display()),
        ))
    })
}

fn cleanup_socket(path: &Path) -> ProtocolResult<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to stat {}: {e}", path.display()),
            )));
        },
    };

    if !metadata.file_type().is_socket() {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("path {} exists but is not a socket", path.display()),
        )));
    }

    std::fs::remove_file(path).map_err(|e| {
        ProtocolError::Io(io::Error::new(
            e.kind(),
            format!("failed to remove stale socket {}: {e}", path.display()),
        ))
    })?;
    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}
