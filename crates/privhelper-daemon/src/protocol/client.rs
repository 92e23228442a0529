//! Client side of the helper channel.
//!
//! [`ChannelClient`] connects to an installed helper by service label, runs
//! the handshake, and exchanges requests one at a time. Every call to
//! [`ChannelClient::send`] resolves to exactly one outcome: a [`Reply`] or an
//! [`RpcError`].
//!
//! # Ordering
//!
//! Sends on one client are serialized: a request is written only after the
//! previous reply was read. A request abandoned mid-flight (deadline expired,
//! future dropped) leaves a reply in the pipe that no caller is waiting for,
//! so the channel is invalidated rather than risk handing that reply to the
//! next request.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use privhelper_core::install::ServiceLayout;
use privhelper_core::{HelperConfig, ServiceIdentity, ServiceLabel};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::error::{PROTOCOL_VERSION, ProtocolError};
use super::framing::FrameCodec;
use super::handshake::{HandshakeMessage, Hello};
use super::messages::{
    DecodeConfig, HelperErrorCode, HelperMessageType, HelperResponse, Reply, Request,
};

/// Default connect and handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration =
    Duration::from_millis(privhelper_core::config::DEFAULT_CONNECT_TIMEOUT_MS);

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where installed helpers put their sockets.
    pub layout: ServiceLayout,
    /// Bound on connecting plus the handshake.
    pub connect_timeout: Duration,
    /// Name sent in the Hello.
    pub client_info: String,
    /// Limits applied to reply bodies.
    pub decode: DecodeConfig,
}

impl ClientConfig {
    /// Settings for helpers installed under `layout`.
    #[must_use]
    pub fn new(layout: ServiceLayout) -> Self {
        Self {
            layout,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            client_info: format!("privhelper-client/{}", env!("CARGO_PKG_VERSION")),
            decode: DecodeConfig::default(),
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the client name.
    #[must_use]
    pub fn with_client_info(mut self, client_info: impl Into<String>) -> Self {
        self.client_info = client_info.into();
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(ServiceLayout::default())
    }
}

impl From<&HelperConfig> for ClientConfig {
    fn from(config: &HelperConfig) -> Self {
        Self::new(config.layout.clone()).with_connect_timeout(config.client.connect_timeout())
    }
}

/// Why a connection could not be established.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Nothing is listening for the label.
    #[error("service '{label}' not found at {}", path.display())]
    ServiceNotFound {
        /// Label asked for.
        label: ServiceLabel,
        /// Socket path tried.
        path: PathBuf,
    },

    /// A different service answered.
    #[error("identity mismatch: expected service '{expected}', connected to '{found}'")]
    IdentityMismatch {
        /// Label asked for.
        expected: ServiceLabel,
        /// Label the server announced.
        found: String,
    },

    /// The helper refused the connection.
    #[error("connection rejected: {reason}")]
    Rejected {
        /// Helper-provided or observed reason.
        reason: String,
    },

    /// The handshake failed for a protocol reason.
    #[error("handshake failed: {0}")]
    Handshake(#[source] ProtocolError),

    /// Connecting or the handshake took too long.
    #[error("connect timed out after {timeout:?}")]
    Timeout {
        /// Bound that expired.
        timeout: Duration,
    },

    /// The socket could not be opened.
    #[error("failed to connect to {}: {source}", path.display())]
    Io {
        /// Socket path tried.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Outcome of a request that produced no [`Reply`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The channel is gone: the helper closed it, or an earlier request left
    /// it unusable.
    #[error("channel invalidated: {reason}")]
    Invalidated {
        /// What happened.
        reason: String,
    },

    /// The transport failed while the request was in flight.
    #[error("channel interrupted: {reason}")]
    Interrupted {
        /// Transport error.
        reason: String,
    },

    /// No reply before the deadline.
    #[error("no reply within {deadline_ms} ms")]
    Timeout {
        /// Deadline in milliseconds.
        deadline_ms: u64,
    },

    /// The helper does not understand the request.
    #[error("unsupported message: {message}")]
    UnsupportedMessage {
        /// Helper detail.
        message: String,
    },

    /// The helper answered with another error.
    #[error("helper error ({code:?}): {message}")]
    Remote {
        /// Error class.
        code: HelperErrorCode,
        /// Helper detail.
        message: String,
    },

    /// The reply could not be understood.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What was wrong.
        reason: String,
    },
}

impl RpcError {
    /// Returns `true` if a fresh connection may succeed where this one failed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Invalidated { .. } | Self::Interrupted { .. } | Self::Timeout { .. }
        )
    }

    fn from_transport(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) if peer_gone(&e) => Self::Invalidated {
                reason: e.to_string(),
            },
            ProtocolError::Io(e) => Self::Interrupted {
                reason: e.to_string(),
            },
            ProtocolError::ConnectionClosed => Self::Invalidated {
                reason: "helper closed the connection".to_string(),
            },
            other => Self::Protocol {
                reason: other.to_string(),
            },
        }
    }
}

fn peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

struct Channel {
    framed: Framed<UnixStream, FrameCodec>,
    in_flight: bool,
    closed: Option<String>,
}

impl Channel {
    fn ensure_usable(&mut self) -> Result<(), RpcError> {
        if self.in_flight {
            self.closed
                .get_or_insert_with(|| "a previous request was abandoned in flight".to_string());
        }
        match &self.closed {
            Some(reason) => Err(RpcError::Invalidated {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn invalidate(&mut self, err: RpcError) -> RpcError {
        self.closed = Some(err.to_string());
        err
    }

    async fn round_trip(&mut self, request: bytes::Bytes) -> Result<bytes::Bytes, RpcError> {
        if let Err(e) = self.framed.send(request).await {
            return Err(self.invalidate(RpcError::from_transport(e)));
        }
        match self.framed.next().await {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(self.invalidate(RpcError::from_transport(e))),
            None => Err(self.invalidate(RpcError::from_transport(
                ProtocolError::ConnectionClosed,
            ))),
        }
    }
}

/// Connection to one helper.
pub struct ChannelClient {
    label: ServiceLabel,
    server_info: String,
    decode: DecodeConfig,
    channel: Mutex<Channel>,
}

impl ChannelClient {
    /// Connect to the helper installed for `identity`.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::ServiceNotFound`] if no socket exists or nothing
    ///   listens on it
    /// - [`ConnectError::IdentityMismatch`] if another service answers
    /// - [`ConnectError::Rejected`] if the helper refuses the connection
    /// - [`ConnectError::Timeout`], [`ConnectError::Handshake`] or
    ///   [`ConnectError::Io`] otherwise
    pub async fn connect(
        identity: &ServiceIdentity,
        config: &ClientConfig,
    ) -> Result<Self, ConnectError> {
        let path = config.layout.socket_path(&identity.label);

        let stream =
            match tokio::time::timeout(config.connect_timeout, UnixStream::connect(&path)).await {
                Err(_) => {
                    return Err(ConnectError::Timeout {
                        timeout: config.connect_timeout,
                    });
                },
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    return Err(ConnectError::ServiceNotFound {
                        label: identity.label.clone(),
                        path,
                    });
                },
                Ok(Err(source)) => return Err(ConnectError::Io { path, source }),
                Ok(Ok(stream)) => stream,
            };

        Self::establish(stream, &identity.label, config).await
    }

    /// Run the handshake on an already connected stream.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect), minus `ServiceNotFound`.
    pub async fn establish(
        stream: UnixStream,
        label: &ServiceLabel,
        config: &ClientConfig,
    ) -> Result<Self, ConnectError> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        let server_info =
            tokio::time::timeout(config.connect_timeout, handshake(&mut framed, label, config))
                .await
                .map_err(|_| ConnectError::Timeout {
                    timeout: config.connect_timeout,
                })??;

        debug!(%label, server_info = %server_info, "Connected to helper");
        Ok(Self {
            label: label.clone(),
            server_info,
            decode: config.decode,
            channel: Mutex::new(Channel {
                framed,
                in_flight: false,
                closed: None,
            }),
        })
    }

    /// Label of the connected helper.
    #[must_use]
    pub const fn label(&self) -> &ServiceLabel {
        &self.label
    }

    /// Server name from the handshake.
    #[must_use]
    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    /// Send `request` and wait up to `deadline` for its reply.
    ///
    /// Waiting for an earlier send on the same client counts against the
    /// deadline.
    ///
    /// # Errors
    ///
    /// Returns exactly one [`RpcError`] when no reply is produced. After
    /// [`RpcError::Timeout`] or any transport failure the client is
    /// invalidated and later sends fail with [`RpcError::Invalidated`].
    pub async fn send(&self, request: &Request, deadline: Duration) -> Result<Reply, RpcError> {
        if let Ok(result) = tokio::time::timeout(deadline, self.exchange(request)).await {
            result
        } else {
            let deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
            warn!(
                label = %self.label,
                message = request.message_type().name(),
                deadline_ms,
                "Request timed out"
            );
            Err(RpcError::Timeout { deadline_ms })
        }
    }

    /// Ask the helper for its version.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn get_version(&self, deadline: Duration) -> Result<String, RpcError> {
        match self.send(&Request::GetVersion, deadline).await? {
            Reply::Version { version } => Ok(version),
            other => Err(unexpected(HelperMessageType::GetVersion, &other)),
        }
    }

    /// Run the helper's privileged operation.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn perform_privileged_operation(
        &self,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<(bool, String), RpcError> {
        let request = Request::PerformPrivilegedOperation { payload };
        match self.send(&request, deadline).await? {
            Reply::OperationResult { success, detail } => Ok((success, detail)),
            other => Err(unexpected(
                HelperMessageType::PerformPrivilegedOperation,
                &other,
            )),
        }
    }

    async fn exchange(&self, request: &Request) -> Result<Reply, RpcError> {
        let mut channel = self.channel.lock().await;
        channel.ensure_usable()?;

        channel.in_flight = true;
        let frame = channel.round_trip(request.encode()).await?;
        channel.in_flight = false;

        match self.interpret(request.message_type(), &frame) {
            Err(err @ RpcError::Protocol { .. }) => Err(channel.invalidate(err)),
            other => other,
        }
    }

    fn interpret(&self, sent: HelperMessageType, frame: &[u8]) -> Result<Reply, RpcError> {
        let response =
            HelperResponse::decode(frame, &self.decode).map_err(|e| RpcError::Protocol {
                reason: e.to_string(),
            })?;

        // Error replies are honored at any version so an older or newer
        // helper can still say it does not understand us.
        if let HelperResponse::Error(err) = &response {
            return Err(match err.code() {
                HelperErrorCode::UnsupportedMessage => RpcError::UnsupportedMessage {
                    message: err.message.clone(),
                },
                code => RpcError::Remote {
                    code,
                    message: err.message.clone(),
                },
            });
        }

        if response.protocol_version() != PROTOCOL_VERSION {
            return Err(RpcError::Protocol {
                reason: format!(
                    "reply at protocol version {}, expected {PROTOCOL_VERSION}",
                    response.protocol_version()
                ),
            });
        }

        match response {
            HelperResponse::Version(resp) if sent == HelperMessageType::GetVersion => {
                Ok(Reply::Version {
                    version: resp.version,
                })
            },
            HelperResponse::Operation(resp)
                if sent == HelperMessageType::PerformPrivilegedOperation =>
            {
                Ok(Reply::OperationResult {
                    success: resp.success,
                    detail: resp.detail,
                })
            },
            other => Err(RpcError::Protocol {
                reason: format!(
                    "{} answered with a {} reply",
                    sent.name(),
                    other.message_type().map_or("error", HelperMessageType::name)
                ),
            }),
        }
    }
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("label", &self.label)
            .field("server_info", &self.server_info)
            .finish_non_exhaustive()
    }
}

fn unexpected(sent: HelperMessageType, reply: &Reply) -> RpcError {
    RpcError::Protocol {
        reason: format!("{} answered with {reply:?}", sent.name()),
    }
}

async fn handshake(
    framed: &mut Framed<UnixStream, FrameCodec>,
    label: &ServiceLabel,
    config: &ClientConfig,
) -> Result<String, ConnectError> {
    let hello = HandshakeMessage::from(Hello::current(&config.client_info))
        .encode()
        .map_err(ConnectError::Handshake)?;

    if let Err(e) = framed.send(hello).await {
        return Err(handshake_transport_error(e));
    }

    let frame = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(handshake_transport_error(e)),
        None => {
            return Err(ConnectError::Rejected {
                reason: "helper closed the connection during the handshake".to_string(),
            });
        },
    };

    let ack = match HandshakeMessage::decode(&frame).and_then(HandshakeMessage::into_ack) {
        Ok(ack) => ack,
        Err(ProtocolError::HandshakeFailed { reason }) => {
            return Err(ConnectError::Rejected { reason });
        },
        Err(e) => return Err(ConnectError::Handshake(e)),
    };
    if ack.label != label.as_str() {
        return Err(ConnectError::IdentityMismatch {
            expected: label.clone(),
            found: ack.label,
        });
    }
    Ok(ack.server)
}

fn handshake_transport_error(err: ProtocolError) -> ConnectError {
    match err {
        ProtocolError::Io(e) if peer_gone(&e) => ConnectError::Rejected {
            reason: format!("helper closed the connection during the handshake: {e}"),
        },
        other => ConnectError::Handshake(other),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::protocol::handshake::{HelloAck, HelloNack};
    use crate::protocol::messages::{ERROR_TAG, decode_request};

    fn label() -> ServiceLabel {
        ServiceLabel::new("com.example.helper").unwrap()
    }

    type Server = Framed<UnixStream, FrameCodec>;

    /// Accept the client's Hello and answer with `reply`.
    async fn answer_hello(server: &mut Server, reply: HandshakeMessage) {
        let _hello = server.next().await.unwrap().unwrap();
        server
            .send(reply.encode().unwrap())
            .await
            .unwrap();
    }

    fn ack(label: &str) -> HandshakeMessage {
        HelloAck {
            version: PROTOCOL_VERSION,
            server: "fake/1".to_string(),
            label: label.to_string(),
        }
        .into()
    }

    async fn connected_pair() -> (ChannelClient, Server) {
        let (client, server) = UnixStream::pair().unwrap();
        let mut server = Framed::new(server, FrameCodec::new());
        let server_task = tokio::spawn(async move {
            answer_hello(&mut server, ack("com.example.helper")).await;
            server
        });
        let client = ChannelClient::establish(client, &label(), &ClientConfig::default())
            .await
            .unwrap();
        (client, server_task.await.unwrap())
    }

    #[test]
    fn test_config_connect_timeout_is_not_the_request_timeout() {
        let config = HelperConfig::from_toml(
            r#"
            [service]
            label = "com.example.helper"
            source_binary = "helper"

            [client]
            request_timeout_ms = 60000
            connect_timeout_ms = 750
            "#,
        )
        .unwrap();
        let client = ClientConfig::from(&config);
        assert_eq!(client.connect_timeout, Duration::from_millis(750));
        assert_eq!(client.layout, config.layout);

        let defaults = HelperConfig::from_toml(
            "[service]\nlabel = \"com.example.helper\"\nsource_binary = \"helper\"\n",
        )
        .unwrap();
        assert_eq!(
            ClientConfig::from(&defaults).connect_timeout,
            DEFAULT_CONNECT_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_connect_missing_socket_is_service_not_found() {
        let tmp = TempDir::new().unwrap();
        let config = ClientConfig::new(ServiceLayout::rooted_at(tmp.path()));
        let identity = ServiceIdentity::new(
            label(),
            privhelper_core::CodeIdentity::of_bytes(b"helper"),
        );
        let err = ChannelClient::connect(&identity, &config).await.unwrap_err();
        assert!(matches!(err, ConnectError::ServiceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_wrong_service_is_identity_mismatch() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut server = Framed::new(server, FrameCodec::new());
        tokio::spawn(async move { answer_hello(&mut server, ack("com.example.other")).await });

        let err = ChannelClient::establish(client, &label(), &ClientConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::IdentityMismatch { found, .. } if found == "com.example.other"));
    }

    #[tokio::test]
    async fn test_nack_is_rejected() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut server = Framed::new(server, FrameCodec::new());
        tokio::spawn(async move {
            answer_hello(&mut server, HelloNack::draining().into()).await;
        });

        let err = ChannelClient::establish(client, &label(), &ClientConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_silent_close_is_rejected() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(server);
        let err = ChannelClient::establish(client, &label(), &ClientConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Rejected { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_get_version_round_trip() {
        let (client, mut server) = connected_pair().await;
        tokio::spawn(async move {
            let frame = server.next().await.unwrap().unwrap();
            assert_eq!(
                decode_request(&frame, &DecodeConfig::default()).unwrap(),
                Request::GetVersion
            );
            server.send(HelperResponse::version().encode()).await.unwrap();
        });

        let version = client.get_version(Duration::from_secs(1)).await.unwrap();
        assert_eq!(version, "1.0.0");
    }

    #[tokio::test]
    async fn test_unsupported_reply() {
        let (client, mut server) = connected_pair().await;
        tokio::spawn(async move {
            let _ = server.next().await;
            let reply = HelperResponse::error(HelperErrorCode::UnsupportedMessage, "what");
            server.send(reply.encode()).await.unwrap();
        });

        let err = client
            .send(&Request::GetVersion, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::UnsupportedMessage {
                message: "what".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_close_mid_request_is_invalidated() {
        let (client, mut server) = connected_pair().await;
        tokio::spawn(async move {
            let _ = server.next().await;
            drop(server);
        });

        let err = client
            .send(&Request::GetVersion, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Invalidated { .. }), "{err:?}");

        let again = client
            .send(&Request::GetVersion, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(again, RpcError::Invalidated { .. }));
    }

    #[tokio::test]
    async fn test_timeout_invalidates_channel() {
        let (client, mut server) = connected_pair().await;
        let server_task = tokio::spawn(async move {
            let _ = server.next().await;
            // Answer late; nobody may receive this.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = server.send(HelperResponse::version().encode()).await;
            server
        });

        let err = client
            .send(&Request::GetVersion, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Timeout { deadline_ms: 20 });
        assert!(err.is_recoverable());

        let _server = server_task.await.unwrap();
        let err = client
            .send(&Request::GetVersion, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Invalidated { .. }));
    }

    #[tokio::test]
    async fn test_mismatched_reply_kind_is_protocol_error() {
        let (client, mut server) = connected_pair().await;
        tokio::spawn(async move {
            let _ = server.next().await;
            server
                .send(HelperResponse::operation(true, "x").encode())
                .await
                .unwrap();
        });

        let err = client
            .send(&Request::GetVersion, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_garbage_reply_is_protocol_error() {
        let (client, mut server) = connected_pair().await;
        tokio::spawn(async move {
            let _ = server.next().await;
            server.send(Bytes::from_static(&[ERROR_TAG, 0xff])).await.unwrap();
        });

        let err = client
            .send(&Request::GetVersion, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }
}
