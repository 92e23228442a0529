//! Version and identity check that opens every helper connection.
//!
//! ```text
//! caller                                   privhelperd
//!   | -- hello     { version, client } ----------> |
//!   | <- hello_ack { version, server, label } ---- |   channel is open
//!   |    or                                        |
//!   | <- hello_nack { reason, detail } ----------- |   server hangs up
//! ```
//!
//! These frames are JSON, not protobuf, so an incompatible build still gets
//! a readable refusal. They are capped at [`MAX_HANDSHAKE_FRAME_SIZE`]. The
//! ack carries the service label: a socket path can be squatted, a label
//! baked into the helper cannot.

use bytes::Bytes;
use privhelper_core::ServiceLabel;
use serde::{Deserialize, Serialize};

use super::error::{MAX_HANDSHAKE_FRAME_SIZE, PROTOCOL_VERSION, ProtocolError, ProtocolResult};

/// Opening frame from the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    /// Wire version the caller was built with.
    pub version: u32,
    /// Free-form caller name, logged by the helper.
    pub client: String,
}

impl Hello {
    /// Hello for this build.
    #[must_use]
    pub fn current(client: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            client: client.into(),
        }
    }

    /// The helper's answer to this Hello.
    ///
    /// Only the exact version is accepted; there is no downgrade.
    #[must_use]
    pub fn answer(&self, server: &str, label: &ServiceLabel) -> HandshakeMessage {
        if self.version != PROTOCOL_VERSION {
            return HelloNack::unsupported_version(self.version).into();
        }
        HelloAck {
            version: PROTOCOL_VERSION,
            server: server.to_string(),
            label: label.to_string(),
        }
        .into()
    }
}

/// The helper accepted the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloAck {
    /// Wire version for the rest of the connection.
    pub version: u32,
    /// Helper name and build.
    pub server: String,
    /// Label the helper was installed under.
    pub label: String,
}

/// The helper refused the caller and is about to close the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloNack {
    /// Machine-readable cause.
    pub reason: RefusalReason,
    /// Text for logs and error messages.
    pub detail: String,
    /// Version the helper does speak, set for [`RefusalReason::UnsupportedVersion`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_version: Option<u32>,
}

/// Why a Hello was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    /// Caller and helper come from incompatible builds.
    UnsupportedVersion,
    /// The opening frame was not a well-formed Hello.
    Malformed,
    /// The listener is draining and takes no new channels.
    Draining,
}

impl HelloNack {
    fn new(reason: RefusalReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
            supported_version: None,
        }
    }

    /// Caller sent `version`.
    #[must_use]
    pub fn unsupported_version(version: u32) -> Self {
        Self {
            supported_version: Some(PROTOCOL_VERSION),
            ..Self::new(
                RefusalReason::UnsupportedVersion,
                format!("caller speaks protocol {version}, helper speaks {PROTOCOL_VERSION}"),
            )
        }
    }

    /// The opening frame did not parse.
    #[must_use]
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(RefusalReason::Malformed, detail)
    }

    /// Refusal while stopping.
    #[must_use]
    pub fn draining() -> Self {
        Self::new(RefusalReason::Draining, "helper is stopping")
    }
}

/// Any handshake frame, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Caller to helper.
    Hello(Hello),
    /// Helper to caller, accepted.
    HelloAck(HelloAck),
    /// Helper to caller, refused.
    HelloNack(HelloNack),
}

impl From<Hello> for HandshakeMessage {
    fn from(msg: Hello) -> Self {
        Self::Hello(msg)
    }
}

impl From<HelloAck> for HandshakeMessage {
    fn from(msg: HelloAck) -> Self {
        Self::HelloAck(msg)
    }
}

impl From<HelloNack> for HandshakeMessage {
    fn from(msg: HelloNack) -> Self {
        Self::HelloNack(msg)
    }
}

impl HandshakeMessage {
    /// Parse one handshake frame.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::FrameTooLarge`] past [`MAX_HANDSHAKE_FRAME_SIZE`],
    /// [`ProtocolError::Serialization`] for anything that is not one of the
    /// three message shapes.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        if frame.len() > MAX_HANDSHAKE_FRAME_SIZE {
            return Err(ProtocolError::frame_too_large(
                frame.len(),
                MAX_HANDSHAKE_FRAME_SIZE,
            ));
        }
        serde_json::from_slice(frame)
            .map_err(|e| ProtocolError::serialization(format!("handshake frame: {e}")))
    }

    /// JSON encoding of this message.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Serialization`] if serde refuses the value.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::serialization(format!("handshake frame: {e}")))
    }

    /// The Hello a helper expects as the first frame.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::HandshakeFailed`] if the caller opened with an ack or
    /// a nack.
    pub fn into_hello(self) -> ProtocolResult<Hello> {
        match self {
            Self::Hello(hello) => Ok(hello),
            other => Err(ProtocolError::handshake_failed(format!(
                "expected hello, got {}",
                other.kind()
            ))),
        }
    }

    /// Accept the helper's answer, or turn it into the matching error.
    ///
    /// The label is not checked here; callers compare it against the service
    /// they meant to reach.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::VersionMismatch`] for an ack at another version or
    ///   a version refusal
    /// - [`ProtocolError::HandshakeFailed`] for any other refusal, or if the
    ///   helper answered with a Hello of its own
    pub fn into_ack(self) -> ProtocolResult<HelloAck> {
        match self {
            Self::HelloAck(ack) if ack.version == PROTOCOL_VERSION => Ok(ack),
            Self::HelloAck(ack) => Err(ProtocolError::version_mismatch(ack.version)),
            Self::HelloNack(HelloNack {
                reason: RefusalReason::UnsupportedVersion,
                supported_version: Some(theirs),
                ..
            }) => Err(ProtocolError::version_mismatch(theirs)),
            Self::HelloNack(nack) => Err(ProtocolError::handshake_failed(nack.detail)),
            Self::Hello(_) => Err(ProtocolError::handshake_failed(
                "helper answered with a hello",
            )),
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::HelloAck(_) => "hello_ack",
            Self::HelloNack(_) => "hello_nack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label() -> ServiceLabel {
        ServiceLabel::new("com.example.helper").unwrap()
    }

    #[test]
    fn test_hello_is_tagged_json() {
        let frame = HandshakeMessage::from(Hello::current("cli/1.0")).encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["kind"], "hello");
        assert_eq!(value["version"], PROTOCOL_VERSION);
        assert_eq!(value["client"], "cli/1.0");
    }

    #[test]
    fn test_matching_versions_open_the_channel() {
        let wire = HandshakeMessage::from(Hello::current("cli/test")).encode().unwrap();
        let hello = HandshakeMessage::decode(&wire).unwrap().into_hello().unwrap();

        let answer = hello.answer("privhelperd/test", &label()).encode().unwrap();
        let ack = HandshakeMessage::decode(&answer).unwrap().into_ack().unwrap();
        assert_eq!(ack.server, "privhelperd/test");
        assert_eq!(ack.label, "com.example.helper");
    }

    #[test]
    fn test_other_version_is_refused_with_ours() {
        let hello = Hello {
            version: PROTOCOL_VERSION + 1,
            client: "future-cli".to_string(),
        };
        let HandshakeMessage::HelloNack(nack) = hello.answer("privhelperd/test", &label()) else {
            panic!("expected a refusal");
        };
        assert_eq!(nack.reason, RefusalReason::UnsupportedVersion);
        assert_eq!(nack.supported_version, Some(PROTOCOL_VERSION));

        let err = HandshakeMessage::from(nack).into_ack().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::VersionMismatch { peer_version, .. } if peer_version == PROTOCOL_VERSION
        ));
    }

    #[test]
    fn test_draining_refusal_is_handshake_failure() {
        let err = HandshakeMessage::from(HelloNack::draining())
            .into_ack()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeFailed { reason } if reason.contains("stopping")));
    }

    #[test]
    fn test_caller_opening_with_ack_is_rejected() {
        let ack = HelloAck {
            version: PROTOCOL_VERSION,
            server: "x".to_string(),
            label: "y".to_string(),
        };
        let err = HandshakeMessage::from(ack).into_hello().unwrap_err();
        assert!(err.to_string().contains("hello_ack"));
    }

    #[test]
    fn test_extra_fields_are_malformed() {
        let frame = br#"{"kind":"hello","version":1,"client":"x","uid":0}"#;
        assert!(matches!(
            HandshakeMessage::decode(frame),
            Err(ProtocolError::Serialization { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_is_refused_before_parsing() {
        let frame = vec![b'{'; MAX_HANDSHAKE_FRAME_SIZE + 1];
        assert!(matches!(
            HandshakeMessage::decode(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
