//! Connection-level failures and wire limits.
//!
//! Everything here concerns one socket: frame sizes, the handshake and the
//! transport. What a caller of the helper sees per request is
//! [`super::client::RpcError`].

use std::io;

use thiserror::Error;

/// Version of the helper wire protocol.
///
/// Sent in the Hello, echoed in the ack, and stamped on every request and
/// reply so either side can refuse a peer built from a different release.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame accepted before the handshake completes.
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 << 10;

/// Largest frame accepted on an established channel.
pub const MAX_FRAME_SIZE: usize = 16 << 20;

/// A failure on one helper connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A length prefix announced more than the current limit.
    #[error("frame of {size} bytes exceeds the {max}-byte limit")]
    FrameTooLarge {
        /// Announced length.
        size: usize,
        /// Limit at the time.
        max: usize,
    },

    /// The two sides were built against different protocol versions.
    #[error("peer speaks protocol version {peer_version}, this side speaks {local_version}")]
    VersionMismatch {
        /// What the peer announced.
        peer_version: u32,
        /// [`PROTOCOL_VERSION`].
        local_version: u32,
    },

    /// The peer refused the handshake or answered it with nonsense.
    #[error("handshake refused: {reason}")]
    HandshakeFailed {
        /// Detail from the peer or from local validation.
        reason: String,
    },

    /// Orderly close by the peer.
    #[error("peer closed the connection")]
    ConnectionClosed,

    /// Socket read or write failed.
    #[error("transport: {0}")]
    Io(#[from] io::Error),

    /// A frame arrived intact but its contents would not decode.
    #[error("malformed payload: {reason}")]
    Serialization {
        /// Decoder message.
        reason: String,
    },
}

impl ProtocolError {
    /// Length prefix `size` is over `max`.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// Peer announced `peer_version`.
    #[must_use]
    pub const fn version_mismatch(peer_version: u32) -> Self {
        Self::VersionMismatch {
            peer_version,
            local_version: PROTOCOL_VERSION,
        }
    }

    /// Handshake refused with `reason`.
    #[must_use]
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Undecodable payload.
    #[must_use]
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// The peer broke the protocol, as opposed to the transport failing.
    #[must_use]
    pub const fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::VersionMismatch { .. }
                | Self::HandshakeFailed { .. }
                | Self::Serialization { .. }
        )
    }
}

/// Result alias for connection-level operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    const _: () = assert!(MAX_HANDSHAKE_FRAME_SIZE < MAX_FRAME_SIZE);

    #[test]
    fn test_version_mismatch_names_both_sides() {
        let msg = ProtocolError::version_mismatch(7).to_string();
        assert!(msg.contains("version 7"), "{msg}");
        assert!(msg.contains(&format!("speaks {PROTOCOL_VERSION}")), "{msg}");
    }

    #[test]
    fn test_transport_errors_are_not_peer_faults() {
        let pipe = ProtocolError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(!pipe.is_peer_fault());
        assert!(!ProtocolError::ConnectionClosed.is_peer_fault());
        assert!(ProtocolError::frame_too_large(MAX_FRAME_SIZE + 1, MAX_FRAME_SIZE).is_peer_fault());
        assert!(ProtocolError::serialization("bad tag").is_peer_fault());
    }
}
