//! Helper IPC protocol.
//!
//! Wire layout on the helper's Unix socket:
//!
//! 1. Length-prefixed frames ([`framing`]): 4-byte big-endian length, then
//!    the payload
//! 2. JSON hello exchange ([`handshake`]) naming the protocol version and
//!    the service label
//! 3. Tagged protobuf requests and replies ([`messages`]), every one carrying
//!    its protocol version
//!
//! [`connection_handler`] and [`dispatch`] are the server half;
//! [`client`] is the caller half.

pub mod client;
pub mod connection_handler;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;

pub use client::{ChannelClient, ClientConfig, ConnectError, RpcError};
pub use credentials::PeerCredentials;
pub use dispatch::{
    HelperDispatcher, OperationOutcome, PrivilegedOperation, RequestContext, RequestHandler,
};
pub use error::{
    MAX_FRAME_SIZE, MAX_HANDSHAKE_FRAME_SIZE, PROTOCOL_VERSION, ProtocolError, ProtocolResult,
};
pub use framing::FrameCodec;
pub use handshake::{HandshakeMessage, Hello, HelloAck, HelloNack, RefusalReason};
pub use messages::{
    DecodeConfig, HELPER_VERSION, HelperErrorCode, HelperMessageType, HelperResponse, Reply,
    Request, decode_request,
};
