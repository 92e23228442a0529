//! Helper request and reply messages.
//!
//! After the handshake every frame is `[tag: u8][protobuf]`. Request tags
//! select the message kind; a reply carries the tag of the request it answers,
//! or [`ERROR_TAG`] for an error.
//!
//! | Tag | Request                        | Reply                                  |
//! |-----|--------------------------------|----------------------------------------|
//! | 1   | [`GetVersionRequest`]          | [`GetVersionResponse`]                 |
//! | 2   | [`PerformPrivilegedOperationRequest`] | [`PerformPrivilegedOperationResponse`] |
//! | 0   | (never sent)                   | [`HelperError`]                        |
//!
//! Every message carries `protocol_version`. A request with an unknown tag or
//! a version other than [`PROTOCOL_VERSION`] is answered with
//! [`HelperErrorCode::UnsupportedMessage`], never with silence.

use bytes::Bytes;
use prost::Message;

use super::error::{PROTOCOL_VERSION, ProtocolError, ProtocolResult};

/// Version string reported by `GetVersion`.
pub const HELPER_VERSION: &str = "1.0.0";

/// Tag of error replies.
pub const ERROR_TAG: u8 = 0;

/// Default cap on a decoded message body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// `GetVersion` request.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct GetVersionRequest {
    /// Protocol version of the sender.
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
}

/// `GetVersion` reply.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct GetVersionResponse {
    /// Protocol version of the sender.
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    /// Helper version, a bare semantic version.
    #[prost(string, tag = "2")]
    pub version: String,
}

/// `PerformPrivilegedOperation` request.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct PerformPrivilegedOperationRequest {
    /// Protocol version of the sender.
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    /// Operation input.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// `PerformPrivilegedOperation` reply.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct PerformPrivilegedOperationResponse {
    /// Protocol version of the sender.
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    /// Whether the operation succeeded.
    #[prost(bool, tag = "2")]
    pub success: bool,
    /// What happened.
    #[prost(string, tag = "3")]
    pub detail: String,
}

/// Error reply.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct HelperError {
    /// Protocol version of the sender.
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    /// Error class.
    #[prost(enumeration = "HelperErrorCode", tag = "2")]
    pub code: i32,
    /// Detail.
    #[prost(string, tag = "3")]
    pub message: String,
}

/// Error classes carried by [`HelperError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum HelperErrorCode {
    /// Not set.
    Unspecified = 0,
    /// Unknown message kind or unsupported protocol version.
    UnsupportedMessage = 1,
    /// The request body could not be decoded.
    InvalidRequest = 2,
    /// The handler failed.
    OperationFailed = 3,
}

/// Request kinds and their wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelperMessageType {
    /// `GetVersion`.
    GetVersion = 1,
    /// `PerformPrivilegedOperation`.
    PerformPrivilegedOperation = 2,
}

impl HelperMessageType {
    /// Parse a tag byte.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::GetVersion),
            2 => Some(Self::PerformPrivilegedOperation),
            _ => None,
        }
    }

    /// Wire tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Message name, for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetVersion => "GetVersion",
            Self::PerformPrivilegedOperation => "PerformPrivilegedOperation",
        }
    }
}

/// Limits applied when decoding untrusted message bodies.
#[derive(Debug, Clone, Copy)]
pub struct DecodeConfig {
    /// Largest body accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Size-checked protobuf decoding.
pub trait BoundedDecode: Message + Default + Sized {
    /// Decode `buf`, refusing bodies over the configured size.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] over the limit, or
    /// [`ProtocolError::Serialization`] for malformed protobuf.
    fn decode_bounded(buf: &[u8], config: &DecodeConfig) -> ProtocolResult<Self> {
        if buf.len() > config.max_message_size {
            return Err(ProtocolError::frame_too_large(
                buf.len(),
                config.max_message_size,
            ));
        }
        Self::decode(buf).map_err(|e| ProtocolError::serialization(e.to_string()))
    }
}

impl<T: Message + Default> BoundedDecode for T {}

/// A request as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask for the helper version.
    GetVersion,
    /// Run the helper's privileged operation.
    PerformPrivilegedOperation {
        /// Operation input.
        payload: Vec<u8>,
    },
}

impl Request {
    /// Kind of this request.
    #[must_use]
    pub const fn message_type(&self) -> HelperMessageType {
        match self {
            Self::GetVersion => HelperMessageType::GetVersion,
            Self::PerformPrivilegedOperation { .. } => {
                HelperMessageType::PerformPrivilegedOperation
            },
        }
    }

    /// Encode at the current protocol version.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::GetVersion => encode_get_version_request(&GetVersionRequest {
                protocol_version: PROTOCOL_VERSION,
            }),
            Self::PerformPrivilegedOperation { payload } => {
                encode_perform_privileged_operation_request(&PerformPrivilegedOperationRequest {
                    protocol_version: PROTOCOL_VERSION,
                    payload: payload.clone(),
                })
            },
        }
    }
}

/// A successful reply as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answer to `GetVersion`.
    Version {
        /// Helper version.
        version: String,
    },
    /// Answer to `PerformPrivilegedOperation`.
    OperationResult {
        /// Whether the operation succeeded.
        success: bool,
        /// What happened.
        detail: String,
    },
}

/// Why a request frame could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestDecodeError {
    /// The frame has no tag byte.
    #[error("empty frame")]
    Empty,

    /// The tag names no known message.
    #[error("unknown message type: {tag}")]
    UnknownTag {
        /// Tag received.
        tag: u8,
    },

    /// The message kind is known but the version is not.
    #[error(
        "{kind} at protocol version {version} is not supported (expected {expected})",
        expected = PROTOCOL_VERSION
    )]
    UnsupportedVersion {
        /// Message name.
        kind: &'static str,
        /// Version received.
        version: u32,
    },

    /// The body is not valid for the message kind.
    #[error("invalid {kind} request: {reason}")]
    Malformed {
        /// Message name.
        kind: &'static str,
        /// Decoder detail.
        reason: String,
    },
}

impl RequestDecodeError {
    /// Error code to answer with.
    #[must_use]
    pub const fn code(&self) -> HelperErrorCode {
        match self {
            Self::UnknownTag { .. } | Self::UnsupportedVersion { .. } => {
                HelperErrorCode::UnsupportedMessage
            },
            Self::Empty | Self::Malformed { .. } => HelperErrorCode::InvalidRequest,
        }
    }
}

/// Decode a request frame.
///
/// # Errors
///
/// Returns [`RequestDecodeError`] describing why the frame is unusable; its
/// [`code`](RequestDecodeError::code) is the error to reply with.
pub fn decode_request(frame: &[u8], config: &DecodeConfig) -> Result<Request, RequestDecodeError> {
    let (&tag, body) = frame.split_first().ok_or(RequestDecodeError::Empty)?;
    let kind = HelperMessageType::from_tag(tag).ok_or(RequestDecodeError::UnknownTag { tag })?;
    let malformed = |e: ProtocolError| RequestDecodeError::Malformed {
        kind: kind.name(),
        reason: e.to_string(),
    };
    let check_version = |version: u32| {
        if version == PROTOCOL_VERSION {
            Ok(())
        } else {
            Err(RequestDecodeError::UnsupportedVersion {
                kind: kind.name(),
                version,
            })
        }
    };

    match kind {
        HelperMessageType::GetVersion => {
            let req = GetVersionRequest::decode_bounded(body, config).map_err(malformed)?;
            check_version(req.protocol_version)?;
            Ok(Request::GetVersion)
        },
        HelperMessageType::PerformPrivilegedOperation => {
            let req = PerformPrivilegedOperationRequest::decode_bounded(body, config)
                .map_err(malformed)?;
            check_version(req.protocol_version)?;
            Ok(Request::PerformPrivilegedOperation {
                payload: req.payload,
            })
        },
    }
}

fn tagged(tag: u8, message: &impl Message) -> Bytes {
    let mut buf = Vec::with_capacity(1 + message.encoded_len());
    buf.push(tag);
    buf.extend_from_slice(&message.encode_to_vec());
    Bytes::from(buf)
}

/// Encode a `GetVersion` request.
#[must_use]
pub fn encode_get_version_request(request: &GetVersionRequest) -> Bytes {
    tagged(HelperMessageType::GetVersion.tag(), request)
}

/// Encode a `PerformPrivilegedOperation` request.
#[must_use]
pub fn encode_perform_privileged_operation_request(
    request: &PerformPrivilegedOperationRequest,
) -> Bytes {
    tagged(HelperMessageType::PerformPrivilegedOperation.tag(), request)
}

/// Reply envelope as sent by the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperResponse {
    /// `GetVersion` answer.
    Version(GetVersionResponse),
    /// `PerformPrivilegedOperation` answer.
    Operation(PerformPrivilegedOperationResponse),
    /// Error.
    Error(HelperError),
}

impl HelperResponse {
    /// Version reply at the current protocol version.
    #[must_use]
    pub fn version() -> Self {
        Self::Version(GetVersionResponse {
            protocol_version: PROTOCOL_VERSION,
            version: HELPER_VERSION.to_string(),
        })
    }

    /// Operation reply at the current protocol version.
    #[must_use]
    pub fn operation(success: bool, detail: impl Into<String>) -> Self {
        Self::Operation(PerformPrivilegedOperationResponse {
            protocol_version: PROTOCOL_VERSION,
            success,
            detail: detail.into(),
        })
    }

    /// Error reply.
    #[must_use]
    pub fn error(code: HelperErrorCode, message: impl Into<String>) -> Self {
        Self::Error(HelperError {
            protocol_version: PROTOCOL_VERSION,
            code: code.into(),
            message: message.into(),
        })
    }

    /// `[tag][protobuf]` encoding.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Version(resp) => tagged(HelperMessageType::GetVersion.tag(), resp),
            Self::Operation(resp) => {
                tagged(HelperMessageType::PerformPrivilegedOperation.tag(), resp)
            },
            Self::Error(err) => tagged(ERROR_TAG, err),
        }
    }

    /// Decode a reply frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] for an empty frame, an unknown
    /// tag, or a malformed body.
    pub fn decode(frame: &[u8], config: &DecodeConfig) -> ProtocolResult<Self> {
        let (&tag, body) = frame
            .split_first()
            .ok_or_else(|| ProtocolError::serialization("empty reply frame"))?;
        if tag == ERROR_TAG {
            return Ok(Self::Error(HelperError::decode_bounded(body, config)?));
        }
        match HelperMessageType::from_tag(tag) {
            Some(HelperMessageType::GetVersion) => {
                Ok(Self::Version(GetVersionResponse::decode_bounded(body, config)?))
            },
            Some(HelperMessageType::PerformPrivilegedOperation) => Ok(Self::Operation(
                PerformPrivilegedOperationResponse::decode_bounded(body, config)?,
            )),
            None => Err(ProtocolError::serialization(format!(
                "unknown reply tag: {tag}"
            ))),
        }
    }

    /// Protocol version the reply was produced at.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        match self {
            Self::Version(resp) => resp.protocol_version,
            Self::Operation(resp) => resp.protocol_version,
            Self::Error(err) => err.protocol_version,
        }
    }

    /// Message kind answered, or `None` for an error.
    #[must_use]
    pub const fn message_type(&self) -> Option<HelperMessageType> {
        match self {
            Self::Version(_) => Some(HelperMessageType::GetVersion),
            Self::Operation(_) => Some(HelperMessageType::PerformPrivilegedOperation),
            Self::Error(_) => None,
        }
    }
}
