//! Request dispatch.
//!
//! The connection handler hands every post-handshake frame to a
//! [`RequestHandler`] and writes back whatever it returns. The production
//! handler is [`HelperDispatcher`], which decodes the frame, routes it by tag,
//! and turns every failure into an error reply so the caller always gets an
//! answer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::credentials::PeerCredentials;
use super::messages::{DecodeConfig, HelperResponse, Request, decode_request};

/// Identity of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// Listener-assigned connection id.
    pub connection_id: u64,
    /// Kernel-reported peer credentials.
    pub peer: PeerCredentials,
}

/// Outcome of the privileged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    /// Whether the operation succeeded.
    pub success: bool,
    /// What happened.
    pub detail: String,
}

impl OperationOutcome {
    /// Successful outcome.
    #[must_use]
    pub fn succeeded(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    /// Failed outcome.
    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// The one privileged operation a helper exposes.
#[async_trait]
pub trait PrivilegedOperation: Send + Sync {
    /// Run the operation for `ctx` with `payload` as input.
    ///
    /// Failures are reported in the outcome, not as errors.
    async fn perform(&self, payload: &[u8], ctx: &RequestContext) -> OperationOutcome;
}

/// Turns a request frame into a reply frame.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one frame. The return value is written back as-is.
    async fn handle(&self, frame: Bytes, ctx: &RequestContext) -> Bytes;
}

/// Routes helper requests by message type.
pub struct HelperDispatcher {
    operation: Arc<dyn PrivilegedOperation>,
    decode_config: DecodeConfig,
}

impl HelperDispatcher {
    /// Dispatcher running `operation` for `PerformPrivilegedOperation`.
    #[must_use]
    pub fn new(operation: Arc<dyn PrivilegedOperation>) -> Self {
        Self {
            operation,
            decode_config: DecodeConfig::default(),
        }
    }

    /// Override the decode limits.
    #[must_use]
    pub const fn with_decode_config(mut self, decode_config: DecodeConfig) -> Self {
        self.decode_config = decode_config;
        self
    }

    /// Answer one request frame.
    pub async fn dispatch(&self, frame: &[u8], ctx: &RequestContext) -> HelperResponse {
        let request = match decode_request(frame, &self.decode_config) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    connection_id = ctx.connection_id,
                    peer_uid = ctx.peer.uid,
                    "Rejected request: {e}"
                );
                return HelperResponse::error(e.code(), e.to_string());
            },
        };

        debug!(
            connection_id = ctx.connection_id,
            message = request.message_type().name(),
            "Dispatching request"
        );

        match request {
            Request::GetVersion => HelperResponse::version(),
            Request::PerformPrivilegedOperation { payload } => {
                let outcome = self.operation.perform(&payload, ctx).await;
                HelperResponse::operation(outcome.success, outcome.detail)
            },
        }
    }
}

#[async_trait]
impl RequestHandler for HelperDispatcher {
    async fn handle(&self, frame: Bytes, ctx: &RequestContext) -> Bytes {
        self.dispatch(&frame, ctx).await.encode()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::protocol::error::PROTOCOL_VERSION;
    use crate::protocol::messages::{
        GetVersionRequest, HELPER_VERSION, HelperErrorCode, encode_get_version_request,
    };

    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PrivilegedOperation for Echo {
        async fn perform(&self, payload: &[u8], ctx: &RequestContext) -> OperationOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            OperationOutcome::succeeded(format!(
                "{} from uid {}",
                String::from_utf8_lossy(payload),
                ctx.peer.uid
            ))
        }
    }

    fn ctx() -> RequestContext {
        RequestContext {
            connection_id: 7,
            peer: PeerCredentials {
                uid: 501,
                gid: 20,
                pid: Some(4242),
                start_time: None,
            },
        }
    }

    fn decode(frame: &Bytes) -> HelperResponse {
        HelperResponse::decode(frame, &DecodeConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_get_version() {
        let dispatcher = HelperDispatcher::new(Arc::new(Echo::default()));
        let reply = dispatcher.handle(Request::GetVersion.encode(), &ctx()).await;
        let HelperResponse::Version(resp) = decode(&reply) else {
            panic!("expected version reply");
        };
        assert_eq!(resp.version, HELPER_VERSION);
        assert_eq!(resp.protocol_version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_operation_is_routed() {
        let op = Arc::new(Echo::default());
        let dispatcher = HelperDispatcher::new(op.clone());
        let request = Request::PerformPrivilegedOperation {
            payload: b"hello".to_vec(),
        };

        let HelperResponse::Operation(resp) =
            decode(&dispatcher.handle(request.encode(), &ctx()).await)
        else {
            panic!("expected operation reply");
        };
        assert!(resp.success);
        assert_eq!(resp.detail, "hello from uid 501");
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_tag_gets_unsupported_reply() {
        let op = Arc::new(Echo::default());
        let dispatcher = HelperDispatcher::new(op.clone());

        let HelperResponse::Error(err) =
            decode(&dispatcher.handle(Bytes::from_static(&[9, 8, 1]), &ctx()).await)
        else {
            panic!("expected error reply");
        };
        assert_eq!(err.code(), HelperErrorCode::UnsupportedMessage);
        assert_eq!(op.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_future_version_gets_unsupported_reply() {
        let dispatcher = HelperDispatcher::new(Arc::new(Echo::default()));
        let frame = encode_get_version_request(&GetVersionRequest {
            protocol_version: PROTOCOL_VERSION + 1,
        });

        let HelperResponse::Error(err) = decode(&dispatcher.handle(frame, &ctx()).await) else {
            panic!("expected error reply");
        };
        assert_eq!(err.code(), HelperErrorCode::UnsupportedMessage);
    }

    #[tokio::test]
    async fn test_empty_frame_is_invalid() {
        let dispatcher = HelperDispatcher::new(Arc::new(Echo::default()));
        let HelperResponse::Error(err) = decode(&dispatcher.handle(Bytes::new(), &ctx()).await)
        else {
            panic!("expected error reply");
        };
        assert_eq!(err.code(), HelperErrorCode::InvalidRequest);
    }
}
