//! Per-connection server loop.
//!
//! A connection that passed the accept policy goes through the Hello/HelloAck
//! handshake and then a strict request/reply loop: one frame in, one frame
//! out, in order. Shutdown is only observed while waiting for the next
//! request, so a request that has been read is always answered.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use privhelper_core::ServiceLabel;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::dispatch::{RequestContext, RequestHandler};
use super::error::{MAX_FRAME_SIZE, MAX_HANDSHAKE_FRAME_SIZE, ProtocolError};
use super::framing::FrameCodec;
use super::handshake::{HandshakeMessage, HelloNack};

/// Framed server-side stream.
pub type ServerStream = Framed<UnixStream, FrameCodec>;

/// Server name sent in the handshake.
#[must_use]
pub fn server_info() -> String {
    format!("privhelperd/{}", env!("CARGO_PKG_VERSION"))
}

/// Wrap a freshly accepted stream with the handshake frame limit.
#[must_use]
pub fn frame_for_handshake(stream: UnixStream) -> ServerStream {
    Framed::new(stream, FrameCodec::with_max_frame_size(MAX_HANDSHAKE_FRAME_SIZE))
}

/// Result of the handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    /// Ready for requests.
    Success,
    /// A `HelloNack` was sent.
    Failed,
    /// The client went away before sending Hello.
    ConnectionClosed,
}

/// How a served connection ended.
#[derive(Debug)]
pub enum ConnectionEnd {
    /// The client closed the connection between requests.
    ClientClosed,
    /// The transport failed.
    Interrupted(ProtocolError),
    /// The listener is draining and the connection was idle.
    Drained,
}

/// Run the server side of the handshake.
///
/// While `shutdown` is cancelled the client is refused with
/// `Draining`. On success the frame limit is widened to
/// [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns an error if the transport fails or a reply cannot be encoded.
pub async fn perform_handshake(
    stream: &mut ServerStream,
    label: &ServiceLabel,
    shutdown: &CancellationToken,
) -> Result<HandshakeResult> {
    let frame = match stream.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
            warn!("Failed to receive handshake frame: {e}");
            return Err(e.into());
        },
        None => return Ok(HandshakeResult::ConnectionClosed),
    };

    let hello = match HandshakeMessage::decode(&frame).and_then(HandshakeMessage::into_hello) {
        Ok(hello) => hello,
        Err(e) => {
            warn!("Unreadable hello: {e}");
            reply(stream, HelloNack::malformed(e.to_string()).into()).await?;
            return Ok(HandshakeResult::Failed);
        },
    };

    if shutdown.is_cancelled() {
        reply(stream, HelloNack::draining().into()).await?;
        return Ok(HandshakeResult::Failed);
    }

    let answer = hello.answer(&server_info(), label);
    let accepted = matches!(answer, HandshakeMessage::HelloAck(_));
    reply(stream, answer).await?;

    if !accepted {
        debug!(
            client = %hello.client,
            client_version = hello.version,
            "Handshake refused"
        );
        return Ok(HandshakeResult::Failed);
    }

    stream.codec_mut().set_max_frame_size(MAX_FRAME_SIZE);
    debug!(client = %hello.client, "Handshake completed");
    Ok(HandshakeResult::Success)
}

async fn reply(stream: &mut ServerStream, msg: HandshakeMessage) -> Result<()> {
    let bytes = msg.encode().context("failed to encode handshake reply")?;
    stream.send(bytes).await?;
    Ok(())
}

/// Serve requests until the client leaves, the transport fails, or the
/// listener drains.
pub async fn serve_requests(
    stream: &mut ServerStream,
    handler: Arc<dyn RequestHandler>,
    ctx: RequestContext,
    shutdown: &CancellationToken,
) -> ConnectionEnd {
    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => return ConnectionEnd::Drained,
            next = stream.next() => next,
        };

        let frame = match next {
            None => return ConnectionEnd::ClientClosed,
            Some(Err(e)) => return ConnectionEnd::Interrupted(e),
            Some(Ok(frame)) => frame,
        };

        let reply = handler.handle(frame, &ctx).await;
        if let Err(e) = stream.send(reply).await {
            return ConnectionEnd::Interrupted(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::time::timeout;

    use super::*;
    use crate::protocol::credentials::PeerCredentials;
    use crate::protocol::handshake::Hello;

    fn label() -> ServiceLabel {
        ServiceLabel::new("com.example.helper").unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext {
            connection_id: 1,
            peer: PeerCredentials {
                uid: 0,
                gid: 0,
                pid: None,
                start_time: None,
            },
        }
    }

    struct Reverse;

    #[async_trait]
    impl RequestHandler for Reverse {
        async fn handle(&self, frame: Bytes, _ctx: &RequestContext) -> Bytes {
            frame.iter().rev().copied().collect::<Vec<_>>().into()
        }
    }

    async fn client_hello(client: &mut ServerStream, hello: Hello) -> HandshakeMessage {
        client
            .send(HandshakeMessage::from(hello).encode().unwrap())
            .await
            .unwrap();
        let frame = client.next().await.unwrap().unwrap();
        HandshakeMessage::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_success_widens_frame_limit() {
        let (server, client) = UnixStream::pair().unwrap();
        let server_task = tokio::spawn(async move {
            let mut stream = frame_for_handshake(server);
            let result = perform_handshake(&mut stream, &label(), &CancellationToken::new())
                .await
                .unwrap();
            (result, stream.codec().max_frame_size())
        });

        let mut client = Framed::new(client, FrameCodec::new());
        let response = client_hello(&mut client, Hello::current("test-client")).await;
        assert_eq!(response.into_ack().unwrap().label, "com.example.helper");

        let (result, max) = server_task.await.unwrap();
        assert_eq!(result, HandshakeResult::Success);
        assert_eq!(max, MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let (server, client) = UnixStream::pair().unwrap();
        let server_task = tokio::spawn(async move {
            let mut stream = frame_for_handshake(server);
            perform_handshake(&mut stream, &label(), &CancellationToken::new()).await
        });

        let mut client = Framed::new(client, FrameCodec::new());
        let old = Hello {
            version: 99,
            client: "old".to_string(),
        };
        let response = client_hello(&mut client, old).await;
        assert!(matches!(response, HandshakeMessage::HelloNack(_)));
        assert_eq!(server_task.await.unwrap().unwrap(), HandshakeResult::Failed);
    }

    #[tokio::test]
    async fn test_handshake_refused_while_draining() {
        let (server, client) = UnixStream::pair().unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let server_task = tokio::spawn(async move {
            let mut stream = frame_for_handshake(server);
            perform_handshake(&mut stream, &label(), &shutdown).await
        });

        let mut client = Framed::new(client, FrameCodec::new());
        let HandshakeMessage::HelloNack(nack) = client_hello(&mut client, Hello::current("c")).await
        else {
            panic!("expected HelloNack");
        };
        assert_eq!(nack, HelloNack::draining());
        assert_eq!(server_task.await.unwrap().unwrap(), HandshakeResult::Failed);
    }

    #[tokio::test]
    async fn test_handshake_client_gone() {
        let (server, client) = UnixStream::pair().unwrap();
        drop(client);
        let mut stream = frame_for_handshake(server);
        let result = perform_handshake(&mut stream, &label(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, HandshakeResult::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_serve_requests_in_order_then_client_close() {
        let (server, client) = UnixStream::pair().unwrap();
        let shutdown = CancellationToken::new();
        let server_task = tokio::spawn(async move {
            let mut stream = Framed::new(server, FrameCodec::new());
            serve_requests(&mut stream, Arc::new(Reverse), ctx(), &shutdown).await
        });

        let mut client = Framed::new(client, FrameCodec::new());
        for word in ["abc", "xyz"] {
            client.send(Bytes::from(word)).await.unwrap();
            let reply = client.next().await.unwrap().unwrap();
            assert_eq!(reply, word.chars().rev().collect::<String>().as_bytes());
        }
        drop(client);

        let end = timeout(Duration::from_secs(1), server_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, ConnectionEnd::ClientClosed));
    }

    #[tokio::test]
    async fn test_serve_requests_stops_when_idle_and_draining() {
        let (server, _client) = UnixStream::pair().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let server_task = tokio::spawn(async move {
            let mut stream = Framed::new(server, FrameCodec::new());
            serve_requests(&mut stream, Arc::new(Reverse), ctx(), &token).await
        });

        shutdown.cancel();
        let end = timeout(Duration::from_secs(1), server_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, ConnectionEnd::Drained));
    }
}
