//! Transport abstraction and the axum `WebSocket` implementation.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sockroute_core::{FrameKind, InboundFrame, PeerKey, TransportError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

/// A persistent, bidirectional frame transport.
///
/// Reads and writes may run concurrently from different tasks.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Wait for the next frame.
    async fn read_frame(&self) -> Result<InboundFrame, TransportError>;

    /// Write one frame.
    async fn write_frame(&self, kind: FrameKind, payload: Bytes) -> Result<(), TransportError>;

    /// Close the transport. A second call returns [`TransportError::AlreadyClosed`].
    async fn close(&self) -> Result<(), TransportError>;

    /// Remote identity of the connection.
    fn peer(&self) -> &PeerKey;
}

/// [`Transport`] over an upgraded axum `WebSocket`.
///
/// The socket is split so the read half and write half sit behind separate
/// async mutexes. Ping/pong are answered by axum and never surfaced.
pub struct AxumTransport {
    sink: AsyncMutex<SplitSink<WebSocket, Message>>,
    stream: AsyncMutex<SplitStream<WebSocket>>,
    peer: PeerKey,
    closed: AtomicBool,
}

impl AxumTransport {
    /// Wrap an upgraded socket.
    pub fn new(socket: WebSocket, peer: PeerKey) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: AsyncMutex::new(sink),
            stream: AsyncMutex::new(stream),
            peer,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for AxumTransport {
    async fn read_frame(&self) -> Result<InboundFrame, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let msg = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(TransportError::Read(e.to_string())),
                None => return Err(TransportError::Closed),
            };
            return match msg {
                Message::Text(text) => Ok(InboundFrame::new(
                    FrameKind::Text,
                    Bytes::copy_from_slice(text.as_str().as_bytes()),
                )),
                Message::Binary(data) => Ok(InboundFrame::new(FrameKind::Binary, data)),
                Message::Close(_) => Err(TransportError::Closed),
                Message::Ping(_) | Message::Pong(_) => {
                    trace!(peer = %self.peer, "control frame");
                    continue;
                }
            };
        }
    }

    async fn write_frame(&self, kind: FrameKind, payload: Bytes) -> Result<(), TransportError> {
        let message = match kind {
            FrameKind::Text => {
                let text =
                    String::from_utf8(payload.to_vec()).map_err(|_| TransportError::InvalidUtf8)?;
                Message::Text(text.into())
            }
            FrameKind::Binary => Message::Binary(payload),
            FrameKind::Ping => Message::Ping(payload),
            FrameKind::Pong => Message::Pong(payload),
        };
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyClosed);
        }
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    fn peer(&self) -> &PeerKey {
        &self.peer
    }
}
