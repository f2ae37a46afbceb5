//! Channel-backed in-process transport.
//!
//! [`memory_pair`] returns the server-side [`MemoryTransport`] and the
//! client-side [`MemoryPeer`]. The peer can inject write failures, which is
//! how the close and keepalive paths are exercised without a socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sockroute_core::{FrameKind, InboundFrame, PeerKey, TransportError};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::transport::Transport;

struct Shared {
    closed: CancellationToken,
    close_calls: AtomicUsize,
    fail_writes: AtomicBool,
}

/// Server side of an in-memory connection.
pub struct MemoryTransport {
    inbound: AsyncMutex<mpsc::UnboundedReceiver<InboundFrame>>,
    outbound: mpsc::UnboundedSender<(FrameKind, Bytes)>,
    peer: PeerKey,
    shared: Arc<Shared>,
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>,
    outbound: mpsc::UnboundedReceiver<(FrameKind, Bytes)>,
    shared: Arc<Shared>,
}

/// Create a connected transport/peer pair.
pub fn memory_pair(peer: impl Into<PeerKey>) -> (MemoryTransport, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        closed: CancellationToken::new(),
        close_calls: AtomicUsize::new(0),
        fail_writes: AtomicBool::new(false),
    });
    let transport = MemoryTransport {
        inbound: AsyncMutex::new(in_rx),
        outbound: out_tx,
        peer: peer.into(),
        shared: Arc::clone(&shared),
    };
    let client = MemoryPeer {
        inbound: Mutex::new(Some(in_tx)),
        outbound: out_rx,
        shared,
    };
    (transport, client)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_frame(&self) -> Result<InboundFrame, TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            () = self.shared.closed.cancelled() => Err(TransportError::Closed),
            frame = inbound.recv() => frame.ok_or(TransportError::Closed),
        }
    }

    async fn write_frame(&self, kind: FrameKind, payload: Bytes) -> Result<(), TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.shared.fail_writes.load(Ordering::Acquire) {
            return Err(TransportError::Write("injected write failure".into()));
        }
        self.outbound
            .send((kind, payload))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _ = self.shared.close_calls.fetch_add(1, Ordering::AcqRel);
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::AlreadyClosed);
        }
        self.shared.closed.cancel();
        Ok(())
    }

    fn peer(&self) -> &PeerKey {
        &self.peer
    }
}

impl MemoryPeer {
    /// Send a frame to the server. Returns `false` once disconnected.
    pub fn send(&self, frame: InboundFrame) -> bool {
        self.inbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Send a text frame to the server.
    pub fn send_text(&self, text: &str) -> bool {
        self.send(InboundFrame::text(text))
    }

    /// Drop the client's sending half; the server's next read fails.
    pub fn disconnect(&self) {
        drop(self.inbound.lock().take());
    }

    /// Next frame written by the server, or `None` once the transport is
    /// closed and every written frame has been received.
    pub async fn recv(&mut self) -> Option<(FrameKind, Bytes)> {
        let closed = self.shared.closed.clone();
        let next = tokio::select! {
            biased;
            frame = self.outbound.recv() => Some(frame),
            () = closed.cancelled() => None,
        };
        match next {
            Some(frame) => frame,
            None => self.outbound.try_recv().ok(),
        }
    }

    /// Next frame written by the server, decoded as UTF-8 text.
    pub async fn recv_text(&mut self) -> Option<String> {
        let (_, payload) = self.recv().await?;
        String::from_utf8(payload.to_vec()).ok()
    }

    /// Make every subsequent server write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::Release);
    }

    /// Whether the server closed the transport.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Wait until the server closes the transport.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// How many times `close()` was called on the server side.
    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (transport, mut peer) = memory_pair("mem:1");
        assert!(peer.send_text("hello"));

        let frame = transport.read_frame().await.unwrap();
        assert_eq!(frame.payload().as_ref(), b"hello");

        transport
            .write_frame(FrameKind::Text, Bytes::from_static(b"world"))
            .await
            .unwrap();
        assert_eq!(peer.recv_text().await.as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn disconnect_fails_read() {
        let (transport, peer) = memory_pair("mem:2");
        peer.disconnect();
        assert!(!peer.send_text("late"));
        assert_eq!(transport.read_frame().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn close_wakes_reader_and_rejects_second_close() {
        let (transport, peer) = memory_pair("mem:3");
        let transport = Arc::new(transport);

        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.read_frame().await })
        };

        transport.close().await.unwrap();
        assert_eq!(reader.await.unwrap(), Err(TransportError::Closed));
        assert_eq!(transport.close().await, Err(TransportError::AlreadyClosed));
        assert_eq!(peer.close_calls(), 2);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn injected_write_failure() {
        let (transport, peer) = memory_pair("mem:4");
        peer.fail_writes(true);
        let err = transport
            .write_frame(FrameKind::Text, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Write(_)));

        peer.fail_writes(false);
        assert!(
            transport
                .write_frame(FrameKind::Text, Bytes::from_static(b"x"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn recv_drains_then_ends_after_close() {
        let (transport, mut peer) = memory_pair("mem:5");
        transport
            .write_frame(FrameKind::Text, Bytes::from_static(b"last"))
            .await
            .unwrap();
        transport.close().await.unwrap();

        assert_eq!(peer.recv_text().await.as_deref(), Some("last"));
        assert!(peer.recv().await.is_none());
    }
}
