//! Keepalive strategies.
//!
//! A strategy's `tick` is run in a loop by the actor until the connection
//! leaves `Open`. A failed probe only drops the registry entry; the read and
//! write loops notice a dead peer on their own.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use sockroute_core::FrameKind;
use tracing::{trace, warn};

use super::actor::ConnectionActor;
use crate::metrics::WS_KEEPALIVE_FAILURES_TOTAL;

/// Periodic liveness work for one connection.
#[async_trait]
pub trait KeepaliveStrategy: Send + Sync {
    /// Perform one round. Called back to back while the connection is open.
    async fn tick(&self, conn: &ConnectionActor);
}

/// Sleep `interval`, then write a probe frame straight to the transport.
#[derive(Clone, Debug)]
pub struct IntervalProbe {
    interval: Duration,
    kind: FrameKind,
    payload: Bytes,
}

impl IntervalProbe {
    /// Probe with a `"ping"` text frame every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            kind: FrameKind::Text,
            payload: Bytes::from_static(b"ping"),
        }
    }

    /// Use a different probe frame.
    #[must_use]
    pub fn with_probe(mut self, kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        self.kind = kind;
        self.payload = payload.into();
        self
    }

    /// Time between probes.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl KeepaliveStrategy for IntervalProbe {
    async fn tick(&self, conn: &ConnectionActor) {
        tokio::time::sleep(self.interval).await;
        if !conn.accepts_writes() {
            trace!(peer = %conn.peer(), "keepalive probe skipped, connection draining");
            return;
        }
        match conn
            .transport()
            .write_frame(self.kind, self.payload.clone())
            .await
        {
            Ok(()) => trace!(peer = %conn.peer(), "keepalive probe sent"),
            Err(error) => {
                warn!(peer = %conn.peer(), conn_id = %conn.connection_id(), %error, "keepalive probe failed");
                counter!(WS_KEEPALIVE_FAILURES_TOTAL).increment(1);
                let _ = conn.registry().remove_entry(conn.peer(), conn);
            }
        }
    }
}

/// Never probes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Disabled;

#[async_trait]
impl KeepaliveStrategy for Disabled {
    async fn tick(&self, _conn: &ConnectionActor) {
        std::future::pending::<()>().await;
    }
}
