//! Per-connection actor.
//!
//! Each connection runs four tasks:
//!
//! - **read**: transport → inbound channel
//! - **handling**: inbound channel → dispatch bridge → outbound channel
//! - **write**: outbound channel → transport
//! - **keepalive**: periodic probe via a [`KeepaliveStrategy`]
//!
//! A supervisor task joins them and marks the connection `Closed`. The
//! close signal is a `watch` channel, so any number of tasks can observe it
//! and repeated close attempts never block.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::Bytes;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use sockroute_core::{
    BridgeError, ConnectionId, ErrorMapper, FrameKind, HandlerError, InboundFrame, OutboundFrame,
    PeerKey, TransportError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use super::dispatch::{DispatchBridge, RequestContext};
use super::keepalive::{IntervalProbe, KeepaliveStrategy};
use super::registry::ConnectionRegistry;
use super::transport::Transport;
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_DISPATCH_DURATION_SECONDS, WS_FRAMES_DISPATCHED_TOTAL, WS_HANDLER_FAILURES_TOTAL,
};
use crate::routes::Route;

/// Default keepalive probe interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Default time a handler has to reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-actor settings.
#[derive(Clone)]
pub struct ActorConfig {
    /// Keepalive behaviour.
    pub keepalive: Arc<dyn KeepaliveStrategy>,
    /// Maps recovered failures to the terminal-error payload.
    pub error_mapper: ErrorMapper,
    /// How long a handler may take to reply. `None` waits forever.
    pub reply_timeout: Option<Duration>,
    /// Capacity of the read → handling channel.
    pub inbound_capacity: usize,
    /// Capacity of the handling → write channel.
    pub outbound_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            keepalive: Arc::new(IntervalProbe::new(DEFAULT_KEEPALIVE_INTERVAL)),
            error_mapper: ErrorMapper::default(),
            reply_timeout: Some(DEFAULT_REPLY_TIMEOUT),
            inbound_capacity: 1,
            outbound_capacity: 16,
        }
    }
}

impl fmt::Debug for ActorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorConfig")
            .field("reply_timeout", &self.reply_timeout)
            .field("inbound_capacity", &self.inbound_capacity)
            .field("outbound_capacity", &self.outbound_capacity)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a connection. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Loops are running.
    Open,
    /// `close()` ran; loops are winding down.
    Closing,
    /// Every loop has exited.
    Closed,
}

/// One live transport connection bound to a route.
pub struct ConnectionActor {
    id: ConnectionId,
    peer: PeerKey,
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    route: Route,
    state: watch::Sender<ConnectionState>,
    draining: AtomicBool,
}

impl ConnectionActor {
    /// Register a new actor for `transport` and start its loops.
    ///
    /// `headers` are the upgrade request's headers; they are copied into
    /// every synthetic request.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        route: Route,
        headers: HeaderMap,
        registry: Arc<ConnectionRegistry>,
        config: ActorConfig,
    ) -> Arc<Self> {
        let peer = transport.peer().clone();
        let (state, _) = watch::channel(ConnectionState::Open);
        let actor = Arc::new(Self {
            id: ConnectionId::new(),
            peer: peer.clone(),
            transport,
            registry: Arc::clone(&registry),
            route: route.clone(),
            state,
            draining: AtomicBool::new(false),
        });
        registry.store(peer.clone(), &actor);

        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(peer = %peer, conn_id = %actor.id, route = route.path(), "websocket connection opened");

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let ctx = RequestContext::new(peer, actor.id.clone(), &route, headers);
        let bridge = DispatchBridge::new(route, config.reply_timeout);

        let mut loops = JoinSet::new();
        let _ = loops.spawn(read_loop(Arc::clone(&actor), inbound_tx));
        let _ = loops.spawn(write_loop(Arc::clone(&actor), outbound_rx));
        let _ = loops.spawn(handling_loop(
            Arc::clone(&actor),
            inbound_rx,
            outbound_tx,
            bridge,
            ctx,
            config.error_mapper,
        ));
        let _ = loops.spawn(keepalive_loop(Arc::clone(&actor), config.keepalive));
        drop(tokio::spawn(supervise(Arc::clone(&actor), loops)));

        actor
    }

    /// Close the connection.
    ///
    /// Moves `Open → Closing` (waking every loop), drops the registry entry
    /// and closes the transport. Fails with [`BridgeError::AlreadyClosed`] if
    /// the connection was not open.
    pub async fn close(&self) -> Result<(), BridgeError> {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if !transitioned {
            return Err(BridgeError::AlreadyClosed(self.peer.clone()));
        }

        let _ = self.registry.remove_entry(&self.peer, self);
        let closed = self.transport.close().await;
        info!(peer = %self.peer, conn_id = %self.id, "websocket connection closing");
        closed.map_err(BridgeError::from)
    }

    /// Close on behalf of one of the loops. Losing a close race is expected.
    async fn shutdown(&self, reason: &'static str) {
        match self.close().await {
            Ok(()) => debug!(peer = %self.peer, reason, "connection shut down"),
            Err(BridgeError::AlreadyClosed(_)) => {
                debug!(peer = %self.peer, reason, "connection already closing");
            }
            Err(error) => warn!(peer = %self.peer, reason, %error, "transport close failed"),
        }
    }

    /// Remote identity; also the registry key.
    pub fn peer(&self) -> &PeerKey {
        &self.peer
    }

    /// Unique id for logs.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The registry this actor is stored in.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The bound route.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether frames may still be written outside the write loop. `false`
    /// once an error frame has been queued or the connection left `Open`.
    pub fn accepts_writes(&self) -> bool {
        self.is_open() && !self.draining.load(Ordering::Acquire)
    }

    /// Stop out-of-band writes; the next outbound frame is the last one.
    pub(crate) fn mark_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Wait until every loop has exited.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

impl fmt::Debug for ConnectionActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionActor")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("route", &self.route)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Resolves once the connection has left `Open`.
async fn closing(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| *s != ConnectionState::Open).await;
}

async fn supervise(actor: Arc<ConnectionActor>, mut loops: JoinSet<()>) {
    while let Some(joined) = loops.join_next().await {
        match joined {
            Err(e) if e.is_panic() => {
                error!(peer = %actor.peer, conn_id = %actor.id, "connection loop panicked");
                actor.shutdown("loop panicked").await;
            }
            _ => {}
        }
    }
    let _ = actor.state.send_replace(ConnectionState::Closed);
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    debug!(peer = %actor.peer, conn_id = %actor.id, "connection actor finished");
}

async fn read_loop(actor: Arc<ConnectionActor>, inbound: mpsc::Sender<InboundFrame>) {
    let mut state = actor.state.subscribe();
    loop {
        let read = tokio::select! {
            read = actor.transport.read_frame() => read,
            () = closing(&mut state) => break,
        };
        match read {
            Ok(frame) => {
                trace!(peer = %actor.peer, kind = frame.kind().as_str(), "frame read");
                tokio::select! {
                    sent = inbound.send(frame) => if sent.is_err() { break },
                    () = closing(&mut state) => break,
                }
            }
            Err(TransportError::Closed) => {
                debug!(peer = %actor.peer, "peer closed the transport");
                actor.shutdown("peer closed").await;
                break;
            }
            Err(error) => {
                warn!(peer = %actor.peer, %error, "transport read failed");
                actor.shutdown("read failed").await;
                break;
            }
        }
    }
    trace!(peer = %actor.peer, "read loop exited");
}

async fn write_loop(actor: Arc<ConnectionActor>, mut outbound: mpsc::Receiver<OutboundFrame>) {
    let mut state = actor.state.subscribe();
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => frame,
            () = closing(&mut state) => break,
        };
        let Some(frame) = frame else { break };

        let terminal = frame.is_terminal();
        let payload = frame.into_payload();
        let kind = frame_kind_for(&payload);
        let written = tokio::select! {
            written = actor.transport.write_frame(kind, payload) => written,
            () = closing(&mut state) => break,
        };

        if terminal {
            if let Err(error) = written {
                warn!(peer = %actor.peer, %error, "error frame write failed");
            }
            actor.shutdown("error frame sent").await;
            break;
        }
        if let Err(error) = written {
            warn!(peer = %actor.peer, %error, "transport write failed");
            actor.shutdown("write failed").await;
            break;
        }
    }
    trace!(peer = %actor.peer, "write loop exited");
}

/// Text when the payload is valid UTF-8, binary otherwise.
fn frame_kind_for(payload: &Bytes) -> FrameKind {
    if std::str::from_utf8(payload).is_ok() {
        FrameKind::Text
    } else {
        FrameKind::Binary
    }
}

async fn handling_loop(
    actor: Arc<ConnectionActor>,
    mut inbound: mpsc::Receiver<InboundFrame>,
    outbound: mpsc::Sender<OutboundFrame>,
    bridge: DispatchBridge,
    mut ctx: RequestContext,
    error_mapper: ErrorMapper,
) {
    let mut state = actor.state.subscribe();
    loop {
        let frame = tokio::select! {
            frame = inbound.recv() => frame,
            () = closing(&mut state) => break,
        };
        let Some(frame) = frame else { break };
        if !frame.kind().is_payload() {
            trace!(peer = %actor.peer, kind = frame.kind().as_str(), "control frame skipped");
            continue;
        }

        let result = tokio::select! {
            result = dispatch_recovered(&bridge, &mut ctx, frame) => result,
            () = closing(&mut state) => break,
        };
        let reply = match result {
            Ok(payload) => OutboundFrame::normal(payload),
            Err(err) => {
                error!(
                    peer = %actor.peer,
                    conn_id = %actor.id,
                    route = bridge.route().path(),
                    sequence = ctx.sequence(),
                    error = %err,
                    "handler failed"
                );
                counter!(WS_HANDLER_FAILURES_TOTAL, "kind" => err.kind()).increment(1);
                OutboundFrame::terminal_error(error_mapper.map(&err))
            }
        };

        let terminal = reply.is_terminal();
        if terminal {
            actor.mark_draining();
        }
        tokio::select! {
            sent = outbound.send(reply) => if sent.is_err() { break },
            () = closing(&mut state) => break,
        }
        if terminal {
            // Nothing is dispatched after an error frame.
            closing(&mut state).await;
            break;
        }
    }
    info!(peer = %actor.peer, conn_id = %actor.id, "websocket connection closed");
}

/// Dispatch one frame, turning a handler panic into a [`HandlerError`].
async fn dispatch_recovered(
    bridge: &DispatchBridge,
    ctx: &mut RequestContext,
    frame: InboundFrame,
) -> Result<Bytes, HandlerError> {
    let started = Instant::now();
    let result = AssertUnwindSafe(bridge.dispatch(ctx, frame))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::from_panic(panic)));

    let route = bridge.route().path().to_owned();
    counter!(WS_FRAMES_DISPATCHED_TOTAL, "route" => route.clone()).increment(1);
    histogram!(WS_DISPATCH_DURATION_SECONDS, "route" => route).record(started.elapsed().as_secs_f64());
    result
}

async fn keepalive_loop(actor: Arc<ConnectionActor>, strategy: Arc<dyn KeepaliveStrategy>) {
    let mut state = actor.state.subscribe();
    loop {
        tokio::select! {
            () = strategy.tick(&actor) => {}
            () = closing(&mut state) => break,
        }
    }
    trace!(peer = %actor.peer, "keepalive loop exited");
}
