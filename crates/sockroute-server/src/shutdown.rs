//! Server shutdown: stop accepting, close every registered connection, then
//! wait (bounded) for the connection actors and server tasks to finish.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use sockroute_core::BridgeError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::websocket::actor::ConnectionActor;
use crate::websocket::registry::ConnectionRegistry;

/// Used when no explicit shutdown timeout is given.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives shutdown of the listener and the connections in a registry.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl ShutdownCoordinator {
    /// Coordinator for the connections stored in `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            token: CancellationToken::new(),
            registry,
        }
    }

    /// A clone of the listener's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop accepting new connections. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close every registered connection. Returns the actors this call
    /// moved out of `Open`; connections already closing are skipped.
    pub async fn close_connections(&self) -> Vec<Arc<ConnectionActor>> {
        let mut closed = Vec::new();
        for key in self.registry.keys() {
            let Some(actor) = self.registry.lookup(&key) else {
                continue;
            };
            match actor.close().await {
                Ok(()) => closed.push(actor),
                Err(BridgeError::AlreadyClosed(_)) => {
                    debug!(peer = %key, "connection already closing");
                }
                Err(error) => {
                    warn!(peer = %key, %error, "transport close failed during shutdown");
                    closed.push(actor);
                }
            }
        }
        closed
    }

    /// Stop accepting, close every connection, then wait up to `timeout`
    /// for the actors and `handles` to finish. Tasks still running after the
    /// timeout are aborted. Returns how many connections were closed.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> usize {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        let actors = self.close_connections().await;
        info!(
            connections = actors.len(),
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "draining connections"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = async {
            let _ = join_all(actors.iter().map(|actor| actor.closed())).await;
            let _ = join_all(handles).await;
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
        }
        actors.len()
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("shutting_down", &self.is_shutting_down())
            .field("connections", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, Method};

    use super::*;
    use crate::routes::Route;
    use crate::websocket::actor::{ActorConfig, ConnectionState};
    use crate::websocket::dispatch::handler_fn;
    use crate::websocket::keepalive::Disabled;
    use crate::websocket::memory::{MemoryPeer, memory_pair};

    fn connect(registry: &Arc<ConnectionRegistry>, peer: &str) -> (Arc<ConnectionActor>, MemoryPeer) {
        let (transport, client) = memory_pair(peer);
        let route = Route::new(
            Method::GET,
            "/ws",
            handler_fn(|_ctx, reply| {
                reply.text("ok");
                Ok(())
            }),
        );
        let config = ActorConfig {
            keepalive: Arc::new(Disabled),
            ..ActorConfig::default()
        };
        let actor = ConnectionActor::spawn(
            Arc::new(transport),
            route,
            HeaderMap::new(),
            Arc::clone(registry),
            config,
        );
        (actor, client)
    }

    #[test]
    fn tokens_are_cancelled_together() {
        let coord = ShutdownCoordinator::new(Arc::new(ConnectionRegistry::new()));
        assert!(!coord.is_shutting_down());
        let (t1, t2) = (coord.token(), coord.token());
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled() && t2.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_closes_connections_and_waits_for_tasks() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, peer_a) = connect(&registry, "mem:a");
        let (b, peer_b) = connect(&registry, "mem:b");
        let coord = ShutdownCoordinator::new(Arc::clone(&registry));
        let token = coord.token();
        let task = tokio::spawn(async move { token.cancelled().await });

        let closed = coord
            .graceful_shutdown(vec![task], Some(Duration::from_secs(5)))
            .await;

        assert_eq!(closed, 2);
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
        assert!(peer_a.is_closed() && peer_b.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn closing_connections_are_skipped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (actor, peer) = connect(&registry, "mem:c");
        actor.close().await.unwrap();
        registry.store(actor.peer().clone(), &actor);

        let coord = ShutdownCoordinator::new(Arc::clone(&registry));
        assert!(coord.close_connections().await.is_empty());
        assert_eq!(peer.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_aborts_stuck_tasks() {
        let coord = ShutdownCoordinator::new(Arc::new(ConnectionRegistry::new()));
        let handle = tokio::spawn(std::future::pending::<()>());
        let abort = handle.abort_handle();

        let closed = coord
            .graceful_shutdown(vec![handle], Some(Duration::from_secs(1)))
            .await;
        tokio::task::yield_now().await;
        assert_eq!(closed, 0);
        assert!(abort.is_finished());
    }
}
