//! WebSocket connection handling.
//!
//! - [`actor`]: per-connection read/handling/write/keepalive loops
//! - [`dispatch`]: frame → synthetic request → handler → reply
//! - [`keepalive`]: liveness probing strategies
//! - [`registry`]: live connections keyed by peer
//! - [`transport`]: the transport trait and its axum implementation
//! - [`memory`]: channel-backed transport for tests and embedding

pub mod actor;
pub mod dispatch;
pub mod keepalive;
pub mod memory;
pub mod registry;
pub mod transport;

pub use actor::{ActorConfig, ConnectionActor, ConnectionState};
pub use dispatch::{
    DispatchBridge, Handler, HandlerFn, PendingReply, RequestContext, Responder, handler_fn,
    reply_channel,
};
pub use keepalive::{Disabled, IntervalProbe, KeepaliveStrategy};
pub use memory::{MemoryPeer, MemoryTransport, memory_pair};
pub use registry::{ConnectionRegistry, Registry, start_prune_task};
pub use transport::{AxumTransport, Transport};
