//! # sockroute-server
//!
//! Bridges persistent WebSocket connections to single-shot route handlers.
//!
//! Every upgraded connection becomes a [`ConnectionActor`]. Each inbound
//! frame is turned into a synthetic `POST` request, run through the
//! [`Handler`] bound to the connection's route, and the handler's reply is
//! written back in frame order. A failing handler gets one structured error
//! frame sent to the peer before the connection is closed.

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use axum::http;
pub use config::{ServerConfig, SettingsError, load_config};
pub use routes::{Route, RouteTable};
pub use server::{BridgeServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use websocket::{
    ActorConfig, ConnectionActor, ConnectionRegistry, ConnectionState, Handler, RequestContext,
    Responder, handler_fn,
};
