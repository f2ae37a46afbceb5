//! # sockroute-core
//!
//! Shared types for the sockroute bridge:
//!
//! - [`ids`]: connection identifiers (`PeerKey`, `ConnectionId`)
//! - [`frame`]: the envelopes carried on a connection's internal channels
//! - [`errors`]: transport, handler and protocol-misuse error types
//! - [`error_body`]: the structured error body sent to peers and the
//!   overridable mapping that produces it

#![deny(unsafe_code)]

pub mod error_body;
pub mod errors;
pub mod frame;
pub mod ids;

pub use error_body::{ErrorBody, ErrorMapper};
pub use errors::{BridgeError, HandlerError, TransportError};
pub use frame::{FrameKind, InboundFrame, OutboundFrame, OutboundKind};
pub use ids::{ConnectionId, PeerKey};
