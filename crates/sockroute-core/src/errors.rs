//! Error taxonomy.
//!
//! - [`TransportError`]: read/write/close failures, fatal to the connection.
//! - [`HandlerError`]: anything that goes wrong while dispatching one frame.
//!   Recovered at the handling-loop boundary and reported to the peer.
//! - [`BridgeError`]: caller/collaborator contract violations, returned to
//!   whoever made the call.

use std::any::Any;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::ids::PeerKey;

/// Failure of the underlying transport.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer went away or the stream ended.
    #[error("transport closed")]
    Closed,
    /// `close()` was called on a transport that is already closed.
    #[error("transport already closed")]
    AlreadyClosed,
    /// Reading a frame failed.
    #[error("read failed: {0}")]
    Read(String),
    /// Writing a frame failed.
    #[error("write failed: {0}")]
    Write(String),
    /// A text frame was requested with a non UTF-8 payload.
    #[error("text frame payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Failure raised while dispatching a frame through a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Failure carrying an application error code.
    #[error("{message}")]
    Coded {
        /// Application error code.
        code: i64,
        /// Human readable message.
        message: String,
    },
    /// Pre-built structured error payload, sent to the peer verbatim.
    #[error("{}", render_payload(.0))]
    Payload(Map<String, Value>),
    /// The synthetic request could not be built from the frame.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The reply value could not be encoded.
    #[error("reply encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    /// The handler dropped its responder without replying.
    #[error("handler finished without replying")]
    NoReply,
    /// The handler did not reply within the configured timeout.
    #[error("handler did not reply within {0:?}")]
    ReplyTimeout(Duration),
    /// The handler panicked; carries the panic message.
    #[error("{0}")]
    Panicked(String),
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Failure with an application error code.
    pub fn coded(code: i64, message: impl Into<String>) -> Self {
        Self::Coded {
            code,
            message: message.into(),
        }
    }

    /// Unstructured failure from any displayable value.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Other(anyhow::anyhow!("{message}"))
    }

    /// Convert a caught panic payload into a handler error.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_owned()
        };
        Self::Panicked(message)
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Coded { .. } => "coded",
            Self::Payload(_) => "payload",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Encode(_) => "encode",
            Self::NoReply => "no_reply",
            Self::ReplyTimeout(_) => "reply_timeout",
            Self::Panicked(_) => "panicked",
            Self::Other(_) => "other",
        }
    }
}

fn render_payload(map: &Map<String, Value>) -> String {
    serde_json::to_string(map).unwrap_or_default()
}

/// Contract violation by a caller or collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No live connection actor is registered under this key.
    #[error("no connection registered for {0}")]
    NotRegistered(PeerKey),
    /// `close()` was called on a connection that is not open.
    #[error("connection {0} is already closed")]
    AlreadyClosed(PeerKey),
    /// No route is bound for the upgrade request.
    #[error("no route for {method} {path}")]
    NoRoute {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },
    /// Transport failure surfaced to the caller.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
