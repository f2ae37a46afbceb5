//! Structured error body sent to the peer before a handler-failure disconnect.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::HandlerError;

const FALLBACK_BODY: &[u8] = br#"{"code":0,"message":"internal error","data":null}"#;

/// `{code, message, data}` error body. Field order is part of the wire format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Application error code (`0` when the failure carries none).
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Always `null` for mapped failures.
    pub data: Option<Value>,
}

impl ErrorBody {
    /// Body with `data: null`.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Bytes {
        serde_json::to_vec(self).map_or_else(|_| Bytes::from_static(FALLBACK_BODY), Bytes::from)
    }
}

type MapFn = dyn Fn(&HandlerError) -> Bytes + Send + Sync;

/// Maps a recovered [`HandlerError`] to the payload of a terminal-error frame.
///
/// Injected into each connection actor; [`ErrorMapper::default`] applies
/// [`default_mapping`].
#[derive(Clone)]
pub struct ErrorMapper {
    map: Arc<MapFn>,
}

impl ErrorMapper {
    /// Use a custom mapping function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&HandlerError) -> Bytes + Send + Sync + 'static,
    {
        Self { map: Arc::new(f) }
    }

    /// Produce the error frame payload for `err`.
    pub fn map(&self, err: &HandlerError) -> Bytes {
        (self.map)(err)
    }
}

impl Default for ErrorMapper {
    fn default() -> Self {
        Self::custom(default_mapping)
    }
}

impl fmt::Debug for ErrorMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMapper").finish_non_exhaustive()
    }
}

/// Default precedence:
/// 1. coded failures keep their code and message,
/// 2. pre-built payloads pass through unchanged,
/// 3. everything else becomes code `0` with the failure's display text.
pub fn default_mapping(err: &HandlerError) -> Bytes {
    match err {
        HandlerError::Coded { code, message } => ErrorBody::new(*code, message.clone()).to_bytes(),
        HandlerError::Payload(map) => {
            serde_json::to_vec(map).map_or_else(|_| Bytes::from_static(FALLBACK_BODY), Bytes::from)
        }
        other => ErrorBody::new(0, other.to_string()).to_bytes(),
    }
}
