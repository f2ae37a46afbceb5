//! Envelopes carried on a connection's internal channels.

use bytes::Bytes;

/// Kind of a frame on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// UTF-8 text payload.
    Text,
    /// Binary payload.
    Binary,
    /// Ping control frame.
    Ping,
    /// Pong control frame.
    Pong,
}

impl FrameKind {
    /// Whether this frame carries application payload (as opposed to control).
    pub fn is_payload(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }

    /// Short name for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

/// A frame read from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFrame {
    kind: FrameKind,
    payload: Bytes,
}

impl InboundFrame {
    /// Build an inbound frame.
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Convenience constructor for a text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Text, Bytes::from(text.into()))
    }

    /// Frame kind.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// How the write loop treats an outbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboundKind {
    /// Ordinary reply.
    Normal,
    /// Error report; the connection is closed right after it is written.
    TerminalError,
}

/// A frame queued for the write loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundFrame {
    kind: OutboundKind,
    payload: Bytes,
}

impl OutboundFrame {
    /// A normal reply frame.
    pub fn normal(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: OutboundKind::Normal,
            payload: payload.into(),
        }
    }

    /// A terminal error frame.
    pub fn terminal_error(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: OutboundKind::TerminalError,
            payload: payload.into(),
        }
    }

    /// Outbound kind.
    pub fn kind(&self) -> OutboundKind {
        self.kind
    }

    /// Whether the write loop must close the connection after this frame.
    pub fn is_terminal(&self) -> bool {
        self.kind == OutboundKind::TerminalError
    }

    /// Raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_vs_control_kinds() {
        assert!(FrameKind::Text.is_payload());
        assert!(FrameKind::Binary.is_payload());
        assert!(!FrameKind::Ping.is_payload());
        assert!(!FrameKind::Pong.is_payload());
    }

    #[test]
    fn text_frame_carries_bytes() {
        let frame = InboundFrame::text(r#"{"op":"ping"}"#);
        assert_eq!(frame.kind(), FrameKind::Text);
        assert_eq!(frame.payload().as_ref(), br#"{"op":"ping"}"#);
    }

    #[test]
    fn terminal_flag() {
        assert!(!OutboundFrame::normal("ok").is_terminal());
        let err = OutboundFrame::terminal_error("bad");
        assert!(err.is_terminal());
        assert_eq!(err.kind(), OutboundKind::TerminalError);
        assert_eq!(err.into_payload(), Bytes::from_static(b"bad"));
    }
}
