use thiserror::Error;

use crate::disconnect::DisconnectReason;
use crate::packets::PacketId;
use crate::state::StateKind;

/// Errors raised while decoding fixed-layout binary records
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    #[error("negative length prefix {0}")]
    NegativeLength(i32),

    #[error("byte string of {0} bytes does not fit an i32 length prefix")]
    TooLong(usize),

    #[error("invalid {kind} tag {value}")]
    InvalidTag { kind: &'static str, value: u8 },
}

/// Errors raised by the parallel transfer multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiplexError {
    #[error("empty chunk carries no channel index")]
    EmptyChunk,

    #[error("channel index {index} out of range for {channels} parallel channels")]
    ChannelOutOfRange { index: u8, channels: usize },

    #[error("chunk header truncated: {0} bytes")]
    TruncatedHeader(usize),

    #[error("parallel channel count {0} is not supported (1..=32)")]
    InvalidChannelCount(usize),

    #[error("parallel channel {0} is not attached")]
    ChannelMissing(usize),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised when handing a frame to a sub-connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel {0} is closed")]
    ChannelClosed(usize),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("io error: {0}")]
    Io(String),

    #[error("striping failed: {0}")]
    Striping(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<MultiplexError> for TransportError {
    fn from(err: MultiplexError) -> Self {
        match err {
            MultiplexError::Transport(inner) => inner,
            other => TransportError::Striping(other.to_string()),
        }
    }
}

/// Errors raised while encoding or decoding packets
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("unknown packet id {0}")]
    UnknownId(u8),

    #[error("malformed {id:?} body: {message}")]
    Body { id: PacketId, message: String },

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Errors returned from packet handlers
///
/// The dispatcher turns any of these into a disconnect of the offending
/// connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("packet {packet:?} is not valid in state {state:?}")]
    InvalidState { state: StateKind, packet: PacketId },

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("rejected: {reason:?}")]
    Rejected {
        reason: DisconnectReason,
        data: Vec<u8>,
    },

    #[error("{0}")]
    Invalid(String),
}

impl HandlerError {
    pub fn rejected(reason: DisconnectReason) -> Self {
        HandlerError::Rejected {
            reason,
            data: Vec::new(),
        }
    }
}
