//! Wire protocol for the LAN file-transfer channel.
//!
//! One TCP stream carries two kinds of traffic: newline-terminated JSON
//! control messages and binary chunk frames. [`frame::parse_next`] separates
//! them; [`messages`] and [`validate`] turn JSON lines into typed messages.

pub mod constants;
pub mod frame;
pub mod messages;
pub mod types;
pub mod validate;

pub use constants::{MessageType, PROTOCOL_VERSION};
pub use frame::{BinaryChunk, ParseResult, encode_chunk_frame, parse_next};
pub use messages::{InboundMessage, OutboundMessage};
pub use types::{ClientInfo, ErrorCode, ServerStatus, TransferProgress};

/// Errors produced while decoding or encoding protocol traffic.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no type")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {} message", .0.as_str())]
    InvalidMessage(MessageType),

    #[error("transfer id too long: {0} bytes")]
    TransferIdTooLong(usize),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}
