use serde::{Deserialize, Serialize};

/// Protocol version the server accepts during the handshake.
///
/// Compared by exact string equality; there is no range negotiation.
pub const PROTOCOL_VERSION: &str = "1";

/// Magic bytes that open every binary frame.
///
/// Neither byte is `{`, so a frame can never be mistaken for a JSON line.
pub const FRAME_MAGIC: [u8; 2] = [0xFD, 0xFC];

/// Bytes before the frame body: magic (2) + total length (4).
pub const FRAME_PREFIX_LEN: usize = 6;

/// Fixed part of a chunk frame body: type (1) + id length (2) + chunk index (4).
pub const CHUNK_FRAME_FIXED_LEN: usize = 7;

/// Frame type byte for a file chunk.
pub const FRAME_TYPE_FILE_CHUNK: u8 = 0x01;

/// Hard upper bound for `chunkSize` (1 MiB).
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

/// Largest frame body the parser will wait for.
///
/// Anything declaring more is treated as garbage and resynchronised byte by
/// byte, otherwise a corrupted length field would stall the stream forever.
pub const MAX_FRAME_LEN: usize =
    MAX_CHUNK_SIZE as usize + CHUNK_FRAME_FIXED_LEN + u16::MAX as usize;

/// Longest JSON line accepted without a terminating newline (4 MiB).
///
/// Base64 inflates a maximum-size chunk to ~1.4 MiB, so this leaves room for
/// JSON-wrapped chunks.
pub const MAX_JSON_LINE_LEN: usize = 4 * 1024 * 1024;

/// Device name recorded when a client omits `deviceName`.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Control message type identifier carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Client -> server
    Handshake,
    Ping,
    FileStart,
    FileChunk,
    FileEnd,

    // Server -> client
    HandshakeAck,
    Pong,
    FileStartAck,
    FileComplete,
    Error,
}

impl MessageType {
    /// Wire name of the message type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Ping => "ping",
            Self::FileStart => "file_start",
            Self::FileChunk => "file_chunk",
            Self::FileEnd => "file_end",
            Self::HandshakeAck => "handshake_ack",
            Self::Pong => "pong",
            Self::FileStartAck => "file_start_ack",
            Self::FileComplete => "file_complete",
            Self::Error => "error",
        }
    }

    /// Looks up an inbound message type by wire name.
    pub fn inbound(name: &str) -> Option<Self> {
        match name {
            "handshake" => Some(Self::Handshake),
            "ping" => Some(Self::Ping),
            "file_start" => Some(Self::FileStart),
            "file_chunk" => Some(Self::FileChunk),
            "file_end" => Some(Self::FileEnd),
            _ => None,
        }
    }
}
