use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;
use crate::constants::MessageType;
use crate::types::ErrorCode;
use crate::validate;

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// Opens a session; `version` must match the server's protocol version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub version: String,
    pub platform: String,
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// Liveness probe. The payload is echoed back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Announces a file transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStart {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    /// SHA-256 hex digest of the whole file.
    pub checksum: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

/// A chunk delivered inside JSON.
///
/// `data` is base64 on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub transfer_id: String,
    pub chunk_index: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Marks the end of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEnd {
    pub transfer_id: String,
}

/// A validated message received from the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Handshake(Handshake),
    Ping(Ping),
    FileStart(FileStart),
    FileChunk(FileChunk),
    FileEnd(FileEnd),
}

impl InboundMessage {
    /// Parses one JSON line.
    ///
    /// The shape is checked by the structural validators first; only then is
    /// the value deserialized into its typed form. Unknown fields are
    /// ignored.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Same as [`from_json`](Self::from_json) for an already parsed value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let name = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        let msg_type =
            MessageType::inbound(name).ok_or_else(|| ProtocolError::UnknownType(name.to_owned()))?;

        let valid = match msg_type {
            MessageType::Handshake => validate::is_valid_handshake(&value),
            MessageType::Ping => validate::is_valid_ping(&value),
            MessageType::FileStart => validate::is_valid_file_start(&value),
            MessageType::FileChunk => validate::is_valid_file_chunk(&value),
            MessageType::FileEnd => validate::is_valid_file_end(&value),
            _ => false,
        };
        if !valid {
            return Err(ProtocolError::InvalidMessage(msg_type));
        }

        let invalid = |_| ProtocolError::InvalidMessage(msg_type);
        Ok(match msg_type {
            MessageType::Handshake => Self::Handshake(serde_json::from_value(value).map_err(invalid)?),
            MessageType::Ping => Self::Ping(serde_json::from_value(value).map_err(invalid)?),
            MessageType::FileStart => Self::FileStart(serde_json::from_value(value).map_err(invalid)?),
            MessageType::FileChunk => Self::FileChunk(serde_json::from_value(value).map_err(invalid)?),
            _ => Self::FileEnd(serde_json::from_value(value).map_err(invalid)?),
        })
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Handshake(_) => MessageType::Handshake,
            Self::Ping(_) => MessageType::Ping,
            Self::FileStart(_) => MessageType::FileStart,
            Self::FileChunk(_) => MessageType::FileChunk,
            Self::FileEnd(_) => MessageType::FileEnd,
        }
    }

    /// Serializes as a newline-terminated line (client side and tests).
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        to_line(self)
    }
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

/// Reply to a handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub accepted: bool,
    /// Protocol version the server speaks.
    pub version: String,
    /// Name of the receiving device.
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Reply to a ping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Admission decision for a `file_start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStartAck {
    pub transfer_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FileStartAck {
    pub fn accepted(transfer_id: impl Into<String>) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            accepted: true,
            message: None,
        }
    }

    pub fn rejected(transfer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            accepted: false,
            message: Some(message.into()),
        }
    }
}

/// Final outcome of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileComplete {
    pub transfer_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub received_chunks: u32,
    pub received_bytes: u64,
}

/// Protocol-level error report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// A message sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    HandshakeAck(HandshakeAck),
    Pong(Pong),
    FileStartAck(FileStartAck),
    FileComplete(FileComplete),
    Error(ErrorMessage),
}

impl OutboundMessage {
    /// Builds an `error` message.
    pub fn error(message: impl Into<String>, code: Option<&str>) -> Self {
        Self::Error(ErrorMessage {
            message: message.into(),
            code: code.map(str::to_owned),
        })
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::HandshakeAck(_) => MessageType::HandshakeAck,
            Self::Pong(_) => MessageType::Pong,
            Self::FileStartAck(_) => MessageType::FileStartAck,
            Self::FileComplete(_) => MessageType::FileComplete,
            Self::Error(_) => MessageType::Error,
        }
    }

    /// Serializes as a newline-terminated JSON line.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        to_line(self)
    }
}

fn to_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(line)
}

/// Serde helper: `Vec<u8>` as standard base64.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
