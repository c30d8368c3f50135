use std::fmt;

use serde::{Deserialize, Serialize};

/// Server lifecycle status.
///
/// `Idle → Starting → Listening → Handshaking → Connected → ReceivingFile`,
/// returning to `Listening` after a transfer concludes. `Error` is entered on
/// transport failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Idle,
    Starting,
    Listening,
    Handshaking,
    Connected,
    ReceivingFile,
    Error,
}

impl ServerStatus {
    /// Whether a `file_start` may be considered in this status.
    pub fn accepts_transfers(self) -> bool {
        matches!(self, Self::Connected | Self::ReceivingFile)
    }
}

/// The handshaken client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub device_name: String,
    pub platform: String,
    pub protocol_version: String,
    pub app_version: String,
}

/// Progress of the in-flight transfer, as shown to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_received: u64,
    pub received_chunks: u32,
    pub total_chunks: u32,
}

impl TransferProgress {
    /// Percentage in `0.0..=100.0`.
    pub fn percentage(&self) -> f64 {
        if self.file_size == 0 {
            return if self.received_chunks >= self.total_chunks {
                100.0
            } else {
                0.0
            };
        }
        (self.bytes_received as f64 / self.file_size as f64 * 100.0).min(100.0)
    }
}

/// Machine-readable failure reason in `file_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    IncompleteTransfer,
    DiskError,
    Timeout,
    ChecksumMismatch,
    ConnectionLost,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IncompleteTransfer => "INCOMPLETE_TRANSFER",
            Self::DiskError => "DISK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::ConnectionLost => "CONNECTION_LOST",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
