use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use dropline_protocol::constants::MAX_CHUNK_SIZE;
use dropline_protocol::messages::FileStart;
use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::chunked::is_sha256_hex;

/// Pending bytes that trigger a background flush: 512 KiB.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 512 * 1024;

/// Default global transfer timeout: 30 minutes.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;

/// Directory under `storage_dir` used for temp files when none is configured.
const PARTIAL_DIR: &str = ".partial";

/// Longest accepted file name, in bytes.
const MAX_FILE_NAME_LEN: usize = 255;

/// Validates that `file_name` is a bare file name that stays inside the
/// storage directory.
///
/// Rejects:
/// - Empty names and `.` / `..`
/// - Path separators (`/` or `\`) and drive prefixes (`C:`)
/// - Control characters
/// - Names longer than 255 bytes
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    let invalid = |reason: &str| Err(TransferError::InvalidFileName(format!("{reason}: {file_name:?}")));

    if file_name.is_empty() {
        return invalid("empty name");
    }
    if file_name.len() > MAX_FILE_NAME_LEN {
        return invalid("name too long");
    }
    if file_name.contains(['/', '\\', ':']) {
        return invalid("path separators not allowed");
    }
    if file_name.chars().any(char::is_control) {
        return invalid("control characters not allowed");
    }

    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => invalid("not a plain file name"),
    }
}

/// Why a `file_start` was refused. The `Display` text is sent to the client
/// in `file_start_ack.message`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("Not ready to receive files")]
    NotConnected,

    #[error("Another transfer is already in progress")]
    TransferInProgress,

    #[error("Invalid file name")]
    InvalidFileName,

    #[error("File type not allowed: {0}")]
    ExtensionNotAllowed(String),

    #[error("MIME type not allowed: {0}")]
    MimeTypeNotAllowed(String),

    #[error("Chunk size {chunk_size} exceeds maximum {max}")]
    ChunkTooLarge { chunk_size: u64, max: u64 },

    #[error("File size {file_size} does not match {total_chunks} chunks of {chunk_size} bytes")]
    SizeMismatch {
        file_size: u64,
        total_chunks: u32,
        chunk_size: u64,
    },

    #[error("Invalid checksum format")]
    InvalidChecksum,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Failed to create temporary file: {0}")]
    TempFile(String),
}

/// Limits and locations applied to incoming transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferPolicy {
    /// Where completed files are placed.
    pub storage_dir: PathBuf,
    /// Where in-progress files are written. Unset means
    /// `storage_dir/.partial`; see [`temp_dir`](Self::temp_dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    /// Lower-case extensions without the dot.
    pub allowed_extensions: Vec<String>,
    pub allowed_mime_types: Vec<String>,
    /// Capped at [`MAX_CHUNK_SIZE`]; larger frames never reach the manager.
    pub max_chunk_size: u64,
    pub flush_threshold: usize,
    pub timeout_secs: u64,
    /// Compare the received file's SHA-256 against the declared checksum.
    pub verify_checksum: bool,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("received"),
            temp_dir: None,
            allowed_extensions: vec!["zip".into()],
            allowed_mime_types: vec![
                "application/zip".into(),
                "application/x-zip-compressed".into(),
                "application/octet-stream".into(),
            ],
            max_chunk_size: MAX_CHUNK_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            verify_checksum: false,
        }
    }
}

impl TransferPolicy {
    /// Policy rooted at `storage_dir`, temp files in `storage_dir/.partial`.
    pub fn with_storage(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    /// Resolved temp directory.
    pub fn temp_dir(&self) -> PathBuf {
        match &self.temp_dir {
            Some(dir) => dir.clone(),
            None => self.storage_dir.join(PARTIAL_DIR),
        }
    }

    /// Largest chunk admitted, never above what the frame parser accepts.
    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size.min(MAX_CHUNK_SIZE)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Request-only admission checks, in the order they are reported.
    ///
    /// Server status and the single-transfer rule are checked by the
    /// manager before this.
    pub fn check_admission(&self, req: &FileStart) -> Result<(), Rejection> {
        if validate_file_name(&req.file_name).is_err() {
            return Err(Rejection::InvalidFileName);
        }

        let extension = Path::new(&req.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        {
            return Err(Rejection::ExtensionNotAllowed(extension));
        }

        if !self
            .allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&req.mime_type))
        {
            return Err(Rejection::MimeTypeNotAllowed(req.mime_type.clone()));
        }

        let max_chunk_size = self.max_chunk_size();
        if req.chunk_size > max_chunk_size {
            return Err(Rejection::ChunkTooLarge {
                chunk_size: req.chunk_size,
                max: max_chunk_size,
            });
        }

        if !size_consistent(req.file_size, req.total_chunks, req.chunk_size) {
            return Err(Rejection::SizeMismatch {
                file_size: req.file_size,
                total_chunks: req.total_chunks,
                chunk_size: req.chunk_size,
            });
        }

        if !is_sha256_hex(&req.checksum) {
            return Err(Rejection::InvalidChecksum);
        }

        Ok(())
    }
}

/// `(total - 1) * chunk < size <= total * chunk`. An empty file has zero chunks.
fn size_consistent(file_size: u64, total_chunks: u32, chunk_size: u64) -> bool {
    let size = u128::from(file_size);
    let chunk = u128::from(chunk_size);
    let total = u128::from(total_chunks);
    if total == 0 {
        return size == 0;
    }
    (total - 1) * chunk < size && size <= total * chunk
}
