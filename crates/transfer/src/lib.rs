//! Receiving side of a chunked file transfer.
//!
//! [`TransferManager`] admits one transfer at a time, buffers chunks in
//! memory, writes them at their offsets in a temp file and moves the
//! finished file into storage. Leftovers are removed by a deferred
//! [`CleanupTask`] guarded by a [`CleanupGeneration`].

mod chunked;
mod cleanup;
pub mod fs;
mod manager;
mod types;
mod validation;

pub use chunked::{FlushBatch, PendingChunks, calculate_file_checksum, checksum_bytes, is_sha256_hex};
pub use cleanup::{CleanupGeneration, CleanupOutcome, CleanupTask};
pub use fs::{ChunkFile, FileSystem, LocalFileSystem};
pub use manager::{
    ChunkOutcome, Completed, Completion, Concluded, DropReason, FinishStep, TransferManager,
};
pub use types::{Transfer, TransferStatus};
pub use validation::{
    DEFAULT_FLUSH_THRESHOLD, DEFAULT_TIMEOUT_SECS, Rejection, TransferPolicy, validate_file_name,
};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid file name: {0}")]
    InvalidFileName(String),
}
