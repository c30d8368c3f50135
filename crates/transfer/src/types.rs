use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use dropline_protocol::TransferProgress;
use dropline_protocol::messages::FileStart;
use tokio::time::Instant;

use crate::chunked::PendingChunks;
use crate::fs::ChunkFile;

/// Lifecycle of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Receiving,
    Completing,
    Complete,
    Error,
}

/// The in-flight transfer record.
pub struct Transfer {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub expected_checksum: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub status: TransferStatus,
    pub temp_path: PathBuf,
    pub final_path: PathBuf,
    pub started_at: Instant,
    pub last_chunk_at: Instant,
    pub deadline: Instant,

    received: HashSet<u32>,
    bytes_received: u64,
    pub(crate) file: Option<Arc<dyn ChunkFile>>,
    pub(crate) pending: PendingChunks,
    pub(crate) flush_scheduled: bool,
}

impl Transfer {
    pub(crate) fn new(
        req: &FileStart,
        temp_path: PathBuf,
        final_path: PathBuf,
        file: Arc<dyn ChunkFile>,
        deadline: Instant,
    ) -> Self {
        let now = Instant::now();
        Self {
            transfer_id: req.transfer_id.clone(),
            file_name: req.file_name.clone(),
            file_size: req.file_size,
            mime_type: req.mime_type.clone(),
            expected_checksum: req.checksum.to_ascii_lowercase(),
            total_chunks: req.total_chunks,
            chunk_size: req.chunk_size,
            status: TransferStatus::Receiving,
            temp_path,
            final_path,
            started_at: now,
            last_chunk_at: now,
            deadline,
            received: HashSet::new(),
            bytes_received: 0,
            file: Some(file),
            pending: PendingChunks::default(),
            flush_scheduled: false,
        }
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.received.contains(&index)
    }

    /// Records a chunk as received. Returns `false` for duplicates.
    pub(crate) fn record_chunk(&mut self, index: u32, len: u64) -> bool {
        if !self.received.insert(index) {
            return false;
        }
        self.bytes_received += len;
        self.last_chunk_at = Instant::now();
        true
    }

    pub fn received_chunks(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Missing chunk indices in ascending order, at most `limit` of them.
    /// The flag reports whether more were omitted.
    pub fn missing_chunks(&self, limit: usize) -> (Vec<u32>, bool) {
        let mut missing = (0..self.total_chunks).filter(|i| !self.received.contains(i));
        let shown: Vec<u32> = missing.by_ref().take(limit).collect();
        let truncated = missing.next().is_some();
        (shown, truncated)
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            transfer_id: self.transfer_id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            bytes_received: self.bytes_received,
            received_chunks: self.received_chunks(),
            total_chunks: self.total_chunks,
        }
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("transfer_id", &self.transfer_id)
            .field("file_name", &self.file_name)
            .field("status", &self.status)
            .field("received_chunks", &self.received.len())
            .field("total_chunks", &self.total_chunks)
            .field("bytes_received", &self.bytes_received)
            .field("pending_bytes", &self.pending.bytes())
            .finish_non_exhaustive()
    }
}
