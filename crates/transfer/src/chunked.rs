use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::fs::{ChunkFile, FileSystem};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(fs: &dyn FileSystem, path: &Path) -> Result<String, TransferError> {
    let mut file = fs.open_read(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Returns `true` for a 64-character hex string (SHA-256 digest format).
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// PendingChunks
// ---------------------------------------------------------------------------

/// Chunks received but not yet written, keyed by chunk index.
#[derive(Debug, Default)]
pub struct PendingChunks {
    chunks: BTreeMap<u32, Vec<u8>>,
    bytes: usize,
}

impl PendingChunks {
    /// Buffers a chunk and returns the new buffered byte total.
    ///
    /// Callers guarantee `index` is not already buffered.
    pub fn insert(&mut self, index: u32, data: Vec<u8>) -> usize {
        self.bytes += data.len();
        if let Some(old) = self.chunks.insert(index, data) {
            self.bytes -= old.len();
        }
        self.bytes
    }

    /// Buffered byte total.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Moves every buffered chunk out, leaving the buffer empty.
    pub fn take(&mut self) -> BTreeMap<u32, Vec<u8>> {
        self.bytes = 0;
        std::mem::take(&mut self.chunks)
    }
}

// ---------------------------------------------------------------------------
// FlushBatch
// ---------------------------------------------------------------------------

/// Buffered chunks detached from a transfer, ready to be written.
///
/// Owns everything it needs so it can run on a blocking thread.
pub struct FlushBatch {
    pub transfer_id: String,
    file: Arc<dyn ChunkFile>,
    chunk_size: u64,
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl FlushBatch {
    pub(crate) fn new(
        transfer_id: String,
        file: Arc<dyn ChunkFile>,
        chunk_size: u64,
        chunks: BTreeMap<u32, Vec<u8>>,
    ) -> Self {
        Self {
            transfer_id,
            file,
            chunk_size,
            chunks,
        }
    }

    /// Writes every chunk at `index * chunk_size`. Returns bytes written.
    pub fn write(&self) -> Result<u64, TransferError> {
        let mut written = 0u64;
        for (&index, data) in &self.chunks {
            let offset = u64::from(index) * self.chunk_size;
            self.file.write_at(offset, data)?;
            written += data.len() as u64;
        }
        Ok(written)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use tempfile::TempDir;

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert!(is_sha256_hex(&c1));
    }

    #[test]
    fn calculate_file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.bin");
        std::fs::write(&path, b"test content for checksum").unwrap();

        let file_cs = calculate_file_checksum(&LocalFileSystem, &path).unwrap();
        assert_eq!(file_cs, checksum_bytes(b"test content for checksum"));
    }

    #[test]
    fn sha256_hex_format() {
        assert!(is_sha256_hex(&"0".repeat(64)));
        assert!(is_sha256_hex(&"aB".repeat(32)));
        assert!(!is_sha256_hex(&"0".repeat(63)));
        assert!(!is_sha256_hex(&"g".repeat(64)));
        assert!(!is_sha256_hex(""));
    }

    #[test]
    fn pending_tracks_bytes() {
        let mut pending = PendingChunks::default();
        assert_eq!(pending.insert(3, vec![0; 10]), 10);
        assert_eq!(pending.insert(1, vec![0; 5]), 15);
        assert_eq!(pending.len(), 2);

        let taken = pending.take();
        assert_eq!(taken.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(pending.is_empty());
        assert_eq!(pending.bytes(), 0);
    }

    #[test]
    fn flush_batch_writes_at_chunk_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let file = LocalFileSystem.create_file(&path).unwrap();

        let mut pending = PendingChunks::default();
        pending.insert(2, b"EE".to_vec());
        pending.insert(0, b"AABB".to_vec());
        pending.insert(1, b"CCDD".to_vec());

        let batch = FlushBatch::new("t1".into(), file.clone(), 4, pending.take());
        assert_eq!(batch.chunk_count(), 3);
        assert_eq!(batch.write().unwrap(), 10);
        file.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"AABBCCDDEE");
    }
}
