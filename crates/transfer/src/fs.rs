//! File-system capability used by the transfer state machine.
//!
//! The state machine never touches `std::fs` directly so hosts can supply
//! their own storage (sandboxed app directories, test doubles).

use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

/// An open file that accepts positioned writes.
///
/// Chunks arrive out of order, so every write names its absolute offset.
pub trait ChunkFile: Send + Sync {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Flushes written data to stable storage.
    fn close(&self) -> io::Result<()>;
}

/// Storage primitives the transfer state machine relies on.
pub trait FileSystem: Send + Sync {
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Creates (or truncates) a file for writing.
    fn create_file(&self, path: &Path) -> io::Result<Arc<dyn ChunkFile>>;

    fn exists(&self, path: &Path) -> bool;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Moves `from` to `to`. `to` must not exist.
    fn move_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
}

/// [`FileSystem`] backed by the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

struct LocalChunkFile {
    file: std::fs::File,
}

impl ChunkFile for LocalChunkFile {
    #[cfg(unix)]
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut written = 0;
        while written < data.len() {
            let n = self
                .file
                .seek_write(&data[written..], offset + written as u64)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn write_at(&self, _offset: u64, _data: &[u8]) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn close(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl FileSystem for LocalFileSystem {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn create_file(&self, path: &Path) -> io::Result<Arc<dyn ChunkFile>> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Arc::new(LocalChunkFile { file }))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    /// Renames, falling back to copy + remove when the paths are on
    /// different devices. A failed copy may leave a partial `to` behind.
    fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        match std::fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                tracing::debug!(
                    from = %from.display(),
                    to = %to.display(),
                    "rename failed ({rename_err}), falling back to copy"
                );
                std::fs::copy(from, to)?;
                std::fs::remove_file(from)
            }
        }
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn positioned_writes_out_of_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let fs = LocalFileSystem;

        let file = fs.create_file(&path).unwrap();
        file.write_at(5, b" World").unwrap();
        file.write_at(0, b"Hello").unwrap();
        file.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"Hello World");
    }

    #[test]
    fn create_truncates_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"stale content").unwrap();

        let file = LocalFileSystem.create_file(&path).unwrap();
        file.write_at(0, b"new").unwrap();
        file.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn move_file_renames() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.part");
        let to = dir.path().join("a.zip");
        std::fs::write(&from, b"data").unwrap();

        LocalFileSystem.move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"data");
    }

    #[test]
    fn move_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let result = LocalFileSystem.move_file(&dir.path().join("nope"), &dir.path().join("x"));
        assert!(result.is_err());
    }
}
