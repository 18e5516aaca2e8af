//! C6: `FileSet`/`ChunkWriter` collaborator traits (§3, §6) plus `FsFileSet`,
//! the one concrete implementation backing both server read and receiver
//! write paths. Grounded on the teacher's `AudioBufferPool` (`buffers.rs`):
//! same idea of a small pool of reusable buffers handed out to a concurrent
//! pipeline of producers/consumers, generalized here from fixed-size audio
//! frames in memory to file-backed chunks at computed byte offsets.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::error::{Result, TransferError};
use crate::session::FileHeader;

/// Server-side: enumerate and read the payload at a session path (§3).
/// A `FileSet` implementation owns resolving `path` (from
/// `SessionJoinRequest`) to an ordered, stable `FileHeader` list and
/// serving byte ranges from it.
#[async_trait::async_trait]
pub trait FileSet: Send + Sync {
    /// List the files under `path` in the canonical order used to assign
    /// `FileHeader.ordinal` and derive chunks (§3). Must be stable across
    /// calls for the same `path` for the lifetime of a session.
    async fn headers(&self, path: &str) -> Result<Vec<FileHeader>>;

    /// Read `length` bytes at `byte_offset` from the file at `ordinal`
    /// within `path`.
    async fn read_range(&self, path: &str, ordinal: usize, byte_offset: u64, length: u32) -> Result<Vec<u8>>;
}

/// Receiver-side: write decoded chunks to local disk and track completion
/// (§3, §4.4). A `ChunkWriter` implementation owns file creation,
/// preallocation, and idempotent writes (the same `segment_id` may be
/// written more than once across waves/reconnects with identical bytes).
#[async_trait::async_trait]
pub trait ChunkWriter: Send + Sync {
    /// Prepare local storage for `files` under `root`, creating/truncating
    /// to final size as needed. Called once per session (including after
    /// a reconnect onto the same session, in which case existing partial
    /// files are kept, not truncated). Implementations remember the
    /// `root`/`files` pairing so a later `write_chunk` can resolve
    /// `ordinal` back to a path.
    async fn prepare(&self, root: &Path, files: &[FileHeader]) -> Result<()>;

    /// Write `data` for file `ordinal` (as indexed by the `files` passed to
    /// the most recent `prepare` call for this `root`) at `byte_offset`.
    /// Safe to call more than once for the same range with the same bytes.
    async fn write_chunk(&self, root: &Path, ordinal: usize, byte_offset: u64, data: &[u8]) -> Result<()>;

    /// Remove partial local state under `root` (§7 `PayloadMismatch`: "local
    /// files are cleaned"; §8 scenario 6). Not called on ordinary
    /// completion or `TransportLost`/reconnect — only when the receiver
    /// gives up on the payload entirely.
    async fn clean(&self, root: &Path) -> Result<()>;
}

/// Default `FileSet`/`ChunkWriter`: plain files under a root directory,
/// ordinal assigned by sorted filename. No in-memory buffer pool — unlike
/// the teacher's fixed-size `AudioBufferPool`, chunk sizes here are
/// derived once per session from `block_size` (§4.5) and callers already
/// own the byte vector they pass in, so there is nothing to pool against.
pub struct FsFileSet {
    root: PathBuf,
    /// Per-`root` file list recorded by `prepare`, so `write_chunk` can
    /// resolve an `ordinal` to a target path without re-reading the
    /// directory (which may no longer sort the same way once files have
    /// been created at their final, preallocated size).
    prepared: Mutex<std::collections::HashMap<PathBuf, Vec<FileHeader>>>,
}

impl FsFileSet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prepared: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn ordered_entries(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut read_dir = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| TransferError::DeserialiseFailed(format!("read_dir {}: {e}", dir.display())))?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| TransferError::DeserialiseFailed(format!("read_dir entry: {e}")))?
        {
            if entry
                .file_type()
                .await
                .map_err(|e| TransferError::DeserialiseFailed(format!("file_type: {e}")))?
                .is_file()
            {
                entries.push(entry.path());
            }
        }
        entries.sort();
        Ok(entries)
    }
}

#[async_trait::async_trait]
impl FileSet for FsFileSet {
    async fn headers(&self, path: &str) -> Result<Vec<FileHeader>> {
        let dir = self.resolve(path);
        let entries = Self::ordered_entries(&dir).await?;
        let mut headers = Vec::with_capacity(entries.len());
        for (ordinal, entry) in entries.iter().enumerate() {
            let metadata = tokio::fs::metadata(entry)
                .await
                .map_err(|e| TransferError::DeserialiseFailed(format!("metadata {}: {e}", entry.display())))?;
            let name = entry
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| TransferError::DeserialiseFailed(format!("non-utf8 file name: {}", entry.display())))?
                .to_string();
            headers.push(FileHeader {
                name,
                length: metadata.len(),
                ordinal,
            });
        }
        Ok(headers)
    }

    async fn read_range(&self, path: &str, ordinal: usize, byte_offset: u64, length: u32) -> Result<Vec<u8>> {
        let dir = self.resolve(path);
        let entries = Self::ordered_entries(&dir).await?;
        let entry = entries
            .get(ordinal)
            .ok_or_else(|| TransferError::DeserialiseFailed(format!("no file at ordinal {ordinal}")))?;
        let mut file = File::open(entry)
            .await
            .map_err(|e| TransferError::TransportLost(e))?;
        file.seek(SeekFrom::Start(byte_offset))
            .await
            .map_err(|e| TransferError::TransportLost(e))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| TransferError::TransportLost(e))?;
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl ChunkWriter for FsFileSet {
    async fn prepare(&self, root: &Path, files: &[FileHeader]) -> Result<()> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| TransferError::TransportLost(e))?;
        for f in files {
            let path = root.join(&f.name);
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .await
                .map_err(|e| TransferError::TransportLost(e))?;
            file.set_len(f.length)
                .await
                .map_err(|e| TransferError::TransportLost(e))?;
        }
        self.prepared.lock().insert(root.to_path_buf(), files.to_vec());
        Ok(())
    }

    async fn write_chunk(&self, root: &Path, ordinal: usize, byte_offset: u64, data: &[u8]) -> Result<()> {
        let name = {
            let guard = self.prepared.lock();
            let files = guard
                .get(root)
                .ok_or_else(|| TransferError::DeserialiseFailed(format!("write_chunk: {} not prepared", root.display())))?;
            files
                .get(ordinal)
                .ok_or_else(|| TransferError::DeserialiseFailed(format!("write_chunk: no ordinal {ordinal}")))?
                .name
                .clone()
        };
        let target = root.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&target)
            .await
            .map_err(|e| TransferError::TransportLost(e))?;
        file.seek(SeekFrom::Start(byte_offset))
            .await
            .map_err(|e| TransferError::TransportLost(e))?;
        file.write_all(data)
            .await
            .map_err(|e| TransferError::TransportLost(e))?;
        Ok(())
    }

    async fn clean(&self, root: &Path) -> Result<()> {
        self.prepared.lock().remove(root);
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::TransportLost(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn headers_lists_files_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("b.bin"), vec![0u8; 10]).await.unwrap();
        tokio::fs::write(dir.path().join("a.bin"), vec![0u8; 20]).await.unwrap();

        let fs = FsFileSet::new(dir.path());
        let headers = fs.headers("").await.unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].name, "a.bin");
        assert_eq!(headers[0].length, 20);
        assert_eq!(headers[1].name, "b.bin");
        assert_eq!(headers[1].length, 10);
    }

    #[tokio::test]
    async fn read_range_returns_requested_slice() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.bin"), (0u8..=255).collect::<Vec<u8>>())
            .await
            .unwrap();

        let fs = FsFileSet::new(dir.path());
        let data = fs.read_range("", 0, 10, 5).await.unwrap();
        assert_eq!(data, vec![10, 11, 12, 13, 14]);
    }

    #[tokio::test]
    async fn prepare_then_write_chunk_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsFileSet::new(dir.path());
        let headers = vec![FileHeader { name: "out.bin".into(), length: 8, ordinal: 0 }];
        fs.prepare(dir.path(), &headers).await.unwrap();

        fs.write_chunk(dir.path(), 0, 4, &[1, 2, 3, 4]).await.unwrap();

        let written = tokio::fs::read(dir.path().join("out.bin")).await.unwrap();
        assert_eq!(written, vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn clean_removes_partial_files_and_unprepares_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsFileSet::new(dir.path());
        let headers = vec![FileHeader { name: "out.bin".into(), length: 4, ordinal: 0 }];
        fs.prepare(dir.path(), &headers).await.unwrap();
        fs.write_chunk(dir.path(), 0, 0, &[1, 2, 3, 4]).await.unwrap();

        fs.clean(dir.path()).await.unwrap();

        assert!(!dir.path().join("out.bin").exists());
        let err = fs.write_chunk(dir.path(), 0, 0, &[1]).await.unwrap_err();
        assert!(matches!(err, TransferError::DeserialiseFailed(_)));
    }
}
