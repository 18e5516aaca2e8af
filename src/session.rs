//! `FileHeader`, `Session`, and the deterministic chunk-plan derivation
//! (§3). Server and receivers must agree byte-for-byte on the ordered
//! header list; a mismatch on reconnect is fatal (`PayloadMismatch`).

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One file in the payload's ordered sequence. Structural equality across
/// the whole list is the reconnection contract (§4.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub name: String,
    pub length: u64,
    pub ordinal: usize,
}

/// Internal mapping from a `segment_id` to a byte range in one file (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub segment_id: u64,
    pub file_ordinal: usize,
    pub byte_offset: u64,
    pub length: u32,
}

/// Derive the ordered chunk sequence for a file list and block size. This
/// is a pure function of its inputs so server and receiver always agree
/// without needing to exchange the chunk list itself — only the headers
/// and `block_size` (carried in `SessionJoinResponse` plus the MTU/encoder
/// config both sides share) need to match.
pub fn derive_chunks(files: &[FileHeader], block_size: u32) -> Vec<FileChunk> {
    assert!(block_size > 0, "block_size must be positive");
    let mut chunks = Vec::new();
    let mut segment_id = 0u64;
    for file in files {
        let mut offset = 0u64;
        while offset < file.length {
            let remaining = file.length - offset;
            let len = remaining.min(block_size as u64) as u32;
            chunks.push(FileChunk {
                segment_id,
                file_ordinal: file.ordinal,
                byte_offset: offset,
                length: len,
            });
            offset += len as u64;
            segment_id += 1;
        }
    }
    chunks
}

/// One admitted transfer for a given payload path (§3).
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: u32,
    pub multicast_address: Ipv4Addr,
    pub multicast_port: u16,
    pub payload_root: PathBuf,
    pub files: Vec<FileHeader>,
    pub chunks: Vec<FileChunk>,
    /// The `block_size` chunks were derived with (§4.5). Distinct from any
    /// individual `FileChunk::length`, which is clipped to the remaining
    /// bytes of its file and so is `<= block_size` for the last chunk of
    /// each file.
    pub block_size: u32,
    pub wave: u64,
}

impl Session {
    pub fn new(
        session_id: u32,
        multicast_address: Ipv4Addr,
        multicast_start_port: u16,
        payload_root: PathBuf,
        files: Vec<FileHeader>,
        block_size: u32,
    ) -> Self {
        let chunks = derive_chunks(&files, block_size);
        Self {
            session_id,
            multicast_address,
            multicast_port: multicast_start_port + session_id as u16,
            payload_root,
            files,
            chunks,
            block_size,
            wave: 0,
        }
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_chunks_splits_evenly() {
        let files = vec![FileHeader { name: "a".into(), length: 10, ordinal: 0 }];
        let chunks = derive_chunks(&files, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], FileChunk { segment_id: 0, file_ordinal: 0, byte_offset: 0, length: 4 });
        assert_eq!(chunks[1], FileChunk { segment_id: 1, file_ordinal: 0, byte_offset: 4, length: 4 });
        assert_eq!(chunks[2], FileChunk { segment_id: 2, file_ordinal: 0, byte_offset: 8, length: 2 });
    }

    #[test]
    fn derive_chunks_spans_multiple_files_with_continuous_segment_ids() {
        let files = vec![
            FileHeader { name: "a".into(), length: 5, ordinal: 0 },
            FileHeader { name: "b".into(), length: 3, ordinal: 1 },
        ];
        let chunks = derive_chunks(&files, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].segment_id, 0);
        assert_eq!(chunks[1].segment_id, 1);
        assert_eq!(chunks[1].file_ordinal, 0);
        assert_eq!(chunks[2].segment_id, 2);
        assert_eq!(chunks[2].file_ordinal, 1);
        assert_eq!(chunks[2].byte_offset, 0);
    }

    #[test]
    fn derive_chunks_is_deterministic() {
        let files = vec![FileHeader { name: "a".into(), length: 4096, ordinal: 0 }];
        let a = derive_chunks(&files, 1024);
        let b = derive_chunks(&files, 1024);
        assert_eq!(a, b);
    }
}
