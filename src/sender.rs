//! C10: builds and transmits one `FileSegment` per planned `segment_id`
//! (§4.3). Grounded on the teacher's `audio_multicast_loop` frame-build-
//! and-send sequence: read/assemble payload, optionally AEAD-encrypt with
//! the header as AAD, `udp.send_to`. Generalized from one audio frame per
//! captured buffer to one `FileSegment` per `FileChunk`, with the
//! teacher's per-frame sequence number replaced by `segment_id` (already
//! unique and deterministic, so no separate counter is needed) and the
//! teacher's fixed 22-byte frame header replaced by `wire::Message::encode`.

use std::sync::Arc;

use crate::crypto::BlockCipher;
use crate::datagram::DatagramGroup;
use crate::error::Result;
use crate::fileset::FileSet;
use crate::scheduler::ChunkSender;
use crate::session::FileChunk;
use crate::wire::Message;

/// Ties a session's chunk plan, payload source, optional encoder, and
/// datagram group together into something `WaveScheduler::run` can drive
/// one `segment_id` at a time.
pub struct MulticastSender<F, G> {
    session_id: u32,
    path: String,
    chunks: Vec<FileChunk>,
    file_set: Arc<F>,
    group: Arc<G>,
    cipher: Option<BlockCipher>,
}

impl<F, G> MulticastSender<F, G>
where
    F: FileSet,
    G: DatagramGroup,
{
    pub fn new(session_id: u32, path: String, chunks: Vec<FileChunk>, file_set: Arc<F>, group: Arc<G>, cipher: Option<BlockCipher>) -> Self {
        Self {
            session_id,
            path,
            chunks,
            file_set,
            group,
            cipher,
        }
    }

    async fn build_segment(&self, chunk: &FileChunk, wave: u64) -> Result<Message> {
        let plaintext = self
            .file_set
            .read_range(&self.path, chunk.file_ordinal, chunk.byte_offset, chunk.length)
            .await?;
        let data = match &self.cipher {
            None => plaintext,
            Some(cipher) => {
                let aad = chunk.segment_id.to_be_bytes();
                cipher.encode(self.session_id, wave, chunk.segment_id, &plaintext, &aad)
            }
        };
        Ok(Message::FileSegment {
            segment_id: chunk.segment_id,
            data,
        })
    }
}

#[async_trait::async_trait]
impl<F, G> ChunkSender for MulticastSender<F, G>
where
    F: FileSet,
    G: DatagramGroup,
{
    async fn send(&self, segment_id: u64) -> Result<()> {
        let chunk = self
            .chunks
            .iter()
            .find(|c| c.segment_id == segment_id)
            .expect("scheduler only requests segment_ids within the session's chunk plan");
        // `wave` only needs to vary the nonce if the same segment_id can
        // carry different plaintext across calls, which it can't within a
        // session (§3: chunk byte ranges are fixed once derived), so a
        // constant wave value here is as safe as a real per-wave counter
        // and avoids threading the scheduler's wave state through this
        // trait object.
        let msg = self.build_segment(chunk, 0).await?;
        let encoded = msg.encode();
        self.group.send(&encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PassphraseEncoding;
    use crate::crypto::PskKey;
    use crate::error::TransferError;
    use crate::session::FileHeader;
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    struct FixedFileSet {
        bytes: Vec<u8>,
    }

    #[async_trait]
    impl FileSet for FixedFileSet {
        async fn headers(&self, _path: &str) -> Result<Vec<FileHeader>> {
            Ok(vec![FileHeader { name: "a".into(), length: self.bytes.len() as u64, ordinal: 0 }])
        }

        async fn read_range(&self, _path: &str, _ordinal: usize, byte_offset: u64, length: u32) -> Result<Vec<u8>> {
            let start = byte_offset as usize;
            let end = start + length as usize;
            self.bytes
                .get(start..end)
                .map(|s| s.to_vec())
                .ok_or_else(|| TransferError::DeserialiseFailed("out of range".into()))
        }
    }

    struct CapturingGroup {
        sent: AsyncMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl DatagramGroup for CapturingGroup {
        async fn join(_address: std::net::Ipv4Addr, _port: u16, _interface: Option<std::net::Ipv4Addr>) -> Result<Self> {
            unimplemented!("sender constructs its group directly, never via join")
        }

        async fn send(&self, data: &[u8]) -> Result<()> {
            self.sent.lock().await.push(data.to_vec());
            Ok(())
        }

        async fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
            unimplemented!("sender does not receive")
        }

        async fn leave(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sends_plaintext_segment_for_requested_chunk() {
        let file_set = Arc::new(FixedFileSet { bytes: vec![1, 2, 3, 4, 5, 6] });
        let group = Arc::new(CapturingGroup { sent: AsyncMutex::new(Vec::new()) });
        let chunks = vec![
            FileChunk { segment_id: 0, file_ordinal: 0, byte_offset: 0, length: 3 },
            FileChunk { segment_id: 1, file_ordinal: 0, byte_offset: 3, length: 3 },
        ];
        let sender = MulticastSender::new(1, "p".into(), chunks, file_set, group.clone(), None);

        sender.send(1).await.unwrap();

        let sent = group.sent.lock().await;
        let decoded = Message::decode(sent[0].clone().into()).unwrap();
        match decoded {
            Message::FileSegment { segment_id, data } => {
                assert_eq!(segment_id, 1);
                assert_eq!(data, vec![4, 5, 6]);
            }
            _ => panic!("wrong message"),
        }
    }

    #[tokio::test]
    async fn sends_encrypted_segment_when_cipher_configured() {
        let file_set = Arc::new(FixedFileSet { bytes: vec![9, 9, 9, 9] });
        let group = Arc::new(CapturingGroup { sent: AsyncMutex::new(Vec::new()) });
        let chunks = vec![FileChunk { segment_id: 0, file_ordinal: 0, byte_offset: 0, length: 4 }];
        let key = PskKey::derive("s", PassphraseEncoding::Utf8);
        let sender = MulticastSender::new(1, "p".into(), chunks, file_set, group.clone(), Some(BlockCipher::new(key)));

        sender.send(0).await.unwrap();

        let sent = group.sent.lock().await;
        let decoded = Message::decode(sent[0].clone().into()).unwrap();
        match decoded {
            Message::FileSegment { data, .. } => assert_ne!(data, vec![9, 9, 9, 9]),
            _ => panic!("wrong message"),
        }
    }
}
