//! C3/C4-adjacent: the unicast control channel (§2, §4.1, §4.2). Frames are
//! a varint length prefix followed by a [`Message`]-encoded body; the
//! length prefix is the transport-layer framing `wire.rs` explicitly
//! leaves to this module. Grounded on the teacher's `control_loop`/
//! `per_client_control` accept-and-serve loop and `client.rs`'s connect
//! path, ported from blocking `std::net::TcpStream` with manual
//! non-blocking polling to `tokio::net::TcpStream` with `AsyncReadExt`/
//! `AsyncWriteExt`, which removes the teacher's 50ms poll-sleep loop
//! entirely in favor of real async suspension.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::FrameCipher;
use crate::error::{Result, TransferError};
use crate::wire::{self, Message};

/// Largest frame this side will accept, guarding against a peer claiming
/// an absurd length prefix and exhausting memory before the real payload
/// arrives.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// An ordered, reliable, framed point-to-point stream carrying [`Message`]
/// values (§2 C3). The concrete implementation is `TcpControlChannel`;
/// the trait exists so `server_session.rs`/`receiver.rs` can be tested
/// against an in-memory double without a real socket.
#[async_trait::async_trait]
pub trait ControlChannel: Send {
    async fn send(&mut self, msg: &Message) -> Result<()>;
    async fn recv(&mut self) -> Result<Message>;
}

/// Wraps frame bytes for confidentiality/integrity after authentication
/// (§4.2 step 3). `PlainSecureChannel` is a no-op (no PSK configured or
/// TLS out of scope entirely); `PskSecureChannel` AEAD-wraps each frame
/// using the handshake-derived [`FrameCipher`] pair, standing in for the
/// spec's "TLS wrapper ... using that nonce as PSK identity material".
pub trait SecureChannel: Send {
    fn wrap_outgoing(&mut self, frame: &[u8]) -> Vec<u8>;
    fn unwrap_incoming(&mut self, frame: &[u8]) -> Result<Vec<u8>>;
}

pub struct PlainSecureChannel;

impl SecureChannel for PlainSecureChannel {
    fn wrap_outgoing(&mut self, frame: &[u8]) -> Vec<u8> {
        frame.to_vec()
    }

    fn unwrap_incoming(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        Ok(frame.to_vec())
    }
}

pub struct PskSecureChannel {
    outgoing: FrameCipher,
    incoming: FrameCipher,
    send_counter: u64,
    recv_counter: u64,
}

impl PskSecureChannel {
    /// `outgoing_label`/`incoming_label` must be swapped between the two
    /// ends of the same connection (e.g. `b"client-to-server"` on the
    /// sender, `b"server-to-client"` on that same side's read direction)
    /// so each side derives the matching pair of direction keys.
    pub fn new(outgoing: FrameCipher, incoming: FrameCipher) -> Self {
        Self {
            outgoing,
            incoming,
            send_counter: 0,
            recv_counter: 0,
        }
    }
}

impl SecureChannel for PskSecureChannel {
    fn wrap_outgoing(&mut self, frame: &[u8]) -> Vec<u8> {
        let sealed = self.outgoing.seal_frame(self.send_counter, frame);
        self.send_counter += 1;
        sealed
    }

    fn unwrap_incoming(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let opened = self.incoming.open_frame(self.recv_counter, frame)?;
        self.recv_counter += 1;
        Ok(opened)
    }
}

/// `ControlChannel` over any `AsyncRead + AsyncWrite` stream (a
/// `tokio::net::TcpStream` in production, an in-memory duplex in tests),
/// with an optional `SecureChannel` wrapping layer.
pub struct FramedControlChannel<S> {
    stream: S,
    secure: Box<dyn SecureChannel>,
}

impl<S> FramedControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, secure: Box<dyn SecureChannel>) -> Self {
        Self { stream, secure }
    }

    pub fn plain(stream: S) -> Self {
        Self::new(stream, Box::new(PlainSecureChannel))
    }

    async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        let wrapped = self.secure.wrap_outgoing(body);
        let mut len_buf = BytesMut::new();
        wire::write_varint(&mut len_buf, wrapped.len() as u64);
        self.stream.write_all(&len_buf).await?;
        self.stream.write_all(&wrapped).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Bytes> {
        let len = self.read_varint_from_stream().await?;
        if len > MAX_FRAME_LEN {
            return Err(TransferError::MalformedFrame(format!(
                "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
            )));
        }
        let mut raw = vec![0u8; len as usize];
        self.stream.read_exact(&mut raw).await?;
        let unwrapped = self.secure.unwrap_incoming(&raw)?;
        Ok(Bytes::from(unwrapped))
    }

    /// Read one QUIC-style varint a byte at a time directly off the
    /// stream (the codec in `wire.rs` operates on an already-buffered
    /// `Bytes`, so the first length byte has to be peeked here to learn
    /// how many more bytes to read).
    async fn read_varint_from_stream(&mut self) -> Result<u64> {
        let mut first = [0u8; 1];
        self.stream.read_exact(&mut first).await?;
        let extra = (1usize << (first[0] >> 6)) - 1;
        let mut rest = vec![0u8; extra];
        if extra > 0 {
            self.stream.read_exact(&mut rest).await?;
        }
        let mut combined = BytesMut::with_capacity(1 + extra);
        combined.extend_from_slice(&first);
        combined.extend_from_slice(&rest);
        let mut frozen = combined.freeze();
        wire::read_varint(&mut frozen)
    }
}

#[async_trait::async_trait]
impl<S> ControlChannel for FramedControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &Message) -> Result<()> {
        let body = msg.encode();
        self.write_frame(&body).await
    }

    async fn recv(&mut self) -> Result<Message> {
        let body = self.read_frame().await?;
        Message::decode(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Status;
    use tokio::io::duplex;

    #[tokio::test]
    async fn plain_channel_roundtrips_messages() {
        let (client_io, server_io) = duplex(4096);
        let mut client = FramedControlChannel::plain(client_io);
        let mut server = FramedControlChannel::plain(server_io);

        let msg = Message::SessionJoinRequest {
            path: "payload/a".into(),
            state: 0,
        };
        client.send(&msg).await.unwrap();
        let received = server.recv().await.unwrap();
        assert_eq!(received, msg);

        let reply = Message::Response {
            status: Status::Ok,
            error_message: None,
        };
        server.send(&reply).await.unwrap();
        let received_reply = client.recv().await.unwrap();
        assert_eq!(received_reply, reply);
    }

    #[tokio::test]
    async fn psk_channel_roundtrips_messages() {
        use crate::config::PassphraseEncoding;
        use crate::crypto::{derive_frame_base_nonce, FrameCipher, PskKey};

        let key = PskKey::derive("shared-secret", PassphraseEncoding::Utf16Le);
        let base_nonce = derive_frame_base_nonce(b"challenge-value");

        let client_out = FrameCipher::new(&key, base_nonce, b"client-to-server");
        let client_in = FrameCipher::new(&key, base_nonce, b"server-to-client");
        let server_out = FrameCipher::new(&key, base_nonce, b"server-to-client");
        let server_in = FrameCipher::new(&key, base_nonce, b"client-to-server");

        let (client_io, server_io) = duplex(4096);
        let mut client = FramedControlChannel::new(client_io, Box::new(PskSecureChannel::new(client_out, client_in)));
        let mut server = FramedControlChannel::new(server_io, Box::new(PskSecureChannel::new(server_out, server_in)));

        let msg = Message::PacketStatusUpdate {
            bytes_left: 4096,
            leaving_session: false,
        };
        client.send(&msg).await.unwrap();
        let received = server.recv().await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client_io, server_io) = duplex(4096);
        let mut server = FramedControlChannel::plain(server_io);

        let mut len_buf = BytesMut::new();
        wire::write_varint(&mut len_buf, MAX_FRAME_LEN + 1);
        client_io.write_all(&len_buf).await.unwrap();

        let err = server.recv().await.unwrap_err();
        assert!(matches!(err, TransferError::MalformedFrame(_)));
    }
}
