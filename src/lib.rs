//! `mcastxfer`: a multicast fan-out file transfer protocol (see
//! `SPEC_FULL.md`). One server advertises a payload, admits receivers on
//! a unicast control channel, then drives them through a sequence of
//! waves over a shared UDP multicast group until every admitted receiver
//! has every chunk.
//!
//! This crate is a library: it has no GUI and no binary entry point. A
//! caller wires a `server_session::SessionRegistry` (server side) or a
//! `receiver::ReceiverSession` (client side) together with concrete
//! `control::ControlChannel`/`datagram::DatagramGroup`/`fileset`
//! implementations and drives them on a `tokio` runtime.

pub mod bitvector;
pub mod block;
pub mod config;
pub mod control;
pub mod crypto;
pub mod datagram;
pub mod error;
pub mod fileset;
pub mod receiver;
pub mod scheduler;
pub mod sender;
pub mod server_session;
pub mod session;
pub mod wire;

/// Re-exports of the types most callers need, so `use mcastxfer::prelude::*`
/// covers the common cases without reaching into individual modules.
pub mod prelude {
    pub use crate::bitvector::BitVector;
    pub use crate::config::{ClientConfig, PassphraseEncoding, ServerConfig};
    pub use crate::control::{ControlChannel, FramedControlChannel};
    pub use crate::crypto::{BlockCipher, PskKey};
    pub use crate::datagram::{DatagramGroup, UdpDatagramGroup};
    pub use crate::error::{Result, TransferError};
    pub use crate::fileset::{ChunkWriter, FileSet, FsFileSet};
    pub use crate::receiver::{ControlChannelFactory, DatagramGroupFactory, ReceiverSession};
    pub use crate::scheduler::WaveScheduler;
    pub use crate::server_session::{ServerSession, SessionRegistry, SessionSenderFactory};
    pub use crate::session::{derive_chunks, FileChunk, FileHeader, Session};
    pub use crate::wire::Message;
}
