//! Protocol error kinds (§7). One closed enum shared by every component so
//! the receiver engine can match on `can_reconnect` semantics without
//! string-sniffing.

use thiserror::Error;

/// Error surface for the control-channel state machine, the wire codec, and
/// the reception engine. Transport-level I/O errors are folded into
/// [`TransferError::TransportLost`] or [`TransferError::MalformedFrame`]
/// depending on whether they occurred mid-frame or between frames.
#[derive(Debug, Error)]
pub enum TransferError {
    /// PSK mismatch or PSK-wrapped channel handshake failure (§4.2 step 5).
    /// Fatal to the session; no retry.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Reconnect found a different `FileHeader` list than the one already
    /// in progress (§4.2 "Reconnection"). Fatal; local files are cleaned.
    #[error("payload mismatch on reconnect: {0}")]
    PayloadMismatch(String),

    /// Admission limits exceeded (§4.2 step 6). Fatal for this attempt;
    /// caller may retry after `ReconnectDelay`.
    #[error("admission refused: {0}")]
    Refused(String),

    /// A length prefix overran the stream or a required field was absent.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame parsed structurally but failed semantic decode (e.g. an
    /// unknown tag, or a `FileSegment` whose `segment_id` is out of range).
    #[error("deserialise failed: {0}")]
    DeserialiseFailed(String),

    /// Control-channel I/O error after a successful join. Retryable.
    #[error("transport lost: {0}")]
    TransportLost(#[from] std::io::Error),

    /// Block-size derivation or settings validation failed at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Cooperative cancellation. No retry.
    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether the receiver engine's reconnect loop should retry after this
    /// error (§7 "Propagation"). `AuthFailed`, `PayloadMismatch`, and
    /// `Cancelled` are excluded — everything else is retried once
    /// `can_reconnect` has been set (i.e. after the first successful join).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransferError::AuthFailed(_) | TransferError::PayloadMismatch(_) | TransferError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
