//! Error types for tftp-transfer.

use thiserror::Error;

use crate::packet::Packet;
use crate::protocol::ErrorCode;

/// Result type for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Reasons a raw buffer could not be decoded into a [`Packet`].
///
/// These are fatal to the datagram, never to the session: the caller drops
/// the datagram and keeps waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer than two bytes, or the reserved first opcode byte is not zero.
    #[error("malformed packet header")]
    MalformedHeader,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    /// A fixed-size field is cut short.
    #[error("packet truncated before its minimum frame size")]
    TruncatedPayload,
}

/// Errors that end a transfer session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The peer sent a block other than the next one (stream variant only).
    #[error("block sequence error: expected block {expected}, got {got}")]
    BlockSequence { expected: u16, got: u16 },

    /// The peer sent an ERROR packet.
    #[error("remote error: {code}: {message}")]
    RemoteError { code: ErrorCode, message: String },

    #[error("peer unreachable after {attempts} attempts")]
    PeerUnreachable { attempts: u32 },

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("file too large for 16-bit block numbers")]
    FileTooLarge,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transfer aborted")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// The wire code a local failure is reported with.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransferError::RemoteError { code, .. } => *code,
            TransferError::NotFound(_) => ErrorCode::FileNotFound,
            TransferError::InvalidFilename(_) => ErrorCode::AccessViolation,
            TransferError::Io(_) => ErrorCode::DiskFull,
            TransferError::BlockSequence { .. } | TransferError::Decode(_) => {
                ErrorCode::IllegalOperation
            }
            TransferError::PeerUnreachable { .. }
            | TransferError::FileTooLarge
            | TransferError::Handshake(_)
            | TransferError::Aborted => ErrorCode::NotDefined,
        }
    }

    /// ERROR packet telling the peer why the session ended, or `None` when
    /// the peer must not (or cannot) be told.
    pub fn to_packet(&self) -> Option<Packet> {
        match self {
            TransferError::RemoteError { .. }
            | TransferError::PeerUnreachable { .. }
            | TransferError::Decode(_) => None,
            other => Some(Packet::error(other.code(), other.to_string())),
        }
    }
}
