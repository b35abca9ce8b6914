//! Wire codec for the five packet kinds.
//!
//! Pure data transformation: [`Packet::encode`] builds the bytes described in
//! [`crate::protocol`], [`Packet::decode`] parses them back. All multi-byte
//! integers are big-endian.
//!
//! Decoding is lenient: a filename or message
//! without its trailing NUL ends at the end of the buffer, and anything after
//! the first NUL of a request (the mode string) is ignored.

use crate::error::DecodeError;
use crate::protocol::{ErrorCode, Opcode, HEADER_LEN};

// Byte offsets within a serialised packet.
const OFF_OPCODE: usize = 0;
const OFF_FIELD: usize = 2;
const OFF_BODY: usize = HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String },
    Wrq { filename: String },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

impl Packet {
    pub fn data(block: u16, payload: Vec<u8>) -> Packet {
        Packet::Data { block, payload }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Packet {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    /// Serialise into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&(self.opcode() as u16).to_be_bytes());

        match self {
            Packet::Rrq { filename } | Packet::Wrq { filename } => {
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
            }
            Packet::Data { block, payload } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&u16::from(*code).to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
            }
        }

        buf
    }

    /// Parse a [`Packet`] from a raw datagram.
    pub fn decode(buf: &[u8]) -> Result<Packet, DecodeError> {
        if buf.len() < OFF_FIELD || buf[OFF_OPCODE] != 0 {
            return Err(DecodeError::MalformedHeader);
        }

        let op = buf[OFF_OPCODE + 1];
        let opcode = Opcode::from_u16(u16::from(op)).ok_or(DecodeError::UnknownOpcode(op))?;

        match opcode {
            Opcode::Rrq => Ok(Packet::Rrq {
                filename: string_from_buffer(&buf[OFF_FIELD..]),
            }),
            Opcode::Wrq => Ok(Packet::Wrq {
                filename: string_from_buffer(&buf[OFF_FIELD..]),
            }),
            Opcode::Data => Ok(Packet::Data {
                block: read_u16(buf)?,
                payload: buf[OFF_BODY..].to_vec(),
            }),
            Opcode::Ack => Ok(Packet::Ack {
                block: read_u16(buf)?,
            }),
            Opcode::Error => Ok(Packet::Error {
                code: ErrorCode::from(read_u16(buf)?),
                message: string_from_buffer(&buf[OFF_BODY..]),
            }),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Packet::Rrq { filename } | Packet::Wrq { filename } => OFF_FIELD + filename.len() + 1,
            Packet::Data { payload, .. } => HEADER_LEN + payload.len(),
            Packet::Ack { .. } => HEADER_LEN,
            Packet::Error { message, .. } => HEADER_LEN + message.len() + 1,
        }
    }
}

/// The 16-bit field that follows the opcode (block number or error code).
fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::TruncatedPayload);
    }
    Ok(u16::from_be_bytes([buf[OFF_FIELD], buf[OFF_FIELD + 1]]))
}

/// Text up to the first NUL, or to the end of the buffer when there is none.
fn string_from_buffer(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
