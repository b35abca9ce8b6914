/* Wire-level constants shared by the datagram and stream variants.
 *
 * Every packet starts with a two byte opcode whose first byte is always zero:
 *   RRQ   | 00 01 | filename | 00 |
 *   WRQ   | 00 02 | filename | 00 |
 *   DATA  | 00 03 | block (2, BE) | payload (0..512) |
 *   ACK   | 00 04 | block (2, BE) |
 *   ERROR | 00 05 | code (2, BE)  | message | 00 |
 *
 * A DATA payload shorter than BLOCK_SIZE ends the transfer. When the file
 * length is an exact multiple of BLOCK_SIZE an empty DATA block is sent last.
 * ACK 0 acknowledges a write request; DATA/ACK pairs count up from block 1.
 */

use std::fmt;
use std::time::Duration;

// Protocol configuration constants
pub const BLOCK_SIZE: usize = 512;
pub const HEADER_LEN: usize = 4;
pub const MAX_PACKET_LEN: usize = BLOCK_SIZE + HEADER_LEN;
pub const DEFAULT_PORT: u16 = 1025;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const DEFAULT_SERVER_DIR: &str = "files";
pub const DEFAULT_INCOMING_DIR: &str = "incoming";
pub const DEFAULT_OUTGOING_DIR: &str = "outgoing";

/// Greeting exchanged in both directions before a stream transfer starts.
pub const HANDSHAKE: &[u8; 7] = b"CONNECT";

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    pub fn from_u16(val: u16) -> Option<Opcode> {
        match val {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            _ => None,
        }
    }
}

/// Error codes carried by ERROR packets.
///
/// Codes outside the conventional range are kept as `Other` so that whatever
/// a peer puts on the wire survives a decode/encode cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileAlreadyExists,
    NoSuchUser,
    Other(u16),
}

impl ErrorCode {
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or I/O failure",
            ErrorCode::IllegalOperation => "Illegal operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::Other(_) => "Unknown error",
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(val: u16) -> ErrorCode {
        match val {
            0 => ErrorCode::NotDefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        match code {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::Other(val) => val,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), u16::from(*self))
    }
}

/// Which way file content flows, named after the request that opens the
/// transfer: `Read` moves a file from server to client, `Write` the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}
