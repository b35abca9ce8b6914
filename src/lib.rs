//! Small TFTP-style file transfer over UDP or TCP.
//!
//! The datagram variant runs a stop-and-wait exchange per peer: one
//! outstanding packet, retransmitted on timeout up to a retry budget. A
//! server multiplexes any number of peers over one socket. The stream
//! variant carries the same packets over a TCP connection and leaves
//! reliability to the transport.
//!
//! Layers, bottom-up: [`packet`] codec, [`store`] file access, [`timer`],
//! the sans-I/O [`session`] state machine, the async [`driver`], and the
//! [`server`] / [`client`] front ends.

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod packet;
pub mod prompt;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod stream;
pub mod timer;

pub use client::{Client, UdpClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::{DecodeError, Result, TransferError};
pub use packet::Packet;
pub use protocol::{Direction, ErrorCode};
pub use server::UdpServer;
pub use session::{Session, TransferReport};
pub use shutdown::Shutdown;
pub use store::{BlockStore, FsBlockStore, MemoryBlockStore};
pub use stream::{TcpClient, TcpServer};
pub use timer::RetransmitConfig;
