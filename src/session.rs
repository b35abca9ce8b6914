//! Per-peer transfer state machine.
//!
//! A [`Session`] never touches the network. The driver feeds it decoded
//! packets and timer expiries; it answers with a [`Progress`] telling the
//! driver what to put on the wire next. The only I/O it performs is through
//! the injected [`BlockStore`], one chunk per block.
//!
//! # Stop-and-wait contract
//! - At most one packet is outstanding. Block N+1 is never sent before
//!   block N was acknowledged.
//! - The sender ignores an ACK for anything but the outstanding block.
//! - The receiver silently drops DATA for anything but the expected block:
//!   no write, no ACK. The peer's own timer recovers the exchange.
//! - On timeout a session re-sends the exact bytes of its last packet.

use std::net::SocketAddr;

use crate::error::{Result, TransferError};
use crate::packet::Packet;
use crate::protocol::{Direction, BLOCK_SIZE};
use crate::store::BlockStore;

/// What the driver should do after feeding the session an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Transmit these bytes, then wait for the reply under a fresh timer.
    Send(Vec<u8>),
    /// Nothing to send; keep waiting under the current timer.
    Idle,
    /// Transfer complete. Transmit the trailing packet, if any, and stop.
    Done(Option<Vec<u8>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Succeeded,
    Failed,
    /// The peer sent an ERROR packet.
    RemoteError,
}

/// Final statistics of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub peer: SocketAddr,
    pub filename: String,
    pub direction: Direction,
    /// File bytes moved.
    pub bytes: u64,
    /// DATA blocks exchanged, including a trailing empty block.
    pub blocks: u32,
}

/// How a session opens its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opening {
    /// Client: send RRQ or WRQ.
    Request,
    /// Server on RRQ: send block 1 straight away.
    FirstBlock,
    /// Server on WRQ: acknowledge the request with ACK 0.
    AckRequest,
}

#[derive(Debug, Clone)]
enum Role {
    Sender(SendState),
    Receiver(RecvState),
}

#[derive(Debug, Clone, Default)]
struct SendState {
    /// Block waiting for its ACK. 0 while a write request awaits ACK 0.
    outstanding: u16,
    /// Payload length of the outstanding DATA block, `None` until one is sent.
    last_len: Option<usize>,
    offset: u64,
}

#[derive(Debug, Clone)]
struct RecvState {
    expected: u16,
    /// Last block written and acknowledged.
    last_block: u16,
    offset: u64,
    /// Whether anything was written, so abort only removes our own output.
    touched: bool,
}

impl RecvState {
    fn new() -> Self {
        Self {
            expected: 1,
            last_block: 0,
            offset: 0,
            touched: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    peer: SocketAddr,
    filename: String,
    direction: Direction,
    opening: Opening,
    role: Role,
    state: SessionState,
    last_sent: Option<Vec<u8>>,
    bytes: u64,
    blocks: u32,
}

impl Session {
    /// Client side of a download: send RRQ, then receive.
    pub fn client_read(server: SocketAddr, filename: impl Into<String>) -> Session {
        Session::new(
            server,
            filename.into(),
            Direction::Read,
            Opening::Request,
            Role::Receiver(RecvState::new()),
        )
    }

    /// Client side of an upload: send WRQ, wait for ACK 0, then send.
    pub fn client_write(server: SocketAddr, filename: impl Into<String>) -> Session {
        Session::new(
            server,
            filename.into(),
            Direction::Write,
            Opening::Request,
            Role::Sender(SendState::default()),
        )
    }

    /// Server side of a fresh request. `None` for anything but RRQ/WRQ.
    pub fn serve(peer: SocketAddr, request: Packet) -> Option<Session> {
        match request {
            Packet::Rrq { filename } => Some(Session::new(
                peer,
                filename,
                Direction::Read,
                Opening::FirstBlock,
                Role::Sender(SendState::default()),
            )),
            Packet::Wrq { filename } => Some(Session::new(
                peer,
                filename,
                Direction::Write,
                Opening::AckRequest,
                Role::Receiver(RecvState::new()),
            )),
            _ => None,
        }
    }

    fn new(
        peer: SocketAddr,
        filename: String,
        direction: Direction,
        opening: Opening,
        role: Role,
    ) -> Session {
        Session {
            peer,
            filename,
            direction,
            opening,
            role,
            state: SessionState::Active,
            last_sent: None,
            bytes: 0,
            blocks: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_sender(&self) -> bool {
        matches!(self.role, Role::Sender(_))
    }

    /// Whether the peer knows this session exists: it sent the request we
    /// are serving, or we already put a packet on the wire.
    pub fn has_engaged_peer(&self) -> bool {
        self.opening != Opening::Request || self.last_sent.is_some()
    }

    /// Bytes of the most recent transmission, for retransmission.
    pub fn last_sent(&self) -> Option<&[u8]> {
        self.last_sent.as_deref()
    }

    pub fn report(&self) -> TransferReport {
        TransferReport {
            peer: self.peer,
            filename: self.filename.clone(),
            direction: self.direction,
            bytes: self.bytes,
            blocks: self.blocks,
        }
    }

    /// Produce the packet that opens the exchange.
    pub fn start(&mut self, store: &dyn BlockStore) -> Result<Progress> {
        if self.filename.is_empty() {
            return Err(TransferError::InvalidFilename(self.filename.clone()));
        }

        match self.opening {
            Opening::Request => {
                let request = match self.direction {
                    Direction::Read => Packet::Rrq {
                        filename: self.filename.clone(),
                    },
                    Direction::Write => Packet::Wrq {
                        filename: self.filename.clone(),
                    },
                };
                Ok(self.transmit(request))
            }
            Opening::FirstBlock => self.send_next_block(store),
            Opening::AckRequest => Ok(self.transmit(Packet::Ack { block: 0 })),
        }
    }

    /// Feed one packet from the peer.
    pub fn on_packet(&mut self, packet: Packet, store: &dyn BlockStore) -> Result<Progress> {
        if self.state != SessionState::Active {
            return Ok(Progress::Idle);
        }

        if let Packet::Error { code, message } = packet {
            self.state = SessionState::RemoteError;
            return Err(TransferError::RemoteError { code, message });
        }

        match self.role {
            Role::Sender(_) => self.sender_on_packet(packet, store),
            Role::Receiver(_) => self.receiver_on_packet(packet, store),
        }
    }

    /// Whether `packet` is the peer re-sending the final block of a finished
    /// receive, meaning our final ACK was lost and should be re-sent as is.
    pub fn is_final_retransmit(&self, packet: &Packet) -> bool {
        match (&self.role, packet) {
            (Role::Receiver(recv), Packet::Data { block, .. }) => {
                self.state == SessionState::Succeeded && *block == recv.last_block
            }
            _ => false,
        }
    }

    /// Tear the session down after a failure. A receiver that wrote part of
    /// the file discards it. Safe to call more than once.
    pub fn abort(&mut self, store: &dyn BlockStore) {
        if self.state == SessionState::Active {
            self.state = SessionState::Failed;
        }

        if let Role::Receiver(recv) = &mut self.role {
            if recv.touched {
                match store.discard(&self.filename) {
                    Ok(()) => tracing::debug!(file = %self.filename, "discarded partial output"),
                    Err(e) => {
                        tracing::warn!(file = %self.filename, error = %e, "failed to discard partial output")
                    }
                }
                recv.touched = false;
            }
        }
    }

    fn sender_on_packet(&mut self, packet: Packet, store: &dyn BlockStore) -> Result<Progress> {
        let Role::Sender(send) = &mut self.role else {
            return Ok(Progress::Idle);
        };

        let block = match packet {
            Packet::Ack { block } => block,
            other => {
                tracing::debug!(peer = %self.peer, opcode = ?other.opcode(), "ignoring packet while sending");
                return Ok(Progress::Idle);
            }
        };

        if block != send.outstanding {
            tracing::debug!(peer = %self.peer, block, outstanding = send.outstanding, "ignoring stale ack");
            return Ok(Progress::Idle);
        }

        let last_len = send.last_len;
        match last_len {
            // ACK 0 for our write request.
            None => self.send_next_block(store),
            Some(len) => {
                send.offset += len as u64;
                self.bytes += len as u64;
                if len < BLOCK_SIZE {
                    self.state = SessionState::Succeeded;
                    Ok(Progress::Done(None))
                } else {
                    self.send_next_block(store)
                }
            }
        }
    }

    fn receiver_on_packet(&mut self, packet: Packet, store: &dyn BlockStore) -> Result<Progress> {
        let Role::Receiver(recv) = &mut self.role else {
            return Ok(Progress::Idle);
        };

        let (block, payload) = match packet {
            Packet::Data { block, payload } => (block, payload),
            other => {
                tracing::debug!(peer = %self.peer, opcode = ?other.opcode(), "ignoring packet while receiving");
                return Ok(Progress::Idle);
            }
        };

        if block != recv.expected {
            tracing::debug!(peer = %self.peer, block, expected = recv.expected, "discarding out-of-sequence block");
            return Ok(Progress::Idle);
        }

        recv.touched = true;
        store.append_chunk(&self.filename, recv.offset, &payload)?;
        recv.offset += payload.len() as u64;
        recv.last_block = block;
        self.bytes += payload.len() as u64;
        self.blocks += 1;

        let ack = Packet::Ack { block };
        if payload.len() < BLOCK_SIZE {
            self.state = SessionState::Succeeded;
            let bytes = ack.encode();
            self.last_sent = Some(bytes.clone());
            return Ok(Progress::Done(Some(bytes)));
        }

        recv.expected = block.checked_add(1).ok_or(TransferError::FileTooLarge)?;
        Ok(self.transmit(ack))
    }

    fn send_next_block(&mut self, store: &dyn BlockStore) -> Result<Progress> {
        let Role::Sender(send) = &mut self.role else {
            return Ok(Progress::Idle);
        };

        let block = send
            .outstanding
            .checked_add(1)
            .ok_or(TransferError::FileTooLarge)?;
        let chunk = store.read_chunk(&self.filename, send.offset, BLOCK_SIZE)?;

        send.outstanding = block;
        send.last_len = Some(chunk.len());
        self.blocks += 1;
        Ok(self.transmit(Packet::data(block, chunk)))
    }

    fn transmit(&mut self, packet: Packet) -> Progress {
        let bytes = packet.encode();
        self.last_sent = Some(bytes.clone());
        Progress::Send(bytes)
    }
}
