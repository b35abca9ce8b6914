//! Reliable-stream variant over TCP.
//!
//! The stream carries the same packets as the datagram variant, each framed
//! with a 2-byte big-endian length. Both ends first exchange the `CONNECT`
//! handshake. There are no per-block ACKs: the stream is reliable, so the
//! receiver only checks block order, and any gap is fatal. After an upload
//! the server acknowledges the final block once so the client knows the
//! file landed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, TransferError};
use crate::packet::Packet;
use crate::protocol::{Direction, ErrorCode, BLOCK_SIZE, HANDSHAKE};
use crate::session::TransferReport;
use crate::shutdown::Shutdown;
use crate::store::{self, BlockStore, FsBlockStore};
use crate::timer::RetransmitConfig;

/// Write one length-prefixed packet. A packet too long for the 16-bit
/// prefix is refused before anything reaches the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let body = packet.encode();
    let len = u16::try_from(body.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} byte packet does not fit a frame", body.len()),
        )
    })?;
    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed packet. `None` if the peer closed the stream
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Packet>> {
    let mut prefix = [0u8; 2];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut body = vec![0u8; u16::from_be_bytes(prefix) as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(Packet::decode(&body)?))
}

/// One side of an open stream, with an idle limit on every read.
struct Conn<S> {
    stream: S,
    peer: SocketAddr,
    idle: Duration,
    attempts: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    fn new(stream: S, peer: SocketAddr, config: RetransmitConfig) -> Conn<S> {
        // As patient as the datagram side: one timeout per allowed attempt.
        let attempts = config.max_retries.saturating_add(1);
        Conn {
            stream,
            peer,
            idle: config.timeout.saturating_mul(attempts),
            attempts,
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<()> {
        write_frame(&mut self.stream, packet).await
    }

    async fn recv(&mut self) -> Result<Option<Packet>> {
        match tokio::time::timeout(self.idle, read_frame(&mut self.stream)).await {
            Ok(frame) => frame,
            Err(_) => Err(TransferError::PeerUnreachable {
                attempts: self.attempts,
            }),
        }
    }

    /// Like `recv`, but a closed stream is an error.
    async fn next_packet(&mut self) -> Result<Packet> {
        match self.recv().await? {
            Some(packet) => Ok(packet),
            None => Err(TransferError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            ))),
        }
    }

    async fn send_handshake(&mut self) -> Result<()> {
        self.stream.write_all(HANDSHAKE).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv_handshake(&mut self) -> Result<()> {
        let mut greeting = [0u8; HANDSHAKE.len()];
        match tokio::time::timeout(self.idle, self.stream.read_exact(&mut greeting)).await {
            Ok(Ok(_)) if &greeting == HANDSHAKE => Ok(()),
            Ok(Ok(_)) => Err(TransferError::Handshake(format!(
                "unexpected greeting {:?}",
                String::from_utf8_lossy(&greeting)
            ))),
            Ok(Err(e)) => Err(TransferError::Handshake(e.to_string())),
            Err(_) => Err(TransferError::Handshake("timed out".into())),
        }
    }

    /// Tell the peer why the transfer ended, if it should be told.
    async fn report_failure(&mut self, err: &TransferError) {
        if let Some(packet) = err.to_packet() {
            if let Err(e) = self.send(&packet).await {
                tracing::debug!(peer = %self.peer, error = %e, "failed to notify peer");
            }
        }
    }
}

/// Bytes and blocks moved so far, and whether the output file was written.
#[derive(Debug, Default)]
struct Tally {
    bytes: u64,
    blocks: u32,
    touched: bool,
}

impl Tally {
    fn report(&self, peer: SocketAddr, filename: &str, direction: Direction) -> TransferReport {
        TransferReport {
            peer,
            filename: filename.to_string(),
            direction,
            bytes: self.bytes,
            blocks: self.blocks,
        }
    }
}

/// Stream `name` as DATA blocks, ending with a short (possibly empty) block.
/// Returns the number of the final block.
async fn send_blocks<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Conn<S>,
    store: &Arc<dyn BlockStore>,
    name: &str,
    tally: &mut Tally,
) -> Result<u16> {
    let mut block: u16 = 1;
    loop {
        let (file, offset) = (name.to_string(), tally.bytes);
        let chunk = store::blocking(store, move |s| s.read_chunk(&file, offset, BLOCK_SIZE)).await?;
        let last = chunk.len() < BLOCK_SIZE;
        tally.bytes += chunk.len() as u64;
        tally.blocks += 1;
        conn.send(&Packet::data(block, chunk)).await?;

        if last {
            return Ok(block);
        }
        block = block.checked_add(1).ok_or(TransferError::FileTooLarge)?;
    }
}

/// Store DATA blocks into `name` until a short block arrives. Returns the
/// number of the final block.
async fn receive_blocks<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Conn<S>,
    store: &Arc<dyn BlockStore>,
    name: &str,
    tally: &mut Tally,
) -> Result<u16> {
    let mut expected: u16 = 1;
    loop {
        match conn.next_packet().await? {
            Packet::Data { block, payload } if block == expected => {
                tally.touched = true;
                let (file, offset, len) = (name.to_string(), tally.bytes, payload.len());
                store::blocking(store, move |s| s.append_chunk(&file, offset, &payload)).await?;
                tally.bytes += len as u64;
                tally.blocks += 1;

                if len < BLOCK_SIZE {
                    return Ok(block);
                }
                expected = expected.checked_add(1).ok_or(TransferError::FileTooLarge)?;
            }
            Packet::Data { block, .. } | Packet::Ack { block } => {
                return Err(TransferError::BlockSequence {
                    expected,
                    got: block,
                });
            }
            Packet::Error { code, message } => {
                return Err(TransferError::RemoteError { code, message });
            }
            Packet::Rrq { .. } | Packet::Wrq { .. } => {
                return Err(TransferError::BlockSequence { expected, got: 0 });
            }
        }
    }
}

/// Drop a partially written file after a failed receive.
async fn discard_partial(store: &Arc<dyn BlockStore>, name: &str, tally: &Tally) {
    if tally.touched {
        let file = name.to_string();
        if let Err(e) = store::blocking(store, move |s| s.discard(&file)).await {
            tracing::warn!(file = name, error = %e, "failed to discard partial file");
        }
    }
}

/// Stream server. One task per accepted connection.
pub struct TcpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    store: Arc<dyn BlockStore>,
    retransmit: RetransmitConfig,
    shutdown: Shutdown,
}

impl TcpServer {
    pub async fn bind(
        config: ServerConfig,
        store: Arc<dyn BlockStore>,
        shutdown: Shutdown,
    ) -> Result<TcpServer> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "stream server bound");

        Ok(TcpServer {
            listener,
            local_addr,
            store,
            retransmit: config.retransmit,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the shutdown signal arrives.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("server is now listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                _ = self.shutdown.recv() => {
                    tracing::info!("terminating server");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!(%peer, "connection accepted");
        let store = self.store.clone();
        let retransmit = self.retransmit;
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let conn = Conn::new(stream, peer, retransmit);
            match serve_connection(conn, &store, &mut shutdown).await {
                Ok(report) => tracing::info!(
                    %peer,
                    file = %report.filename,
                    direction = %report.direction,
                    bytes = report.bytes,
                    blocks = report.blocks,
                    "transfer complete"
                ),
                Err(e) => tracing::warn!(%peer, error = %e, "transfer failed"),
            }
        });
    }
}

async fn serve_connection<S: AsyncRead + AsyncWrite + Unpin>(
    mut conn: Conn<S>,
    store: &Arc<dyn BlockStore>,
    shutdown: &mut Shutdown,
) -> Result<TransferReport> {
    conn.recv_handshake().await?;
    conn.send_handshake().await?;

    let (direction, filename) = match conn.next_packet().await? {
        Packet::Rrq { filename } => (Direction::Read, filename),
        Packet::Wrq { filename } => (Direction::Write, filename),
        other => {
            let err = TransferError::Handshake(format!("expected a request, got {:?}", other.opcode()));
            let _ = conn
                .send(&Packet::error(ErrorCode::IllegalOperation, err.to_string()))
                .await;
            return Err(err);
        }
    };
    tracing::info!(peer = %conn.peer, file = %filename, %direction, "serving request");

    let mut tally = Tally::default();
    let result = if filename.is_empty() {
        Err(TransferError::InvalidFilename(filename.clone()))
    } else {
        tokio::select! {
            r = serve_transfer(&mut conn, store, &filename, direction, &mut tally) => r,
            _ = shutdown.recv() => Err(TransferError::Aborted),
        }
    };

    match result {
        Ok(()) => Ok(tally.report(conn.peer, &filename, direction)),
        Err(err) => {
            conn.report_failure(&err).await;
            if direction == Direction::Write {
                discard_partial(store, &filename, &tally).await;
            }
            Err(err)
        }
    }
}

async fn serve_transfer<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Conn<S>,
    store: &Arc<dyn BlockStore>,
    filename: &str,
    direction: Direction,
    tally: &mut Tally,
) -> Result<()> {
    match direction {
        Direction::Read => {
            send_blocks(conn, store, filename, tally).await?;
        }
        Direction::Write => {
            let last = receive_blocks(conn, store, filename, tally).await?;
            conn.send(&Packet::Ack { block: last }).await?;
        }
    }
    Ok(())
}

/// Stream client. Opens one connection per transfer.
#[derive(Clone)]
pub struct TcpClient {
    server: SocketAddr,
    incoming: Arc<dyn BlockStore>,
    outgoing: Arc<dyn BlockStore>,
    retransmit: RetransmitConfig,
}

impl TcpClient {
    pub fn new(
        server: SocketAddr,
        incoming: Arc<dyn BlockStore>,
        outgoing: Arc<dyn BlockStore>,
        retransmit: RetransmitConfig,
    ) -> TcpClient {
        TcpClient {
            server,
            incoming,
            outgoing,
            retransmit,
        }
    }

    pub fn from_config(config: &ClientConfig) -> TcpClient {
        TcpClient::new(
            config.server,
            Arc::new(FsBlockStore::new(&config.incoming)),
            Arc::new(FsBlockStore::new(&config.outgoing)),
            config.retransmit,
        )
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Fetch `filename` from the server into the incoming store.
    pub async fn download(&self, filename: &str) -> Result<TransferReport> {
        let mut conn = self.connect().await?;
        conn.send(&Packet::Rrq {
            filename: filename.to_string(),
        })
        .await?;

        let mut tally = Tally::default();
        match receive_blocks(&mut conn, &self.incoming, filename, &mut tally).await {
            Ok(_) => Ok(tally.report(self.server, filename, Direction::Read)),
            Err(err) => {
                conn.report_failure(&err).await;
                discard_partial(&self.incoming, filename, &tally).await;
                Err(err)
            }
        }
    }

    /// Send `filename` from the outgoing store and wait for the server to
    /// acknowledge the final block.
    pub async fn upload(&self, filename: &str) -> Result<TransferReport> {
        let name = filename.to_string();
        if !store::blocking(&self.outgoing, move |s| Ok(s.exists(&name))).await? {
            return Err(TransferError::NotFound(filename.to_string()));
        }

        let mut conn = self.connect().await?;
        conn.send(&Packet::Wrq {
            filename: filename.to_string(),
        })
        .await?;

        let mut tally = Tally::default();
        let last = match send_blocks(&mut conn, &self.outgoing, filename, &mut tally).await {
            Ok(last) => last,
            Err(err) => {
                conn.report_failure(&err).await;
                return Err(err);
            }
        };

        match conn.next_packet().await? {
            Packet::Ack { block } if block == last => {
                Ok(tally.report(self.server, filename, Direction::Write))
            }
            Packet::Ack { block } => Err(TransferError::BlockSequence {
                expected: last,
                got: block,
            }),
            Packet::Error { code, message } => Err(TransferError::RemoteError { code, message }),
            _ => Err(TransferError::BlockSequence {
                expected: last,
                got: 0,
            }),
        }
    }

    async fn connect(&self) -> Result<Conn<TcpStream>> {
        let stream = TcpStream::connect(self.server).await?;
        let mut conn = Conn::new(stream, self.server, self.retransmit);
        conn.send_handshake().await?;
        conn.recv_handshake().await?;
        tracing::debug!(server = %self.server, "handshake complete");
        Ok(conn)
    }
}
