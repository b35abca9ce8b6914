//! Async loop that runs one [`Session`] over a datagram socket.
//!
//! ```text
//!   inbound packet ──▶ Session::on_packet ──▶ Progress ──▶ send + arm timer
//!   timer expiry   ──▶ re-send last bytes (bounded) or PeerUnreachable
//!   shutdown       ──▶ Aborted
//! ```
//!
//! A session suspends only while awaiting the next packet or its timer.
//! On failure the peer is told with an ERROR packet where that makes sense,
//! and partial output is discarded before the error is returned.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{Result, TransferError};
use crate::packet::Packet;
use crate::protocol::MAX_PACKET_LEN;
use crate::session::{Progress, Session, TransferReport};
use crate::shutdown::Shutdown;
use crate::store::{self, BlockStore};
use crate::timer::{RetransmitConfig, RetransmitTimer};

/// Where a session's inbound packets come from.
#[derive(Debug)]
enum Inbound {
    /// Read the socket directly, keeping only the peer's datagrams.
    Socket,
    /// Packets already decoded and routed by the server dispatcher.
    Routed(mpsc::Receiver<Packet>),
}

/// One session's view of the network: a shared socket and its peer.
#[derive(Debug)]
pub struct Link {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: Inbound,
}

impl Link {
    pub fn direct(socket: Arc<UdpSocket>, peer: SocketAddr) -> Link {
        Link {
            socket,
            peer,
            inbound: Inbound::Socket,
        }
    }

    pub fn routed(socket: Arc<UdpSocket>, peer: SocketAddr, rx: mpsc::Receiver<Packet>) -> Link {
        Link {
            socket,
            peer,
            inbound: Inbound::Routed(rx),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.socket.send_to(bytes, self.peer).await?;
        Ok(())
    }

    /// Next well-formed packet from the peer. `None` once the dispatcher
    /// has dropped this session's queue.
    pub async fn recv(&mut self) -> io::Result<Option<Packet>> {
        match &mut self.inbound {
            Inbound::Routed(rx) => Ok(rx.recv().await),
            Inbound::Socket => {
                let mut buf = [0u8; MAX_PACKET_LEN];
                loop {
                    let (len, from) = self.socket.recv_from(&mut buf).await?;
                    if from != self.peer {
                        tracing::debug!(%from, expected = %self.peer, "dropping datagram from unexpected peer");
                        continue;
                    }
                    match Packet::decode(&buf[..len]) {
                        Ok(packet) => return Ok(Some(packet)),
                        Err(e) => tracing::debug!(%from, error = %e, "dropping malformed datagram"),
                    }
                }
            }
        }
    }
}

/// Run `session` to completion over `link`.
///
/// A finished receiver then dallies for `config.dally`, re-sending its final
/// ACK if the peer re-sends the final block.
pub async fn run_session(
    mut session: Session,
    link: &mut Link,
    store: &Arc<dyn BlockStore>,
    config: RetransmitConfig,
    mut shutdown: Option<&mut Shutdown>,
) -> Result<TransferReport> {
    match drive(&mut session, link, store, config, &mut shutdown).await {
        Ok(report) => {
            if !session.is_sender() && !config.dally.is_zero() {
                dally(&session, link, config.dally).await;
            }
            Ok(report)
        }
        Err(err) => {
            // A peer that never saw a request has nothing to be told.
            if let Some(packet) = err.to_packet().filter(|_| session.has_engaged_peer()) {
                // Best effort: the session is over either way.
                if let Err(e) = link.send(&packet.encode()).await {
                    tracing::warn!(peer = %link.peer(), error = %e, "failed to notify peer");
                }
            }
            let aborted = step(&mut session, store, |s, store| {
                s.abort(store);
                Ok(())
            })
            .await;
            if let Err(e) = aborted {
                tracing::warn!(peer = %link.peer(), error = %e, "failed to clean up session");
            }
            Err(err)
        }
    }
}

/// Apply one store-touching step to `session` on the blocking pool.
async fn step<T, F>(session: &mut Session, store: &Arc<dyn BlockStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Session, &dyn BlockStore) -> Result<T> + Send + 'static,
{
    let mut working = session.clone();
    let (working, outcome) = store::blocking(store, move |store| {
        let outcome = op(&mut working, store);
        Ok((working, outcome))
    })
    .await?;
    *session = working;
    outcome
}

async fn drive(
    session: &mut Session,
    link: &mut Link,
    store: &Arc<dyn BlockStore>,
    config: RetransmitConfig,
    shutdown: &mut Option<&mut Shutdown>,
) -> Result<TransferReport> {
    let mut timer = RetransmitTimer::new(config);
    let mut progress = step(session, store, |s, store| s.start(store)).await?;

    loop {
        match progress {
            Progress::Send(bytes) => {
                link.send(&bytes).await?;
                timer.arm();
            }
            Progress::Idle => {}
            Progress::Done(last) => {
                if let Some(bytes) = last {
                    link.send(&bytes).await?;
                }
                timer.disarm();
                return Ok(session.report());
            }
        }

        progress = tokio::select! {
            packet = link.recv() => match packet? {
                Some(packet) => step(session, store, move |s, store| s.on_packet(packet, store)).await?,
                None => return Err(TransferError::Aborted),
            },
            _ = timer.expired() => {
                let attempt = timer.on_expiry()?;
                if let Some(bytes) = session.last_sent() {
                    tracing::debug!(peer = %link.peer(), file = session.filename(), attempt, "retransmitting");
                    link.send(bytes).await?;
                }
                Progress::Idle
            }
            _ = stopped(shutdown) => return Err(TransferError::Aborted),
        };
    }
}

async fn dally(session: &Session, link: &mut Link, period: Duration) {
    let deadline = tokio::time::sleep(period);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return,
            packet = link.recv() => match packet {
                Ok(Some(packet)) if session.is_final_retransmit(&packet) => {
                    if let Some(bytes) = session.last_sent() {
                        tracing::debug!(peer = %link.peer(), "re-sending final ack");
                        let _ = link.send(bytes).await;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return,
            },
        }
    }
}

async fn stopped(shutdown: &mut Option<&mut Shutdown>) {
    match shutdown {
        Some(shutdown) => shutdown.recv().await,
        None => std::future::pending::<()>().await,
    }
}
