//! Datagram server: one socket, many concurrent sessions.
//!
//! The dispatch loop owns the session table and is the only reader of the
//! socket. Each session runs in its own task and receives its packets over
//! a bounded channel; the loop never waits on a session. Sessions are keyed
//! by the peer's (address, port) alone, so two clients behind one NAT
//! mapping that share an apparent port cannot be told apart.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::driver::{run_session, Link};
use crate::error::{Result, TransferError};
use crate::packet::Packet;
use crate::protocol::MAX_PACKET_LEN;
use crate::session::{Session, TransferReport};
use crate::shutdown::Shutdown;
use crate::store::BlockStore;
use crate::timer::RetransmitConfig;

/// What a finished session task reports back to the dispatcher.
#[derive(Debug)]
enum SessionReturnState {
    Complete(u64, TransferReport),
    Failed(u64, SocketAddr, String, TransferError),
}

#[derive(Debug)]
struct SessionHandle {
    id: u64,
    tx: mpsc::Sender<Packet>,
}

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    store: Arc<dyn BlockStore>,
    retransmit: RetransmitConfig,
    session_queue: usize,
    sessions: HashMap<SocketAddr, SessionHandle>,
    next_id: u64,
    shutdown: Shutdown,
}

impl UdpServer {
    pub async fn bind(
        config: ServerConfig,
        store: Arc<dyn BlockStore>,
        shutdown: Shutdown,
    ) -> Result<UdpServer> {
        let socket = UdpSocket::bind(config.bind).await?;
        let local_addr = socket.local_addr()?;
        tracing::info!(addr = %local_addr, "datagram server bound");

        Ok(UdpServer {
            socket: Arc::new(socket),
            local_addr,
            store,
            retransmit: config.retransmit,
            session_queue: config.session_queue.max(1),
            sessions: HashMap::new(),
            next_id: 0,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Serve until the shutdown signal arrives, then wait for every session
    /// to wind down.
    pub async fn run(mut self) -> Result<()> {
        let mut in_buffer = [0u8; MAX_PACKET_LEN];
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<SessionReturnState>();
        tracing::info!("server is now listening");

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut in_buffer[..]) => {
                    match received {
                        Ok((len, peer)) => self.dispatch(&in_buffer[..len], peer, &done_tx),
                        // ICMP errors from earlier sends surface here on some platforms.
                        Err(e) => tracing::warn!(error = %e, "receive failed"),
                    }
                }
                Some(state) = done_rx.recv() => self.finish(state),
                _ = self.shutdown.recv() => break,
            }
        }

        tracing::info!(sessions = self.sessions.len(), "terminating server");
        // Closing every queue aborts sessions that missed the signal. Each
        // task discards its partial output before reporting, and the channel
        // closes once the last task has dropped its sender.
        self.sessions.clear();
        drop(done_tx);
        while let Some(state) = done_rx.recv().await {
            self.finish(state);
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        datagram: &[u8],
        peer: SocketAddr,
        done_tx: &mpsc::UnboundedSender<SessionReturnState>,
    ) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "dropping malformed datagram");
                return;
            }
        };

        if let Some(handle) = self.sessions.get(&peer) {
            if !handle.tx.is_closed() {
                if let Err(e) = handle.tx.try_send(packet) {
                    tracing::debug!(%peer, error = %e, "session queue unavailable, dropping datagram");
                }
                return;
            }
            // The task has ended but its report is still in flight.
            self.sessions.remove(&peer);
        }

        match Session::serve(peer, packet) {
            Some(session) => self.spawn_session(session, done_tx.clone()),
            None => tracing::debug!(%peer, "no session for peer, dropping datagram"),
        }
    }

    fn spawn_session(&mut self, session: Session, done_tx: mpsc::UnboundedSender<SessionReturnState>) {
        let peer = session.peer();
        let id = self.next_id;
        self.next_id += 1;

        tracing::info!(%peer, file = session.filename(), direction = %session.direction(), "serving request");

        let (tx, rx) = mpsc::channel(self.session_queue);
        self.sessions.insert(peer, SessionHandle { id, tx });

        let mut link = Link::routed(self.socket.clone(), peer, rx);
        let store = self.store.clone();
        let retransmit = self.retransmit;
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let filename = session.filename().to_string();
            let result =
                run_session(session, &mut link, &store, retransmit, Some(&mut shutdown)).await;
            let state = match result {
                Ok(report) => SessionReturnState::Complete(id, report),
                Err(e) => SessionReturnState::Failed(id, peer, filename, e),
            };
            let _ = done_tx.send(state);
        });
    }

    fn finish(&mut self, state: SessionReturnState) {
        let (id, peer) = match &state {
            SessionReturnState::Complete(id, report) => {
                tracing::info!(
                    peer = %report.peer,
                    file = %report.filename,
                    direction = %report.direction,
                    bytes = report.bytes,
                    blocks = report.blocks,
                    "transfer complete"
                );
                (*id, report.peer)
            }
            SessionReturnState::Failed(id, peer, file, e) => {
                tracing::warn!(%peer, %file, error = %e, "transfer failed");
                (*id, *peer)
            }
        };

        // A newer session from the same peer may already own the slot.
        if self.sessions.get(&peer).is_some_and(|h| h.id == id) {
            self.sessions.remove(&peer);
        }
    }
}
