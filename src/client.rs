//! Client side: one session per invocation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::config::ClientConfig;
use crate::driver::{run_session, Link};
use crate::error::{Result, TransferError};
use crate::protocol::Direction;
use crate::session::{Session, TransferReport};
use crate::store::{self, BlockStore, FsBlockStore};
use crate::stream::TcpClient;
use crate::timer::RetransmitConfig;

/// Datagram client. Binds a fresh ephemeral socket for every transfer.
#[derive(Clone)]
pub struct UdpClient {
    server: SocketAddr,
    incoming: Arc<dyn BlockStore>,
    outgoing: Arc<dyn BlockStore>,
    retransmit: RetransmitConfig,
}

impl UdpClient {
    pub fn new(
        server: SocketAddr,
        incoming: Arc<dyn BlockStore>,
        outgoing: Arc<dyn BlockStore>,
        retransmit: RetransmitConfig,
    ) -> UdpClient {
        UdpClient {
            server,
            incoming,
            outgoing,
            retransmit,
        }
    }

    pub fn from_config(config: &ClientConfig) -> UdpClient {
        UdpClient::new(
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
        let mut link = self.open_link().await?;
        let session = Session::client_read(self.server, filename);
        run_session(session, &mut link, &self.incoming, self.retransmit, None).await
    }

    /// Send `filename` from the outgoing store to the server.
    pub async fn upload(&self, filename: &str) -> Result<TransferReport> {
        let name = filename.to_string();
        if !store::blocking(&self.outgoing, move |s| Ok(s.exists(&name))).await? {
            return Err(TransferError::NotFound(filename.to_string()));
        }
        let mut link = self.open_link().await?;
        let session = Session::client_write(self.server, filename);
        run_session(session, &mut link, &self.outgoing, self.retransmit, None).await
    }

    async fn open_link(&self) -> Result<Link> {
        let unspecified = match self.server.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
        tracing::debug!(local = %socket.local_addr()?, server = %self.server, "client socket bound");
        Ok(Link::direct(Arc::new(socket), self.server))
    }
}

/// Either transport behind one interface, for the interactive front end.
#[derive(Clone)]
pub enum Client {
    Udp(UdpClient),
    Tcp(TcpClient),
}

impl Client {
    pub async fn transfer(&self, direction: Direction, filename: &str) -> Result<TransferReport> {
        match (self, direction) {
            (Client::Udp(client), Direction::Read) => client.download(filename).await,
            (Client::Udp(client), Direction::Write) => client.upload(filename).await,
            (Client::Tcp(client), Direction::Read) => client.download(filename).await,
            (Client::Tcp(client), Direction::Write) => client.upload(filename).await,
        }
    }
}
