use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::protocol::{DEFAULT_INCOMING_DIR, DEFAULT_OUTGOING_DIR, DEFAULT_PORT, DEFAULT_SERVER_DIR};
use crate::timer::RetransmitConfig;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: SocketAddr,
    /// Directory files are served from and stored to
    pub dir: PathBuf,
    pub retransmit: RetransmitConfig,
    /// Capacity of each session's inbound queue; datagrams beyond it are dropped
    pub session_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let retransmit = RetransmitConfig::default();
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            dir: PathBuf::from(DEFAULT_SERVER_DIR),
            retransmit: RetransmitConfig {
                dally: retransmit.timeout,
                ..retransmit
            },
            session_queue: 16,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server to talk to
    pub server: SocketAddr,
    /// Downloads land here; created if absent
    pub incoming: PathBuf,
    /// Uploads are read from here
    pub outgoing: PathBuf,
    pub retransmit: RetransmitConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            incoming: PathBuf::from(DEFAULT_INCOMING_DIR),
            outgoing: PathBuf::from(DEFAULT_OUTGOING_DIR),
            retransmit: RetransmitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind.port(), 1025);
        assert_eq!(cfg.dir, PathBuf::from("files"));
        assert_eq!(cfg.retransmit.dally, cfg.retransmit.timeout);
    }

    #[test]
    fn client_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.server, "127.0.0.1:1025".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.retransmit.timeout, Duration::from_millis(5000));
        assert_eq!(cfg.retransmit.dally, Duration::ZERO);
    }
}
