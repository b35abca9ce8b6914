//! `tftp` binary: run a server, or an interactive client, over UDP or TCP.
//!
//! Logging goes through `tracing`; set `RUST_LOG` to change verbosity.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};

use tftp_transfer::prompt::Menu;
use tftp_transfer::protocol::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};
use tftp_transfer::{
    Client, ClientConfig, Direction, FsBlockStore, ServerConfig, Shutdown, TcpClient, TcpServer,
    UdpClient, UdpServer,
};

#[derive(Parser)]
#[command(author, version, about = "Small TFTP-style file transfer")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve files from a directory.
    Server {
        #[arg(long, value_enum, default_value_t = Transport::Udp)]
        transport: Transport,
        /// Local address to bind.
        #[arg(long, default_value = "0.0.0.0:1025")]
        bind: SocketAddr,
        /// Directory files are served from and stored to.
        #[arg(long, default_value = "files")]
        dir: PathBuf,
        #[command(flatten)]
        retransmit: RetransmitArgs,
    },
    /// Prompt for transfers against a server.
    Client {
        #[arg(long, value_enum, default_value_t = Transport::Udp)]
        transport: Transport,
        /// Server address (HOST:PORT).
        #[arg(long, default_value = "127.0.0.1:1025")]
        server: String,
        /// Where downloads are written.
        #[arg(long, default_value = "incoming")]
        incoming: PathBuf,
        /// Where uploads are read from.
        #[arg(long, default_value = "outgoing")]
        outgoing: PathBuf,
        #[command(flatten)]
        retransmit: RetransmitArgs,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Udp,
    Tcp,
}

#[derive(Args)]
struct RetransmitArgs {
    /// Retransmission timeout in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,
    /// Retransmissions before giving up on a silent peer.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.mode {
        Mode::Server {
            transport,
            bind,
            dir,
            retransmit,
        } => {
            let mut config = ServerConfig {
                bind,
                dir,
                ..ServerConfig::default()
            };
            config.retransmit.timeout = Duration::from_millis(retransmit.timeout_ms);
            config.retransmit.max_retries = retransmit.max_retries;
            config.retransmit.dally = config.retransmit.timeout;
            run_server(transport, config).await
        }
        Mode::Client {
            transport,
            server,
            incoming,
            outgoing,
            retransmit,
        } => {
            let server = tokio::net::lookup_host(&server)
                .await
                .with_context(|| format!("cannot resolve {server}"))?
                .next()
                .with_context(|| format!("no address for {server}"))?;
            let mut config = ClientConfig {
                server,
                incoming,
                outgoing,
                ..ClientConfig::default()
            };
            config.retransmit.timeout = Duration::from_millis(retransmit.timeout_ms);
            config.retransmit.max_retries = retransmit.max_retries;
            run_client(transport, &config).await
        }
    }
}

async fn run_server(transport: Transport, config: ServerConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.dir)
        .await
        .with_context(|| format!("cannot create {}", config.dir.display()))?;
    tracing::info!(dir = %config.dir.display(), "serving directory");

    let mut shutdown = Shutdown::new();
    let server_shutdown = shutdown.clone();
    let store = Arc::new(FsBlockStore::new(&config.dir));

    let server = match transport {
        Transport::Udp => {
            let server = UdpServer::bind(config, store, server_shutdown).await?;
            tokio::spawn(server.run())
        }
        Transport::Tcp => {
            let server = TcpServer::bind(config, store, server_shutdown).await?;
            tokio::spawn(server.run())
        }
    };

    tokio::signal::ctrl_c().await?;
    shutdown.trigger();
    server.await??;
    Ok(())
}

async fn run_client(transport: Transport, config: &ClientConfig) -> anyhow::Result<()> {
    let client = match transport {
        Transport::Udp => Client::Udp(UdpClient::from_config(config)),
        Transport::Tcp => Client::Tcp(TcpClient::from_config(config)),
    };

    let stdin = io::stdin();
    let mut menu = Menu::new(stdin.lock(), io::stdout());

    let mut active = true;
    while active {
        if let Some(request) = menu.next_request()? {
            let outcome = client.transfer(request.direction, &request.filename).await;
            let line = match (outcome, request.direction) {
                (Ok(report), Direction::Write) => {
                    format!("File upload completed! ({} bytes)", report.bytes)
                }
                (Ok(report), Direction::Read) => {
                    format!("File download completed! ({} bytes)", report.bytes)
                }
                (Err(e), _) => format!("Error: {e}"),
            };
            menu.say(&line)?;
        }
        active = menu.confirm_continue()?;
    }
    Ok(())
}
