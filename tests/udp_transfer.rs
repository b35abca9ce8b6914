use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use tftp_transfer::protocol::MAX_PACKET_LEN;
use tftp_transfer::{
    BlockStore, ErrorCode, FsBlockStore, MemoryBlockStore, Packet, RetransmitConfig, ServerConfig,
    Shutdown, TransferError, UdpClient, UdpServer,
};

const WAIT: Duration = Duration::from_secs(3);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn client_retransmit() -> RetransmitConfig {
    RetransmitConfig {
        timeout: Duration::from_millis(200),
        max_retries: 3,
        dally: Duration::ZERO,
    }
}

type ServerTask = JoinHandle<tftp_transfer::Result<()>>;

async fn start_server(dir: &Path) -> (SocketAddr, Shutdown, ServerTask) {
    start_server_with(dir, Arc::new(FsBlockStore::new(dir))).await
}

async fn start_server_with(
    dir: &Path,
    store: Arc<dyn BlockStore>,
) -> (SocketAddr, Shutdown, ServerTask) {
    let config = ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        dir: dir.to_path_buf(),
        retransmit: RetransmitConfig {
            dally: Duration::from_millis(200),
            ..client_retransmit()
        },
        session_queue: 16,
    };
    let shutdown = Shutdown::new();
    let server = UdpServer::bind(config, store, shutdown.clone()).await.unwrap();
    let addr = server.local_addr();
    (addr, shutdown, tokio::spawn(server.run()))
}

fn client(server: SocketAddr, incoming: &Path, outgoing: &Path) -> UdpClient {
    UdpClient::new(
        server,
        Arc::new(FsBlockStore::new(incoming)),
        Arc::new(FsBlockStore::new(outgoing)),
        client_retransmit(),
    )
}

async fn recv_raw(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; MAX_PACKET_LEN];
    let (len, from) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("no datagram within the wait period")
        .unwrap();
    (buf[..len].to_vec(), from)
}

async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let (bytes, from) = recv_raw(socket).await;
    (Packet::decode(&bytes).unwrap(), from)
}

/// Memory store whose reads of one file stall like a cold disk.
struct SlowStore {
    inner: MemoryBlockStore,
    slow_name: &'static str,
    delay: Duration,
}

impl BlockStore for SlowStore {
    fn read_chunk(&self, name: &str, offset: u64, max_len: usize) -> tftp_transfer::Result<Vec<u8>> {
        if name == self.slow_name {
            std::thread::sleep(self.delay);
        }
        self.inner.read_chunk(name, offset, max_len)
    }

    fn append_chunk(&self, name: &str, offset: u64, data: &[u8]) -> tftp_transfer::Result<()> {
        self.inner.append_chunk(name, offset, data)
    }

    fn discard(&self, name: &str) -> tftp_transfer::Result<()> {
        self.inner.discard(name)
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.exists(name)
    }
}

#[tokio::test]
async fn upload_then_download_round_trip() {
    let served = tempfile::tempdir().unwrap();
    let incoming = tempfile::tempdir().unwrap();
    let outgoing = tempfile::tempdir().unwrap();
    let contents = pattern(1500);
    std::fs::write(outgoing.path().join("notes.txt"), &contents).unwrap();

    let (addr, _shutdown, _server) = start_server(served.path()).await;
    let client = client(addr, incoming.path(), outgoing.path());

    let report = client.upload("notes.txt").await.unwrap();
    assert_eq!(report.bytes, 1500);
    assert_eq!(report.blocks, 3);
    assert_eq!(std::fs::read(served.path().join("notes.txt")).unwrap(), contents);

    let report = client.download("notes.txt").await.unwrap();
    assert_eq!(report.bytes, 1500);
    assert_eq!(std::fs::read(incoming.path().join("notes.txt")).unwrap(), contents);
}

#[tokio::test]
async fn exact_multiple_upload_ends_with_empty_block() {
    let served = tempfile::tempdir().unwrap();
    let outgoing = tempfile::tempdir().unwrap();
    std::fs::write(outgoing.path().join("even.bin"), pattern(1024)).unwrap();

    let (addr, _shutdown, _server) = start_server(served.path()).await;
    let client = client(addr, outgoing.path(), outgoing.path());

    let report = client.upload("even.bin").await.unwrap();
    assert_eq!(report.blocks, 3);
    assert_eq!(report.bytes, 1024);
    assert_eq!(std::fs::read(served.path().join("even.bin")).unwrap(), pattern(1024));
}

#[tokio::test]
async fn empty_file_download_is_one_empty_block() {
    let served = tempfile::tempdir().unwrap();
    let incoming = tempfile::tempdir().unwrap();
    std::fs::write(served.path().join("empty"), b"").unwrap();

    let (addr, _shutdown, _server) = start_server(served.path()).await;
    let report = client(addr, incoming.path(), incoming.path())
        .download("empty")
        .await
        .unwrap();
    assert_eq!(report.blocks, 1);
    assert_eq!(report.bytes, 0);
    assert!(incoming.path().join("empty").is_file());
}

#[tokio::test]
async fn missing_remote_file_leaves_nothing_behind() {
    let served = tempfile::tempdir().unwrap();
    let incoming = tempfile::tempdir().unwrap();

    let (addr, _shutdown, _server) = start_server(served.path()).await;
    let err = client(addr, incoming.path(), incoming.path())
        .download("ghost.txt")
        .await
        .unwrap_err();

    match err {
        TransferError::RemoteError { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!incoming.path().join("ghost.txt").exists());
}

#[tokio::test]
async fn missing_local_file_fails_before_contacting_server() {
    let dir = tempfile::tempdir().unwrap();
    // Nothing listens here; the error must come from the local check.
    let client = client("127.0.0.1:9".parse().unwrap(), dir.path(), dir.path());
    let err = client.upload("absent.bin").await.unwrap_err();
    assert!(matches!(err, TransferError::NotFound(name) if name == "absent.bin"));
}

#[tokio::test]
async fn concurrent_sessions_do_not_interfere() {
    let served = tempfile::tempdir().unwrap();
    let incoming = tempfile::tempdir().unwrap();
    for i in 0..4 {
        std::fs::write(served.path().join(format!("f{i}")), pattern(700 + i * 300)).unwrap();
    }

    let (addr, _shutdown, _server) = start_server(served.path()).await;
    let mut tasks = Vec::new();
    for i in 0..4 {
        let client = client(addr, incoming.path(), incoming.path());
        tasks.push(tokio::spawn(async move { client.download(&format!("f{i}")).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    for i in 0..4 {
        assert_eq!(
            std::fs::read(incoming.path().join(format!("f{i}"))).unwrap(),
            pattern(700 + i * 300)
        );
    }
}

#[tokio::test]
async fn duplicate_data_is_ignored_and_final_ack_repeated() {
    let served = tempfile::tempdir().unwrap();
    let (addr, _shutdown, _server) = start_server(served.path()).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let wrq = Packet::Wrq { filename: "dup.bin".into() };
    peer.send_to(&wrq.encode(), addr).await.unwrap();
    assert_eq!(recv_packet(&peer).await.0, Packet::Ack { block: 0 });

    let first = Packet::data(1, pattern(512)).encode();
    peer.send_to(&first, addr).await.unwrap();
    assert_eq!(recv_packet(&peer).await.0, Packet::Ack { block: 1 });

    // The duplicate gets no ACK, so the next reply is for block 2.
    peer.send_to(&first, addr).await.unwrap();
    let last = Packet::data(2, vec![9; 10]).encode();
    peer.send_to(&last, addr).await.unwrap();
    assert_eq!(recv_packet(&peer).await.0, Packet::Ack { block: 2 });

    // Pretend ACK 2 was lost: the dallying server answers again.
    peer.send_to(&last, addr).await.unwrap();
    assert_eq!(recv_packet(&peer).await.0, Packet::Ack { block: 2 });

    let stored = std::fs::read(served.path().join("dup.bin")).unwrap();
    assert_eq!(stored.len(), 522);
    assert_eq!(&stored[..512], &pattern(512)[..]);
}

#[tokio::test]
async fn unanswered_data_is_retransmitted_verbatim() {
    let served = tempfile::tempdir().unwrap();
    std::fs::write(served.path().join("r.bin"), pattern(600)).unwrap();
    let (addr, _shutdown, _server) = start_server(served.path()).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let rrq = Packet::Rrq { filename: "r.bin".into() };
    peer.send_to(&rrq.encode(), addr).await.unwrap();
    let (first, from) = recv_packet(&peer).await;
    assert_eq!(from, addr);
    assert_eq!(first, Packet::data(1, pattern(512)));

    // No ACK: the same block comes back after the timeout.
    let (again, _) = recv_packet(&peer).await;
    assert_eq!(again, first);

    peer.send_to(&Packet::Ack { block: 1 }.encode(), addr).await.unwrap();
    let (second, _) = recv_packet(&peer).await;
    assert_eq!(second, Packet::data(2, pattern(600)[512..].to_vec()));
}

#[tokio::test]
async fn silent_server_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = UdpClient::new(
        silent.local_addr().unwrap(),
        Arc::new(FsBlockStore::new(dir.path())),
        Arc::new(FsBlockStore::new(dir.path())),
        RetransmitConfig {
            timeout: Duration::from_millis(100),
            max_retries: 2,
            dally: Duration::ZERO,
        },
    );

    let err = client.download("anything").await.unwrap_err();
    assert!(matches!(err, TransferError::PeerUnreachable { attempts: 3 }));
    assert!(!dir.path().join("anything").exists());
}

#[tokio::test]
async fn malformed_datagrams_do_not_disturb_the_server() {
    let served = tempfile::tempdir().unwrap();
    let incoming = tempfile::tempdir().unwrap();
    std::fs::write(served.path().join("ok.txt"), b"still here").unwrap();

    let (addr, _shutdown, _server) = start_server(served.path()).await;
    let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    noise.send_to(&[9, 9, 9], addr).await.unwrap();
    noise.send_to(&[0], addr).await.unwrap();
    noise.send_to(&Packet::Ack { block: 4 }.encode(), addr).await.unwrap();

    let report = client(addr, incoming.path(), incoming.path())
        .download("ok.txt")
        .await
        .unwrap();
    assert_eq!(report.bytes, 10);
}

#[tokio::test]
async fn shutdown_stops_the_server() {
    let served = tempfile::tempdir().unwrap();
    let (_addr, mut shutdown, server) = start_server(served.path()).await;

    shutdown.trigger();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn slow_disk_read_does_not_hold_up_other_peers() {
    let served = tempfile::tempdir().unwrap();
    let inner = MemoryBlockStore::new();
    inner.insert("slow", pattern(100));
    inner.insert("fast", pattern(100));
    let store = Arc::new(SlowStore {
        inner,
        slow_name: "slow",
        delay: Duration::from_millis(800),
    });
    let (addr, _shutdown, _server) = start_server_with(served.path(), store).await;

    let stalled = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let quick = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stalled
        .send_to(&Packet::Rrq { filename: "slow".into() }.encode(), addr)
        .await
        .unwrap();
    let started = Instant::now();
    quick
        .send_to(&Packet::Rrq { filename: "fast".into() }.encode(), addr)
        .await
        .unwrap();

    let (first, _) = recv_packet(&quick).await;
    assert_eq!(first, Packet::data(1, pattern(100)));
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "fast peer waited {:?}",
        started.elapsed()
    );

    // The stalled peer is still served once its read completes.
    let (late, _) = recv_packet(&stalled).await;
    assert_eq!(late, Packet::data(1, pattern(100)));
}

#[tokio::test]
async fn client_resends_identical_data_when_its_ack_is_lost() {
    let outgoing = tempfile::tempdir().unwrap();
    std::fs::write(outgoing.path().join("up.bin"), pattern(300)).unwrap();
    let fake_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = client(fake_server.local_addr().unwrap(), outgoing.path(), outgoing.path());
    let upload = tokio::spawn(async move { client.upload("up.bin").await });

    let (request, from) = recv_packet(&fake_server).await;
    assert_eq!(request, Packet::Wrq { filename: "up.bin".into() });
    fake_server
        .send_to(&Packet::Ack { block: 0 }.encode(), from)
        .await
        .unwrap();

    let (first, _) = recv_raw(&fake_server).await;
    assert_eq!(Packet::decode(&first).unwrap(), Packet::data(1, pattern(300)));

    // ACK 1 never arrives; the client times out and repeats itself exactly.
    let (again, _) = recv_raw(&fake_server).await;
    assert_eq!(again, first);

    fake_server
        .send_to(&Packet::Ack { block: 1 }.encode(), from)
        .await
        .unwrap();
    let report = timeout(WAIT, upload).await.unwrap().unwrap().unwrap();
    assert_eq!(report.bytes, 300);
    assert_eq!(report.blocks, 1);
}

#[tokio::test]
async fn server_repeats_its_last_ack_when_data_stops() {
    let served = tempfile::tempdir().unwrap();
    let (addr, _shutdown, _server) = start_server(served.path()).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    peer.send_to(&Packet::Wrq { filename: "w.bin".into() }.encode(), addr)
        .await
        .unwrap();
    assert_eq!(recv_packet(&peer).await.0, Packet::Ack { block: 0 });
    peer.send_to(&Packet::data(1, pattern(512)).encode(), addr)
        .await
        .unwrap();
    let (ack, _) = recv_raw(&peer).await;
    assert_eq!(Packet::decode(&ack).unwrap(), Packet::Ack { block: 1 });

    // Withhold DATA 2: after its timeout the server sends ACK 1 again.
    let (again, _) = recv_raw(&peer).await;
    assert_eq!(again, ack);

    peer.send_to(&Packet::data(2, vec![3; 20]).encode(), addr)
        .await
        .unwrap();
    assert_eq!(recv_packet(&peer).await.0, Packet::Ack { block: 2 });
    assert_eq!(std::fs::read(served.path().join("w.bin")).unwrap().len(), 532);
}

#[tokio::test]
async fn shutdown_discards_partial_uploads_before_returning() {
    let served = tempfile::tempdir().unwrap();
    let (addr, mut shutdown, server) = start_server(served.path()).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    peer.send_to(&Packet::Wrq { filename: "half.bin".into() }.encode(), addr)
        .await
        .unwrap();
    assert_eq!(recv_packet(&peer).await.0, Packet::Ack { block: 0 });
    peer.send_to(&Packet::data(1, pattern(512)).encode(), addr)
        .await
        .unwrap();
    assert_eq!(recv_packet(&peer).await.0, Packet::Ack { block: 1 });
    assert!(served.path().join("half.bin").exists());

    shutdown.trigger();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
    assert!(!served.path().join("half.bin").exists());

    // The uploader hears why, possibly after a late retransmitted ACK.
    loop {
        match recv_packet(&peer).await.0 {
            Packet::Ack { block: 1 } => continue,
            Packet::Error { code, .. } => {
                assert_eq!(code, ErrorCode::NotDefined);
                break;
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
