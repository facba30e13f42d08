use std::fs;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use tftpx::error::ClientError;
use tftpx::options::{OptionSet, TimeoutValue};
use tftpx::packet::{encode_request, ErrorCode, Mode, Packet, RequestKind};
use tftpx::server::SessionStats;
use tftpx::{Client, ClientConfig, Server, ServerConfig};

struct TestServer {
    addr: SocketAddr,
    root: TempDir,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
    sessions: Arc<Mutex<Vec<SessionStats>>>,
}

async fn start_server(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    let config = ServerConfig::new("127.0.0.1".parse().unwrap(), 0, root.path().to_path_buf())
        .with_workers(2)
        .with_retries(3)
        .with_timeout(Duration::from_millis(300));
    let sessions = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&sessions);
    let server = Server::bind(configure(config))
        .await
        .unwrap()
        .with_session_callback(move |stats| recorded.lock().unwrap().push(stats.clone()));
    let addr = server.local_addr().unwrap();
    let (shutdown, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async move {
        let _ = rx.await;
    }));
    TestServer {
        addr,
        root,
        shutdown,
        handle,
        sessions,
    }
}

impl TestServer {
    fn client(&self) -> ClientConfig {
        ClientConfig::new(self.addr).with_timeout(Duration::from_millis(500))
    }

    fn write(&self, name: &str, contents: &[u8]) {
        fs::write(self.root.path().join(name), contents).unwrap();
    }

    /// Waits for `n` sessions to report their stats.
    async fn sessions(&self, n: usize) -> Vec<SessionStats> {
        for _ in 0..200 {
            {
                let sessions = self.sessions.lock().unwrap();
                if sessions.len() >= n {
                    return sessions.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{n} sessions did not close in time");
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        timeout(Duration::from_secs(5), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = vec![0u8; 70000];
    let (n, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    (Packet::deserialize(&buf[..n]).unwrap(), from)
}

async fn loopback_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

#[tokio::test]
async fn get_empty_file() {
    let server = start_server(|c| c).await;
    server.write("empty", b"");

    let mut out: Vec<u8> = Vec::new();
    let stats = Client::new(server.client()).get_to("empty", &mut out).await.unwrap();
    assert!(out.is_empty());
    assert_eq!(stats.bytes, 0);
    assert_eq!(stats.packets_received, 1);

    let sessions = server.sessions(1).await;
    assert!(sessions[0].succeeded());
    assert_eq!(sessions[0].packets_sent, 1);
    server.stop().await;
}

#[tokio::test]
async fn windowed_get_needs_one_round_trip() {
    let server = start_server(|c| c).await;
    let contents = pattern(2048);
    server.write("four.bin", &contents);

    let mut out: Vec<u8> = Vec::new();
    let stats = Client::new(server.client().with_window_size(4))
        .get_to("four.bin", &mut out)
        .await
        .unwrap();
    assert_eq!(out, contents);
    assert_eq!(stats.window_size, 4);
    // OACK, then blocks 1..=4 and the empty final block
    assert_eq!(stats.packets_received, 6);
    // RRQ, ACK 0, ACK 4, ACK 5
    assert_eq!(stats.packets_sent, 4);

    let sessions = server.sessions(1).await;
    assert_eq!(sessions[0].retransmits, 0);
    assert_eq!(sessions[0].bytes_sent, 2048);
    server.stop().await;
}

#[tokio::test]
async fn large_transfer_wraps_block_numbers() {
    let server = start_server(|c| c).await;
    // 65540 blocks of 8 bytes plus an empty final block
    let contents = pattern(8 * 65540);
    server.write("big.bin", &contents);

    let mut out: Vec<u8> = Vec::new();
    let stats = Client::new(server.client().with_block_size(8).with_window_size(64).with_tsize(true))
        .get_to("big.bin", &mut out)
        .await
        .unwrap();
    assert_eq!(out.len(), contents.len());
    assert_eq!(out, contents);
    assert_eq!(stats.options.transfer_size, Some(contents.len() as u64));
    server.stop().await;
}

#[tokio::test]
async fn client_reacks_after_out_of_order_block() {
    let listener = loopback_socket().await;
    let config = ClientConfig::new(listener.local_addr().unwrap()).with_timeout(Duration::from_secs(2));
    let full = pattern(512);

    let fake_server = async {
        let (request, client) = recv_packet(&listener).await;
        assert!(matches!(request, Packet::Rrq { ref filename, .. } if filename == "lossy"));
        let transfer = loopback_socket().await;
        let frame = |block: u16, payload: &[u8]| {
            Packet::Data {
                block,
                data: payload.to_vec(),
            }
            .serialize()
        };

        transfer.send_to(&frame(1, &full), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(1));
        // block 2 is lost
        transfer.send_to(&frame(3, b"tail"), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(1));
        transfer.send_to(&frame(2, &full), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(2));
        transfer.send_to(&frame(3, b"tail"), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(3));
    };

    let mut out: Vec<u8> = Vec::new();
    let client = Client::new(config);
    let (result, ()) = tokio::join!(client.get_to("lossy", &mut out), fake_server);
    result.unwrap();
    assert_eq!(out.len(), 512 * 2 + 4);
    assert_eq!(&out[1024..], b"tail");
}

#[tokio::test]
async fn client_answers_foreign_sender_and_keeps_peer() {
    let listener = loopback_socket().await;
    let config = ClientConfig::new(listener.local_addr().unwrap()).with_timeout(Duration::from_secs(2));
    let full = pattern(512);

    let fake_server = async {
        let (_, client) = recv_packet(&listener).await;
        let transfer = loopback_socket().await;
        let first = Packet::Data {
            block: 1,
            data: full.clone(),
        };
        transfer.send_to(&first.serialize(), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(1));

        let stranger = loopback_socket().await;
        let bogus = Packet::Data {
            block: 2,
            data: b"bogus".to_vec(),
        };
        stranger.send_to(&bogus.serialize(), client).await.unwrap();
        let (reply, from) = recv_packet(&stranger).await;
        assert_eq!(from, client);
        assert_eq!(reply, Packet::error(ErrorCode::UnknownTransferId, "Unknown transfer ID."));

        let second = Packet::Data {
            block: 2,
            data: b"tail".to_vec(),
        };
        transfer.send_to(&second.serialize(), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(2));
    };

    let mut out: Vec<u8> = Vec::new();
    let client = Client::new(config);
    let (result, ()) = tokio::join!(client.get_to("tid", &mut out), fake_server);
    let stats = result.unwrap();
    assert_eq!(stats.packets_received, 2);
    assert_eq!(out.len(), 512 + 4);
    assert_eq!(&out[..512], &full[..]);
    assert_eq!(&out[512..], b"tail");
}

#[tokio::test]
async fn client_adopts_acknowledged_subset() {
    let listener = loopback_socket().await;
    let config = ClientConfig::new(listener.local_addr().unwrap())
        .with_block_size(1024)
        .with_timeout_option(TimeoutValue::Seconds(5));

    let fake_server = async {
        let (request, client) = recv_packet(&listener).await;
        let Packet::Rrq { options, .. } = request else {
            panic!("expected RRQ");
        };
        assert_eq!(options.timeout, Some(TimeoutValue::Seconds(5)));

        let transfer = loopback_socket().await;
        let acked = OptionSet {
            block_size: Some(1024),
            ..Default::default()
        };
        transfer.send_to(&Packet::Oack(acked).serialize(), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(0));
        let block = Packet::Data {
            block: 1,
            data: pattern(1000),
        };
        transfer.send_to(&block.serialize(), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(1));
    };

    let mut out: Vec<u8> = Vec::new();
    let client = Client::new(config);
    let (result, ()) = tokio::join!(client.get_to("subset", &mut out), fake_server);
    let stats = result.unwrap();
    assert_eq!(stats.block_size, 1024);
    assert_eq!(stats.options.timeout, None);
    assert_eq!(out, pattern(1000));
}

#[tokio::test]
async fn client_rejects_unrequested_option() {
    let listener = loopback_socket().await;
    let config = ClientConfig::new(listener.local_addr().unwrap()).with_block_size(1024);

    let fake_server = async {
        let (_, client) = recv_packet(&listener).await;
        let transfer = loopback_socket().await;
        let acked = OptionSet {
            block_size: Some(1024),
            transfer_size: Some(10),
            ..Default::default()
        };
        transfer.send_to(&Packet::Oack(acked).serialize(), client).await.unwrap();
        recv_packet(&transfer).await.0
    };

    let mut out: Vec<u8> = Vec::new();
    let client = Client::new(config);
    let (result, reply) = tokio::join!(client.get_to("f", &mut out), fake_server);
    let failure = result.unwrap_err();
    assert!(matches!(failure.error, ClientError::InvalidOptions));
    assert!(!failure.server_may_not_support_options);
    assert!(matches!(reply, Packet::Error { code: 8, .. }));
}

#[tokio::test]
async fn client_detects_size_mismatch() {
    let listener = loopback_socket().await;
    let config = ClientConfig::new(listener.local_addr().unwrap()).with_tsize(true);

    let fake_server = async {
        let (_, client) = recv_packet(&listener).await;
        let transfer = loopback_socket().await;
        let acked = OptionSet {
            transfer_size: Some(100),
            ..Default::default()
        };
        transfer.send_to(&Packet::Oack(acked).serialize(), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(0));
        let block = Packet::Data {
            block: 1,
            data: vec![1; 10],
        };
        transfer.send_to(&block.serialize(), client).await.unwrap();
        recv_packet(&transfer).await.0
    };

    let mut out: Vec<u8> = Vec::new();
    let client = Client::new(config);
    let (result, last) = tokio::join!(client.get_to("f", &mut out), fake_server);
    assert_eq!(last, Packet::Ack(1));
    assert!(matches!(
        result.unwrap_err().error,
        ClientError::SizeMismatch {
            announced: 100,
            received: 10
        }
    ));
}

#[tokio::test]
async fn fallback_retries_without_options() {
    let listener = loopback_socket().await;
    let config = ClientConfig::new(listener.local_addr().unwrap()).with_window_size(8);
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("plain.txt");

    let fake_server = async {
        let (first, client) = recv_packet(&listener).await;
        let Packet::Rrq { options, .. } = first else {
            panic!("expected RRQ");
        };
        assert_eq!(options.window_size, Some(8));
        let refusal = Packet::error(ErrorCode::NotDefined, "options not supported");
        listener.send_to(&refusal.serialize(), client).await.unwrap();

        let (second, client) = recv_packet(&listener).await;
        let Packet::Rrq { options, .. } = second else {
            panic!("expected RRQ");
        };
        assert!(options.is_empty());
        let transfer = loopback_socket().await;
        let block = Packet::Data {
            block: 1,
            data: b"plain".to_vec(),
        };
        transfer.send_to(&block.serialize(), client).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(1));
    };

    let client = Client::new(config);
    let (result, ()) = tokio::join!(client.get_with_fallback("plain.txt", &local), fake_server);
    result.unwrap();
    assert_eq!(fs::read(&local).unwrap(), b"plain");
}

#[tokio::test]
async fn foreign_sender_does_not_disturb_transfer() {
    let server = start_server(|c| c).await;
    server.write("f.bin", &pattern(600));

    let client = loopback_socket().await;
    let request = encode_request(RequestKind::Read, "f.bin", Mode::Octet, &OptionSet::default()).unwrap();
    client.send_to(&request, server.addr).await.unwrap();
    let (first, session) = recv_packet(&client).await;
    assert!(matches!(first, Packet::Data { block: 1, ref data } if data.len() == 512));

    let stranger = loopback_socket().await;
    stranger.send_to(&Packet::Ack(1).serialize(), session).await.unwrap();
    let (reply, _) = recv_packet(&stranger).await;
    assert_eq!(reply, Packet::error(ErrorCode::UnknownTransferId, "Unknown transfer ID."));

    client.send_to(&Packet::Ack(1).serialize(), session).await.unwrap();
    let (second, from) = recv_packet(&client).await;
    assert_eq!(from, session);
    assert!(matches!(second, Packet::Data { block: 2, ref data } if data.len() == 88));
    client.send_to(&Packet::Ack(2).serialize(), session).await.unwrap();

    let sessions = server.sessions(1).await;
    assert!(sessions[0].succeeded());
    assert!(sessions[0].error.is_none());
    assert_eq!(sessions[0].bytes_sent, 600);
    // DATA 1 and DATA 2 only
    assert_eq!(sessions[0].packets_sent, 2);
    server.stop().await;
}

#[tokio::test]
async fn server_retransmits_then_gives_up() {
    let server = start_server(|c| c.with_retries(1).with_timeout(Duration::from_millis(100))).await;
    server.write("f", b"abc");

    let client = loopback_socket().await;
    let request = encode_request(RequestKind::Read, "f", Mode::Octet, &OptionSet::default()).unwrap();
    client.send_to(&request, server.addr).await.unwrap();
    let block = Packet::Data {
        block: 1,
        data: b"abc".to_vec(),
    };
    assert_eq!(recv_packet(&client).await.0, block);
    assert_eq!(recv_packet(&client).await.0, block);
    assert_eq!(
        recv_packet(&client).await.0,
        Packet::error(ErrorCode::NotDefined, "timeout after 1 retransmits. Missed last ack.")
    );

    let sessions = server.sessions(1).await;
    assert!(!sessions[0].succeeded());
    assert_eq!(sessions[0].retransmits, 1);
    server.stop().await;
}

#[tokio::test]
async fn missing_file_and_escape_are_refused() {
    let server = start_server(|c| c).await;
    let client = Client::new(server.client());

    let failure = client.get_to("nope", &mut Vec::<u8>::new()).await.unwrap_err();
    assert!(matches!(failure.error, ClientError::Remote { code: 1, .. }));
    assert!(!failure.server_may_not_support_options);

    let failure = client.get_to("../etc/passwd", &mut Vec::<u8>::new()).await.unwrap_err();
    assert!(matches!(failure.error, ClientError::Remote { code: 2, .. }));
    server.stop().await;
}

#[tokio::test]
async fn put_writes_file_when_enabled() {
    let server = start_server(|c| c.with_write_requests(true)).await;
    let contents = pattern(5000);

    let stats = Client::new(server.client().with_block_size(1024).with_window_size(4).with_tsize(true))
        .put_from("upload.bin", &mut contents.as_slice(), Some(5000))
        .await
        .unwrap();
    assert_eq!(stats.bytes, 5000);
    assert_eq!(stats.options.transfer_size, Some(5000));

    let sessions = server.sessions(1).await;
    assert!(sessions[0].succeeded());
    assert_eq!(sessions[0].bytes_received, 5000);
    assert_eq!(fs::read(server.root.path().join("upload.bin")).unwrap(), contents);
    server.stop().await;
}

#[tokio::test]
async fn adaptive_put_falls_back_to_fixed_timeout() {
    let server = start_server(|c| c.with_write_requests(true).with_adaptive_timeout(true)).await;
    let contents = pattern(3000);

    let stats = Client::new(
        server
            .client()
            .with_window_size(4)
            .with_timeout_option(TimeoutValue::Adaptive),
    )
    .put_from("adaptive.bin", &mut contents.as_slice(), Some(3000))
    .await
    .unwrap();
    // the server never acks adaptive on a WRQ
    assert_eq!(stats.options.timeout, None);
    assert_eq!(stats.options.window_size, Some(4));
    assert_eq!(stats.window_size, 4);
    assert_eq!(stats.bytes, 3000);

    let sessions = server.sessions(1).await;
    assert!(sessions[0].succeeded());
    assert_eq!(sessions[0].options_in.timeout, Some(TimeoutValue::Adaptive));
    assert_eq!(sessions[0].options_acked.timeout, None);
    assert_eq!(fs::read(server.root.path().join("adaptive.bin")).unwrap(), contents);
    server.stop().await;
}

#[tokio::test]
async fn put_is_refused_by_default() {
    let server = start_server(|c| c).await;
    let failure = Client::new(server.client())
        .put_from("upload.bin", &mut &b"data"[..], Some(4))
        .await
        .unwrap_err();
    match failure.error {
        ClientError::Remote { code, message } => {
            assert_eq!(code, 2);
            assert_eq!(message, "Write requests are disabled.");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!server.root.path().join("upload.bin").exists());
    server.stop().await;
}

#[tokio::test]
async fn lists_directory_when_enabled() {
    let server = start_server(|c| c.with_list_requests(true)).await;
    server.write("b.txt", b"");
    server.write("a.txt", b"");
    fs::create_dir(server.root.path().join("images")).unwrap();

    let (listing, _) = Client::new(server.client()).list(".").await.unwrap();
    assert_eq!(listing, b"a.txt\nb.txt\nimages\n");
    server.stop().await;
}

#[tokio::test]
async fn listing_is_a_file_read_when_disabled() {
    let server = start_server(|c| c).await;
    let failure = Client::new(server.client()).list(".").await.unwrap_err();
    assert!(matches!(failure.error, ClientError::Remote { code: 0, .. }));
    server.stop().await;
}

#[tokio::test]
async fn netascii_get_is_transcoded() {
    let server = start_server(|c| c).await;
    server.write("text.txt", b"one\ntwo\rthree");

    let mut out: Vec<u8> = Vec::new();
    let stats = Client::new(server.client().with_mode(Mode::Netascii).with_tsize(true))
        .get_to("text.txt", &mut out)
        .await
        .unwrap();
    assert_eq!(out, b"one\r\ntwo\r\0three");
    assert_eq!(stats.options.transfer_size, Some(15));
    server.stop().await;
}

#[tokio::test]
async fn adaptive_timeout_is_negotiated_when_enabled() {
    let server = start_server(|c| c.with_adaptive_timeout(true)).await;
    let contents = pattern(20_000);
    server.write("rtt.bin", &contents);

    let mut out: Vec<u8> = Vec::new();
    let stats = Client::new(server.client().with_window_size(4).with_timeout_option(TimeoutValue::Adaptive))
        .get_to("rtt.bin", &mut out)
        .await
        .unwrap();
    assert_eq!(out, contents);
    assert_eq!(stats.options.timeout, Some(TimeoutValue::Adaptive));
    server.stop().await;
}

#[tokio::test]
async fn adaptive_timeout_is_ignored_when_disabled() {
    let server = start_server(|c| c).await;
    server.write("f", b"x");

    let mut out: Vec<u8> = Vec::new();
    let stats = Client::new(server.client().with_timeout_option(TimeoutValue::Adaptive))
        .get_to("f", &mut out)
        .await
        .unwrap();
    assert_eq!(out, b"x");
    assert!(stats.options.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn concurrent_sessions_share_workers() {
    let server = start_server(|c| c.with_workers(2).with_sessions_per_worker(2)).await;
    let contents = pattern(40_000);
    server.write("shared.bin", &contents);

    let client = Client::new(server.client().with_window_size(8));
    let mut transfers = Vec::new();
    for _ in 0..6 {
        let client = client.clone();
        transfers.push(tokio::spawn(async move {
            let mut out: Vec<u8> = Vec::new();
            client.get_to("shared.bin", &mut out).await.map(|_| out)
        }));
    }
    for transfer in transfers {
        assert_eq!(transfer.await.unwrap().unwrap(), contents);
    }
    assert_eq!(server.sessions(6).await.len(), 6);
    server.stop().await;
}
