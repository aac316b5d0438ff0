use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};

use shadowsocks_transport::{
    config::{ServerConfig, ServerConfigError, ServerType, ServerUser, ServerUserManager},
    context::Context,
    crypto::CipherKind,
    relay::socks5::Address,
    service::{BoxStreamConnection, ConnectionMetadata, Handler, ServiceError, TcpService, UdpPacket},
    ProxyClientStream, ProxyServerStream,
};

fn peer_addr() -> SocketAddr {
    "127.0.0.1:54321".parse().unwrap()
}

async fn tcp_round_trip(method: CipherKind, password: &str, addr: Address, payload: &[u8]) {
    let _ = env_logger::try_init();

    let svr_cfg = Arc::new(ServerConfig::new(method, password).unwrap());
    let ctx_local = Context::new_shared(ServerType::Local);
    let ctx_server = Context::new_shared(ServerType::Server);

    let (client_side, server_side) = tokio::io::duplex(65536);

    let server_cfg = svr_cfg.clone();
    let expected_addr = addr.clone();
    let expected_payload = payload.to_vec();
    let server = tokio::spawn(async move {
        let mut stream =
            ProxyServerStream::from_stream(ctx_server, server_side, server_cfg.method(), server_cfg.key());

        let target = stream.handshake().await.unwrap();
        assert_eq!(target, expected_addr);

        let mut buf = vec![0u8; expected_payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected_payload);

        stream.write_all(b"pong").await.unwrap();
        stream.flush().await.unwrap();
    });

    let mut client = ProxyClientStream::from_stream(ctx_local, client_side, &svr_cfg, addr);
    client.write_all(payload).await.unwrap();
    client.flush().await.unwrap();

    let mut response = [0u8; 4];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"pong");

    server.await.unwrap();
}

#[tokio::test]
async fn tcp_tunnel_aead() {
    // method aes-128-gcm, password "test", destination example.com:443
    tcp_round_trip(
        CipherKind::AES_128_GCM,
        "test",
        "example.com:443".parse().unwrap(),
        b"hello",
    )
    .await;
}

#[tokio::test]
async fn tcp_tunnel_stream_ipv6_large() {
    // aes-256-ctr to [::1]:8080 with a 32 KiB payload
    tcp_round_trip(
        CipherKind::AES_256_CTR,
        "test-password",
        "[::1]:8080".parse().unwrap(),
        &vec![b'A'; 32768],
    )
    .await;
}

#[tokio::test]
async fn tcp_tunnel_all_methods() {
    for method in [
        CipherKind::AES_128_CTR,
        CipherKind::AES_192_CTR,
        CipherKind::AES_256_CTR,
        CipherKind::AES_128_CFB,
        CipherKind::AES_256_CFB,
        CipherKind::RC4_MD5,
        CipherKind::CHACHA20,
        CipherKind::XCHACHA20,
        CipherKind::AES_128_GCM,
        CipherKind::AES_256_GCM,
        CipherKind::CHACHA20_POLY1305,
        CipherKind::XCHACHA20_POLY1305,
    ] {
        tcp_round_trip(
            method,
            "p$p-round-trip",
            "www.example.org:80".parse().unwrap(),
            b"GET / HTTP/1.0\r\n\r\n",
        )
        .await;
    }
}

#[tokio::test]
async fn tcp_tunnel_none() {
    tcp_round_trip(CipherKind::NONE, "", "example.com:80".parse().unwrap(), b"plain").await;
}

#[tokio::test]
async fn tcp_tunnel_aead_2022() {
    let password = STANDARD.encode([0x99u8; 16]);
    tcp_round_trip(
        CipherKind::AEAD2022_BLAKE3_AES_128_GCM,
        &password,
        "example.com:443".parse().unwrap(),
        b"hello 2022",
    )
    .await;
}

#[tokio::test]
async fn tcp_tunnel_chunked_writes() {
    // A payload bigger than one AEAD chunk, written in uneven pieces
    let _ = env_logger::try_init();

    let method = CipherKind::AES_256_GCM;
    let svr_cfg = Arc::new(ServerConfig::new(method, "chunky").unwrap());
    let ctx_local = Context::new_shared(ServerType::Local);
    let ctx_server = Context::new_shared(ServerType::Server);

    let payload: Vec<u8> = (0..262144u32).map(|i| (i % 251) as u8).collect();

    let (client_side, server_side) = tokio::io::duplex(65536);

    let server_cfg = svr_cfg.clone();
    let expected = payload.clone();
    let server = tokio::spawn(async move {
        let mut stream =
            ProxyServerStream::from_stream(ctx_server, server_side, server_cfg.method(), server_cfg.key());
        let _ = stream.handshake().await.unwrap();

        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    });

    let addr: Address = "bulk.example.com:443".parse().unwrap();
    let mut client = ProxyClientStream::from_stream(ctx_local, client_side, &svr_cfg, addr);

    for chunk in payload.chunks(7777) {
        client.write_all(chunk).await.unwrap();
    }
    client.flush().await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn tcp_corrupted_ciphertext_fails_auth() {
    // chacha20-ietf-poly1305 with ciphertext byte 40 flipped: the server must
    // fail authentication without delivering any plaintext
    let _ = env_logger::try_init();

    let method = CipherKind::CHACHA20_POLY1305;
    let svr_cfg = ServerConfig::new(method, "test").unwrap();
    let ctx_local = Context::new_shared(ServerType::Local);

    let (client_side, mut wire) = tokio::io::duplex(65536);
    let addr: Address = "example.com:443".parse().unwrap();
    let mut client = ProxyClientStream::from_stream(ctx_local, client_side, &svr_cfg, addr);
    client.write_all(b"hello").await.unwrap();
    client.flush().await.unwrap();
    drop(client);

    let mut raw = Vec::new();
    wire.read_to_end(&mut raw).await.unwrap();
    assert!(raw.len() > 40);
    raw[40] ^= 0x01;

    let (mut inject, server_side) = tokio::io::duplex(65536);
    inject.write_all(&raw).await.unwrap();
    drop(inject);

    let ctx_server = Context::new_shared(ServerType::Server);
    let mut stream = ProxyServerStream::from_stream(ctx_server, server_side, method, svr_cfg.key());
    stream.handshake().await.unwrap_err();
}

#[tokio::test]
async fn tcp_unknown_method() {
    match ServerConfig::from_method_name("aes-128-xyz", "pw") {
        Err(ServerConfigError::UnsupportedMethod(name)) => assert_eq!(name, "aes-128-xyz"),
        other => panic!("unexpected {other:?}"),
    }
}

struct MetadataHandler {
    tx: mpsc::UnboundedSender<ConnectionMetadata>,
}

#[async_trait]
impl Handler for MetadataHandler {
    async fn new_connection(&self, _conn: BoxStreamConnection, metadata: ConnectionMetadata) -> std::io::Result<()> {
        self.tx.send(metadata).unwrap();
        Ok(())
    }

    async fn new_packet(&self, _packet: UdpPacket, _metadata: ConnectionMetadata) -> std::io::Result<()> {
        Ok(())
    }

    fn new_error(&self, error: ServiceError) {
        panic!("unexpected error: {error}");
    }
}

#[tokio::test]
async fn tcp_multi_user_service() {
    // 2022-blake3-aes-128-gcm, iPSK = 0x00..0x0f, user "my user" with
    // uPSK = 0x10..0x1f; the client opens the session with an empty payload
    let _ = env_logger::try_init();

    let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
    let ipsk: Vec<u8> = (0x00..0x10).collect();
    let upsk: Vec<u8> = (0x10..0x20).collect();

    let mut server_cfg = ServerConfig::new(method, STANDARD.encode(&ipsk)).unwrap();
    let mut manager = ServerUserManager::new();
    manager
        .add_user(ServerUser::with_psk("my user", upsk.clone().into(), method).unwrap())
        .unwrap();
    server_cfg.set_user_manager(Arc::new(manager));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let service = TcpService::new(
        Context::new_shared(ServerType::Server),
        Arc::new(server_cfg),
        Arc::new(MetadataHandler { tx }),
    );

    let client_cfg =
        ServerConfig::new(method, format!("{}:{}", STANDARD.encode(&ipsk), STANDARD.encode(&upsk))).unwrap();
    let ctx_local = Context::new_shared(ServerType::Local);

    let (client_side, server_side) = tokio::io::duplex(65536);
    let addr: Address = "test.com:443".parse().unwrap();
    let mut client = ProxyClientStream::from_stream(ctx_local, client_side, &client_cfg, addr.clone());

    // an empty first write still sends the whole request header
    let _ = client.write(b"").await.unwrap();
    client.flush().await.unwrap();

    service.handle_connection(server_side, peer_addr()).await;

    let metadata = rx.recv().await.unwrap();
    assert_eq!(metadata.protocol, "shadowsocks");
    assert_eq!(metadata.destination, addr);
    assert_eq!(metadata.user.expect("matched user").name(), "my user");
}

#[tokio::test]
async fn tcp_multi_user_unknown_psk_rejected() {
    let _ = env_logger::try_init();

    let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
    let ipsk = [0x42u8; 16];

    let mut server_cfg = ServerConfig::new(method, STANDARD.encode(ipsk)).unwrap();
    let mut manager = ServerUserManager::new();
    manager
        .add_user(ServerUser::with_psk("alice", vec![0xAAu8; 16].into(), method).unwrap())
        .unwrap();
    server_cfg.set_user_manager(Arc::new(manager));

    struct ErrorHandler {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Handler for ErrorHandler {
        async fn new_connection(&self, _conn: BoxStreamConnection, _metadata: ConnectionMetadata) -> std::io::Result<()> {
            panic!("connection must not be accepted");
        }

        async fn new_packet(&self, _packet: UdpPacket, _metadata: ConnectionMetadata) -> std::io::Result<()> {
            panic!("packet must not be accepted");
        }

        fn new_error(&self, error: ServiceError) {
            self.tx.send(error.to_string()).unwrap();
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let service = TcpService::new(
        Context::new_shared(ServerType::Server),
        Arc::new(server_cfg),
        Arc::new(ErrorHandler { tx }),
    );

    // client holds a PSK that is not in the table
    let client_cfg = ServerConfig::new(
        method,
        format!("{}:{}", STANDARD.encode(ipsk), STANDARD.encode([0xBBu8; 16])),
    )
    .unwrap();
    let ctx_local = Context::new_shared(ServerType::Local);

    let (client_side, server_side) = tokio::io::duplex(65536);
    let addr: Address = "test.com:443".parse().unwrap();
    let mut client = ProxyClientStream::from_stream(ctx_local, client_side, &client_cfg, addr);
    let _ = client.write(b"").await.unwrap();
    client.flush().await.unwrap();

    service.handle_connection(server_side, peer_addr()).await;

    let message = rx.recv().await.unwrap();
    assert!(message.contains("invalid request"), "got: {message}");
}
