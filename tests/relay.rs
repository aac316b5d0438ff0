use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};

use shadowsocks_transport::{
    config::{ServerConfig, ServerType, ServerUserError},
    context::Context,
    crypto::CipherKind,
    relay::{
        socks5::Address,
        udprelay::crypto_io::{decrypt_client_payload, encrypt_client_payload},
        udprelay::UdpSocketControlData,
    },
    service::{BoxStreamConnection, ConnectionMetadata, Handler, NatKey, Relay, ServiceError, UdpPacket},
    ProxyClientStream, ProxyServerStream,
};

const METHOD: CipherKind = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;

fn peer_addr() -> SocketAddr {
    "127.0.0.1:50001".parse().unwrap()
}

fn relay_with_two_users(handler: Arc<dyn Handler>) -> (Relay, [u8; 16], [u8; 16], [u8; 16]) {
    let ipsk = [0x01u8; 16];
    let upsk1 = [0x02u8; 16];
    let upsk2 = [0x03u8; 16];

    let svr_cfg = ServerConfig::new(METHOD, STANDARD.encode(ipsk)).unwrap();
    let relay = Relay::new(Context::new_shared(ServerType::Server), &svr_cfg, handler).unwrap();
    relay
        .update_users([
            ("u1".to_owned(), Bytes::copy_from_slice(&upsk1), "downstream-1.example.com:8388".parse().unwrap()),
            ("u2".to_owned(), Bytes::copy_from_slice(&upsk2), "downstream-2.example.com:8388".parse().unwrap()),
        ])
        .unwrap();

    (relay, ipsk, upsk1, upsk2)
}

fn client_config(ipsk: &[u8], upsk: &[u8]) -> ServerConfig {
    ServerConfig::new(METHOD, format!("{}:{}", STANDARD.encode(ipsk), STANDARD.encode(upsk))).unwrap()
}

/// The downstream side of the relay: terminates the forwarded single-user
/// session and reports what it saw.
struct DownstreamHandler {
    upsk: Bytes,
    tx: mpsc::UnboundedSender<DownstreamEvent>,
}

enum DownstreamEvent {
    Conn {
        metadata: ConnectionMetadata,
        target: Address,
        payload: Vec<u8>,
    },
    Packet {
        metadata: ConnectionMetadata,
        packet: UdpPacket,
    },
    Error(String),
}

#[async_trait]
impl Handler for DownstreamHandler {
    async fn new_connection(&self, conn: BoxStreamConnection, metadata: ConnectionMetadata) -> std::io::Result<()> {
        // the forwarded bytes must be a valid single-user session under the
        // user's own PSK: salt || AEAD chunks, identity header removed
        let mut stream = ProxyServerStream::from_stream(
            Context::new_shared(ServerType::Server),
            conn,
            METHOD,
            &self.upsk,
        );

        let target = stream.handshake().await?;

        let mut payload = vec![0u8; 11];
        stream.read_exact(&mut payload).await?;

        self.tx
            .send(DownstreamEvent::Conn {
                metadata,
                target,
                payload,
            })
            .unwrap();
        Ok(())
    }

    async fn new_packet(&self, packet: UdpPacket, metadata: ConnectionMetadata) -> std::io::Result<()> {
        self.tx.send(DownstreamEvent::Packet { metadata, packet }).unwrap();
        Ok(())
    }

    fn new_error(&self, error: ServiceError) {
        self.tx.send(DownstreamEvent::Error(error.to_string())).unwrap();
    }
}

#[tokio::test]
async fn relay_tcp_dispatches_to_user_destination() {
    let _ = env_logger::try_init();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let upsk2 = [0x03u8; 16];
    let handler = Arc::new(DownstreamHandler {
        upsk: Bytes::copy_from_slice(&upsk2),
        tx,
    });
    let (relay, ipsk, _upsk1, upsk2) = relay_with_two_users(handler);

    // a session encoded with U2's PSK must land on U2's destination
    let client_cfg = client_config(&ipsk, &upsk2);
    let ctx_local = Context::new_shared(ServerType::Local);

    let (client_side, server_side) = tokio::io::duplex(65536);
    let target: Address = "target.example.com:443".parse().unwrap();
    let mut client = ProxyClientStream::from_stream(ctx_local, client_side, &client_cfg, target.clone());
    client.write_all(b"hello relay").await.unwrap();
    client.flush().await.unwrap();

    relay.handle_connection(server_side, peer_addr()).await;

    match rx.recv().await.unwrap() {
        DownstreamEvent::Conn {
            metadata,
            target: seen_target,
            payload,
        } => {
            assert_eq!(metadata.protocol, "shadowsocks-relay");
            assert_eq!(metadata.destination.to_string(), "downstream-2.example.com:8388");
            assert_eq!(metadata.user.expect("relay user").name(), "u2");
            assert_eq!(seen_target, target);
            assert_eq!(payload, b"hello relay");
        }
        DownstreamEvent::Error(message) => panic!("relay failed: {message}"),
        DownstreamEvent::Packet { .. } => panic!("unexpected packet"),
    }
}

#[tokio::test]
async fn relay_tcp_unknown_psk_rejected() {
    let _ = env_logger::try_init();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(DownstreamHandler {
        upsk: Bytes::from_static(&[0u8; 16]),
        tx,
    });
    let (relay, ipsk, _upsk1, _upsk2) = relay_with_two_users(handler);

    let unknown_psk = [0x7fu8; 16];
    let client_cfg = client_config(&ipsk, &unknown_psk);
    let ctx_local = Context::new_shared(ServerType::Local);

    let (client_side, server_side) = tokio::io::duplex(65536);
    let target: Address = "target.example.com:443".parse().unwrap();
    let mut client = ProxyClientStream::from_stream(ctx_local, client_side, &client_cfg, target);
    client.write_all(b"hello relay").await.unwrap();
    client.flush().await.unwrap();

    relay.handle_connection(server_side, peer_addr()).await;

    match rx.recv().await.unwrap() {
        DownstreamEvent::Error(message) => assert!(message.contains("invalid request"), "got: {message}"),
        _ => panic!("session must be rejected"),
    }
}

#[tokio::test]
async fn relay_tcp_short_header_rejected() {
    let _ = env_logger::try_init();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(DownstreamHandler {
        upsk: Bytes::from_static(&[0u8; 16]),
        tx,
    });
    let (relay, _ipsk, _upsk1, _upsk2) = relay_with_two_users(handler);

    let (mut client_side, server_side) = tokio::io::duplex(65536);
    client_side.write_all(b"too short").await.unwrap();
    drop(client_side);

    relay.handle_connection(server_side, peer_addr()).await;

    match rx.recv().await.unwrap() {
        DownstreamEvent::Error(message) => assert!(message.contains("bad header"), "got: {message}"),
        _ => panic!("session must be rejected"),
    }
}

#[tokio::test]
async fn relay_udp_rewrites_and_dispatches() {
    let _ = env_logger::try_init();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let upsk2 = [0x03u8; 16];
    let handler = Arc::new(DownstreamHandler {
        upsk: Bytes::copy_from_slice(&upsk2),
        tx,
    });
    let (relay, ipsk, _upsk1, upsk2) = relay_with_two_users(handler);

    let client_cfg = client_config(&ipsk, &upsk2);
    let ctx_local = Context::new_shared(ServerType::Local);

    let target: Address = "target.example.com:53".parse().unwrap();
    let mut control = UdpSocketControlData::default();
    control.client_session_id = 0x0102_0304_0506_0708;
    control.packet_id = 9;

    let mut packet = BytesMut::new();
    encrypt_client_payload(
        &ctx_local,
        METHOD,
        client_cfg.key(),
        &target,
        &control,
        client_cfg.identity_keys(),
        b"relayed datagram",
        &mut packet,
    );

    relay.handle_packet(packet, peer_addr()).await;

    match rx.recv().await.unwrap() {
        DownstreamEvent::Packet { metadata, packet } => {
            assert_eq!(metadata.protocol, "shadowsocks-relay");
            assert_eq!(metadata.destination.to_string(), "downstream-2.example.com:8388");
            assert_eq!(metadata.user.expect("relay user").name(), "u2");
            assert_eq!(packet.nat_key, NatKey::SessionId(0x0102_0304_0506_0708));

            // the rewritten datagram must decrypt as a plain single-user
            // packet under U2's PSK
            let mut forwarded = packet.payload;
            let ctx = Context::new_shared(ServerType::Server);
            let (n, addr, control) = decrypt_client_payload(&ctx, METHOD, &upsk2, None, &mut forwarded)
                .await
                .unwrap();
            assert_eq!(&forwarded[..n], b"relayed datagram");
            assert_eq!(addr, target);
            assert_eq!(control.expect("control").client_session_id, 0x0102_0304_0506_0708);
        }
        DownstreamEvent::Error(message) => panic!("relay failed: {message}"),
        DownstreamEvent::Conn { .. } => panic!("unexpected connection"),
    }
}

#[tokio::test]
async fn relay_udp_unknown_psk_rejected() {
    let _ = env_logger::try_init();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(DownstreamHandler {
        upsk: Bytes::from_static(&[0u8; 16]),
        tx,
    });
    let (relay, ipsk, _upsk1, _upsk2) = relay_with_two_users(handler);

    let client_cfg = client_config(&ipsk, &[0x6au8; 16]);
    let ctx_local = Context::new_shared(ServerType::Local);

    let target: Address = "target.example.com:53".parse().unwrap();
    let mut packet = BytesMut::new();
    encrypt_client_payload(
        &ctx_local,
        METHOD,
        client_cfg.key(),
        &target,
        &UdpSocketControlData::default(),
        client_cfg.identity_keys(),
        b"datagram",
        &mut packet,
    );

    relay.handle_packet(packet, peer_addr()).await;

    match rx.recv().await.unwrap() {
        DownstreamEvent::Error(message) => assert!(message.contains("invalid request"), "got: {message}"),
        _ => panic!("packet must be rejected"),
    }
}

#[tokio::test]
async fn relay_rejects_identity_hash_collision() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let handler = Arc::new(DownstreamHandler {
        upsk: Bytes::from_static(&[0u8; 16]),
        tx,
    });

    let svr_cfg = ServerConfig::new(METHOD, STANDARD.encode([0x01u8; 16])).unwrap();
    let relay = Relay::new(Context::new_shared(ServerType::Server), &svr_cfg, handler).unwrap();

    let psk = Bytes::copy_from_slice(&[0x09u8; 16]);
    let err = relay
        .update_users([
            ("first".to_owned(), psk.clone(), "d1.example.com:8388".parse().unwrap()),
            ("second".to_owned(), psk, "d2.example.com:8388".parse().unwrap()),
        ])
        .unwrap_err();

    assert!(matches!(err, ServerUserError::IdentityHashCollision(name) if name == "first"));
    // a failed update leaves the table untouched
    assert_eq!(relay.user_count(), 0);
}

#[tokio::test]
async fn relay_requires_eih_method() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let handler = Arc::new(DownstreamHandler {
        upsk: Bytes::from_static(&[0u8; 16]),
        tx,
    });

    let svr_cfg = ServerConfig::new(CipherKind::AES_256_GCM, "pw").unwrap();
    Relay::new(Context::new_shared(ServerType::Server), &svr_cfg, handler).unwrap_err();
}
