//! Inbound services: accepted sessions are decoded and delegated to a
//! [`Handler`]
//!
//! Socket management, routing and NAT lifetime stay outside: services consume
//! already-accepted streams and datagram buffers, and hand decrypted sessions
//! to the handler together with their metadata.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{config::ServerUser, relay::socks5::Address, relay::udprelay::UdpSocketControlData};

pub use self::{relay::Relay, tcp::TcpService, udp::UdpService};

pub mod relay;
pub mod tcp;
pub mod udp;

/// Protocol tag of terminated shadowsocks sessions
pub const PROTOCOL_SHADOWSOCKS: &str = "shadowsocks";
/// Protocol tag of relayed shadowsocks sessions
pub const PROTOCOL_SHADOWSOCKS_RELAY: &str = "shadowsocks-relay";

/// Object-safe bound for connections handed to the handler
pub trait StreamConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamConnection for T {}

/// A boxed duplex connection
pub type BoxStreamConnection = Box<dyn StreamConnection>;

/// What a service knows about an accepted session
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// `"shadowsocks"` or `"shadowsocks-relay"`
    pub protocol: &'static str,
    /// Peer address the session came from
    pub source: SocketAddr,
    /// Destination parsed from the request, or configured for the user
    pub destination: Address,
    /// User matched by the identity header, if any
    pub user: Option<Arc<ServerUser>>,
}

/// Key under which the handler should track a UDP association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatKey {
    /// Legacy methods: the datagram's source address
    SourceAddr(SocketAddr),
    /// AEAD 2022: the session id from the packet header
    SessionId(u64),
}

/// One decrypted (or relay-rewritten) datagram
#[derive(Debug)]
pub struct UdpPacket {
    /// Packet payload; for terminated sessions the decrypted payload, for
    /// relayed sessions the rewritten wire datagram
    pub payload: BytesMut,
    /// Association key for the NAT kept by the handler
    pub nat_key: NatKey,
    /// Session control data (AEAD 2022)
    pub control: Option<UdpSocketControlData>,
}

/// TCP session error reported through [`Handler::new_error`]
#[derive(Debug, Error)]
#[error("shadowsocks connection from {source}: {cause}")]
pub struct ServerConnError {
    /// Peer the session came from
    pub source: SocketAddr,
    /// Underlying failure
    #[source]
    pub cause: io::Error,
}

/// UDP packet error reported through [`Handler::new_error`]
#[derive(Debug, Error)]
#[error("shadowsocks packet from {source}: {cause}")]
pub struct ServerPacketError {
    /// Peer the datagram came from
    pub source: SocketAddr,
    /// Underlying failure
    #[source]
    pub cause: io::Error,
}

/// Errors surfaced to the handler
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Connection(#[from] ServerConnError),
    #[error(transparent)]
    Packet(#[from] ServerPacketError),
}

/// The delegate receiving accepted sessions
///
/// Implementations route the session onwards (dial the destination, splice
/// the two streams, keep the UDP NAT). Nothing is retried by the services;
/// every per-session failure arrives exactly once at [`Handler::new_error`].
#[async_trait]
pub trait Handler: Send + Sync {
    /// An inbound TCP session was authenticated and decoded
    async fn new_connection(&self, conn: BoxStreamConnection, metadata: ConnectionMetadata) -> io::Result<()>;

    /// An inbound datagram was authenticated and decoded
    async fn new_packet(&self, packet: UdpPacket, metadata: ConnectionMetadata) -> io::Result<()>;

    /// A session or datagram failed
    fn new_error(&self, error: ServiceError);
}
