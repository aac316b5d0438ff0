//! UDP socket control data

use bytes::Bytes;

/// Session/packet identifiers carried by AEAD 2022 datagrams
#[derive(Debug, Clone, Eq, PartialEq, Default)]
#[non_exhaustive]
pub struct UdpSocketControlData {
    /// Session ID in the client, identifying one association
    pub client_session_id: u64,
    /// Session ID in the server, identifying one association
    pub server_session_id: u64,
    /// Packet counter within the session
    pub packet_id: u64,
    /// Identity hash of the user matched by the EIH
    pub user_hash: Option<Bytes>,
}
