//! Inbound UDP service

use std::{io, net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use log::trace;

use crate::{
    config::ServerConfig,
    context::SharedContext,
    relay::udprelay::crypto_io::decrypt_client_payload,
};

use super::{ConnectionMetadata, Handler, NatKey, ServerPacketError, UdpPacket, PROTOCOL_SHADOWSOCKS};

/// Terminating UDP service for all cipher families
///
/// Each datagram is decrypted independently; the handler keeps the NAT,
/// keyed by source address (legacy) or by the 64-bit session id (2022).
pub struct UdpService {
    context: SharedContext,
    svr_cfg: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
}

impl UdpService {
    /// Create a service for `svr_cfg`
    pub fn new(context: SharedContext, svr_cfg: Arc<ServerConfig>, handler: Arc<dyn Handler>) -> Self {
        Self {
            context,
            svr_cfg,
            handler,
        }
    }

    /// Server configuration
    pub fn server_config(&self) -> &Arc<ServerConfig> {
        &self.svr_cfg
    }

    /// Serve one received datagram
    ///
    /// All failures are reported to the handler's error sink.
    pub async fn handle_packet(&self, data: BytesMut, source: SocketAddr) {
        if let Err(cause) = self.serve(data, source).await {
            self.handler.new_error(ServerPacketError { source, cause }.into());
        }
    }

    async fn serve(&self, mut data: BytesMut, source: SocketAddr) -> io::Result<()> {
        let method = self.svr_cfg.method();
        let user_manager = self.svr_cfg.user_manager().map(AsRef::as_ref);

        let (n, destination, control) =
            decrypt_client_payload(&self.context, method, self.svr_cfg.key(), user_manager, &mut data).await?;
        data.truncate(n);

        let user = match (user_manager, &control) {
            (Some(manager), Some(control)) => match control.user_hash {
                Some(ref hash) => manager.clone_user_by_hash(hash),
                None => None,
            },
            _ => None,
        };

        let nat_key = match control {
            Some(ref c) => NatKey::SessionId(c.client_session_id),
            None => NatKey::SourceAddr(source),
        };

        trace!("accepted udp packet from {source} to {destination}, {} bytes", data.len());

        let metadata = ConnectionMetadata {
            protocol: PROTOCOL_SHADOWSOCKS,
            source,
            destination,
            user,
        };

        let packet = UdpPacket {
            payload: data,
            nat_key,
            control,
        };

        self.handler.new_packet(packet, metadata).await
    }
}
