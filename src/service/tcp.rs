//! Inbound TCP service

use std::{net::SocketAddr, sync::Arc};

use log::trace;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    config::ServerConfig,
    context::SharedContext,
    relay::tcprelay::ProxyServerStream,
};

use super::{ConnectionMetadata, Handler, ServerConnError, PROTOCOL_SHADOWSOCKS};

/// Terminating TCP service for all cipher families
///
/// Per accepted stream: read the salt, derive the session key, decrypt the
/// destination header and hand the decrypted duplex connection to the
/// handler. With a user table on the config, AEAD 2022 sessions are
/// demultiplexed by their identity header first.
pub struct TcpService {
    context: SharedContext,
    svr_cfg: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
}

impl TcpService {
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

    /// Serve one accepted connection
    ///
    /// All failures are reported to the handler's error sink; the connection
    /// is closed by dropping it.
    pub async fn handle_connection<S>(&self, stream: S, source: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if let Err(cause) = self.serve(stream, source).await {
            self.handler.new_error(ServerConnError { source, cause }.into());
        }
    }

    async fn serve<S>(&self, stream: S, source: SocketAddr) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut stream = ProxyServerStream::from_stream_with_user_manager(
            self.context.clone(),
            stream,
            self.svr_cfg.method(),
            self.svr_cfg.key(),
            self.svr_cfg.user_manager().cloned(),
        );

        let destination = stream.handshake().await?;
        let user = stream.user().cloned();

        trace!(
            "accepted tcp session from {source} to {destination}{}",
            match user {
                Some(ref u) => format!(" (user {})", u.name()),
                None => String::new(),
            }
        );

        let metadata = ConnectionMetadata {
            protocol: PROTOCOL_SHADOWSOCKS,
            source,
            destination,
            user,
        };

        self.handler.new_connection(Box::new(stream), metadata).await
    }
}
