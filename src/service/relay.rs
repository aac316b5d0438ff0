//! AEAD 2022 multi-user relay
//!
//! Authenticates each inbound session against a user table by decrypting the
//! encrypted identity header, then forwards the session to that user's
//! configured destination without terminating the AEAD layer. The forwarded
//! bytes are a plain single-user session: the identity field is cut out and
//! the remainder is spliced back in front of the raw connection.

use std::{
    collections::HashMap,
    fmt,
    io::{self, ErrorKind},
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
};

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use log::trace;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::{
    config::{ServerConfig, ServerConfigError, ServerUser, ServerUserError},
    context::SharedContext,
    crypto::{
        v2::{identity_subkey_cipher, IdentityCipher, IDENTITY_HEADER_LENGTH},
        CipherKind,
    },
    relay::socks5::Address,
    relay::udprelay::UdpSocketControlData,
};

use super::{
    ConnectionMetadata, Handler, NatKey, ServerConnError, ServerPacketError, UdpPacket, PROTOCOL_SHADOWSOCKS_RELAY,
};

/// A relay user: PSK, identity and downstream destination
pub struct RelayUser {
    user: Arc<ServerUser>,
    destination: Address,
    block_cipher: IdentityCipher,
}

impl RelayUser {
    /// The user's identity
    pub fn user(&self) -> &Arc<ServerUser> {
        &self.user
    }

    /// Downstream destination of the user
    pub fn destination(&self) -> &Address {
        &self.destination
    }
}

/// Multi-user relay dispatching sessions to per-user destinations
pub struct Relay {
    context: SharedContext,
    method: CipherKind,
    ipsk: Bytes,
    udp_block_cipher: IdentityCipher,
    // hash -> user, user -> destination and user -> cipher are folded into
    // one table so an update replaces all three in a single substitution
    users: ArcSwap<HashMap<Bytes, Arc<RelayUser>>>,
    handler: Arc<dyn Handler>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay").field("method", &self.method).finish_non_exhaustive()
    }
}

impl Relay {
    /// Create a relay from `svr_cfg`
    ///
    /// Only the identity-header capable AEAD 2022 methods can be relayed.
    pub fn new(
        context: SharedContext,
        svr_cfg: &ServerConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, ServerConfigError> {
        let method = svr_cfg.method();
        if !method.support_eih() {
            return Err(ServerConfigError::UnsupportedMethod(method.to_string()));
        }

        let ipsk = Bytes::copy_from_slice(svr_cfg.key());

        Ok(Self {
            context,
            method,
            udp_block_cipher: IdentityCipher::new(&ipsk),
            ipsk,
            users: ArcSwap::from_pointee(HashMap::new()),
            handler,
        })
    }

    /// Replace the whole user table
    ///
    /// Validates every PSK against the method's key length and rejects
    /// identity-hash collisions; on any error the previous table stays.
    pub fn update_users<I>(&self, users: I) -> Result<(), ServerUserError>
    where
        I: IntoIterator<Item = (String, Bytes, Address)>,
    {
        let mut table = HashMap::new();

        for (name, psk, destination) in users {
            let user = ServerUser::with_psk(name, psk, self.method)?;

            let entry = RelayUser {
                block_cipher: IdentityCipher::new(user.key()),
                user: Arc::new(user),
                destination,
            };

            let hash = entry.user.clone_identity_hash();
            if let Some(existing) = table.insert(hash, Arc::new(entry)) {
                return Err(ServerUserError::IdentityHashCollision(existing.user.name().to_owned()));
            }
        }

        self.users.store(Arc::new(table));
        Ok(())
    }

    /// Number of configured users
    pub fn user_count(&self) -> usize {
        self.users.load().len()
    }

    /// Serve one accepted connection
    pub async fn handle_connection<S>(&self, stream: S, source: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if let Err(cause) = self.serve_connection(stream, source).await {
            self.handler.new_error(ServerConnError { source, cause }.into());
        }
    }

    async fn serve_connection<S>(&self, mut stream: S, source: SocketAddr) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let salt_len = self.method.salt_len();

        // salt || eih; everything after stays on the wire untouched
        let mut request_header = BytesMut::new();
        request_header.resize(salt_len + IDENTITY_HEADER_LENGTH, 0);
        if let Err(err) = stream.read_exact(&mut request_header).await {
            return match err.kind() {
                ErrorKind::UnexpectedEof => Err(io::Error::new(ErrorKind::InvalidData, "bad header")),
                _ => Err(err),
            };
        }

        let (salt, eih) = request_header.split_at_mut(salt_len);

        let subkey_cipher = identity_subkey_cipher(&self.ipsk, salt);
        subkey_cipher.decrypt_block(eih);

        let relay_user = match self.users.load().get(&eih[..]) {
            Some(user) => user.clone(),
            None => return Err(io::Error::other("invalid request")),
        };

        // Checked only after the identity matched, so strangers cannot flood
        // the replay filter
        self.context.check_nonce_replay(self.method, salt)?;

        trace!(
            "relaying tcp session from {source} for user {} to {}",
            relay_user.user.name(),
            relay_user.destination
        );

        // Cut the identity field: the downstream peer sees salt || rest
        request_header.truncate(salt_len);
        let conn = PrefixedStream::new(request_header.freeze(), stream);

        let metadata = ConnectionMetadata {
            protocol: PROTOCOL_SHADOWSOCKS_RELAY,
            source,
            destination: relay_user.destination.clone(),
            user: Some(relay_user.user.clone()),
        };

        self.handler.new_connection(Box::new(conn), metadata).await
    }

    /// Serve one received datagram
    pub async fn handle_packet(&self, data: BytesMut, source: SocketAddr) {
        if let Err(cause) = self.serve_packet(data, source).await {
            self.handler.new_error(ServerPacketError { source, cause }.into());
        }
    }

    async fn serve_packet(&self, mut data: BytesMut, source: SocketAddr) -> io::Result<()> {
        if data.len() < 2 * IDENTITY_HEADER_LENGTH {
            return Err(io::Error::new(ErrorKind::InvalidData, "bad header"));
        }

        // header := AES-ECB(session_id || packet_id)
        let mut header = [0u8; IDENTITY_HEADER_LENGTH];
        header.copy_from_slice(&data[..IDENTITY_HEADER_LENGTH]);
        self.udp_block_cipher.decrypt_block(&mut header);

        let session_id = u64::from_be_bytes(header[0..8].try_into().expect("session id"));
        let packet_id = u64::from_be_bytes(header[8..16].try_into().expect("packet id"));

        // eih := AES-ECB(identity_hash XOR header)
        let mut eih = [0u8; IDENTITY_HEADER_LENGTH];
        eih.copy_from_slice(&data[IDENTITY_HEADER_LENGTH..2 * IDENTITY_HEADER_LENGTH]);
        self.udp_block_cipher.decrypt_block(&mut eih);
        for (e, h) in eih.iter_mut().zip(header.iter()) {
            *e ^= *h;
        }

        let relay_user = match self.users.load().get(&eih[..]) {
            Some(user) => user.clone(),
            None => return Err(io::Error::other("invalid request")),
        };

        trace!(
            "relaying udp packet from {source} for user {} to {}, session {session_id:#018x}",
            relay_user.user.name(),
            relay_user.destination
        );

        // Re-encrypt the header under the user's PSK into the identity slot,
        // then cut the first block: downstream sees a single-user packet
        relay_user.block_cipher.encrypt_block(&mut header);
        data[IDENTITY_HEADER_LENGTH..2 * IDENTITY_HEADER_LENGTH].copy_from_slice(&header);
        let _ = data.split_to(IDENTITY_HEADER_LENGTH);

        let metadata = ConnectionMetadata {
            protocol: PROTOCOL_SHADOWSOCKS_RELAY,
            source,
            destination: relay_user.destination.clone(),
            user: Some(relay_user.user.clone()),
        };

        let control = UdpSocketControlData {
            client_session_id: session_id,
            server_session_id: 0,
            packet_id,
            user_hash: Some(relay_user.user.clone_identity_hash()),
        };

        let packet = UdpPacket {
            payload: data,
            nat_key: NatKey::SessionId(session_id),
            control: Some(control),
        };

        self.handler.new_packet(packet, metadata).await
    }
}

/// A stream that replays a prefix before reading from the inner transport
///
/// Used to splice the rewritten request header back in front of the raw
/// connection when forwarding.
#[pin_project]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    #[pin]
    stream: S,
}

impl<S> PrefixedStream<S> {
    /// Wrap `stream`, serving `prefix` first
    pub fn new(prefix: Bytes, stream: S) -> Self {
        Self { prefix, stream }
    }

    /// Bytes of the prefix not yet read
    pub fn remaining_prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Consume and return the inner stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> AsyncRead for PrefixedStream<S>
where
    S: AsyncRead,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();

        if !this.prefix.is_empty() {
            let consumed = usize::min(this.prefix.len(), buf.remaining());
            buf.put_slice(&this.prefix.split_to(consumed));
            return Ok(()).into();
        }

        this.stream.poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for PrefixedStream<S>
where
    S: AsyncWrite,
{
    #[inline]
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn prefixed_stream_replays_prefix() {
        let inner = std::io::Cursor::new(b"world".to_vec());
        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello "), inner);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
