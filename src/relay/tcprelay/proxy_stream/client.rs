//! TCP stream for communicating with a shadowsocks server

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};

use bytes::BytesMut;
use futures::ready;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    config::ServerConfig,
    context::SharedContext,
    crypto::CipherCategory,
    relay::{
        socks5::Address,
        tcprelay::crypto_io::{CryptoStream, StreamType},
    },
};

use super::protocol::v2::{get_padding_size, Aead2022TcpRequestHeaderRef};

/// Client stream tunnelling through a shadowsocks server to `addr`
///
/// The writer is lazy: the first `poll_write` assembles
/// `salt ‖ [EIH] ‖ header(addr) ‖ payload` and emits it in one write.
#[pin_project]
pub struct ProxyClientStream<S> {
    stream: CryptoStream<S>,
    addr: Option<Address>,
    context: SharedContext,
}

impl<S> ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a `ProxyClientStream` over a `stream` already connected to the
    /// server configured in `svr_cfg`
    pub fn from_stream<A>(context: SharedContext, stream: S, svr_cfg: &ServerConfig, addr: A) -> Self
    where
        A: Into<Address>,
    {
        let addr = addr.into();
        let stream = CryptoStream::from_stream_with_identity(
            &context,
            stream,
            StreamType::Client,
            svr_cfg.method(),
            svr_cfg.key(),
            svr_cfg.identity_keys(),
            None,
        );

        Self {
            stream,
            addr: Some(addr),
            context,
        }
    }

    /// Get a reference to the underlying transport
    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Get a mutable reference to the underlying transport
    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Consume and return the underlying transport
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S> AsyncRead for ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        this.stream.poll_read_decrypted(cx, this.context, buf).map_err(Into::into)
    }
}

impl<S> AsyncWrite for ProxyClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();

        if this.addr.is_none() {
            // Header already sent, proxy subsequent writes directly
            return this.stream.poll_write_encrypted(cx, buf).map_err(Into::into);
        }

        let addr = this.addr.as_ref().unwrap();
        let method = this.stream.method();

        // The first chunk carries the request header; cap the payload so the
        // whole of it fits into a single chunk of the method's framing.
        let (header_len, consumed) = match method.category() {
            CipherCategory::Aead => {
                let header_len = addr.serialized_len();
                let max_payload = super::super::aead::MAX_PACKET_SIZE - header_len;
                (header_len, usize::min(buf.len(), max_payload))
            }
            CipherCategory::Aead2022 => {
                let padding_size = get_padding_size(buf);
                let header_len = addr.serialized_len() + 2 + padding_size;
                let max_payload = super::super::aead_2022::MAX_PACKET_SIZE - header_len;
                (header_len, usize::min(buf.len(), max_payload))
            }
            _ => (addr.serialized_len(), buf.len()),
        };

        let mut buffer = BytesMut::with_capacity(header_len + consumed);
        match method.category() {
            CipherCategory::Aead2022 => {
                let padding_size = header_len - addr.serialized_len() - 2;
                Aead2022TcpRequestHeaderRef {
                    addr,
                    padding_size: padding_size as u16,
                }
                .write_to_buf(&mut buffer);
            }
            _ => addr.write_to_buf(&mut buffer),
        }
        buffer.extend_from_slice(&buf[..consumed]);

        ready!(this.stream.poll_write_encrypted(cx, &buffer)).map_err(io::Error::from)?;

        *this.addr = None;

        // NOTE: a first write of an empty `buf` still sends the handshake
        // (salt + header), which some server-speaks-first protocols need.
        Ok(consumed).into()
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx).map_err(Into::into)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx).map_err(Into::into)
    }
}
