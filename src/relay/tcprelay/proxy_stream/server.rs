//! TCP stream for communicating with a shadowsocks client

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
};

use futures::ready;
use log::warn;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    config::{ServerUser, ServerUserManager},
    context::SharedContext,
    crypto::CipherKind,
    relay::{
        socks5::Address,
        tcprelay::{
            crypto_io::{CryptoStream, StreamType},
            proxy_stream::protocol::TcpRequestHeader,
        },
    },
};

#[derive(Debug)]
enum ProxyServerStreamWriteState {
    /// AEAD 2022 responses must wait for the request salt before the
    /// response header can be assembled
    PrepareHeader(Option<std::task::Waker>),
    Established,
}

/// A server-side session stream accepted from a shadowsocks client
///
/// Call [`ProxyServerStream::handshake`] once after accepting; it reads the
/// destination address and leaves the stream as the decrypted data path.
/// The response direction is lazy: the salt and first response chunk go out
/// together on the first write.
#[pin_project]
pub struct ProxyServerStream<S> {
    stream: CryptoStream<S>,
    context: SharedContext,
    writer_state: ProxyServerStreamWriteState,
    has_handshaked: bool,
}

impl<S> ProxyServerStream<S> {
    /// Create a `ProxyServerStream` from an accepted connection
    pub fn from_stream(context: SharedContext, stream: S, method: CipherKind, key: &[u8]) -> Self {
        Self::from_stream_with_user_manager(context, stream, method, key, None)
    }

    /// Create a `ProxyServerStream`; `user_manager` enables EIH verification
    pub fn from_stream_with_user_manager(
        context: SharedContext,
        stream: S,
        method: CipherKind,
        key: &[u8],
        user_manager: Option<Arc<ServerUserManager>>,
    ) -> Self {
        let writer_state = if method.is_aead_2022() {
            ProxyServerStreamWriteState::PrepareHeader(None)
        } else {
            ProxyServerStreamWriteState::Established
        };

        Self {
            stream: CryptoStream::from_stream_with_identity(
                &context,
                stream,
                StreamType::Server,
                method,
                key,
                &[],
                user_manager,
            ),
            context,
            writer_state,
            has_handshaked: false,
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

    /// User authenticated by the identity header, if any
    pub fn user(&self) -> Option<&Arc<ServerUser>> {
        self.stream.user()
    }
}

impl<S> ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the inbound handshake, returning the destination address
    ///
    /// Must be called exactly once after accepting the connection.
    pub async fn handshake(&mut self) -> io::Result<Address> {
        if self.has_handshaked {
            return Err(io::Error::other("stream is already handshaked"));
        }

        self.has_handshaked = true;
        let method = self.stream.method();
        let header = TcpRequestHeader::read_from(method, self).await?;

        if let TcpRequestHeader::Aead2022(ref header) = header {
            // AEAD 2022 SPEC: a request without payload MUST carry padding.
            // Reject clients that send neither, their first chunk is a replayable
            // fingerprint.
            if header.padding_size == 0 {
                let (chunk_count, chunk_remaining) = self.stream.current_data_chunk_remaining();
                if chunk_count == 1 && chunk_remaining == 0 {
                    return Err(io::Error::other("no payload in first data chunk, and padding is 0"));
                } else if chunk_count > 1 {
                    warn!(
                        "tcp request header is separated in {} chunks, client violates the AEAD 2022 spec",
                        chunk_count
                    );
                }
            }
        }

        Ok(header.addr())
    }
}

impl<S> AsyncRead for ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.has_handshaked {
            return Err(io::Error::other("stream is not handshaked yet")).into();
        }

        let this = self.project();
        ready!(this.stream.poll_read_decrypted(cx, this.context, buf))?;

        // The request salt has arrived, wake a writer waiting to assemble
        // the response header
        if let ProxyServerStreamWriteState::PrepareHeader(waker) = this.writer_state {
            if let Some(waker) = waker.take() {
                waker.wake();
            }
        }

        Ok(()).into()
    }
}

impl<S> AsyncWrite for ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        loop {
            match *this.writer_state {
                ProxyServerStreamWriteState::Established => {
                    return this.stream.poll_write_encrypted(cx, buf).map_err(Into::into);
                }
                ProxyServerStreamWriteState::PrepareHeader(ref mut waker) => {
                    if this.stream.set_request_nonce_with_received() {
                        *this.writer_state = ProxyServerStreamWriteState::Established;
                    } else {
                        // Reader has not received the client salt yet
                        if let Some(waker) = waker.take() {
                            if !waker.will_wake(cx.waker()) {
                                waker.wake();
                            }
                        }
                        *waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                }
            }
        }
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
