//! IO facilities for TCP relay
//!
//! `CryptoStream` turns any `AsyncRead + AsyncWrite` transport into the
//! encrypted tunnel of the configured method, dispatching between the three
//! protocol families.

use std::{
    fmt, io,
    marker::Unpin,
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
};

use byte_string::ByteStr;
use bytes::Bytes;
use futures::ready;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    config::{ServerUser, ServerUserManager},
    context::Context,
    crypto::{CipherCategory, CipherKind},
};

use super::{
    aead::{DecryptedReader as AeadDecryptedReader, EncryptedWriter as AeadEncryptedWriter},
    aead_2022::{DecryptedReader as Aead2022DecryptedReader, EncryptedWriter as Aead2022EncryptedWriter},
    stream::{DecryptedReader as StreamDecryptedReader, EncryptedWriter as StreamEncryptedWriter},
};

/// TCP shadowsocks protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    StreamError(#[from] super::stream::ProtocolError),
    #[error(transparent)]
    AeadError(#[from] super::aead::ProtocolError),
    #[error(transparent)]
    Aead2022Error(#[from] super::aead_2022::ProtocolError),
}

/// TCP shadowsocks protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::IoError(err) => err,
            ProtocolError::StreamError(err) => err.into(),
            ProtocolError::AeadError(err) => err.into(),
            ProtocolError::Aead2022Error(err) => err.into(),
        }
    }
}

/// The direction of a TCP stream
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamType {
    /// Client -> Server
    Client,
    /// Server -> Client
    Server,
}

/// Reader for decrypting the shadowsocks tunnel
pub enum DecryptedReader {
    None,
    Stream(StreamDecryptedReader),
    Aead(AeadDecryptedReader),
    Aead2022(Aead2022DecryptedReader),
}

impl DecryptedReader {
    /// Create a reader for the method's family
    pub fn new(stream_ty: StreamType, method: CipherKind, key: &[u8]) -> Self {
        Self::with_user_manager(stream_ty, method, key, None)
    }

    /// Create a reader; multi-user EIH verification is enabled by `user_manager`
    pub fn with_user_manager(
        stream_ty: StreamType,
        method: CipherKind,
        key: &[u8],
        user_manager: Option<Arc<ServerUserManager>>,
    ) -> Self {
        match method.category() {
            CipherCategory::None => Self::None,
            CipherCategory::Stream => Self::Stream(StreamDecryptedReader::new(method, key)),
            CipherCategory::Aead => Self::Aead(AeadDecryptedReader::new(method, key)),
            CipherCategory::Aead2022 => Self::Aead2022(Aead2022DecryptedReader::with_user_manager(
                stream_ty,
                method,
                key,
                user_manager,
            )),
        }
    }

    /// Attempt to read decrypted data from `stream`
    #[inline]
    pub fn poll_read_decrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        context: &Context,
        stream: &mut S,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        match *self {
            Self::None => Pin::new(stream).poll_read(cx, buf).map_err(Into::into),
            Self::Stream(ref mut reader) => reader.poll_read_decrypted(cx, context, stream, buf).map_err(Into::into),
            Self::Aead(ref mut reader) => reader.poll_read_decrypted(cx, context, stream, buf).map_err(Into::into),
            Self::Aead2022(ref mut reader) => reader.poll_read_decrypted(cx, context, stream, buf).map_err(Into::into),
        }
    }

    /// Received IV (stream) or salt (AEAD, AEAD 2022)
    pub fn nonce(&self) -> Option<&[u8]> {
        match *self {
            Self::None => None,
            Self::Stream(ref reader) => reader.iv(),
            Self::Aead(ref reader) => reader.salt(),
            Self::Aead2022(ref reader) => reader.salt(),
        }
    }

    /// Received request salt (AEAD 2022 responses)
    pub fn request_nonce(&self) -> Option<&[u8]> {
        match *self {
            Self::Aead2022(ref reader) => reader.request_salt(),
            _ => None,
        }
    }

    /// User authenticated by the identity header (AEAD 2022)
    pub fn user(&self) -> Option<&Arc<ServerUser>> {
        match *self {
            Self::Aead2022(ref reader) => reader.user(),
            _ => None,
        }
    }

    /// Check if the session-start handshake bytes were received
    pub fn handshaked(&self) -> bool {
        match *self {
            Self::None => true,
            Self::Stream(ref reader) => reader.handshaked(),
            Self::Aead(ref reader) => reader.handshaked(),
            Self::Aead2022(ref reader) => reader.handshaked(),
        }
    }
}

/// Writer for encrypting into the shadowsocks tunnel
pub enum EncryptedWriter {
    None,
    Stream(StreamEncryptedWriter),
    Aead(AeadEncryptedWriter),
    Aead2022(Aead2022EncryptedWriter),
}

impl EncryptedWriter {
    /// Create a writer for the method's family
    pub fn new(stream_ty: StreamType, method: CipherKind, key: &[u8], nonce: &[u8]) -> Self {
        Self::with_identity(stream_ty, method, key, nonce, &[])
    }

    /// Create a writer, prepending EIH headers built from `identity_keys`
    pub fn with_identity(
        stream_ty: StreamType,
        method: CipherKind,
        key: &[u8],
        nonce: &[u8],
        identity_keys: &[Bytes],
    ) -> Self {
        match method.category() {
            CipherCategory::None => Self::None,
            CipherCategory::Stream => Self::Stream(StreamEncryptedWriter::new(method, key, nonce)),
            CipherCategory::Aead => Self::Aead(AeadEncryptedWriter::new(method, key, nonce)),
            CipherCategory::Aead2022 => Self::Aead2022(Aead2022EncryptedWriter::with_identity(
                stream_ty,
                method,
                key,
                nonce,
                identity_keys,
            )),
        }
    }

    /// Attempt to write encrypted data to `stream`
    #[inline]
    pub fn poll_write_encrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        buf: &[u8],
    ) -> Poll<ProtocolResult<usize>>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        match *self {
            Self::None => Pin::new(stream).poll_write(cx, buf).map_err(Into::into),
            Self::Stream(ref mut writer) => writer.poll_write_encrypted(cx, stream, buf).map_err(Into::into),
            Self::Aead(ref mut writer) => writer.poll_write_encrypted(cx, stream, buf).map_err(Into::into),
            Self::Aead2022(ref mut writer) => writer.poll_write_encrypted(cx, stream, buf).map_err(Into::into),
        }
    }

    /// Sent IV (stream) or salt (AEAD, AEAD 2022)
    pub fn nonce(&self) -> &[u8] {
        match *self {
            Self::None => &[],
            Self::Stream(ref writer) => writer.iv(),
            Self::Aead(ref writer) => writer.salt(),
            Self::Aead2022(ref writer) => writer.salt(),
        }
    }

    /// Set the request salt echoed in AEAD 2022 responses
    pub fn set_request_nonce(&mut self, request_nonce: Bytes) {
        match *self {
            Self::Aead2022(ref mut writer) => writer.set_request_salt(request_nonce),
            _ => panic!("only AEAD 2022 responses echo a request salt"),
        }
    }

    /// Re-key with the authenticated user's key (AEAD 2022 multi-user)
    pub fn reset_cipher_with_key(&mut self, key: &[u8]) {
        match *self {
            Self::Aead2022(ref mut writer) => writer.reset_cipher_with_key(key),
            _ => panic!("only AEAD 2022 supports multi-user authentication"),
        }
    }
}

/// A bidirectional encrypted stream over `S`
pub struct CryptoStream<S> {
    stream: S,
    dec: DecryptedReader,
    enc: EncryptedWriter,
    method: CipherKind,
    stream_ty: StreamType,
    has_handshaked: bool,
}

impl<S> fmt::Debug for CryptoStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoStream")
            .field("method", &self.method)
            .field("has_handshaked", &self.has_handshaked)
            .finish()
    }
}

impl<S> CryptoStream<S> {
    /// Create a `CryptoStream` over the transport `stream`
    pub fn from_stream(context: &Context, stream: S, stream_ty: StreamType, method: CipherKind, key: &[u8]) -> Self {
        const EMPTY_IDENTITY: [Bytes; 0] = [];
        Self::from_stream_with_identity(context, stream, stream_ty, method, key, &EMPTY_IDENTITY, None)
    }

    /// Create a `CryptoStream` with identity keys (client) or a user table (server)
    pub fn from_stream_with_identity(
        context: &Context,
        stream: S,
        stream_ty: StreamType,
        method: CipherKind,
        key: &[u8],
        identity_keys: &[Bytes],
        user_manager: Option<Arc<ServerUserManager>>,
    ) -> Self {
        let category = method.category();

        let local_salt = match category {
            CipherCategory::None => Vec::new(),
            CipherCategory::Stream => {
                let mut local_iv = vec![0u8; method.iv_len()];
                context.generate_nonce(method, &mut local_iv, true);
                trace!("generated stream cipher IV {:?}", ByteStr::new(&local_iv));
                local_iv
            }
            CipherCategory::Aead => {
                let mut local_salt = vec![0u8; method.salt_len()];
                context.generate_nonce(method, &mut local_salt, true);
                trace!("generated AEAD cipher salt {:?}", ByteStr::new(&local_salt));
                local_salt
            }
            CipherCategory::Aead2022 => {
                // AEAD 2022 responses echo the request salt, so the generated
                // salt does not have to be remembered for uniqueness
                let mut local_salt = vec![0u8; method.salt_len()];
                context.generate_nonce(method, &mut local_salt, false);
                trace!("generated AEAD cipher salt {:?}", ByteStr::new(&local_salt));
                local_salt
            }
        };

        Self {
            stream,
            dec: DecryptedReader::with_user_manager(stream_ty, method, key, user_manager),
            enc: EncryptedWriter::with_identity(stream_ty, method, key, &local_salt, identity_keys),
            method,
            stream_ty,
            has_handshaked: false,
        }
    }

    /// Get the encryption method
    pub fn method(&self) -> CipherKind {
        self.method
    }

    /// Return a reference to the underlying transport
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Return a mutable reference to the underlying transport
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the `CryptoStream` and return the transport
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Received IV or salt
    #[inline]
    pub fn received_nonce(&self) -> Option<&[u8]> {
        self.dec.nonce()
    }

    /// Sent IV or salt
    #[inline]
    pub fn sent_nonce(&self) -> &[u8] {
        self.enc.nonce()
    }

    /// User authenticated by the identity header
    #[inline]
    pub fn user(&self) -> Option<&Arc<ServerUser>> {
        self.dec.user()
    }

    /// Echo the received salt in the response header
    ///
    /// Returns `false` while the request salt has not arrived yet.
    pub fn set_request_nonce_with_received(&mut self) -> bool {
        match self.dec.nonce() {
            None => false,
            Some(nonce) => {
                self.enc.set_request_nonce(Bytes::copy_from_slice(nonce));
                true
            }
        }
    }

    /// Remaining bytes of the current AEAD 2022 data chunk
    pub(crate) fn current_data_chunk_remaining(&self) -> (u64, usize) {
        match self.dec {
            DecryptedReader::Aead2022(ref dec) => dec.current_data_chunk_remaining(),
            _ => panic!("only AEAD 2022 has a data chunk counter"),
        }
    }
}

impl<S> CryptoStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Attempt to read decrypted data
    pub fn poll_read_decrypted(
        &mut self,
        cx: &mut task::Context<'_>,
        context: &Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<ProtocolResult<()>> {
        let Self {
            ref mut dec,
            ref mut enc,
            ref mut stream,
            ref mut has_handshaked,
            stream_ty,
            method,
            ..
        } = *self;

        ready!(dec.poll_read_decrypted(cx, context, stream, buf))?;

        if !*has_handshaked && dec.handshaked() {
            *has_handshaked = true;

            // Responses must be encrypted under the authenticated user's key
            if let Some(user) = dec.user() {
                let key = user.key().to_vec();
                enc.reset_cipher_with_key(&key);
            }

            // A response must echo the salt this client sent; a mismatch is
            // a sign of a reflected or spliced session
            if stream_ty == StreamType::Client && method.is_aead_2022() {
                match dec.request_nonce() {
                    Some(request_nonce) if request_nonce == enc.nonce() => {}
                    _ => {
                        return Err(ProtocolError::IoError(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "response salt mismatch",
                        )))
                        .into();
                    }
                }
            }
        }

        Ok(()).into()
    }

    /// Attempt to write encrypted data
    #[inline]
    pub fn poll_write_encrypted(&mut self, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<ProtocolResult<usize>> {
        let Self {
            ref mut enc,
            ref mut stream,
            ..
        } = *self;
        enc.poll_write_encrypted(cx, stream, buf)
    }

    /// Polls `flush` on the underlying transport
    #[inline]
    pub fn poll_flush(&mut self, cx: &mut task::Context<'_>) -> Poll<ProtocolResult<()>> {
        Pin::new(&mut self.stream).poll_flush(cx).map_err(Into::into)
    }

    /// Polls `shutdown` on the underlying transport
    #[inline]
    pub fn poll_shutdown(&mut self, cx: &mut task::Context<'_>) -> Poll<ProtocolResult<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx).map_err(Into::into)
    }
}
