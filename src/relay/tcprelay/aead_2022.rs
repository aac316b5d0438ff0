//! AEAD 2022 packet I/O facilities
//!
//! ```plain
//! TCP Request (after encryption, *ciphertext*)
//!
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | SALT (Variable Length ...)
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | EIH (16 bytes per iPSK, multi-user only ...)
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | AEAD (TYPE + TIMESTAMP + LENGTH)                                      |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | AEAD (ATYP + ADDRESS + PORT + PADDING_LENGTH + PADDING [+ PAYLOAD])
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//!
//! TCP Response (after encryption, *ciphertext*)
//!
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | SALT (Variable Length ...)
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | AEAD (TYPE + TIMESTAMP + REQUEST_SALT + LENGTH)
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//!
//! TCP Chunk (after encryption, *ciphertext*)
//! +--------------+---------------+--------------+------------+
//! |  *DataLen*   |  DataLen_TAG  |    *Data*    |  Data_TAG  |
//! +--------------+---------------+--------------+------------+
//! |      2       |     Fixed     |   Variable   |   Fixed    |
//! +--------------+---------------+--------------+------------+
//! ```

use std::{
    io::{self, ErrorKind},
    marker::Unpin,
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
    time::SystemTime,
};

use byte_string::ByteStr;
use bytes::{BufMut, Bytes, BytesMut};
use futures::ready;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{crypto_io::StreamType, proxy_stream::protocol::v2::SERVER_STREAM_TIMESTAMP_MAX_DIFF};
use crate::{
    config::{ServerUser, ServerUserManager},
    context::Context,
    crypto::{
        v2::{identity_hash, identity_subkey_cipher, TcpCipher, IDENTITY_HEADER_LENGTH},
        CipherKind,
    },
};

/// AEAD 2022 chunk payload is a full u16
pub const MAX_PACKET_SIZE: usize = 0xFFFF;

#[inline]
fn get_now_timestamp() -> u64 {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => n.as_secs(),
        Err(..) => panic!("SystemTime::now() is before UNIX Epoch!"),
    }
}

/// AEAD 2022 protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    // Both authentication failures read the same from the outside
    #[error("invalid request")]
    DecryptError,
    #[error("invalid request")]
    InvalidUserIdentity,
    #[error("invalid stream type {0:#x}")]
    InvalidStreamType(u8),
    #[error("received header with aged timestamp: {0}")]
    AgedTimestamp(u64),
}

/// AEAD 2022 protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::IoError(err) => err,
            e => Self::new(ErrorKind::Other, e),
        }
    }
}

enum DecryptReadState {
    ReadHeader,
    ReadLength,
    ReadData { length: usize },
    BufferedData { pos: usize },
}

/// Reader wrapper that decrypts the AEAD 2022 chunk stream
pub struct DecryptedReader {
    stream_ty: StreamType,
    state: DecryptReadState,
    cipher: Option<TcpCipher>,
    key: Bytes,
    buffer: BytesMut,
    filled: usize,
    method: CipherKind,
    salt: Option<Bytes>,
    request_salt: Option<Bytes>,
    data_chunk_count: u64,
    user_manager: Option<Arc<ServerUserManager>>,
    user: Option<Arc<ServerUser>>,
}

impl DecryptedReader {
    /// Create a single-user reader
    pub fn new(stream_ty: StreamType, method: CipherKind, key: &[u8]) -> Self {
        Self::with_user_manager(stream_ty, method, key, None)
    }

    /// Create a reader; with a `user_manager` the request header must carry
    /// an encrypted identity header selecting one of the users
    pub fn with_user_manager(
        stream_ty: StreamType,
        method: CipherKind,
        key: &[u8],
        user_manager: Option<Arc<ServerUserManager>>,
    ) -> Self {
        Self {
            stream_ty,
            state: DecryptReadState::ReadHeader,
            cipher: None,
            key: Bytes::copy_from_slice(key),
            buffer: BytesMut::new(),
            filled: 0,
            method,
            salt: None,
            request_salt: None,
            data_chunk_count: 0,
            user_manager,
            user: None,
        }
    }

    /// Salt received from the peer
    pub fn salt(&self) -> Option<&[u8]> {
        self.salt.as_deref()
    }

    /// Request salt echoed in a server response header
    pub fn request_salt(&self) -> Option<&[u8]> {
        self.request_salt.as_deref()
    }

    /// User authenticated by the identity header
    pub fn user(&self) -> Option<&Arc<ServerUser>> {
        self.user.as_ref()
    }

    /// Session key of the authenticated user
    pub fn user_key(&self) -> Option<&[u8]> {
        self.user.as_ref().map(|u| u.key())
    }

    /// Check if the header has been received and the cipher is ready
    pub fn handshaked(&self) -> bool {
        self.cipher.is_some()
    }

    /// Remaining bytes of the current data chunk as `(ChunkCount, Remaining)`
    pub fn current_data_chunk_remaining(&self) -> (u64, usize) {
        match self.state {
            DecryptReadState::BufferedData { pos } => (self.data_chunk_count, self.buffer.len() - pos),
            _ => (self.data_chunk_count, 0),
        }
    }

    /// Attempt to read decrypted data from `stream`
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
        loop {
            match self.state {
                DecryptReadState::ReadHeader => match ready!(self.poll_read_header(cx, context, stream))? {
                    None => return Ok(()).into(),
                    Some(length) => {
                        self.reset_buffer();
                        self.state = DecryptReadState::ReadData { length };
                    }
                },
                DecryptReadState::ReadLength => match ready!(self.poll_read_length(cx, stream))? {
                    None => return Ok(()).into(),
                    Some(length) => {
                        self.reset_buffer();
                        self.state = DecryptReadState::ReadData { length };
                    }
                },
                DecryptReadState::ReadData { length } => {
                    ready!(self.poll_read_data(cx, stream, length))?;

                    self.state = DecryptReadState::BufferedData { pos: 0 };
                    self.data_chunk_count = self.data_chunk_count.wrapping_add(1);
                }
                DecryptReadState::BufferedData { ref mut pos } => {
                    if *pos < self.buffer.len() {
                        let buffered = &self.buffer[*pos..];

                        let consumed = usize::min(buffered.len(), buf.remaining());
                        buf.put_slice(&buffered[..consumed]);

                        *pos += consumed;

                        return Ok(()).into();
                    }

                    self.reset_buffer();
                    self.state = DecryptReadState::ReadLength;
                }
            }
        }
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.filled = 0;
    }

    /// Length of the identity header expected in front of the header chunk
    fn eih_len(&self) -> usize {
        match self.stream_ty {
            StreamType::Server if self.user_manager.is_some() && self.method.support_eih() => IDENTITY_HEADER_LENGTH,
            _ => 0,
        }
    }

    fn poll_read_header<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        context: &Context,
        stream: &mut S,
    ) -> Poll<ProtocolResult<Option<usize>>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let salt_len = self.method.salt_len();
        let eih_len = self.eih_len();

        // Response headers echo the request salt
        let request_salt_len = match self.stream_ty {
            StreamType::Client => salt_len,
            StreamType::Server => 0,
        };

        let header_len = salt_len + eih_len + 1 + 8 + request_salt_len + 2 + self.method.tag_len();

        let n = ready!(self.poll_read_exact(cx, stream, header_len))?;
        if n == 0 {
            // Clean EOF before the handshake
            return Ok(None).into();
        }

        let (salt, rest) = self.buffer.split_at_mut(salt_len);

        trace!("got AEAD salt {:?}", ByteStr::new(salt));

        let (eih, header_chunk) = rest.split_at_mut(eih_len);

        if eih_len > 0 {
            let subkey_cipher = identity_subkey_cipher(&self.key, salt);
            subkey_cipher.decrypt_block(eih);

            let manager = self.user_manager.as_ref().expect("user manager");
            match manager.clone_user_by_hash(eih) {
                Some(user) => {
                    trace!("matched EIH user {}", user.name());
                    self.user = Some(user);
                }
                None => return Err(ProtocolError::InvalidUserIdentity).into(),
            }
        }

        let session_key: &[u8] = match self.user {
            Some(ref user) => user.key(),
            None => &self.key,
        };

        let mut cipher = TcpCipher::new(self.method, session_key, salt);

        if !cipher.decrypt_packet(header_chunk) {
            return Err(ProtocolError::DecryptError).into();
        }

        let expected_stream_ty = match self.stream_ty {
            StreamType::Client => 1, // reading from server, type == SERVER (1)
            StreamType::Server => 0,
        };
        if header_chunk[0] != expected_stream_ty {
            return Err(ProtocolError::InvalidStreamType(header_chunk[0])).into();
        }

        let timestamp = u64::from_be_bytes(header_chunk[1..9].try_into().expect("timestamp"));
        let now = get_now_timestamp();
        if now.abs_diff(timestamp) > SERVER_STREAM_TIMESTAMP_MAX_DIFF {
            return Err(ProtocolError::AgedTimestamp(timestamp)).into();
        }

        let mut offset = 9;
        if request_salt_len > 0 {
            self.request_salt = Some(Bytes::copy_from_slice(&header_chunk[offset..offset + request_salt_len]));
            offset += request_salt_len;
        }

        let data_length = u16::from_be_bytes(header_chunk[offset..offset + 2].try_into().expect("length")) as usize;

        // Check repeated salt after the first successful decryption, otherwise
        // an attacker could flood the filter and block legitimate clients
        context.check_nonce_replay(self.method, salt)?;
        self.salt = Some(Bytes::copy_from_slice(salt));

        self.cipher = Some(cipher);
        Ok(Some(data_length)).into()
    }

    fn poll_read_length<S>(&mut self, cx: &mut task::Context<'_>, stream: &mut S) -> Poll<ProtocolResult<Option<usize>>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let length_len = 2 + self.method.tag_len();

        let n = ready!(self.poll_read_exact(cx, stream, length_len))?;
        if n == 0 {
            return Ok(None).into();
        }

        let cipher = self.cipher.as_mut().expect("cipher is None");

        let m = &mut self.buffer[..length_len];
        if !cipher.decrypt_packet(m) {
            return Err(ProtocolError::DecryptError).into();
        }

        let length = u16::from_be_bytes([m[0], m[1]]) as usize;
        Ok(Some(length)).into()
    }

    fn poll_read_data<S>(&mut self, cx: &mut task::Context<'_>, stream: &mut S, size: usize) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let data_len = size + self.method.tag_len();

        let n = ready!(self.poll_read_exact(cx, stream, data_len))?;
        if n == 0 {
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into()).into();
        }

        let cipher = self.cipher.as_mut().expect("cipher is None");

        let m = &mut self.buffer[..data_len];
        if !cipher.decrypt_packet(m) {
            return Err(ProtocolError::DecryptError).into();
        }

        // Remove TAG
        self.buffer.truncate(size);

        Ok(()).into()
    }

    fn poll_read_exact<S>(&mut self, cx: &mut task::Context<'_>, stream: &mut S, size: usize) -> Poll<io::Result<usize>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        assert!(size != 0);

        if self.buffer.len() < size {
            self.buffer.resize(size, 0);
        }

        while self.filled < size {
            let mut read_buf = ReadBuf::new(&mut self.buffer[self.filled..size]);
            ready!(Pin::new(&mut *stream).poll_read(cx, &mut read_buf))?;

            let n = read_buf.filled().len();
            if n == 0 {
                return if self.filled > 0 {
                    Err(ErrorKind::UnexpectedEof.into()).into()
                } else {
                    Ok(0).into()
                };
            }

            self.filled += n;
        }

        Ok(size).into()
    }
}

enum EncryptWriteState {
    AssembleHeader,
    AssemblePacket,
    Writing { pos: usize },
}

/// Writer wrapper that encrypts into the AEAD 2022 chunk stream
///
/// The salt and any identity headers are staged at construction; the fixed
/// header chunk is assembled together with the first payload chunk so that
/// everything goes out in one write.
pub struct EncryptedWriter {
    stream_ty: StreamType,
    cipher: TcpCipher,
    method: CipherKind,
    buffer: BytesMut,
    state: EncryptWriteState,
    salt: Bytes,
    request_salt: Option<Bytes>,
}

impl EncryptedWriter {
    /// Create a writer without identity headers
    pub fn new(stream_ty: StreamType, method: CipherKind, key: &[u8], salt: &[u8]) -> Self {
        Self::with_identity(stream_ty, method, key, salt, &[])
    }

    /// Create a writer, prepending one encrypted identity header per iPSK
    ///
    /// The EIH chain is `AES(subkey_i, blake3(next_key)[..16])` where
    /// `subkey_i` is derived from `identity_keys[i]` and the salt, and
    /// `next_key` is the following iPSK, or the session key for the last one.
    pub fn with_identity(
        stream_ty: StreamType,
        method: CipherKind,
        key: &[u8],
        salt: &[u8],
        identity_keys: &[Bytes],
    ) -> Self {
        let mut buffer = BytesMut::with_capacity(salt.len() + identity_keys.len() * IDENTITY_HEADER_LENGTH);
        buffer.put_slice(salt);

        if !identity_keys.is_empty() && method.support_eih() {
            debug_assert!(stream_ty == StreamType::Client, "only requests carry identity headers");

            for (i, ipsk) in identity_keys.iter().enumerate() {
                let next_key = match identity_keys.get(i + 1) {
                    Some(next_ipsk) => next_ipsk.as_ref(),
                    None => key,
                };

                let mut eih = [0u8; IDENTITY_HEADER_LENGTH];
                eih.copy_from_slice(&identity_hash(next_key));
                identity_subkey_cipher(ipsk, salt).encrypt_block(&mut eih);

                trace!("assembled EIH {:?} for iPSK {}", ByteStr::new(&eih), i);
                buffer.put_slice(&eih);
            }
        }

        Self {
            stream_ty,
            cipher: TcpCipher::new(method, key, salt),
            method,
            buffer,
            state: EncryptWriteState::AssembleHeader,
            salt: Bytes::copy_from_slice(salt),
            request_salt: None,
        }
    }

    /// Salt sent to the peer
    pub fn salt(&self) -> &[u8] {
        self.salt.as_ref()
    }

    /// Set the request salt echoed in the response header
    pub fn set_request_salt(&mut self, request_salt: Bytes) {
        debug_assert!(self.stream_ty == StreamType::Server, "only responses echo a request salt");
        self.request_salt = Some(request_salt);
    }

    /// Re-key the session cipher with an authenticated user key
    ///
    /// Only meaningful before the first write, when a multi-user server has
    /// matched the identity header and must answer under the user's PSK.
    pub fn reset_cipher_with_key(&mut self, key: &[u8]) {
        debug_assert!(matches!(self.state, EncryptWriteState::AssembleHeader));
        self.cipher = TcpCipher::new(self.method, key, &self.salt);
    }

    /// Attempt to write encrypted `buf` to `stream`
    pub fn poll_write_encrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        mut buf: &[u8],
    ) -> Poll<ProtocolResult<usize>>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        if buf.len() > MAX_PACKET_SIZE {
            buf = &buf[..MAX_PACKET_SIZE];
        }

        loop {
            match self.state {
                EncryptWriteState::AssembleHeader => {
                    // AEAD(TYPE + TIMESTAMP [+ REQUEST_SALT] + LENGTH)
                    let tag_len = self.cipher.tag_len();
                    let request_salt_len = self.request_salt.as_ref().map_or(0, |s| s.len());

                    let start = self.buffer.len();
                    let stream_ty = match self.stream_ty {
                        StreamType::Client => 0,
                        StreamType::Server => 1,
                    };
                    self.buffer.put_u8(stream_ty);
                    self.buffer.put_u64(get_now_timestamp());
                    if let Some(ref salt) = self.request_salt {
                        self.buffer.put_slice(salt);
                    }
                    self.buffer.put_u16(buf.len() as u16);
                    self.buffer.resize(start + 1 + 8 + request_salt_len + 2 + tag_len, 0);
                    self.cipher.encrypt_packet(&mut self.buffer[start..]);

                    self.encrypt_data_chunk(buf);
                    self.state = EncryptWriteState::Writing { pos: 0 };
                }
                EncryptWriteState::AssemblePacket => {
                    let tag_len = self.cipher.tag_len();

                    let start = self.buffer.len();
                    self.buffer.put_u16(buf.len() as u16);
                    self.buffer.resize(start + 2 + tag_len, 0);
                    self.cipher.encrypt_packet(&mut self.buffer[start..]);

                    self.encrypt_data_chunk(buf);
                    self.state = EncryptWriteState::Writing { pos: 0 };
                }
                EncryptWriteState::Writing { ref mut pos } => {
                    while *pos < self.buffer.len() {
                        let n = ready!(Pin::new(&mut *stream).poll_write(cx, &self.buffer[*pos..]))?;
                        if n == 0 {
                            return Err(io::Error::from(ErrorKind::UnexpectedEof).into()).into();
                        }
                        *pos += n;
                    }

                    self.state = EncryptWriteState::AssemblePacket;
                    self.buffer.clear();

                    return Ok(buf.len()).into();
                }
            }
        }
    }

    fn encrypt_data_chunk(&mut self, payload: &[u8]) {
        let tag_len = self.cipher.tag_len();

        let start = self.buffer.len();
        self.buffer.put_slice(payload);
        self.buffer.resize(start + payload.len() + tag_len, 0);
        self.cipher.encrypt_packet(&mut self.buffer[start..]);
    }
}
