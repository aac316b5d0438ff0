//! AEAD packet I/O facilities
//!
//! AEAD protocol is defined in <https://shadowsocks.org/en/spec/AEAD.html>.
//!
//! ```plain
//! TCP Chunk (after encryption, *ciphertext*)
//! +--------------+---------------+--------------+------------+
//! |  *DataLen*   |  DataLen_TAG  |    *Data*    |  Data_TAG  |
//! +--------------+---------------+--------------+------------+
//! |      2       |     Fixed     |   Variable   |   Fixed    |
//! +--------------+---------------+--------------+------------+
//! ```
//!
//! The length field is big-endian with the high two bits reserved as zero;
//! both AEAD operations of a chunk advance the same little-endian nonce
//! counter of the direction.

use std::{
    io::{self, ErrorKind},
    marker::Unpin,
    pin::Pin,
    task::{self, Poll},
};

use byte_string::ByteStr;
use bytes::{BufMut, Bytes, BytesMut};
use futures::ready;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    context::Context,
    crypto::{v1::Cipher, CipherKind},
};

/// AEAD chunk payload must be smaller than 0x3FFF
pub const MAX_PACKET_SIZE: usize = 0x3FFF;

/// AEAD protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("invalid chunk tag")]
    DecryptError,
    #[error("data length {0:#x} must be smaller than 0x3FFF with the higher two bits set to zero")]
    DataTooLong(usize),
}

/// AEAD protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::IoError(err) => err,
            ProtocolError::DecryptError => Self::new(ErrorKind::Other, e),
            ProtocolError::DataTooLong(..) => Self::new(ErrorKind::InvalidData, e),
        }
    }
}

enum DecryptReadState {
    WaitSalt,
    ReadLength,
    ReadData { length: usize },
    BufferedData { pos: usize },
}

/// Reader wrapper that decrypts the AEAD chunk stream
pub struct DecryptedReader {
    state: DecryptReadState,
    cipher: Option<Cipher>,
    key: Bytes,
    buffer: BytesMut,
    filled: usize,
    method: CipherKind,
    salt: Option<Bytes>,
}

impl DecryptedReader {
    /// Create a reader that waits for the peer's salt first
    pub fn new(method: CipherKind, key: &[u8]) -> Self {
        let (state, cipher) = if method.salt_len() > 0 {
            (DecryptReadState::WaitSalt, None)
        } else {
            (DecryptReadState::ReadLength, Some(Cipher::new(method, key, &[])))
        };

        Self {
            state,
            cipher,
            key: Bytes::copy_from_slice(key),
            buffer: BytesMut::new(),
            filled: 0,
            method,
            salt: None,
        }
    }

    /// Salt received from the peer
    pub fn salt(&self) -> Option<&[u8]> {
        self.salt.as_deref()
    }

    /// Check if the salt has been received and the cipher is ready
    pub fn handshaked(&self) -> bool {
        self.cipher.is_some()
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
                DecryptReadState::WaitSalt => {
                    ready!(self.poll_read_salt(cx, context, stream))?;

                    self.reset_buffer();
                    self.state = DecryptReadState::ReadLength;
                }
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

    fn poll_read_salt<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        context: &Context,
        stream: &mut S,
    ) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let salt_len = self.method.salt_len();

        let n = ready!(self.poll_read_exact(cx, stream, salt_len))?;
        if n < salt_len {
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into()).into();
        }

        let salt = &self.buffer[..salt_len];
        context.check_nonce_replay(self.method, salt)?;

        trace!("got AEAD salt {:?}", ByteStr::new(salt));

        self.cipher = Some(Cipher::new(self.method, &self.key, salt));
        self.salt = Some(Bytes::copy_from_slice(salt));

        Ok(()).into()
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
        if length > MAX_PACKET_SIZE {
            // https://shadowsocks.org/en/spec/AEAD-Ciphers.html
            //
            // The higher two bits of the length are reserved
            return Err(ProtocolError::DataTooLong(length)).into();
        }

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
    AssemblePacket,
    Writing { pos: usize },
}

/// Writer wrapper that encrypts data into the AEAD chunk stream
///
/// The salt is staged into the scratch buffer at construction, so the first
/// chunk goes out in the same write as the salt.
pub struct EncryptedWriter {
    cipher: Cipher,
    buffer: BytesMut,
    state: EncryptWriteState,
    salt: Bytes,
}

impl EncryptedWriter {
    /// Create a writer sending `salt` in front of the first chunk
    pub fn new(method: CipherKind, key: &[u8], salt: &[u8]) -> Self {
        let mut buffer = BytesMut::with_capacity(salt.len());
        buffer.put_slice(salt);

        Self {
            cipher: Cipher::new(method, key, salt),
            buffer,
            state: EncryptWriteState::AssemblePacket,
            salt: Bytes::copy_from_slice(salt),
        }
    }

    /// Salt sent to the peer
    pub fn salt(&self) -> &[u8] {
        self.salt.as_ref()
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
                EncryptWriteState::AssemblePacket => {
                    self.encrypt_chunk(buf);
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

    /// Append `enc(length) || tag || enc(payload) || tag` to the buffer
    fn encrypt_chunk(&mut self, payload: &[u8]) {
        let tag_len = self.cipher.tag_len();
        self.buffer.reserve(2 + tag_len + payload.len() + tag_len);

        let start = self.buffer.len();
        self.buffer.put_u16(payload.len() as u16);
        self.buffer.resize(start + 2 + tag_len, 0);
        self.cipher.encrypt_packet(&mut self.buffer[start..]);

        let start = self.buffer.len();
        self.buffer.put_slice(payload);
        self.buffer.resize(start + payload.len() + tag_len, 0);
        self.cipher.encrypt_packet(&mut self.buffer[start..]);
    }
}
