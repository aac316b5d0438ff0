//! Stream cipher protocol implementation
//!
//! ```plain
//! +-------+----------------------+
//! |  IV   | Stream(Data ...)     |
//! +-------+----------------------+
//! | Fixed | Variable             |
//! +-------+----------------------+
//! ```

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

/// Stream protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("decrypt failed")]
    DecryptError,
}

/// Stream protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::IoError(err) => err,
            ProtocolError::DecryptError => Self::new(ErrorKind::Other, e),
        }
    }
}

enum DecryptReadState {
    WaitIv,
    Read,
}

/// Reader that decrypts a stream-cipher session lazily
///
/// The first read consumes exactly `iv_len` bytes and builds the decrypt
/// keystream; every later read XORs in place inside the caller's buffer.
pub struct DecryptedReader {
    state: DecryptReadState,
    cipher: Option<Cipher>,
    key: Bytes,
    buffer: BytesMut,
    filled: usize,
    method: CipherKind,
    iv: Option<Bytes>,
}

impl DecryptedReader {
    pub fn new(method: CipherKind, key: &[u8]) -> Self {
        if method.iv_len() > 0 {
            Self {
                state: DecryptReadState::WaitIv,
                cipher: None,
                key: Bytes::copy_from_slice(key),
                buffer: BytesMut::new(),
                filled: 0,
                method,
                iv: None,
            }
        } else {
            Self {
                state: DecryptReadState::Read,
                cipher: Some(Cipher::new(method, key, &[])),
                key: Bytes::copy_from_slice(key),
                buffer: BytesMut::new(),
                filled: 0,
                method,
                iv: Some(Bytes::new()),
            }
        }
    }

    /// IV received from the peer
    pub fn iv(&self) -> Option<&[u8]> {
        self.iv.as_deref()
    }

    /// Check if the IV has been received
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
                DecryptReadState::WaitIv => {
                    ready!(self.poll_read_iv(cx, context, stream))?;

                    self.buffer = BytesMut::new();
                    self.filled = 0;
                    self.state = DecryptReadState::Read;
                }
                DecryptReadState::Read => {
                    let before_n = buf.filled().len();
                    ready!(Pin::new(&mut *stream).poll_read(cx, buf))?;
                    let after_n = buf.filled().len();
                    if before_n == after_n {
                        // EOF
                        return Ok(()).into();
                    }

                    let m = &mut buf.filled_mut()[before_n..];

                    let cipher = self.cipher.as_mut().expect("cipher is None");
                    if !cipher.decrypt_packet(m) {
                        return Err(ProtocolError::DecryptError).into();
                    }

                    return Ok(()).into();
                }
            }
        }
    }

    fn poll_read_iv<S>(&mut self, cx: &mut task::Context<'_>, context: &Context, stream: &mut S) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let iv_len = self.method.iv_len();

        if self.buffer.len() < iv_len {
            self.buffer.resize(iv_len, 0);
        }

        while self.filled < iv_len {
            let mut read_buf = ReadBuf::new(&mut self.buffer[self.filled..iv_len]);
            ready!(Pin::new(&mut *stream).poll_read(cx, &mut read_buf))?;

            let n = read_buf.filled().len();
            if n == 0 {
                return Err(io::Error::from(ErrorKind::UnexpectedEof).into()).into();
            }
            self.filled += n;
        }

        let iv = &self.buffer[..iv_len];
        context.check_nonce_replay(self.method, iv)?;

        trace!("got stream IV {:?}", ByteStr::new(iv));

        self.iv = Some(Bytes::copy_from_slice(iv));
        self.cipher = Some(Cipher::new(self.method, &self.key, iv));

        Ok(()).into()
    }
}

enum EncryptWriteState {
    AssemblePacket,
    Writing { pos: usize },
}

/// Writer that encrypts a stream-cipher session lazily
///
/// The IV is staged into the scratch buffer at construction and goes out
/// with the first write.
pub struct EncryptedWriter {
    cipher: Cipher,
    buffer: BytesMut,
    state: EncryptWriteState,
    iv: Bytes,
}

impl EncryptedWriter {
    /// Create a writer sending `iv` in front of the first bytes
    pub fn new(method: CipherKind, key: &[u8], iv: &[u8]) -> Self {
        let mut buffer = BytesMut::with_capacity(iv.len());
        buffer.put_slice(iv);

        Self {
            cipher: Cipher::new(method, key, iv),
            buffer,
            state: EncryptWriteState::AssemblePacket,
            iv: Bytes::copy_from_slice(iv),
        }
    }

    /// IV sent to the peer
    pub fn iv(&self) -> &[u8] {
        self.iv.as_ref()
    }

    /// Attempt to write encrypted `buf` to `stream`
    pub fn poll_write_encrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        buf: &[u8],
    ) -> Poll<ProtocolResult<usize>>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            match self.state {
                EncryptWriteState::AssemblePacket => {
                    let n = self.buffer.len();
                    self.buffer.put_slice(buf);
                    self.cipher.encrypt_packet(&mut self.buffer[n..]);
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
}
