//! TLS-record-aligned reframing of the AEAD chunk stream
//!
//! Wraps an AEAD session so that every emitted encrypted chunk corresponds to
//! exactly one TLS record, making the framing indistinguishable from TLS to a
//! length-counting observer.
//!
//! ```plain
//! record        := type(1) || version(2) || length(2) || data(length)
//! on the wire   := AEAD(type || version || length) || TAG || body
//! body          := data                         (type == application_data)
//!                | AEAD(data) || TAG            (otherwise)
//! ```
//!
//! `application_data` bodies pass through opaquely: the proxied traffic is
//! already TLS-encrypted, wrapping it again would only waste a tag per record.

use std::{
    io::{self, ErrorKind},
    pin::Pin,
    task::{self, Poll},
};

use bytes::{BufMut, BytesMut};
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::v1::Cipher;

/// TLS record type `handshake`
pub const RECORD_TYPE_HANDSHAKE: u8 = 22;
/// TLS record type `application_data`
pub const RECORD_TYPE_APPLICATION_DATA: u8 = 23;

const TLS_VERSION_10: u16 = 0x0301;
const TLS_VERSION_11: u16 = 0x0302;
const TLS_VERSION_12: u16 = 0x0303;
const TLS_VERSION_13: u16 = 0x0304;

/// TLS record header length
pub const TLS_RECORD_HEADER_LENGTH: usize = 5;

/// Wire length of one encrypted record-header chunk
pub const TLS_ENCRYPTED_LENGTH_CHUNK_LENGTH: usize = TLS_RECORD_HEADER_LENGTH + 16;

#[inline]
fn valid_record_version(version: u16) -> bool {
    matches!(version, TLS_VERSION_10 | TLS_VERSION_11 | TLS_VERSION_12 | TLS_VERSION_13)
}

/// Check if `payload` starts with a TLS handshake record
pub fn is_tls_handshake(payload: &[u8]) -> bool {
    if payload.len() < TLS_RECORD_HEADER_LENGTH {
        return false;
    }
    if payload[0] != RECORD_TYPE_HANDSHAKE {
        return false;
    }
    let version = u16::from_be_bytes([payload[1], payload[2]]);
    version == TLS_VERSION_10 || version == TLS_VERSION_12
}

/// Length of the longest prefix of `payload` that ends on a record boundary
pub fn read_tls_chunk_end(payload: &[u8]) -> usize {
    let plen = payload.len();
    let mut index = 0;
    while index < plen {
        if plen - index < TLS_RECORD_HEADER_LENGTH {
            break;
        }
        let data_len = u16::from_be_bytes([payload[index + 3], payload[index + 4]]) as usize;
        let next_index = index + TLS_RECORD_HEADER_LENGTH + data_len;
        if next_index > plen {
            return index;
        }
        index = next_index;
    }
    index
}

enum ReadState {
    ReadHeaderChunk,
    PassthroughData { remaining: usize },
    ReadRecordChunk { length: usize },
    BufferedData { pos: usize },
}

/// Reader half of the TLS reframer
///
/// `cipher` must be the AEAD session cipher of the receiving direction, in
/// the chunk-counter state right after the session handshake.
pub struct TlsReframedReader<S> {
    stream: S,
    cipher: Cipher,
    state: ReadState,
    buffer: BytesMut,
    filled: usize,
}

impl<S> TlsReframedReader<S> {
    /// Create a reader over `stream`
    pub fn new(stream: S, cipher: Cipher) -> Self {
        debug_assert_eq!(cipher.tag_len(), 16, "reframing requires an AEAD cipher");
        Self {
            stream,
            cipher,
            state: ReadState::ReadHeaderChunk,
            buffer: BytesMut::new(),
            filled: 0,
        }
    }

    /// Consume and return the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.filled = 0;
    }
}

impl<S> TlsReframedReader<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read_exact(&mut self, cx: &mut task::Context<'_>, size: usize) -> Poll<io::Result<usize>> {
        assert!(size != 0);

        if self.buffer.len() < size {
            self.buffer.resize(size, 0);
        }

        while self.filled < size {
            let mut read_buf = ReadBuf::new(&mut self.buffer[self.filled..size]);
            ready!(Pin::new(&mut self.stream).poll_read(cx, &mut read_buf))?;

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

impl<S> AsyncRead for TlsReframedReader<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match this.state {
                ReadState::ReadHeaderChunk => {
                    let n = ready!(this.poll_read_exact(cx, TLS_ENCRYPTED_LENGTH_CHUNK_LENGTH))?;
                    if n == 0 {
                        // Clean EOF on a record boundary
                        return Ok(()).into();
                    }

                    let m = &mut this.buffer[..TLS_ENCRYPTED_LENGTH_CHUNK_LENGTH];
                    if !this.cipher.decrypt_packet(m) {
                        return Err(io::Error::other("invalid record header tag")).into();
                    }

                    let record_type = m[0];
                    let version = u16::from_be_bytes([m[1], m[2]]);
                    if !valid_record_version(version) {
                        return Err(io::Error::new(
                            ErrorKind::InvalidData,
                            format!("invalid TLS record version {version:#06x}"),
                        ))
                        .into();
                    }
                    let length = u16::from_be_bytes([m[3], m[4]]) as usize;

                    this.reset_buffer();
                    this.state = if record_type == RECORD_TYPE_APPLICATION_DATA {
                        ReadState::PassthroughData { remaining: length }
                    } else {
                        ReadState::ReadRecordChunk { length }
                    };
                }
                ReadState::PassthroughData { ref mut remaining } => {
                    if *remaining == 0 {
                        this.state = ReadState::ReadHeaderChunk;
                        continue;
                    }

                    // Already authenticated by the sender's outer AEAD layer,
                    // deliver straight into the caller's buffer
                    let to_read = usize::min(*remaining, buf.remaining());
                    let dst = buf.initialize_unfilled_to(to_read);
                    let mut read_buf = ReadBuf::new(dst);
                    ready!(Pin::new(&mut this.stream).poll_read(cx, &mut read_buf))?;

                    let n = read_buf.filled().len();
                    if n == 0 {
                        return Err(ErrorKind::UnexpectedEof.into()).into();
                    }
                    buf.advance(n);
                    *remaining -= n;

                    return Ok(()).into();
                }
                ReadState::ReadRecordChunk { length } => {
                    // a zero-length record still carries its tag chunk
                    let n = ready!(this.poll_read_exact(cx, length + 16))?;
                    if n == 0 {
                        return Err(ErrorKind::UnexpectedEof.into()).into();
                    }

                    let m = &mut this.buffer[..length + 16];
                    if !this.cipher.decrypt_packet(m) {
                        return Err(io::Error::other("invalid record tag")).into();
                    }

                    this.buffer.truncate(length);
                    this.state = ReadState::BufferedData { pos: 0 };
                }
                ReadState::BufferedData { ref mut pos } => {
                    if *pos < this.buffer.len() {
                        let buffered = &this.buffer[*pos..];

                        let consumed = usize::min(buffered.len(), buf.remaining());
                        buf.put_slice(&buffered[..consumed]);

                        *pos += consumed;

                        return Ok(()).into();
                    }

                    this.reset_buffer();
                    this.state = ReadState::ReadHeaderChunk;
                }
            }
        }
    }
}

enum WriteState {
    CollectHeader,
    CollectBody { passthrough: bool, remaining: usize },
    Writing { pos: usize },
}

/// Writer half of the TLS reframer
///
/// The caller's writes must form a valid TLS record stream; the writer
/// re-frames it record by record, one underlying write per record. This is
/// the state-machine equivalent of a pipe-driven reframer loop: instead of a
/// background task doing structured reads from a pipe, the state machine is
/// driven directly by `poll_write`.
pub struct TlsReframedWriter<S> {
    stream: S,
    cipher: Cipher,
    state: WriteState,
    header: [u8; TLS_RECORD_HEADER_LENGTH],
    header_filled: usize,
    buffer: BytesMut,
}

impl<S> TlsReframedWriter<S> {
    /// Create a writer over `stream`
    pub fn new(stream: S, cipher: Cipher) -> Self {
        debug_assert_eq!(cipher.tag_len(), 16, "reframing requires an AEAD cipher");
        Self {
            stream,
            cipher,
            state: WriteState::CollectHeader,
            header: [0u8; TLS_RECORD_HEADER_LENGTH],
            header_filled: 0,
            buffer: BytesMut::new(),
        }
    }

    /// Consume and return the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Stage `enc(header) || tag` into the output buffer
    fn encrypt_header_chunk(&mut self) {
        debug_assert!(self.buffer.is_empty());
        self.buffer.reserve(TLS_ENCRYPTED_LENGTH_CHUNK_LENGTH);
        self.buffer.put_slice(&self.header);
        self.buffer.resize(TLS_ENCRYPTED_LENGTH_CHUNK_LENGTH, 0);
        self.cipher.encrypt_packet(&mut self.buffer[..]);
    }

    /// Seal the plaintext body staged after the header chunk
    fn encrypt_body_chunk(&mut self) {
        let start = TLS_ENCRYPTED_LENGTH_CHUNK_LENGTH;
        let body_len = self.buffer.len() - start;
        self.buffer.resize(start + body_len + 16, 0);
        self.cipher.encrypt_packet(&mut self.buffer[start..]);
    }
}

impl<S> AsyncWrite for TlsReframedWriter<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut consumed = 0;

        loop {
            match this.state {
                WriteState::CollectHeader => {
                    let want = TLS_RECORD_HEADER_LENGTH - this.header_filled;
                    let take = usize::min(want, buf.len() - consumed);
                    this.header[this.header_filled..this.header_filled + take]
                        .copy_from_slice(&buf[consumed..consumed + take]);
                    this.header_filled += take;
                    consumed += take;

                    if this.header_filled < TLS_RECORD_HEADER_LENGTH {
                        // Caller's buffer exhausted mid-header
                        return Ok(consumed).into();
                    }

                    let record_type = this.header[0];
                    let length = u16::from_be_bytes([this.header[3], this.header[4]]) as usize;

                    this.encrypt_header_chunk();
                    this.state = WriteState::CollectBody {
                        passthrough: record_type == RECORD_TYPE_APPLICATION_DATA,
                        remaining: length,
                    };
                }
                WriteState::CollectBody {
                    passthrough,
                    ref mut remaining,
                } => {
                    let take = usize::min(*remaining, buf.len() - consumed);
                    this.buffer.extend_from_slice(&buf[consumed..consumed + take]);
                    consumed += take;
                    *remaining -= take;

                    if *remaining > 0 {
                        // Record body incomplete, wait for more caller data
                        return Ok(consumed).into();
                    }

                    if !passthrough {
                        this.encrypt_body_chunk();
                    }
                    this.state = WriteState::Writing { pos: 0 };
                }
                WriteState::Writing { ref mut pos } => {
                    while *pos < this.buffer.len() {
                        match Pin::new(&mut this.stream).poll_write(cx, &this.buffer[*pos..]) {
                            Poll::Ready(Ok(0)) => return Err(io::Error::from(ErrorKind::UnexpectedEof)).into(),
                            Poll::Ready(Ok(n)) => *pos += n,
                            Poll::Ready(Err(err)) => return Err(err).into(),
                            Poll::Pending => {
                                // The record is staged; report what was taken
                                // so the caller does not resubmit it
                                return if consumed > 0 { Ok(consumed).into() } else { Poll::Pending };
                            }
                        }
                    }

                    this.buffer.clear();
                    this.header_filled = 0;
                    this.state = WriteState::CollectHeader;

                    if consumed == buf.len() {
                        return Ok(consumed).into();
                    }
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Finish writing a fully staged record first
        if let WriteState::Writing { ref mut pos } = this.state {
            while *pos < this.buffer.len() {
                let n = ready!(Pin::new(&mut this.stream).poll_write(cx, &this.buffer[*pos..]))?;
                if n == 0 {
                    return Err(io::Error::from(ErrorKind::UnexpectedEof)).into();
                }
                *pos += n;
            }

            this.buffer.clear();
            this.header_filled = 0;
            this.state = WriteState::CollectHeader;
        }

        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_detection() {
        assert!(is_tls_handshake(&[22, 0x03, 0x01, 0x00, 0x05]));
        assert!(is_tls_handshake(&[22, 0x03, 0x03, 0x01, 0x00]));
        // TLS 1.1 and 1.3 record versions are not used by ClientHello
        assert!(!is_tls_handshake(&[22, 0x03, 0x02, 0x00, 0x05]));
        assert!(!is_tls_handshake(&[22, 0x03, 0x04, 0x00, 0x05]));
        assert!(!is_tls_handshake(&[23, 0x03, 0x03, 0x00, 0x05]));
        assert!(!is_tls_handshake(&[22, 0x03]));
    }

    #[test]
    fn chunk_end_scanning() {
        // one full record of 3 data bytes then a truncated header
        let payload = [22, 3, 1, 0, 3, 0xaa, 0xbb, 0xcc, 23, 3];
        assert_eq!(read_tls_chunk_end(&payload), 8);

        // record body longer than the buffer
        let payload = [22, 3, 1, 0, 9, 0xaa];
        assert_eq!(read_tls_chunk_end(&payload), 0);

        // two adjacent records
        let payload = [22, 3, 1, 0, 1, 0xaa, 23, 3, 3, 0, 0];
        assert_eq!(read_tls_chunk_end(&payload), payload.len());
    }
}
