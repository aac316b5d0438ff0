//! AEAD 2022 request header
//!
//! ```plain
//! +-------+-------+-------+-------+-------+-------+-------+-------+-------+
//! | ADDR (Variable ...)
//! +-------+-------+-------+-------+-------+-------+-------+-------+-------+
//! | PADDING SIZE  | PADDING (Variable ...)
//! +-------+-------+-------+-------+-------+-------+-------+-------+-------+
//! ```

use std::io;

use bytes::BufMut;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::relay::socks5::Address;

/// Maximum padding length
pub const MAX_PADDING_SIZE: usize = 900;

/// Stream (client & server) timestamp max difference (abs), seconds
pub const SERVER_STREAM_TIMESTAMP_MAX_DIFF: u64 = 30;

/// Padding length for a request carrying `payload`
///
/// A request without payload MUST carry random padding.
pub fn get_padding_size(payload: &[u8]) -> usize {
    if payload.is_empty() {
        rand::thread_rng().gen_range(1..=MAX_PADDING_SIZE)
    } else {
        0
    }
}

/// AEAD 2022 TCP request header
#[derive(Debug, Clone)]
pub struct Aead2022TcpRequestHeader {
    pub addr: Address,
    pub padding_size: u16,
}

impl Aead2022TcpRequestHeader {
    /// Read the header, discarding the padding
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let addr = Address::read_from(reader).await?;

        let mut padding_size_buffer = [0u8; 2];
        reader.read_exact(&mut padding_size_buffer).await?;

        let padding_size = u16::from_be_bytes(padding_size_buffer);
        if padding_size > 0 {
            let mut remaining = padding_size as usize;
            let mut buffer = [0u8; 64];
            while remaining > 0 {
                let chunk = remaining.min(buffer.len());
                reader.read_exact(&mut buffer[..chunk]).await?;
                remaining -= chunk;
            }
        }

        Ok(Self { addr, padding_size })
    }

    /// Write the header, filling the padding with random bytes
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        Aead2022TcpRequestHeaderRef {
            addr: &self.addr,
            padding_size: self.padding_size,
        }
        .write_to_buf(buf)
    }

    /// Serialized length in bytes
    pub fn serialized_len(&self) -> usize {
        self.addr.serialized_len() + 2 + self.padding_size as usize
    }
}

/// Borrowed form of [`Aead2022TcpRequestHeader`] for assembling requests
#[derive(Debug)]
pub struct Aead2022TcpRequestHeaderRef<'a> {
    pub addr: &'a Address,
    pub padding_size: u16,
}

impl Aead2022TcpRequestHeaderRef<'_> {
    /// Write the header, filling the padding with random bytes
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        assert!(
            self.padding_size as usize <= MAX_PADDING_SIZE,
            "padding length must be in [0, {MAX_PADDING_SIZE}]"
        );

        self.addr.write_to_buf(buf);
        buf.put_u16(self.padding_size);

        if self.padding_size > 0 {
            let mut padding = [0u8; MAX_PADDING_SIZE];
            let padding = &mut padding[..self.padding_size as usize];
            rand::thread_rng().fill(padding);
            buf.put_slice(padding);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;

    #[tokio::test]
    async fn header_round_trip_with_padding() {
        let header = Aead2022TcpRequestHeader {
            addr: "test.com:443".parse().unwrap(),
            padding_size: 128,
        };

        let mut buf = BytesMut::new();
        header.write_to_buf(&mut buf);
        assert_eq!(buf.len(), header.serialized_len());

        let mut cursor = Cursor::new(buf.freeze());
        let parsed = Aead2022TcpRequestHeader::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed.addr, header.addr);
        assert_eq!(parsed.padding_size, 128);
    }

    #[test]
    fn empty_payload_requires_padding() {
        let size = get_padding_size(b"");
        assert!(size >= 1 && size <= MAX_PADDING_SIZE);
        assert_eq!(get_padding_size(b"data"), 0);
    }
}
