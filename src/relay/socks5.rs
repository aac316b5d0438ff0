//! SOCKS5-style address serialization (RFC 1928 §5)
//!
//! The address format is used verbatim inside the encrypted channel as the
//! first bytes of every session's payload.

use std::{
    fmt::{self, Debug, Display, Formatter},
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    str::FromStr,
};

use bytes::BufMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[rustfmt::skip]
mod consts {
    pub const SOCKS5_ADDR_TYPE_IPV4:        u8 = 0x01;
    pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
    pub const SOCKS5_ADDR_TYPE_IPV6:        u8 = 0x04;
}

/// SOCKS5 address error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("address type {0:#x} not supported")]
    AddressTypeNotSupported(u8),
    #[error("domain name is not valid UTF-8")]
    AddressDomainInvalidEncoding,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::IoError(err) => err,
            e => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}

/// A destination address, either a socket address or a named host
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Socket address (IP + port)
    SocketAddress(SocketAddr),
    /// Domain name + port
    DomainNameAddress(String, u16),
}

impl Address {
    /// Read an address from `stream`
    ///
    /// ```plain
    /// +------+----------+----------+
    /// | ATYP | DST.ADDR | DST.PORT |
    /// +------+----------+----------+
    /// |  1   | Variable |    2     |
    /// +------+----------+----------+
    /// ```
    pub async fn read_from<R>(stream: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = stream.read_u8().await?;

        match atyp {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                let mut buf = [0u8; 6];
                stream.read_exact(&mut buf).await?;

                let addr = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(Self::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))))
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                let mut buf = [0u8; 18];
                stream.read_exact(&mut buf).await?;

                let mut segments = [0u16; 8];
                for (i, seg) in segments.iter_mut().enumerate() {
                    *seg = u16::from_be_bytes([buf[i * 2], buf[i * 2 + 1]]);
                }
                let addr = Ipv6Addr::from(segments);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok(Self::SocketAddress(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))))
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                let domain_len = stream.read_u8().await? as usize;
                let mut buf = vec![0u8; domain_len + 2];
                stream.read_exact(&mut buf).await?;

                let port = u16::from_be_bytes([buf[domain_len], buf[domain_len + 1]]);
                buf.truncate(domain_len);

                let domain = String::from_utf8(buf).map_err(|_| Error::AddressDomainInvalidEncoding)?;
                Ok(Self::DomainNameAddress(domain, port))
            }
            _ => Err(Error::AddressTypeNotSupported(atyp)),
        }
    }

    /// Write the address into `buf`
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Self::SocketAddress(SocketAddr::V4(ref addr)) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::SocketAddress(SocketAddr::V6(ref addr)) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV6);
                for seg in &addr.ip().segments() {
                    buf.put_u16(*seg);
                }
                buf.put_u16(addr.port());
            }
            Self::DomainNameAddress(ref domain, port) => {
                assert!(domain.len() <= u8::MAX as usize, "domain name longer than 255 bytes");
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(port);
            }
        }
    }

    /// Serialized length in bytes
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match *self {
            Self::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Self::SocketAddress(SocketAddr::V6(..)) => 1 + 8 * 2 + 2,
            Self::DomainNameAddress(ref domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Maximum serialized length of any address
    pub const fn max_serialized_len() -> usize {
        1 + 1 + u8::MAX as usize + 2
    }

    /// Port of the address
    pub fn port(&self) -> u16 {
        match *self {
            Self::SocketAddress(ref addr) => addr.port(),
            Self::DomainNameAddress(_, port) => port,
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Self::SocketAddress(ref addr) => write!(f, "{addr}"),
            Self::DomainNameAddress(ref domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::SocketAddress(addr)
    }
}

impl From<(String, u16)> for Address {
    fn from((domain, port): (String, u16)) -> Self {
        Self::DomainNameAddress(domain, port)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Self::DomainNameAddress(domain.to_owned(), port)
    }
}

impl From<&Address> for Address {
    fn from(addr: &Address) -> Self {
        addr.clone()
    }
}

/// Parse `Address` error
#[derive(Debug)]
pub struct AddressError;

impl Display for AddressError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("invalid Address")
    }
}

impl std::error::Error for AddressError {}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, AddressError> {
        match s.parse::<SocketAddr>() {
            Ok(addr) => Ok(Self::SocketAddress(addr)),
            Err(..) => {
                let mut sp = s.split(':');
                match (sp.next(), sp.next()) {
                    (Some(domain), Some(port)) => match port.parse::<u16>() {
                        Ok(port) => Ok(Self::DomainNameAddress(domain.to_owned(), port)),
                        Err(..) => Err(AddressError),
                    },
                    _ => Err(AddressError),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;

    async fn round_trip(addr: Address) {
        let mut buf = BytesMut::with_capacity(addr.serialized_len());
        addr.write_to_buf(&mut buf);
        assert_eq!(buf.len(), addr.serialized_len());

        let mut cursor = Cursor::new(buf.freeze());
        let parsed = Address::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn address_round_trips() {
        round_trip("127.0.0.1:1080".parse::<Address>().unwrap()).await;
        round_trip("[::1]:8080".parse::<Address>().unwrap()).await;
        round_trip("example.com:443".parse::<Address>().unwrap()).await;
    }

    #[tokio::test]
    async fn rejects_unknown_address_type() {
        let mut cursor = Cursor::new(vec![0x05u8, 0, 0, 0]);
        match Address::read_from(&mut cursor).await {
            Err(Error::AddressTypeNotSupported(0x05)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_domain_with_port() {
        match "test.com:443".parse::<Address>().unwrap() {
            Address::DomainNameAddress(domain, 443) => assert_eq!(domain, "test.com"),
            other => panic!("unexpected {other}"),
        }
    }
}
