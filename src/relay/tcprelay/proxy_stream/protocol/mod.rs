//! Request headers carried inside the encrypted channel

use std::io;

use tokio::io::AsyncRead;

use crate::{
    crypto::{CipherCategory, CipherKind},
    relay::socks5::Address,
};

pub mod v2;

use self::v2::Aead2022TcpRequestHeader;

/// The request header sent by a client after the handshake
#[derive(Debug, Clone)]
pub enum TcpRequestHeader {
    /// Stream / AEAD-1: just the destination address
    Stream(Address),
    /// AEAD 2022: address plus mandatory padding rules
    Aead2022(Aead2022TcpRequestHeader),
}

impl TcpRequestHeader {
    /// Read the request header matching `method` from `reader`
    pub async fn read_from<R: AsyncRead + Unpin>(method: CipherKind, reader: &mut R) -> io::Result<Self> {
        match method.category() {
            CipherCategory::Aead2022 => Ok(Self::Aead2022(Aead2022TcpRequestHeader::read_from(reader).await?)),
            _ => {
                let addr = Address::read_from(reader).await?;
                Ok(Self::Stream(addr))
            }
        }
    }

    /// Destination address of the request
    pub fn addr(self) -> Address {
        match self {
            Self::Stream(addr) => addr,
            Self::Aead2022(header) => header.addr,
        }
    }
}
