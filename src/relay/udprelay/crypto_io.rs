//! Crypto protocol for shadowsocks UDP
//!
//! Per-datagram encryption/decryption, dispatching between the families:
//!
//! ```plain
//! stream:    IV   || Stream(Address + Payload)
//! AEAD:      SALT || AEAD(Address + Payload) || TAG
//! AEAD 2022: AES-ECB(SessionID || PacketID) || [EIH] || AEAD(Header + Address + Payload)
//! ```

use std::io::{self, Cursor};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    config::ServerUserManager,
    context::Context,
    crypto::{CipherCategory, CipherKind},
    relay::socks5::Address,
};

use super::{
    aead::{decrypt_payload_aead, encrypt_payload_aead},
    aead_2022::{
        decrypt_client_payload_aead_2022, decrypt_server_payload_aead_2022, encrypt_client_payload_aead_2022,
        encrypt_server_payload_aead_2022,
    },
    options::UdpSocketControlData,
    stream::{decrypt_payload_stream, encrypt_payload_stream},
};

/// UDP shadowsocks protocol error
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

/// UDP shadowsocks protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::IoError(err) => err,
            e => Self::new(io::ErrorKind::Other, e),
        }
    }
}

/// Encrypt a `Client -> Server` datagram
#[allow(clippy::too_many_arguments)]
pub fn encrypt_client_payload(
    context: &Context,
    method: CipherKind,
    key: &[u8],
    addr: &Address,
    control: &UdpSocketControlData,
    identity_keys: &[Bytes],
    payload: &[u8],
    dst: &mut BytesMut,
) {
    match method.category() {
        CipherCategory::None => {
            dst.reserve(addr.serialized_len() + payload.len());
            addr.write_to_buf(dst);
            dst.put_slice(payload);
        }
        CipherCategory::Stream => encrypt_payload_stream(context, method, key, addr, payload, dst),
        CipherCategory::Aead => encrypt_payload_aead(context, method, key, addr, payload, dst),
        CipherCategory::Aead2022 => {
            encrypt_client_payload_aead_2022(context, method, key, addr, control, identity_keys, payload, dst)
        }
    }
}

/// Encrypt a `Server -> Client` datagram
pub fn encrypt_server_payload(
    context: &Context,
    method: CipherKind,
    key: &[u8],
    addr: &Address,
    control: &UdpSocketControlData,
    payload: &[u8],
    dst: &mut BytesMut,
) {
    match method.category() {
        CipherCategory::None => {
            dst.reserve(addr.serialized_len() + payload.len());
            addr.write_to_buf(dst);
            dst.put_slice(payload);
        }
        CipherCategory::Stream => encrypt_payload_stream(context, method, key, addr, payload, dst),
        CipherCategory::Aead => encrypt_payload_aead(context, method, key, addr, payload, dst),
        CipherCategory::Aead2022 => encrypt_server_payload_aead_2022(context, method, key, addr, control, payload, dst),
    }
}

/// Decrypt a `Client -> Server` datagram in place
///
/// Returns the payload length (moved to the front of `payload`), the
/// destination address, and session control data for AEAD 2022 methods.
pub async fn decrypt_client_payload(
    context: &Context,
    method: CipherKind,
    key: &[u8],
    user_manager: Option<&ServerUserManager>,
    payload: &mut [u8],
) -> ProtocolResult<(usize, Address, Option<UdpSocketControlData>)> {
    match method.category() {
        CipherCategory::None => {
            let (n, addr) = parse_plain_packet(payload).await?;
            Ok((n, addr, None))
        }
        CipherCategory::Stream => decrypt_payload_stream(context, method, key, payload)
            .await
            .map(|(n, a)| (n, a, None))
            .map_err(Into::into),
        CipherCategory::Aead => decrypt_payload_aead(context, method, key, payload)
            .await
            .map(|(n, a)| (n, a, None))
            .map_err(Into::into),
        CipherCategory::Aead2022 => decrypt_client_payload_aead_2022(context, method, key, user_manager, payload)
            .await
            .map(|(n, a, c)| (n, a, Some(c)))
            .map_err(Into::into),
    }
}

/// Decrypt a `Server -> Client` datagram in place
pub async fn decrypt_server_payload(
    context: &Context,
    method: CipherKind,
    key: &[u8],
    payload: &mut [u8],
) -> ProtocolResult<(usize, Address, Option<UdpSocketControlData>)> {
    match method.category() {
        CipherCategory::None => {
            let (n, addr) = parse_plain_packet(payload).await?;
            Ok((n, addr, None))
        }
        CipherCategory::Stream => decrypt_payload_stream(context, method, key, payload)
            .await
            .map(|(n, a)| (n, a, None))
            .map_err(Into::into),
        CipherCategory::Aead => decrypt_payload_aead(context, method, key, payload)
            .await
            .map(|(n, a)| (n, a, None))
            .map_err(Into::into),
        CipherCategory::Aead2022 => decrypt_server_payload_aead_2022(context, method, key, payload)
            .await
            .map(|(n, a, c)| (n, a, Some(c)))
            .map_err(Into::into),
    }
}

async fn parse_plain_packet(payload: &mut [u8]) -> ProtocolResult<(usize, Address)> {
    let mut cur = Cursor::new(&payload[..]);
    match Address::read_from(&mut cur).await {
        Ok(address) => {
            let pos = cur.position() as usize;
            let len = payload.len() - pos;
            payload.copy_within(pos.., 0);
            Ok((len, address))
        }
        Err(..) => {
            let err = io::Error::new(io::ErrorKind::InvalidData, "parse udp packet Address failed");
            Err(err.into())
        }
    }
}
