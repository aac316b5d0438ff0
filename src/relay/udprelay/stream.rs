//! Shadowsocks UDP stream protocol
//!
//! ```plain
//! +-------+----------------------------+
//! |  IV   | Stream(Address + Payload)  |
//! +-------+----------------------------+
//! | Fixed | Variable                   |
//! +-------+----------------------------+
//! ```

use std::io::Cursor;

use byte_string::ByteStr;
use bytes::{BufMut, BytesMut};
use log::trace;

use crate::{
    context::Context,
    crypto::{v1::Cipher, CipherKind},
    relay::socks5::{Address, Error as Socks5Error},
};

/// Stream protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("packet too short for iv, at least {0} bytes, but only {1} bytes")]
    PacketTooShortForIv(usize, usize),
    #[error("invalid address in packet, {0}")]
    InvalidAddress(Socks5Error),
}

/// Stream protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Encrypt a UDP stream protocol packet
pub fn encrypt_payload_stream(
    context: &Context,
    method: CipherKind,
    key: &[u8],
    addr: &Address,
    payload: &[u8],
    dst: &mut BytesMut,
) {
    let iv_len = method.iv_len();

    // Packet = IV + STREAM(ADDRESS + PAYLOAD)
    dst.reserve(iv_len + addr.serialized_len() + payload.len());

    dst.resize(iv_len, 0);
    if iv_len > 0 {
        let iv = &mut dst[..iv_len];
        context.generate_nonce(method, iv, false);
        trace!("UDP packet generated stream iv {:?}", ByteStr::new(iv));
    }

    let mut cipher = {
        let iv = &dst[..iv_len];
        Cipher::new(method, key, iv)
    };

    addr.write_to_buf(dst);
    dst.put_slice(payload);

    cipher.encrypt_packet(&mut dst[iv_len..]);
}

/// Decrypt a UDP stream protocol packet in place
///
/// Returns the payload length; the payload is moved to the front of `payload`.
pub async fn decrypt_payload_stream(
    _context: &Context,
    method: CipherKind,
    key: &[u8],
    payload: &mut [u8],
) -> ProtocolResult<(usize, Address)> {
    let plen = payload.len();
    let iv_len = method.iv_len();
    if plen < iv_len {
        return Err(ProtocolError::PacketTooShortForIv(iv_len, plen));
    }

    let (iv, data) = payload.split_at_mut(iv_len);

    trace!("UDP packet got stream IV {:?}", ByteStr::new(iv));
    let mut cipher = Cipher::new(method, key, iv);

    let _ = cipher.decrypt_packet(data);

    let (dn, addr) = parse_packet(data).await?;

    let data_start_idx = iv_len + dn;
    let data_length = plen - data_start_idx;
    payload.copy_within(data_start_idx.., 0);

    Ok((data_length, addr))
}

async fn parse_packet(buf: &[u8]) -> ProtocolResult<(usize, Address)> {
    let mut cur = Cursor::new(buf);
    match Address::read_from(&mut cur).await {
        Ok(address) => {
            let pos = cur.position() as usize;
            Ok((pos, address))
        }
        Err(err) => Err(ProtocolError::InvalidAddress(err)),
    }
}
