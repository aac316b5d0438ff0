//! Shadowsocks UDP AEAD 2022 protocol
//!
//! Client -> Server
//!
//! ```plain
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | AES-ECB(Client Session ID || Packet ID)                       |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | EIH (16 bytes per iPSK, multi-user only ...)
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | AEAD( TYPE | Timestamp | Padding Size | Padding | Address | Payload )
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! Server -> Client carries the client session id after the timestamp and
//! never has identity headers.
//!
//! The first 16 bytes double as the AEAD nonce source: bytes 4..16 of the
//! decrypted header block. The header block itself is encrypted with a
//! single AES block operation, keyed by the PSK (or the first iPSK when
//! identity headers are present).

use std::{
    cell::RefCell,
    io::{Cursor, Seek, SeekFrom},
    rc::Rc,
    time::{Duration, SystemTime},
};

use byte_string::ByteStr;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use lru_time_cache::LruCache;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    config::ServerUserManager,
    context::Context,
    crypto::{
        v2::{identity_hash, IdentityCipher, UdpCipher, IDENTITY_HEADER_LENGTH},
        CipherKind,
    },
    relay::socks5::{Address, Error as Socks5Error},
};

use super::options::UdpSocketControlData;

const CLIENT_SOCKET_TYPE: u8 = 0;
const SERVER_SOCKET_TYPE: u8 = 1;
const MAX_PADDING_SIZE: usize = 900;

/// Packet timestamp max difference (abs), seconds
pub const SERVER_PACKET_TIMESTAMP_MAX_DIFF: u64 = 30;

/// AEAD 2022 protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("packet too short, at least {0} bytes, but only {1} bytes")]
    PacketTooShort(usize, usize),
    // Authentication failures are indistinguishable from the outside
    #[error("invalid request")]
    DecryptError,
    #[error("invalid request")]
    InvalidUserIdentity,
    #[error("invalid socket type {0}")]
    InvalidSocketType(u8),
    #[error("packet with aged timestamp: {0}")]
    AgedTimestamp(u64),
    #[error("replayed packet nonce")]
    ReplayedNonce,
    #[error("invalid address in packet, {0}")]
    InvalidAddress(Socks5Error),
}

/// AEAD 2022 protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[inline]
pub fn get_now_timestamp() -> u64 {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => n.as_secs(),
        Err(..) => panic!("SystemTime::now() is before UNIX Epoch!"),
    }
}

thread_local! {
    static PADDING_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
    // Session ciphers are derived per (PSK, session id); cache them because a
    // busy association decrypts thousands of datagrams under the same pair.
    // The PSK pointer is stable, it lives in ServerConfig / ServerUser.
    static CIPHER_CACHE: RefCell<LruCache<(usize, u64), Rc<UdpCipher>>> =
        RefCell::new(LruCache::with_expiry_duration_and_capacity(Duration::from_secs(60), 10240));
}

fn get_cipher(method: CipherKind, key: &[u8], session_id: u64) -> Rc<UdpCipher> {
    CIPHER_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache
            .entry((key.as_ptr() as usize, session_id))
            .or_insert_with(|| Rc::new(UdpCipher::new(method, key, session_id)))
            .clone()
    })
}

#[inline]
fn get_padding_size(payload: &[u8]) -> usize {
    if payload.is_empty() {
        PADDING_RNG.with(|rng| rng.borrow_mut().gen::<usize>() % MAX_PADDING_SIZE)
    } else {
        0
    }
}

/// Length of the identity headers in a client packet
fn eih_total_len(identity_keys: &[Bytes], method: CipherKind) -> usize {
    if method.support_eih() {
        identity_keys.len() * IDENTITY_HEADER_LENGTH
    } else {
        0
    }
}

/// Encrypt a `Client -> Server` AEAD 2022 packet
pub fn encrypt_client_payload_aead_2022(
    context: &Context,
    method: CipherKind,
    key: &[u8],
    addr: &Address,
    control: &UdpSocketControlData,
    identity_keys: &[Bytes],
    payload: &[u8],
    dst: &mut BytesMut,
) {
    let _ = context;

    let padding_size = get_padding_size(payload);
    let eih_len = eih_total_len(identity_keys, method);

    dst.reserve(16 + eih_len + 1 + 8 + 2 + padding_size + addr.serialized_len() + payload.len() + method.tag_len());

    dst.put_u64(control.client_session_id);
    dst.put_u64(control.packet_id);

    let mut header_plain = [0u8; 16];
    header_plain.copy_from_slice(&dst[0..16]);

    if eih_len > 0 {
        for (i, ipsk) in identity_keys.iter().enumerate() {
            let next_key = match identity_keys.get(i + 1) {
                Some(next_ipsk) => next_ipsk.as_ref(),
                None => key,
            };

            let mut eih = [0u8; IDENTITY_HEADER_LENGTH];
            eih.copy_from_slice(&identity_hash(next_key));
            for (e, h) in eih.iter_mut().zip(header_plain.iter()) {
                *e ^= *h;
            }
            IdentityCipher::new(ipsk).encrypt_block(&mut eih);

            trace!("UDP packet assembled EIH {:?} for iPSK {}", ByteStr::new(&eih), i);
            dst.put_slice(&eih);
        }
    }

    dst.put_u8(CLIENT_SOCKET_TYPE);
    dst.put_u64(get_now_timestamp());
    dst.put_u16(padding_size as u16);
    if padding_size > 0 {
        let start = dst.len();
        dst.resize(start + padding_size, 0);
        PADDING_RNG.with(|rng| rng.borrow_mut().fill(&mut dst[start..]));
    }
    addr.write_to_buf(dst);
    dst.put_slice(payload);
    dst.resize(dst.len() + method.tag_len(), 0);

    // Seal the message with the session subkey, nonce from the header plaintext
    let nonce = {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&header_plain[4..16]);
        nonce
    };
    let cipher = get_cipher(method, key, control.client_session_id);
    cipher.encrypt_packet(&nonce, &mut dst[16 + eih_len..]);

    // [SessionID || PacketID] is one AES block, encrypted with the PSK
    // (the first iPSK when identity headers are present)
    let header_key: &[u8] = identity_keys.first().map_or(key, AsRef::as_ref);
    IdentityCipher::new(header_key).encrypt_block(&mut dst[0..16]);
}

/// Decrypt a `Client -> Server` AEAD 2022 packet in place
///
/// With a `user_manager` the packet must carry an identity header; the
/// matched user's key opens the message and `user_hash` is set in the
/// returned control data.
pub async fn decrypt_client_payload_aead_2022(
    context: &Context,
    method: CipherKind,
    key: &[u8],
    user_manager: Option<&ServerUserManager>,
    payload: &mut [u8],
) -> ProtocolResult<(usize, Address, UdpSocketControlData)> {
    let eih_len = match user_manager {
        Some(..) if method.support_eih() => IDENTITY_HEADER_LENGTH,
        _ => 0,
    };

    let tag_len = method.tag_len();
    let min_len = 16 + eih_len + 1 + 8 + 2 + tag_len;
    if payload.len() < min_len {
        return Err(ProtocolError::PacketTooShort(min_len, payload.len()));
    }

    // Open the header block
    let header_cipher = IdentityCipher::new(key);
    header_cipher.decrypt_block(&mut payload[0..16]);

    let mut header_plain = [0u8; 16];
    header_plain.copy_from_slice(&payload[0..16]);

    let client_session_id = u64::from_be_bytes(header_plain[0..8].try_into().expect("session id"));
    let packet_id = u64::from_be_bytes(header_plain[8..16].try_into().expect("packet id"));

    let mut control = UdpSocketControlData {
        client_session_id,
        server_session_id: 0,
        packet_id,
        user_hash: None,
    };

    let mut session_key: &[u8] = key;
    if eih_len > 0 {
        let manager = user_manager.expect("user manager");

        let mut eih = [0u8; IDENTITY_HEADER_LENGTH];
        eih.copy_from_slice(&payload[16..16 + IDENTITY_HEADER_LENGTH]);
        header_cipher.decrypt_block(&mut eih);
        for (e, h) in eih.iter_mut().zip(header_plain.iter()) {
            *e ^= *h;
        }

        match manager.get_user_by_hash(&eih) {
            Some(user) => {
                trace!("UDP packet matched EIH user {}", user.name());
                control.user_hash = Some(user.clone_identity_hash());
                session_key = user.key();
            }
            None => return Err(ProtocolError::InvalidUserIdentity),
        }
    }

    let nonce = {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&header_plain[4..16]);
        nonce
    };

    if context.check_nonce_and_set(method, &nonce) {
        return Err(ProtocolError::ReplayedNonce);
    }

    // Scoped so the cached cipher handle is released before awaiting
    {
        let cipher = get_cipher(method, session_key, client_session_id);
        let message = &mut payload[16 + eih_len..];
        if !cipher.decrypt_packet(&nonce, message) {
            return Err(ProtocolError::DecryptError);
        }
    }

    let data = &payload[16 + eih_len..payload.len() - tag_len];
    let mut cursor = Cursor::new(data);

    let socket_type = cursor.get_u8();
    if socket_type != CLIENT_SOCKET_TYPE {
        return Err(ProtocolError::InvalidSocketType(socket_type));
    }

    let timestamp = cursor.get_u64();
    let now = get_now_timestamp();
    if now.abs_diff(timestamp) > SERVER_PACKET_TIMESTAMP_MAX_DIFF {
        return Err(ProtocolError::AgedTimestamp(timestamp));
    }

    let padding_size = cursor.get_u16() as usize;
    if padding_size > 0 {
        cursor
            .seek(SeekFrom::Current(padding_size as i64))
            .map_err(|err| ProtocolError::InvalidAddress(Socks5Error::IoError(err)))?;
    }

    let addr = Address::read_from(&mut cursor).await.map_err(ProtocolError::InvalidAddress)?;

    let payload_start = 16 + eih_len + cursor.position() as usize;
    let payload_len = payload.len() - tag_len - payload_start;

    payload.copy_within(payload_start..payload_start + payload_len, 0);

    Ok((payload_len, addr, control))
}

/// Encrypt a `Server -> Client` AEAD 2022 packet
pub fn encrypt_server_payload_aead_2022(
    context: &Context,
    method: CipherKind,
    key: &[u8],
    addr: &Address,
    control: &UdpSocketControlData,
    payload: &[u8],
    dst: &mut BytesMut,
) {
    let _ = context;

    let padding_size = get_padding_size(payload);

    dst.reserve(16 + 1 + 8 + 8 + 2 + padding_size + addr.serialized_len() + payload.len() + method.tag_len());

    dst.put_u64(control.server_session_id);
    dst.put_u64(control.packet_id);

    let mut header_plain = [0u8; 16];
    header_plain.copy_from_slice(&dst[0..16]);

    dst.put_u8(SERVER_SOCKET_TYPE);
    dst.put_u64(get_now_timestamp());
    dst.put_u64(control.client_session_id);
    dst.put_u16(padding_size as u16);
    if padding_size > 0 {
        let start = dst.len();
        dst.resize(start + padding_size, 0);
        PADDING_RNG.with(|rng| rng.borrow_mut().fill(&mut dst[start..]));
    }
    addr.write_to_buf(dst);
    dst.put_slice(payload);
    dst.resize(dst.len() + method.tag_len(), 0);

    let nonce = {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&header_plain[4..16]);
        nonce
    };
    let cipher = get_cipher(method, key, control.server_session_id);
    cipher.encrypt_packet(&nonce, &mut dst[16..]);

    IdentityCipher::new(key).encrypt_block(&mut dst[0..16]);
}

/// Decrypt a `Server -> Client` AEAD 2022 packet in place
pub async fn decrypt_server_payload_aead_2022(
    context: &Context,
    method: CipherKind,
    key: &[u8],
    payload: &mut [u8],
) -> ProtocolResult<(usize, Address, UdpSocketControlData)> {
    let tag_len = method.tag_len();
    let min_len = 16 + 1 + 8 + 8 + 2 + tag_len;
    if payload.len() < min_len {
        return Err(ProtocolError::PacketTooShort(min_len, payload.len()));
    }

    IdentityCipher::new(key).decrypt_block(&mut payload[0..16]);

    let mut header_plain = [0u8; 16];
    header_plain.copy_from_slice(&payload[0..16]);

    let server_session_id = u64::from_be_bytes(header_plain[0..8].try_into().expect("session id"));
    let packet_id = u64::from_be_bytes(header_plain[8..16].try_into().expect("packet id"));

    let nonce = {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&header_plain[4..16]);
        nonce
    };

    if context.check_nonce_and_set(method, &nonce) {
        return Err(ProtocolError::ReplayedNonce);
    }

    // Scoped so the cached cipher handle is released before awaiting
    {
        let cipher = get_cipher(method, key, server_session_id);
        let message = &mut payload[16..];
        if !cipher.decrypt_packet(&nonce, message) {
            return Err(ProtocolError::DecryptError);
        }
    }

    let data = &payload[16..payload.len() - tag_len];
    let mut cursor = Cursor::new(data);

    let socket_type = cursor.get_u8();
    if socket_type != SERVER_SOCKET_TYPE {
        return Err(ProtocolError::InvalidSocketType(socket_type));
    }

    let timestamp = cursor.get_u64();
    let now = get_now_timestamp();
    if now.abs_diff(timestamp) > SERVER_PACKET_TIMESTAMP_MAX_DIFF {
        return Err(ProtocolError::AgedTimestamp(timestamp));
    }

    let client_session_id = cursor.get_u64();

    let padding_size = cursor.get_u16() as usize;
    if padding_size > 0 {
        cursor
            .seek(SeekFrom::Current(padding_size as i64))
            .map_err(|err| ProtocolError::InvalidAddress(Socks5Error::IoError(err)))?;
    }

    let control = UdpSocketControlData {
        client_session_id,
        server_session_id,
        packet_id,
        user_hash: None,
    };

    let addr = Address::read_from(&mut cursor).await.map_err(ProtocolError::InvalidAddress)?;

    let payload_start = 16 + cursor.position() as usize;
    let payload_len = payload.len() - tag_len - payload_start;

    payload.copy_within(payload_start..payload_start + payload_len, 0);

    Ok((payload_len, addr, control))
}
