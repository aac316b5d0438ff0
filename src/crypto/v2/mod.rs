//! AEAD 2022 cipher construction
//!
//! Session subkeys and identity subkeys are both derived with the keyed
//! BLAKE3 `derive_key` mode; identity headers are single AES blocks.

use aes::{
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit},
    Aes128, Aes256, Block,
};
use bytes::Bytes;

pub mod tcp;
pub mod udp;

pub use self::{tcp::TcpCipher, udp::UdpCipher};

/// BLAKE3 derive_key context for per-session subkeys
pub const SESSION_SUBKEY_CONTEXT: &str = "shadowsocks 2022 session subkey";

/// BLAKE3 derive_key context for identity-header subkeys
pub const IDENTITY_SUBKEY_CONTEXT: &str = "shadowsocks 2022 identity subkey";

/// Identity header length, one AES block
pub const IDENTITY_HEADER_LENGTH: usize = 16;

/// `blake3::derive_key` over `materials` concatenated, filling `okm`
///
/// `okm` may be shorter or longer than 32 bytes; the XOF is read directly.
pub fn blake3_derive_key(context: &str, materials: &[&[u8]], okm: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for m in materials {
        hasher.update(m);
    }
    hasher.finalize_xof().fill(okm);
}

/// Reduce an oversized PSK to `key_len` bytes through the BLAKE3 XOF
pub fn stretch_key(psk: &[u8], key_len: usize) -> Bytes {
    let mut out = vec![0u8; key_len];
    let mut hasher = blake3::Hasher::new();
    hasher.update(psk);
    hasher.finalize_xof().fill(&mut out);
    Bytes::from(out)
}

/// Identity hash of a user PSK, the key of the multi-user table
pub fn identity_hash(psk: &[u8]) -> Bytes {
    let hash = blake3::hash(psk);
    Bytes::copy_from_slice(&hash.as_bytes()[..IDENTITY_HEADER_LENGTH])
}

/// AES block cipher used for encrypting identity headers
///
/// Keyed either by a raw PSK (UDP headers) or by a derived identity subkey
/// (TCP headers); the key length picks the AES variant.
#[derive(Clone)]
pub enum IdentityCipher {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl IdentityCipher {
    /// Create a block cipher from a 16- or 32-byte key
    pub fn new(key: &[u8]) -> Self {
        match key.len() {
            16 => Self::Aes128(Aes128::new_from_slice(key).expect("AES-128 init")),
            32 => Self::Aes256(Aes256::new_from_slice(key).expect("AES-256 init")),
            len => unreachable!("identity cipher key length {len}"),
        }
    }

    /// Encrypt one 16-byte block in place
    pub fn encrypt_block(&self, block: &mut [u8]) {
        let block = Block::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }

    /// Decrypt one 16-byte block in place
    pub fn decrypt_block(&self, block: &mut [u8]) {
        let block = Block::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.decrypt_block(block),
            Self::Aes256(c) => c.decrypt_block(block),
        }
    }
}

/// Derive the identity subkey for `psk` under `salt` and build its AES cipher
pub fn identity_subkey_cipher(psk: &[u8], salt: &[u8]) -> IdentityCipher {
    let mut subkey = [0u8; 32];
    let subkey = &mut subkey[..psk.len()];
    blake3_derive_key(IDENTITY_SUBKEY_CONTEXT, &[psk, salt], subkey);
    IdentityCipher::new(subkey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic() {
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        blake3_derive_key(SESSION_SUBKEY_CONTEXT, &[b"key", b"salt"], &mut a);
        blake3_derive_key(SESSION_SUBKEY_CONTEXT, &[b"keysalt"], &mut b);
        // concatenation of materials is what is keyed, not their boundaries
        assert_eq!(a, b);

        let mut c = [0u8; 16];
        blake3_derive_key(IDENTITY_SUBKEY_CONTEXT, &[b"key", b"salt"], &mut c);
        assert_ne!(a, c);
    }

    #[test]
    fn stretch_key_lengths() {
        let psk = [0xabu8; 64];
        let k16 = stretch_key(&psk, 16);
        let k32 = stretch_key(&psk, 32);
        assert_eq!(k16.len(), 16);
        assert_eq!(k32.len(), 32);
        // XOF prefix property
        assert_eq!(&k32[..16], &k16[..]);
    }

    #[test]
    fn identity_block_round_trip() {
        let cipher = IdentityCipher::new(&[7u8; 16]);
        let mut block = *b"0123456789abcdef";
        let plain = block;
        cipher.encrypt_block(&mut block);
        assert_ne!(block, plain);
        cipher.decrypt_block(&mut block);
        assert_eq!(block, plain);
    }

    #[test]
    fn identity_hash_is_16_bytes() {
        let hash = identity_hash(&[1u8; 16]);
        assert_eq!(hash.len(), IDENTITY_HEADER_LENGTH);
        assert_ne!(hash, identity_hash(&[2u8; 16]));
    }
}
