//! AEAD 2022 UDP session cipher
//!
//! Every datagram is sealed independently; the key is derived from the PSK
//! and the 64-bit session id, and the nonce is carried in the packet header.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes128Gcm, Aes256Gcm,
};

use crate::crypto::kind::CipherKind;

use super::{blake3_derive_key, SESSION_SUBKEY_CONTEXT};

enum UdpCipherVariant {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
}

/// Per-session AEAD 2022 UDP cipher
pub struct UdpCipher {
    cipher: UdpCipherVariant,
    kind: CipherKind,
}

impl UdpCipher {
    /// Create a cipher keyed by `blake3_derive_key(session context, key ‖ session_id)`
    pub fn new(kind: CipherKind, key: &[u8], session_id: u64) -> Self {
        let mut subkey = [0u8; 32];
        let subkey = &mut subkey[..kind.key_len()];
        blake3_derive_key(SESSION_SUBKEY_CONTEXT, &[key, &session_id.to_be_bytes()], subkey);

        let cipher = match kind {
            CipherKind::AEAD2022_BLAKE3_AES_128_GCM => {
                UdpCipherVariant::Aes128Gcm(Aes128Gcm::new_from_slice(subkey).expect("AES-128-GCM init"))
            }
            CipherKind::AEAD2022_BLAKE3_AES_256_GCM => {
                UdpCipherVariant::Aes256Gcm(Aes256Gcm::new_from_slice(subkey).expect("AES-256-GCM init"))
            }
            _ => unreachable!("{kind} is not an AEAD 2022 cipher"),
        };

        Self { cipher, kind }
    }

    /// AEAD tag length
    pub fn tag_len(&self) -> usize {
        self.kind.tag_len()
    }

    /// Seal `m` in place with `nonce`; the trailing bytes receive the tag
    pub fn encrypt_packet(&self, nonce: &[u8], m: &mut [u8]) {
        let (data, tag_out) = m.split_at_mut(m.len() - self.kind.tag_len());
        let nonce = aes_gcm::Nonce::from_slice(nonce);

        let tag = match self.cipher {
            UdpCipherVariant::Aes128Gcm(ref c) => {
                c.encrypt_in_place_detached(nonce, &[], data).expect("AES-128-GCM seal")
            }
            UdpCipherVariant::Aes256Gcm(ref c) => {
                c.encrypt_in_place_detached(nonce, &[], data).expect("AES-256-GCM seal")
            }
        };
        tag_out.copy_from_slice(&tag);
    }

    /// Open `m` in place with `nonce`, returning `false` on failure
    #[must_use]
    pub fn decrypt_packet(&self, nonce: &[u8], m: &mut [u8]) -> bool {
        let (data, tag) = m.split_at_mut(m.len() - self.kind.tag_len());
        let nonce = aes_gcm::Nonce::from_slice(nonce);

        let result = match self.cipher {
            UdpCipherVariant::Aes128Gcm(ref c) => {
                c.decrypt_in_place_detached(nonce, &[], data, aes_gcm::Tag::from_slice(tag))
            }
            UdpCipherVariant::Aes256Gcm(ref c) => {
                c.decrypt_in_place_detached(nonce, &[], data, aes_gcm::Tag::from_slice(tag))
            }
        };

        result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_cipher_round_trip() {
        let kind = CipherKind::AEAD2022_BLAKE3_AES_256_GCM;
        let key = [0x44u8; 32];
        let cipher = UdpCipher::new(kind, &key, 0x1122334455667788);

        let nonce = [9u8; 12];
        let mut m = b"datagram payload".to_vec();
        m.resize(m.len() + kind.tag_len(), 0);

        cipher.encrypt_packet(&nonce, &mut m);
        assert!(cipher.decrypt_packet(&nonce, &mut m));
        assert_eq!(&m[..b"datagram payload".len()], b"datagram payload");
    }

    #[test]
    fn session_id_separates_keys() {
        let kind = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
        let key = [0x55u8; 16];
        let a = UdpCipher::new(kind, &key, 1);
        let b = UdpCipher::new(kind, &key, 2);

        let nonce = [0u8; 12];
        let mut m = vec![0u8; 8 + 16];
        a.encrypt_packet(&nonce, &mut m);
        assert!(!b.decrypt_packet(&nonce, &mut m));
    }
}
