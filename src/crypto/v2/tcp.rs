//! AEAD 2022 TCP session cipher

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes128Gcm, Aes256Gcm,
};

use crate::crypto::{kind::CipherKind, utils::increase_nonce};

use super::{blake3_derive_key, SESSION_SUBKEY_CONTEXT};

enum TcpCipherVariant {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
}

/// Per-direction AEAD 2022 TCP cipher with a little-endian nonce counter
pub struct TcpCipher {
    cipher: TcpCipherVariant,
    nonce: [u8; 12],
    kind: CipherKind,
}

impl TcpCipher {
    /// Create a cipher keyed by `blake3_derive_key(session context, key ‖ salt)`
    pub fn new(kind: CipherKind, key: &[u8], salt: &[u8]) -> Self {
        let mut subkey = [0u8; 32];
        let subkey = &mut subkey[..kind.key_len()];
        blake3_derive_key(SESSION_SUBKEY_CONTEXT, &[key, salt], subkey);

        let cipher = match kind {
            CipherKind::AEAD2022_BLAKE3_AES_128_GCM => {
                TcpCipherVariant::Aes128Gcm(Aes128Gcm::new_from_slice(subkey).expect("AES-128-GCM init"))
            }
            CipherKind::AEAD2022_BLAKE3_AES_256_GCM => {
                TcpCipherVariant::Aes256Gcm(Aes256Gcm::new_from_slice(subkey).expect("AES-256-GCM init"))
            }
            _ => unreachable!("{kind} is not an AEAD 2022 cipher"),
        };

        Self {
            cipher,
            nonce: [0u8; 12],
            kind,
        }
    }

    /// AEAD tag length
    pub fn tag_len(&self) -> usize {
        self.kind.tag_len()
    }

    /// Seal `m` in place; the trailing `tag_len` bytes receive the tag
    pub fn encrypt_packet(&mut self, m: &mut [u8]) {
        let (data, tag_out) = m.split_at_mut(m.len() - self.kind.tag_len());
        let nonce = aes_gcm::Nonce::from_slice(&self.nonce);

        let tag = match self.cipher {
            TcpCipherVariant::Aes128Gcm(ref c) => {
                c.encrypt_in_place_detached(nonce, &[], data).expect("AES-128-GCM seal")
            }
            TcpCipherVariant::Aes256Gcm(ref c) => {
                c.encrypt_in_place_detached(nonce, &[], data).expect("AES-256-GCM seal")
            }
        };
        tag_out.copy_from_slice(&tag);

        increase_nonce(&mut self.nonce);
    }

    /// Open `m` in place, returning `false` on authentication failure
    #[must_use]
    pub fn decrypt_packet(&mut self, m: &mut [u8]) -> bool {
        let (data, tag) = m.split_at_mut(m.len() - self.kind.tag_len());
        let nonce = aes_gcm::Nonce::from_slice(&self.nonce);

        let result = match self.cipher {
            TcpCipherVariant::Aes128Gcm(ref c) => {
                c.decrypt_in_place_detached(nonce, &[], data, aes_gcm::Tag::from_slice(tag))
            }
            TcpCipherVariant::Aes256Gcm(ref c) => {
                c.decrypt_in_place_detached(nonce, &[], data, aes_gcm::Tag::from_slice(tag))
            }
        };

        increase_nonce(&mut self.nonce);

        result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_cipher_round_trip() {
        for kind in [
            CipherKind::AEAD2022_BLAKE3_AES_128_GCM,
            CipherKind::AEAD2022_BLAKE3_AES_256_GCM,
        ] {
            let key = vec![0x11u8; kind.key_len()];
            let salt = vec![0x22u8; kind.salt_len()];

            let mut enc = TcpCipher::new(kind, &key, &salt);
            let mut dec = TcpCipher::new(kind, &key, &salt);

            for payload in [b"first chunk".as_slice(), b"second chunk"] {
                let mut m = payload.to_vec();
                m.resize(m.len() + kind.tag_len(), 0);
                enc.encrypt_packet(&mut m);
                assert!(dec.decrypt_packet(&mut m), "{kind}");
                assert_eq!(&m[..payload.len()], payload);
            }
        }
    }

    #[test]
    fn different_salts_give_disjoint_keystreams() {
        let kind = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
        let key = [0x33u8; 16];

        let mut a = TcpCipher::new(kind, &key, &[1u8; 16]);
        let mut b = TcpCipher::new(kind, &key, &[2u8; 16]);

        let mut ma = vec![0u8; 16 + 16];
        let mut mb = vec![0u8; 16 + 16];
        a.encrypt_packet(&mut ma);
        b.encrypt_packet(&mut mb);
        assert_ne!(ma, mb);
    }
}
