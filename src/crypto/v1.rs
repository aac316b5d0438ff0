//! Legacy cipher construction: stream ciphers and first-generation AEADs
//!
//! A `Cipher` owns the whole per-direction state: the keystream position for
//! stream methods, or the AEAD instance plus the little-endian nonce counter
//! for AEAD methods. It is created once per session direction from the master
//! key and the salt/IV exchanged at session start.

use aes::{
    cipher::{KeyInit, KeyIvInit, StreamCipher as _},
    Aes128, Aes192, Aes256,
};
use aes_gcm::{aead::AeadInPlace, Aes128Gcm, Aes256Gcm};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::{ChaCha20, XChaCha20};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use hkdf::Hkdf;
use md5::{Digest, Md5};
use rc4::Rc4;
use sha1::Sha1;

use super::{
    kind::{CipherCategory, CipherKind},
    utils::increase_nonce,
};

pub use super::utils::openssl_bytes_to_key;

/// HKDF info string for deriving AEAD session subkeys
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Maximum nonce length of any supported AEAD
const MAX_NONCE_LEN: usize = 24;

enum StreamCipherVariant {
    Aes128Ctr(ctr::Ctr128BE<Aes128>),
    Aes192Ctr(ctr::Ctr128BE<Aes192>),
    Aes256Ctr(ctr::Ctr128BE<Aes256>),
    // CFB enc/dec transforms differ, so both directions are instantiated and
    // only the one matching the actual data direction ever advances.
    Aes128Cfb(BufEncryptor<Aes128>, BufDecryptor<Aes128>),
    Aes192Cfb(BufEncryptor<Aes192>, BufDecryptor<Aes192>),
    Aes256Cfb(BufEncryptor<Aes256>, BufDecryptor<Aes256>),
    Rc4Md5(Rc4<rc4::consts::U16>),
    ChaCha20(ChaCha20),
    XChaCha20(XChaCha20),
}

impl StreamCipherVariant {
    fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> Self {
        match kind {
            CipherKind::AES_128_CTR => {
                Self::Aes128Ctr(ctr::Ctr128BE::new_from_slices(key, iv).expect("AES-128-CTR init"))
            }
            CipherKind::AES_192_CTR => {
                Self::Aes192Ctr(ctr::Ctr128BE::new_from_slices(key, iv).expect("AES-192-CTR init"))
            }
            CipherKind::AES_256_CTR => {
                Self::Aes256Ctr(ctr::Ctr128BE::new_from_slices(key, iv).expect("AES-256-CTR init"))
            }
            CipherKind::AES_128_CFB => Self::Aes128Cfb(
                BufEncryptor::new_from_slices(key, iv).expect("AES-128-CFB init"),
                BufDecryptor::new_from_slices(key, iv).expect("AES-128-CFB init"),
            ),
            CipherKind::AES_192_CFB => Self::Aes192Cfb(
                BufEncryptor::new_from_slices(key, iv).expect("AES-192-CFB init"),
                BufDecryptor::new_from_slices(key, iv).expect("AES-192-CFB init"),
            ),
            CipherKind::AES_256_CFB => Self::Aes256Cfb(
                BufEncryptor::new_from_slices(key, iv).expect("AES-256-CFB init"),
                BufDecryptor::new_from_slices(key, iv).expect("AES-256-CFB init"),
            ),
            CipherKind::RC4_MD5 => {
                // RC4 is keyed with md5(key || iv)
                let mut md5 = Md5::new();
                md5.update(key);
                md5.update(iv);
                let rc4_key = md5.finalize();
                Self::Rc4Md5(Rc4::new_from_slice(&rc4_key).expect("RC4-MD5 init"))
            }
            CipherKind::CHACHA20 => Self::ChaCha20(ChaCha20::new_from_slices(key, iv).expect("ChaCha20 init")),
            CipherKind::XCHACHA20 => Self::XChaCha20(XChaCha20::new_from_slices(key, iv).expect("XChaCha20 init")),
            _ => unreachable!("{kind} is not a stream cipher"),
        }
    }

    fn encrypt(&mut self, m: &mut [u8]) {
        match *self {
            Self::Aes128Ctr(ref mut c) => c.apply_keystream(m),
            Self::Aes192Ctr(ref mut c) => c.apply_keystream(m),
            Self::Aes256Ctr(ref mut c) => c.apply_keystream(m),
            Self::Aes128Cfb(ref mut enc, _) => enc.encrypt(m),
            Self::Aes192Cfb(ref mut enc, _) => enc.encrypt(m),
            Self::Aes256Cfb(ref mut enc, _) => enc.encrypt(m),
            Self::Rc4Md5(ref mut c) => c.apply_keystream(m),
            Self::ChaCha20(ref mut c) => c.apply_keystream(m),
            Self::XChaCha20(ref mut c) => c.apply_keystream(m),
        }
    }

    fn decrypt(&mut self, m: &mut [u8]) {
        match *self {
            Self::Aes128Ctr(ref mut c) => c.apply_keystream(m),
            Self::Aes192Ctr(ref mut c) => c.apply_keystream(m),
            Self::Aes256Ctr(ref mut c) => c.apply_keystream(m),
            Self::Aes128Cfb(_, ref mut dec) => dec.decrypt(m),
            Self::Aes192Cfb(_, ref mut dec) => dec.decrypt(m),
            Self::Aes256Cfb(_, ref mut dec) => dec.decrypt(m),
            Self::Rc4Md5(ref mut c) => c.apply_keystream(m),
            Self::ChaCha20(ref mut c) => c.apply_keystream(m),
            Self::XChaCha20(ref mut c) => c.apply_keystream(m),
        }
    }
}

enum AeadCipherVariant {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

struct AeadCipher {
    cipher: AeadCipherVariant,
    nonce: [u8; MAX_NONCE_LEN],
    nonce_len: usize,
}

impl AeadCipher {
    fn new(kind: CipherKind, key: &[u8], salt: &[u8]) -> Self {
        let mut subkey = [0u8; 32];
        let subkey = &mut subkey[..kind.key_len()];
        hkdf_sha1(key, salt, subkey);

        let cipher = match kind {
            CipherKind::AES_128_GCM => {
                AeadCipherVariant::Aes128Gcm(Aes128Gcm::new_from_slice(subkey).expect("AES-128-GCM init"))
            }
            CipherKind::AES_256_GCM => {
                AeadCipherVariant::Aes256Gcm(Aes256Gcm::new_from_slice(subkey).expect("AES-256-GCM init"))
            }
            CipherKind::CHACHA20_POLY1305 => AeadCipherVariant::ChaCha20Poly1305(
                ChaCha20Poly1305::new_from_slice(subkey).expect("ChaCha20-Poly1305 init"),
            ),
            CipherKind::XCHACHA20_POLY1305 => AeadCipherVariant::XChaCha20Poly1305(
                XChaCha20Poly1305::new_from_slice(subkey).expect("XChaCha20-Poly1305 init"),
            ),
            _ => unreachable!("{kind} is not an AEAD cipher"),
        };

        Self {
            cipher,
            nonce: [0u8; MAX_NONCE_LEN],
            nonce_len: kind.nonce_len(),
        }
    }

    fn seal(&mut self, m: &mut [u8]) {
        let (data, tag_out) = m.split_at_mut(m.len() - 16);
        let nonce = &self.nonce[..self.nonce_len];

        let tag = match self.cipher {
            AeadCipherVariant::Aes128Gcm(ref c) => c
                .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(nonce), &[], data)
                .expect("AES-128-GCM seal"),
            AeadCipherVariant::Aes256Gcm(ref c) => c
                .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(nonce), &[], data)
                .expect("AES-256-GCM seal"),
            AeadCipherVariant::ChaCha20Poly1305(ref c) => c
                .encrypt_in_place_detached(chacha20poly1305::Nonce::from_slice(nonce), &[], data)
                .expect("ChaCha20-Poly1305 seal"),
            AeadCipherVariant::XChaCha20Poly1305(ref c) => c
                .encrypt_in_place_detached(chacha20poly1305::XNonce::from_slice(nonce), &[], data)
                .expect("XChaCha20-Poly1305 seal"),
        };
        tag_out.copy_from_slice(&tag);

        increase_nonce(&mut self.nonce[..self.nonce_len]);
    }

    fn open(&mut self, m: &mut [u8]) -> bool {
        let (data, tag) = m.split_at_mut(m.len() - 16);
        let nonce = &self.nonce[..self.nonce_len];

        let result = match self.cipher {
            AeadCipherVariant::Aes128Gcm(ref c) => c.decrypt_in_place_detached(
                aes_gcm::Nonce::from_slice(nonce),
                &[],
                data,
                aes_gcm::Tag::from_slice(tag),
            ),
            AeadCipherVariant::Aes256Gcm(ref c) => c.decrypt_in_place_detached(
                aes_gcm::Nonce::from_slice(nonce),
                &[],
                data,
                aes_gcm::Tag::from_slice(tag),
            ),
            AeadCipherVariant::ChaCha20Poly1305(ref c) => c.decrypt_in_place_detached(
                chacha20poly1305::Nonce::from_slice(nonce),
                &[],
                data,
                chacha20poly1305::Tag::from_slice(tag),
            ),
            AeadCipherVariant::XChaCha20Poly1305(ref c) => c.decrypt_in_place_detached(
                chacha20poly1305::XNonce::from_slice(nonce),
                &[],
                data,
                chacha20poly1305::Tag::from_slice(tag),
            ),
        };

        increase_nonce(&mut self.nonce[..self.nonce_len]);

        result.is_ok()
    }
}

enum CipherVariant {
    None,
    Stream(StreamCipherVariant),
    Aead(AeadCipher),
}

/// A per-direction legacy cipher (stream or AEAD-1)
pub struct Cipher {
    variant: CipherVariant,
    kind: CipherKind,
}

impl Cipher {
    /// Create a cipher for one direction of one session
    ///
    /// `key` is the master key of the method; `salt` is the IV (stream) or
    /// salt (AEAD) exchanged in the clear at session start. AEAD methods
    /// derive the session subkey with HKDF-SHA1 and `"ss-subkey"`.
    pub fn new(kind: CipherKind, key: &[u8], salt: &[u8]) -> Self {
        let variant = match kind.category() {
            CipherCategory::None => CipherVariant::None,
            CipherCategory::Stream => CipherVariant::Stream(StreamCipherVariant::new(kind, key, salt)),
            CipherCategory::Aead => CipherVariant::Aead(AeadCipher::new(kind, key, salt)),
            CipherCategory::Aead2022 => unreachable!("{kind} must use the v2 cipher"),
        };

        Self { variant, kind }
    }

    /// Method this cipher was created for
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// AEAD tag length, 0 for stream methods
    pub fn tag_len(&self) -> usize {
        self.kind.tag_len()
    }

    /// Encrypt `m` in place
    ///
    /// For AEAD methods the last `tag_len` bytes of `m` receive the tag and
    /// everything before them is sealed; for stream methods the whole of `m`
    /// is XORed against the keystream.
    pub fn encrypt_packet(&mut self, m: &mut [u8]) {
        match self.variant {
            CipherVariant::None => {}
            CipherVariant::Stream(ref mut c) => c.encrypt(m),
            CipherVariant::Aead(ref mut c) => c.seal(m),
        }
    }

    /// Decrypt `m` in place, returning `false` on authentication failure
    #[must_use]
    pub fn decrypt_packet(&mut self, m: &mut [u8]) -> bool {
        match self.variant {
            CipherVariant::None => true,
            CipherVariant::Stream(ref mut c) => {
                c.decrypt(m);
                true
            }
            CipherVariant::Aead(ref mut c) => c.open(m),
        }
    }
}

/// HKDF-SHA1 session subkey derivation, `info = "ss-subkey"`
fn hkdf_sha1(key: &[u8], salt: &[u8], okm: &mut [u8]) {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    hk.expand(SUBKEY_INFO, okm).expect("ss-subkey hkdf-sha1");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(kind: CipherKind) -> Vec<u8> {
        let mut key = vec![0u8; kind.key_len()];
        openssl_bytes_to_key(b"password", &mut key);
        key
    }

    #[test]
    fn stream_round_trip() {
        for kind in [
            CipherKind::AES_128_CTR,
            CipherKind::AES_192_CTR,
            CipherKind::AES_256_CTR,
            CipherKind::AES_128_CFB,
            CipherKind::AES_256_CFB,
            CipherKind::RC4_MD5,
            CipherKind::CHACHA20,
            CipherKind::XCHACHA20,
        ] {
            let key = key_of(kind);
            let iv = vec![7u8; kind.iv_len()];

            let mut enc = Cipher::new(kind, &key, &iv);
            let mut dec = Cipher::new(kind, &key, &iv);

            let mut data = b"hello stream cipher".to_vec();
            enc.encrypt_packet(&mut data);
            assert_ne!(&data[..], b"hello stream cipher", "{kind}");
            assert!(dec.decrypt_packet(&mut data));
            assert_eq!(&data[..], b"hello stream cipher", "{kind}");
        }
    }

    #[test]
    fn stream_keystream_continues_across_packets() {
        let kind = CipherKind::AES_256_CTR;
        let key = key_of(kind);
        let iv = [3u8; 16];

        let mut enc = Cipher::new(kind, &key, &iv);
        let mut dec = Cipher::new(kind, &key, &iv);

        for chunk in [b"first".as_slice(), b"second", b"third"] {
            let mut data = chunk.to_vec();
            enc.encrypt_packet(&mut data);
            assert!(dec.decrypt_packet(&mut data));
            assert_eq!(&data[..], chunk);
        }
    }

    #[test]
    fn aead_round_trip() {
        for kind in [
            CipherKind::AES_128_GCM,
            CipherKind::AES_256_GCM,
            CipherKind::CHACHA20_POLY1305,
            CipherKind::XCHACHA20_POLY1305,
        ] {
            let key = key_of(kind);
            let salt = vec![9u8; kind.salt_len()];

            let mut enc = Cipher::new(kind, &key, &salt);
            let mut dec = Cipher::new(kind, &key, &salt);

            let mut m = b"hello aead".to_vec();
            m.resize(m.len() + kind.tag_len(), 0);
            enc.encrypt_packet(&mut m);
            assert!(dec.decrypt_packet(&mut m), "{kind}");
            assert_eq!(&m[..b"hello aead".len()], b"hello aead");
        }
    }

    #[test]
    fn aead_rejects_flipped_bit() {
        let kind = CipherKind::CHACHA20_POLY1305;
        let key = key_of(kind);
        let salt = [1u8; 32];

        let mut enc = Cipher::new(kind, &key, &salt);
        let mut dec = Cipher::new(kind, &key, &salt);

        let mut m = vec![0u8; 32 + 16];
        enc.encrypt_packet(&mut m);
        m[5] ^= 0x01;
        assert!(!dec.decrypt_packet(&mut m));
    }

    #[test]
    fn aead_nonce_sequence_is_order_sensitive() {
        // Two chunks sealed with nonce 0 and 1; decrypting them out of order
        // must fail because the counters no longer line up.
        let kind = CipherKind::AES_128_GCM;
        let key = key_of(kind);
        let salt = [2u8; 16];

        let mut enc = Cipher::new(kind, &key, &salt);
        let mut first = vec![1u8; 8 + 16];
        let mut second = vec![2u8; 8 + 16];
        enc.encrypt_packet(&mut first);
        enc.encrypt_packet(&mut second);

        let mut dec = Cipher::new(kind, &key, &salt);
        let mut swapped = second.clone();
        assert!(!dec.decrypt_packet(&mut swapped));

        let mut dec = Cipher::new(kind, &key, &salt);
        assert!(dec.decrypt_packet(&mut first));
        assert!(dec.decrypt_packet(&mut second));
    }
}
