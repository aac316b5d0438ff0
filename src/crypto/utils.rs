//! Key derivation helpers shared by the cipher families

use md5::{Digest, Md5};

/// `EVP_BytesToKey` with MD5, one iteration, no salt
///
/// The classic OpenSSL password-to-key stretch used by every pre-2022
/// shadowsocks method.
pub fn openssl_bytes_to_key(password: &[u8], key: &mut [u8]) {
    let key_len = key.len();

    let mut last_digest: Option<[u8; 16]> = None;
    let mut offset = 0usize;

    while offset < key_len {
        let mut m = Md5::new();
        if let Some(ref d) = last_digest {
            m.update(d);
        }
        m.update(password);

        let digest = m.finalize();

        let amt = std::cmp::min(key_len - offset, digest.len());
        key[offset..offset + amt].copy_from_slice(&digest[..amt]);

        offset += amt;
        last_digest = Some(digest.into());
    }
}

/// Increment a little-endian integer stored in `nonce` by one
///
/// Used as the per-chunk AEAD nonce counter, starting from all zeros.
pub fn increase_nonce(nonce: &mut [u8]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_to_key_16() {
        // EVP_BytesToKey(md5, "test") first block is md5("test")
        let mut key = [0u8; 16];
        openssl_bytes_to_key(b"test", &mut key);

        let digest = Md5::digest(b"test");
        assert_eq!(&key[..], &digest[..]);
    }

    #[test]
    fn bytes_to_key_32_chained() {
        let mut key = [0u8; 32];
        openssl_bytes_to_key(b"password", &mut key);

        let d1 = Md5::digest(b"password");
        let mut m = Md5::new();
        m.update(d1);
        m.update(b"password");
        let d2 = m.finalize();

        assert_eq!(&key[..16], &d1[..]);
        assert_eq!(&key[16..], &d2[..]);
    }

    #[test]
    fn nonce_increments_little_endian() {
        let mut nonce = [0u8; 12];
        increase_nonce(&mut nonce);
        assert_eq!(nonce[0], 1);

        let mut nonce = [0xffu8, 0x00, 0x00];
        increase_nonce(&mut nonce);
        assert_eq!(nonce, [0x00, 0x01, 0x00]);

        let mut nonce = [0xffu8; 3];
        increase_nonce(&mut nonce);
        assert_eq!(nonce, [0x00; 3]);
    }
}
