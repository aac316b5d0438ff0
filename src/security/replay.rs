//! Protection against salt/nonce replay
//!
//! <https://github.com/shadowsocks/shadowsocks-org/issues/44>

use std::{fmt, time::Duration};

use bloomfilter::Bloom;
use log::debug;
use lru_time_cache::LruCache;

use crate::{config::ServerType, crypto::CipherKind};

// Entries and error rates borrowed from shadowsocks-libev's default values
const BF_NUM_ENTRIES_FOR_SERVER: usize = 1_000_000;
const BF_NUM_ENTRIES_FOR_CLIENT: usize = 10_000;
const BF_ERROR_RATE_FOR_SERVER: f64 = 1e-6;
const BF_ERROR_RATE_FOR_CLIENT: f64 = 1e-15;

// AEAD 2022 headers carry a timestamp with this tolerance, so nonces only
// need to be remembered while the timestamp window would accept them.
const NONCE_WINDOW_DURATION: Duration = Duration::from_secs(60);

/// Ping-pong pair of bloom filters used as a ring buffer
///
/// Borrowed from shadowsocks-libev's `ppbloom`: each filter holds half of the
/// configured entries, the full one is cleared and becomes current.
struct PingPongBloom {
    blooms: [Bloom<[u8]>; 2],
    bloom_count: [usize; 2],
    item_count: usize,
    current: usize,
}

impl PingPongBloom {
    fn new(ty: ServerType) -> Self {
        let (mut item_count, fp_p) = if ty.is_local() {
            (BF_NUM_ENTRIES_FOR_CLIENT, BF_ERROR_RATE_FOR_CLIENT)
        } else {
            (BF_NUM_ENTRIES_FOR_SERVER, BF_ERROR_RATE_FOR_SERVER)
        };

        item_count /= 2;

        Self {
            blooms: [
                Bloom::new_for_fp_rate(item_count, fp_p).expect("bloom filter"),
                Bloom::new_for_fp_rate(item_count, fp_p).expect("bloom filter"),
            ],
            bloom_count: [0, 0],
            item_count,
            current: 0,
        }
    }

    // Check if `buf` was seen before, remembering it if not.
    fn check_and_set(&mut self, buf: &[u8]) -> bool {
        for bloom in &self.blooms {
            if bloom.check(buf) {
                return true;
            }
        }

        if self.bloom_count[self.current] >= self.item_count {
            // Current bloom filter is full, clear the other one and rotate
            self.current = (self.current + 1) % 2;

            self.bloom_count[self.current] = 0;
            self.blooms[self.current].clear();

            debug!(
                "bloom filter based replay protector full, each capacity: {}",
                self.item_count
            );
        }

        self.blooms[self.current].set(buf);
        self.bloom_count[self.current] += 1;

        false
    }
}

/// Detector of repeated session salts and nonces
pub struct ReplayProtector {
    nonce_ppbloom: spin::Mutex<PingPongBloom>,

    // AEAD 2022 salts are kept exactly (not probabilistically): the protocol
    // timestamp already rejects old traffic, so the set stays small.
    nonce_set: spin::Mutex<LruCache<Vec<u8>, ()>>,
}

impl fmt::Debug for ReplayProtector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReplayProtector").finish()
    }
}

impl ReplayProtector {
    /// Create a new protector sized for `ty`
    pub fn new(ty: ServerType) -> Self {
        Self {
            nonce_ppbloom: spin::Mutex::new(PingPongBloom::new(ty)),
            nonce_set: spin::Mutex::new(LruCache::with_expiry_duration(NONCE_WINDOW_DURATION)),
        }
    }

    /// Check whether `nonce` was seen before under `method`, remembering it
    pub fn check_nonce_and_set(&self, method: CipherKind, nonce: &[u8]) -> bool {
        // Plain methods have no nonce, never treated as a replay
        if nonce.is_empty() {
            return false;
        }

        if method.is_aead_2022() {
            let mut set = self.nonce_set.lock();
            if set.get(nonce).is_some() {
                return true;
            }
            set.insert(nonce.to_vec(), ());
            return false;
        }

        let mut ppbloom = self.nonce_ppbloom.lock();
        ppbloom.check_and_set(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_repeated_salt() {
        let protector = ReplayProtector::new(ServerType::Server);
        let salt = [42u8; 32];
        assert!(!protector.check_nonce_and_set(CipherKind::AES_256_GCM, &salt));
        assert!(protector.check_nonce_and_set(CipherKind::AES_256_GCM, &salt));
    }

    #[test]
    fn detects_repeated_2022_salt() {
        let protector = ReplayProtector::new(ServerType::Server);
        let salt = [7u8; 16];
        assert!(!protector.check_nonce_and_set(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &salt));
        assert!(protector.check_nonce_and_set(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &salt));
    }

    #[test]
    fn empty_nonce_is_never_a_replay() {
        let protector = ReplayProtector::new(ServerType::Local);
        assert!(!protector.check_nonce_and_set(CipherKind::NONE, &[]));
        assert!(!protector.check_nonce_and_set(CipherKind::NONE, &[]));
    }
}
