//! Shared transport context

use std::{io, sync::Arc};

use byte_string::ByteStr;
use log::trace;
use rand::RngCore;

use crate::{config::ServerType, crypto::CipherKind, security::replay::ReplayProtector};

/// Context shared by every session of one server or client instance
///
/// Owns the replay protector; all salt generation goes through it so that
/// locally generated salts are remembered as seen.
pub struct Context {
    server_type: ServerType,
    replay_protector: ReplayProtector,
}

/// `Context` shared between services
pub type SharedContext = Arc<Context>;

impl Context {
    /// Create a context for a server or client instance
    pub fn new(server_type: ServerType) -> Self {
        Self {
            server_type,
            replay_protector: ReplayProtector::new(server_type),
        }
    }

    /// Create a shared context
    pub fn new_shared(server_type: ServerType) -> SharedContext {
        SharedContext::new(Self::new(server_type))
    }

    /// Role of this instance
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Check if `nonce` was seen before, remembering it
    pub fn check_nonce_and_set(&self, method: CipherKind, nonce: &[u8]) -> bool {
        self.replay_protector.check_nonce_and_set(method, nonce)
    }

    /// Error variant of [`Context::check_nonce_and_set`]
    pub fn check_nonce_replay(&self, method: CipherKind, nonce: &[u8]) -> io::Result<()> {
        if self.check_nonce_and_set(method, nonce) {
            trace!("detected repeated nonce salt {:?}", ByteStr::new(nonce));
            Err(io::Error::new(io::ErrorKind::Other, "detected repeated salt"))
        } else {
            Ok(())
        }
    }

    /// Fill `nonce` with fresh random bytes from a cryptographic RNG
    ///
    /// With `unique_nonce` the generated value is also registered with the
    /// replay protector, retrying until an unseen one is produced, so that a
    /// reflected copy of our own salt is rejected.
    pub fn generate_nonce(&self, method: CipherKind, nonce: &mut [u8], unique_nonce: bool) {
        if nonce.is_empty() {
            return;
        }

        let mut rng = rand::thread_rng();
        loop {
            rng.fill_bytes(nonce);

            if !unique_nonce || !self.check_nonce_and_set(method, nonce) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_salts_are_unique() {
        let context = Context::new(ServerType::Server);
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        context.generate_nonce(CipherKind::AES_256_GCM, &mut a, true);
        context.generate_nonce(CipherKind::AES_256_GCM, &mut b, true);
        assert_ne!(a, b);

        // both were registered, replaying either must be detected
        assert!(context.check_nonce_and_set(CipherKind::AES_256_GCM, &a));
        assert!(context.check_nonce_and_set(CipherKind::AES_256_GCM, &b));
    }
}
