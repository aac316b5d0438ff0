//! Server configuration: method, keys and users

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use base64::Engine as _;
use byte_string::ByteStr;
use bytes::Bytes;
use thiserror::Error;

use crate::crypto::{
    v1::openssl_bytes_to_key,
    v2::{identity_hash, stretch_key},
    CipherKind,
};

/// Base64 engine for user keys (standard alphabet, tolerant padding)
const USER_KEY_BASE64_ENGINE: base64::engine::GeneralPurpose = base64::engine::GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    base64::engine::GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
);

/// Base64 engine for AEAD 2022 passwords
const AEAD2022_PASSWORD_BASE64_ENGINE: base64::engine::GeneralPurpose = base64::engine::GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    base64::engine::GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
);

/// Role of a running instance
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerType {
    /// Client (sslocal), the peer dialing out
    Local,
    /// Server (ssserver), the peer accepting sessions
    Server,
}

impl ServerType {
    /// Check if it is a client instance
    pub fn is_local(self) -> bool {
        self == Self::Local
    }

    /// Check if it is a server instance
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

/// A user of a multi-user (EIH) server
///
/// Identified on the wire by the first 16 bytes of `blake3(uPSK)`.
#[derive(Clone)]
pub struct ServerUser {
    name: String,
    key: Bytes,
    identity_hash: Bytes,
}

impl Debug for ServerUser {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerUser")
            .field("name", &self.name)
            .field("identity_hash", &ByteStr::new(&self.identity_hash))
            .finish()
    }
}

impl ServerUser {
    /// Create a user from a raw PSK
    pub fn new<N, K>(name: N, key: K) -> Self
    where
        N: Into<String>,
        K: Into<Bytes>,
    {
        let key = key.into();
        let identity_hash = identity_hash(&key);

        Self {
            name: name.into(),
            key,
            identity_hash,
        }
    }

    /// Create a user from a raw PSK, validating its length against `method`
    ///
    /// Short PSKs are rejected, oversized ones are reduced with the BLAKE3
    /// key stretch.
    pub fn with_psk<N>(name: N, key: Bytes, method: CipherKind) -> Result<Self, ServerUserError>
    where
        N: Into<String>,
    {
        let key_len = method.key_len();
        let key = match key.len() {
            n if n == key_len => key,
            n if n < key_len => return Err(ServerUserError::BadKey),
            _ => stretch_key(&key, key_len),
        };
        Ok(Self::new(name, key))
    }

    /// Create a user from a base64 encoded PSK
    pub fn with_encoded_key<N>(name: N, key: &str, method: CipherKind) -> Result<Self, ServerUserError>
    where
        N: Into<String>,
    {
        let key = USER_KEY_BASE64_ENGINE.decode(key)?;
        Self::with_psk(name, Bytes::from(key), method)
    }

    /// Name of the user
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Encryption key of the user
    pub fn key(&self) -> &[u8] {
        self.key.as_ref()
    }

    /// The user's 16-byte identity hash
    pub fn identity_hash(&self) -> &[u8] {
        self.identity_hash.as_ref()
    }

    /// The user's identity hash, cloned
    pub fn clone_identity_hash(&self) -> Bytes {
        self.identity_hash.clone()
    }
}

/// `ServerUser` related errors
#[derive(Debug, Clone, Error)]
pub enum ServerUserError {
    /// Invalid user key encoding
    #[error("{0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),
    /// PSK shorter than the method's key length
    #[error("bad key")]
    BadKey,
    /// Two users map to the same identity hash
    #[error("identity hash collision with user {0}")]
    IdentityHashCollision(String),
}

/// Multi-user table, mapping identity hashes to users
#[derive(Clone, Debug, Default)]
pub struct ServerUserManager {
    users: HashMap<Bytes, Arc<ServerUser>>,
}

impl ServerUserManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self { users: HashMap::new() }
    }

    /// Add a user, rejecting identity-hash collisions
    pub fn add_user(&mut self, user: ServerUser) -> Result<(), ServerUserError> {
        if let Some(existing) = self.users.get(user.identity_hash()) {
            if existing.key() != user.key() || existing.name() != user.name() {
                return Err(ServerUserError::IdentityHashCollision(existing.name().to_owned()));
            }
        }
        self.users.insert(user.clone_identity_hash(), Arc::new(user));
        Ok(())
    }

    /// Get a user by identity hash
    pub fn get_user_by_hash(&self, user_hash: &[u8]) -> Option<&ServerUser> {
        self.users.get(user_hash).map(AsRef::as_ref)
    }

    /// Get a user by identity hash, cloned
    pub fn clone_user_by_hash(&self, user_hash: &[u8]) -> Option<Arc<ServerUser>> {
        self.users.get(user_hash).cloned()
    }

    /// Number of users
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Iterate users
    pub fn users_iter(&self) -> impl Iterator<Item = &ServerUser> {
        self.users.values().map(|v| v.as_ref())
    }
}

/// Errors of method/password handling
#[derive(Debug, Clone, Error)]
pub enum ServerConfigError {
    /// Unknown method name
    #[error("unsupported method {0}")]
    UnsupportedMethod(String),
    /// Legacy method without a password
    #[error("missing password")]
    MissingPassword,
    /// AEAD 2022 method without a PSK
    #[error("missing PSK")]
    MissingPsk,
    /// PSK shorter than the method's key length
    #[error("bad key")]
    BadKey,
    /// AEAD 2022 password that is not valid base64
    #[error("decode psk: {0}")]
    InvalidPskEncoding(#[from] base64::DecodeError),
}

/// Method plus keys of one server
///
/// The method descriptor of the protocol: immutable after construction, the
/// method name is its identity. For AEAD 2022 methods the password may be an
/// `iPSK1:iPSK2:...:uPSK` chain; the iPSKs become identity keys.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    password: String,
    method: CipherKind,
    enc_key: Box<[u8]>,
    timeout: Option<Duration>,

    /// Extensible Identity Headers (client side: iPSK chain)
    identity_keys: Arc<Vec<Bytes>>,

    /// Extensible Identity Headers (server side: user table)
    user_manager: Option<Arc<ServerUserManager>>,
}

impl ServerConfig {
    /// Create a config from a method and its password
    pub fn new<P>(method: CipherKind, password: P) -> Result<Self, ServerConfigError>
    where
        P: Into<String>,
    {
        let password = password.into();
        let (enc_key, identity_keys) = password_to_keys(method, &password)?;

        Ok(Self {
            password,
            method,
            enc_key,
            timeout: None,
            identity_keys: Arc::new(identity_keys),
            user_manager: None,
        })
    }

    /// Create a config from a method name, mapping `none`/`plain`/`dummy` to
    /// the identity method and unknown names to an error
    pub fn from_method_name<P>(name: &str, password: P) -> Result<Self, ServerConfigError>
    where
        P: Into<String>,
    {
        let method =
            CipherKind::from_str(name).map_err(|_| ServerConfigError::UnsupportedMethod(name.to_owned()))?;
        Self::new(method, password)
    }

    /// Encryption method
    pub fn method(&self) -> CipherKind {
        self.method
    }

    /// Master key derived from the password
    pub fn key(&self) -> &[u8] {
        self.enc_key.as_ref()
    }

    /// Original password
    pub fn password(&self) -> &str {
        self.password.as_str()
    }

    /// Identity keys (iPSK chain) for client-side EIH
    pub fn identity_keys(&self) -> &[Bytes] {
        self.identity_keys.as_slice()
    }

    /// Identity keys, cloned
    pub fn clone_identity_keys(&self) -> Arc<Vec<Bytes>> {
        self.identity_keys.clone()
    }

    /// Server-side multi-user table
    pub fn user_manager(&self) -> Option<&Arc<ServerUserManager>> {
        self.user_manager.as_ref()
    }

    /// Install a multi-user table
    pub fn set_user_manager(&mut self, user_manager: Arc<ServerUserManager>) {
        self.user_manager = Some(user_manager);
    }

    /// Handshake timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set handshake timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }
}

/// Decode and validate a 2022 PSK against the method's key length
fn decode_psk(method: CipherKind, encoded: &str) -> Result<Bytes, ServerConfigError> {
    let psk = AEAD2022_PASSWORD_BASE64_ENGINE.decode(encoded)?;
    let key_len = method.key_len();

    match psk.len() {
        n if n == key_len => Ok(Bytes::from(psk)),
        n if n < key_len => Err(ServerConfigError::BadKey),
        _ => Ok(stretch_key(&psk, key_len)),
    }
}

fn password_to_keys(method: CipherKind, password: &str) -> Result<(Box<[u8]>, Vec<Bytes>), ServerConfigError> {
    if method.is_none() {
        return Ok((Box::default(), Vec::new()));
    }

    if method.is_aead_2022() {
        if password.is_empty() {
            return Err(ServerConfigError::MissingPsk);
        }

        // iPSK1:iPSK2:...:uPSK
        let mut split_iter = password.rsplit(':');
        let upsk = split_iter.next().expect("rsplit yields at least one part");

        let enc_key = decode_psk(method, upsk)?;

        let mut identity_keys = Vec::new();
        for ipsk in split_iter {
            identity_keys.push(decode_psk(method, ipsk)?);
        }
        identity_keys.reverse();

        return Ok((enc_key.as_ref().into(), identity_keys));
    }

    if password.is_empty() {
        return Err(ServerConfigError::MissingPassword);
    }

    let mut enc_key = vec![0u8; method.key_len()].into_boxed_slice();
    openssl_bytes_to_key(password.as_bytes(), &mut enc_key);

    Ok((enc_key, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_password_derivation() {
        let config = ServerConfig::new(CipherKind::AES_128_GCM, "test").unwrap();
        assert_eq!(config.key().len(), 16);
        assert_eq!(config.password(), "test");
    }

    #[test]
    fn legacy_missing_password() {
        let err = ServerConfig::new(CipherKind::AES_256_CTR, "").unwrap_err();
        assert!(matches!(err, ServerConfigError::MissingPassword));
    }

    #[test]
    fn aead2022_base64_psk() {
        let psk = [0x5au8; 16];
        let password = USER_KEY_BASE64_ENGINE.encode(psk);
        let config = ServerConfig::new(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, password).unwrap();
        assert_eq!(config.key(), &psk[..]);
        assert!(config.identity_keys().is_empty());
    }

    #[test]
    fn aead2022_ipsk_chain() {
        let ipsk = [0x01u8; 16];
        let upsk = [0x02u8; 16];
        let password = format!(
            "{}:{}",
            USER_KEY_BASE64_ENGINE.encode(ipsk),
            USER_KEY_BASE64_ENGINE.encode(upsk)
        );
        let config = ServerConfig::new(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, password).unwrap();
        assert_eq!(config.key(), &upsk[..]);
        assert_eq!(config.identity_keys(), &[Bytes::copy_from_slice(&ipsk)]);
    }

    #[test]
    fn aead2022_short_psk_rejected() {
        let password = USER_KEY_BASE64_ENGINE.encode([0u8; 8]);
        let err = ServerConfig::new(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, password).unwrap_err();
        assert!(matches!(err, ServerConfigError::BadKey));
    }

    #[test]
    fn aead2022_long_psk_stretched() {
        let password = USER_KEY_BASE64_ENGINE.encode([0xaau8; 64]);
        let config = ServerConfig::new(CipherKind::AEAD2022_BLAKE3_AES_256_GCM, password).unwrap();
        assert_eq!(config.key().len(), 32);
    }

    #[test]
    fn unsupported_method_name() {
        let err = ServerConfig::from_method_name("aes-128-xyz", "pw").unwrap_err();
        assert!(matches!(err, ServerConfigError::UnsupportedMethod(_)));
    }

    #[test]
    fn sentinel_method_names() {
        let config = ServerConfig::from_method_name("plain", "").unwrap();
        assert!(config.method().is_none());
    }

    #[test]
    fn user_manager_rejects_collisions() {
        let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
        let mut manager = ServerUserManager::new();

        let user = ServerUser::with_psk("alice", Bytes::from_static(&[1u8; 16]), method).unwrap();
        let hash = user.clone_identity_hash();
        manager.add_user(user).unwrap();

        // same PSK under a different name collides
        let dup = ServerUser::with_psk("bob", Bytes::from_static(&[1u8; 16]), method).unwrap();
        assert!(matches!(
            manager.add_user(dup),
            Err(ServerUserError::IdentityHashCollision(name)) if name == "alice"
        ));

        assert_eq!(manager.user_count(), 1);
        assert_eq!(manager.get_user_by_hash(&hash).unwrap().name(), "alice");
    }

    #[test]
    fn user_short_psk_rejected() {
        let method = CipherKind::AEAD2022_BLAKE3_AES_256_GCM;
        let err = ServerUser::with_psk("short", Bytes::from_static(&[1u8; 8]), method).unwrap_err();
        assert!(matches!(err, ServerUserError::BadKey));
    }
}
