//! TCP relay

pub use self::{
    crypto_io::{CryptoStream, StreamType},
    proxy_stream::{ProxyClientStream, ProxyServerStream},
};

pub mod aead;
pub mod aead_2022;
pub mod crypto_io;
pub mod proxy_stream;
pub mod stream;
pub mod tls;
