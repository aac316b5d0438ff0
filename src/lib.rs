//! Shadowsocks wire transport
//!
//! The cryptographic transport core of a shadowsocks implementation: wire
//! encoding and decoding for the legacy stream ciphers, the AEAD protocol and
//! the AEAD 2022 edition, session establishment, multi-user identity-header
//! demultiplexing and a relay that dispatches sessions to per-user
//! destinations.

pub use self::{
    config::{ServerConfig, ServerConfigError, ServerType, ServerUser, ServerUserManager},
    context::{Context, SharedContext},
    relay::tcprelay::{ProxyClientStream, ProxyServerStream},
    service::{Handler, Relay, TcpService, UdpService},
};

pub mod config;
pub mod context;
pub mod crypto;
pub mod relay;
mod security;
pub mod service;
