//! Relay protocol implementations

pub use self::socks5::Address;

pub mod socks5;
pub mod tcprelay;
pub mod udprelay;
