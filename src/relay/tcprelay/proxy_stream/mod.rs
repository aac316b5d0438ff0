//! TCP proxy stream endpoints

pub use self::{client::ProxyClientStream, server::ProxyServerStream};

pub mod client;
pub mod protocol;
pub mod server;
