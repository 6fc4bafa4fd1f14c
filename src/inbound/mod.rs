//! Inbound proxy listener

mod http;

pub use http::ProxyListener;
