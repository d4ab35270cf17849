//! Async client/server networking toolkit for the tokio stack.
//!
//! The crate bundles the protocol machinery a connected client needs under
//! one roof: an HTTP/1.1 and HTTP/2 client with redirect chains,
//! authentication retries and compressed bodies, a Websocket engine that
//! runs over both the RFC 6455 upgrade and the RFC 8441 extended CONNECT
//! tunnel (including permessage-deflate), a recursive DNS resolver with a
//! TTL cache, blacklist and hosts-file overrides, and SOCKS5/HTTP CONNECT
//! proxy tunneling. A small event-driven Websocket server is included for
//! the other side of the wire.
//!
//! The usual entry points are [`client::WebClient`] for HTTP,
//! [`handshake::connect_async`] for Websocket clients and
//! [`server::start_server`] for a Websocket server.

pub mod auth;
pub mod broker;
pub mod client;
pub mod compression;
pub mod config;
pub mod dns;
pub mod error;
pub mod event;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod headers;
pub mod hpack;
pub mod http1;
pub mod http2;
pub mod message;
pub mod proxy;
pub mod read;
pub mod request;
pub mod response;
pub mod server;
pub mod split;
pub mod stream;
pub mod tls;
mod utils;
pub mod write;

#[cfg(test)]
mod tests;
