use crate::auth::Credentials;
use crate::compression::{BodyCipher, ContentCoding};
use crate::dns::Family;
use crate::extensions::Extensions;
use crate::proxy::ProxyConfig;
use rustls::ServerConfig as RustlsConfig;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub web_socket_config: Option<WebSocketConfig>,
    pub tls_config: Option<Arc<RustlsConfig>>,
}

/// Everything a client connection can be tuned with. The boolean knobs map
/// onto the flag set of the original configuration: `keep_alive` (ALIVE),
/// `follow_redirects` (REDIRECTS), `verify_tls` (VERIFY_SSL), `ping`
/// (inverse of NOT_PING), `wait_message` (WAIT_MESS), `teardown_transport`
/// (inverse of NOT_STOP).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub web_socket_config: WebSocketConfig,
    pub ca_file: Option<String>,
    pub verify_tls: bool,

    /// Reuse the connection for follow-up requests when the server allows.
    pub keep_alive: bool,
    pub follow_redirects: bool,
    /// Upper bound for combined redirect + authentication retries per URL.
    pub max_attempts: usize,

    pub connect_timeout: Duration,
    pub read_timeout: Duration,

    pub ping: bool,
    pub ping_interval: Duration,
    /// A live connection with no pong for this long is torn down.
    pub wait_pong: Duration,

    /// Wait for a pending inbound message before closing.
    pub wait_message: bool,
    /// Shut the transport down on `stop()` instead of leaving it to the
    /// runtime.
    pub teardown_transport: bool,

    pub proxy: Option<ProxyConfig>,
    pub credentials: Option<Credentials>,
    /// Address family the resolver is asked for first.
    pub family: Family,
    /// Offer `Accept-Encoding` and transparently decode the response body.
    pub accept_encoding: bool,
    /// Content coding applied to outgoing request bodies.
    pub request_coding: Option<ContentCoding>,
    /// Applied to bodies before compression (out) and after decompression
    /// (in).
    pub cipher: Option<Arc<dyn BodyCipher>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            web_socket_config: WebSocketConfig::default(),
            ca_file: None,
            verify_tls: true,
            keep_alive: true,
            follow_redirects: true,
            max_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            ping: true,
            ping_interval: Duration::from_secs(30),
            wait_pong: Duration::from_secs(60),
            wait_message: false,
            teardown_transport: true,
            proxy: None,
            credentials: None,
            family: Family::V4,
            accept_encoding: true,
            request_coding: None,
            cipher: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub max_frame_size: Option<usize>,
    pub max_message_size: Option<usize>,
    /// Outgoing messages are split into fragments of at most this size.
    pub fragment_size: Option<usize>,
    pub extensions: Option<Extensions>,
    pub subprotocols: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            fragment_size: None,
            extensions: None,
            subprotocols: Vec::new(),
        }
    }
}
