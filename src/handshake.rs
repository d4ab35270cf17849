use crate::config::{ClientConfig, ServerConfig, WebSocketConfig};
use crate::error::Error;
use crate::extensions::{merge_extensions, parse_extensions, Extensions};
use crate::frame::Role;
use crate::http1::{Http1Parser, MessageKind};
use crate::request::ws_upgrade_request;
use crate::split::WSConnection;
use crate::stream::Transport;
use crate::utils::{generate_websocket_accept_value, generate_websocket_key};
use bytes::BytesMut;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use url::Url;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the client side negotiated during the upgrade.
pub struct HandshakeOutcome {
    pub subprotocol: Option<String>,
    pub extensions: Option<Extensions>,
    /// Frame bytes the server sent right behind its 101.
    pub leftover: BytesMut,
}

/// Performs the RFC 6455 client upgrade over an established (and, for wss,
/// already TLS-wrapped) stream. Non-101 answers are surfaced as
/// [`Error::HttpStatus`] so the orchestrator can run its retry policy; for
/// 401/407 the carried reason is the authentication challenge itself.
pub async fn client_handshake<S>(
    stream: &mut S,
    url: &Url,
    config: &WebSocketConfig,
) -> Result<HandshakeOutcome, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client_handshake_with_headers(stream, url, config, &[]).await
}

/// Same upgrade with extra request headers, used for authentication
/// retries.
pub async fn client_handshake_with_headers<S>(
    stream: &mut S,
    url: &Url,
    config: &WebSocketConfig,
    extra_headers: &[(&str, &str)],
) -> Result<HandshakeOutcome, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(extensions) = &config.extensions {
        extensions.validate()?;
    }

    let key = generate_websocket_key();
    let mut request = ws_upgrade_request(
        url,
        &key,
        &config.subprotocols,
        config.extensions.as_ref(),
    )?;
    for (name, value) in extra_headers {
        // Splice before the terminating blank line.
        request.truncate(request.len() - 2);
        request.push_str(&format!("{}: {}\r\n\r\n", name, value));
    }
    stream.write_all(request.as_bytes()).await?;

    let mut parser = Http1Parser::new(MessageKind::Response);
    let mut buf = BytesMut::with_capacity(4096);
    timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            parser.feed(&mut buf)?;
            if parser.head_complete() && (parser.status() == 101 || parser.is_done()) {
                return Ok::<(), Error>(());
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                parser.finish_eof()?;
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await??;

    if parser.status() != 101 {
        let status = parser.status();
        // For auth challenges the challenge line itself travels in the
        // reason so the orchestrator can prime its context from it.
        let reason = match status {
            401 => parser.headers().get("www-authenticate"),
            407 => parser.headers().get("proxy-authenticate"),
            _ => None,
        }
        .map(|v| v.to_string())
        .unwrap_or_else(|| parser.reason().to_string());
        return Err(Error::HttpStatus { status, reason });
    }
    if !parser.is_upgrade() {
        return Err(Error::NoUpgrade);
    }

    let accept = parser
        .headers()
        .get("sec-websocket-accept")
        .ok_or(Error::NoUpgrade)?;
    if accept.trim() != generate_websocket_accept_value(&key) {
        return Err(Error::InvalidAcceptKey);
    }

    // The server may pick one of the offered subprotocols, never another.
    let subprotocol = match parser.headers().get("sec-websocket-protocol") {
        Some(picked) => {
            let picked = picked.trim().to_string();
            if !config.subprotocols.iter().any(|p| p == &picked) {
                return Err(Error::SubprotocolNotOffered(picked));
            }
            Some(picked)
        }
        None => None,
    };

    // Same rule for extensions: the answer must be a subset of the offer.
    let extensions = match parser.headers().get("sec-websocket-extensions") {
        Some(value) => {
            let answer = parse_extensions(value.to_string())
                .ok_or_else(|| Error::ExtensionNotOffered(value.to_string()))?;
            match &config.extensions {
                Some(offered) => offered.accept_answer(&answer)?,
                None => return Err(Error::ExtensionNotOffered(value.to_string())),
            }
            Some(answer)
        }
        None => None,
    };

    debug!(
        "ws: upgrade to {} complete (subprotocol {:?})",
        url, subprotocol
    );
    Ok(HandshakeOutcome {
        subprotocol,
        extensions,
        leftover: buf,
    })
}

/// Connects to a `ws://` or `wss://` endpoint with default configuration.
pub async fn connect_async(addr: &str) -> Result<WSConnection, Error> {
    connect_async_with_config(addr, None).await
}

/// Connects with explicit configuration; resolution, proxying and TLS run
/// through the client orchestrator.
pub async fn connect_async_with_config(
    addr: &str,
    config: Option<ClientConfig>,
) -> Result<WSConnection, Error> {
    let client = crate::client::WebClient::with_config(config.unwrap_or_default());
    client.connect_ws(addr).await
}

/// Accepts one server-side Websocket connection with defaults.
pub async fn accept_async(stream: TcpStream) -> Result<WSConnection, Error> {
    accept_async_with_config(stream, None).await
}

/// Validates the client's upgrade request, answers 101 with the accept key
/// and the merged extension set, and hands back a live connection.
pub async fn accept_async_with_config<S>(
    mut stream: S,
    config: Option<ServerConfig>,
) -> Result<WSConnection, Error>
where
    S: Transport + 'static,
{
    let ws_config = config
        .and_then(|c| c.web_socket_config)
        .unwrap_or_default();

    let mut parser = Http1Parser::new(MessageKind::Request);
    let mut buf = BytesMut::with_capacity(4096);
    timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            if parser.feed(&mut buf)? {
                return Ok::<(), Error>(());
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                parser.finish_eof()?;
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await??;

    if !parser.method().eq_ignore_ascii_case("GET") {
        return Err(Error::InvalidHTTPHandshake);
    }
    if !parser.headers().has_token("connection", "upgrade") {
        return Err(Error::NoConnectionHeaderPresent);
    }
    let upgraded = parser
        .headers()
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgraded {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if !parser.headers().contains("host") {
        return Err(Error::NoHostHeaderPresent);
    }
    let key = parser
        .headers()
        .get("sec-websocket-key")
        .ok_or(Error::NoSecWebsocketKey)?
        .trim()
        .to_string();

    let client_extensions = parser
        .headers()
        .get("sec-websocket-extensions")
        .and_then(|value| parse_extensions(value.to_string()));
    let negotiated = merge_extensions(ws_config.extensions.clone(), client_extensions);

    let subprotocol = parser
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|offered| {
            offered
                .split(',')
                .map(|p| p.trim())
                .find(|p| ws_config.subprotocols.iter().any(|s| s == p))
                .map(|p| p.to_string())
        });

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\n",
        generate_websocket_accept_value(&key)
    );
    if let Some(value) = negotiated.as_ref().and_then(|e| e.header_value()) {
        response.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", value));
    }
    if let Some(picked) = &subprotocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", picked));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await?;

    Ok(WSConnection::spawn(
        Box::new(stream),
        Role::Server,
        ws_config,
        negotiated,
        subprotocol,
        buf,
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_client_handshake_accept_key_checked() {
        let (mut client, mut server) = duplex(8192);

        let srv = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = server.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let text = String::from_utf8(buf).unwrap();
            let key = text
                .lines()
                .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
                .unwrap()
                .trim();
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                 Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                generate_websocket_accept_value(key)
            );
            server.write_all(response.as_bytes()).await.unwrap();
        });

        let url = Url::parse("ws://localhost/chat").unwrap();
        let outcome = client_handshake(&mut client, &url, &WebSocketConfig::default())
            .await
            .unwrap();
        assert!(outcome.subprotocol.is_none());
        assert!(outcome.extensions.is_none());
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_handshake_rejects_wrong_accept() {
        let (mut client, mut server) = duplex(8192);

        tokio::spawn(async move {
            let mut chunk = [0u8; 2048];
            let _ = server.read(&mut chunk).await.unwrap();
            server
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                      Connection: Upgrade\r\nSec-WebSocket-Accept: bm90IHZhbGlk\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let url = Url::parse("ws://localhost/").unwrap();
        let result = client_handshake(&mut client, &url, &WebSocketConfig::default()).await;
        assert!(matches!(result, Err(Error::InvalidAcceptKey)));
    }

    #[tokio::test]
    async fn test_client_handshake_rejects_unoffered_subprotocol() {
        let (mut client, mut server) = duplex(8192);

        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = server.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let text = String::from_utf8(buf).unwrap();
            let key = text
                .lines()
                .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
                .unwrap()
                .trim();
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                 Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\
                 Sec-WebSocket-Protocol: sneaky.v9\r\n\r\n",
                generate_websocket_accept_value(key)
            );
            server.write_all(response.as_bytes()).await.unwrap();
        });

        let url = Url::parse("ws://localhost/").unwrap();
        let mut config = WebSocketConfig::default();
        config.subprotocols = vec!["chat.v1".to_string()];
        let result = client_handshake(&mut client, &url, &config).await;
        assert!(matches!(result, Err(Error::SubprotocolNotOffered(_))));
    }

    #[tokio::test]
    async fn test_client_handshake_surfaces_auth_challenge() {
        let (mut client, mut server) = duplex(8192);

        tokio::spawn(async move {
            let mut chunk = [0u8; 2048];
            let _ = server.read(&mut chunk).await.unwrap();
            server
                .write_all(
                    b"HTTP/1.1 401 Unauthorized\r\n\
                      WWW-Authenticate: Basic realm=\"ws\"\r\nContent-Length: 0\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let url = Url::parse("ws://localhost/").unwrap();
        let result = client_handshake(&mut client, &url, &WebSocketConfig::default()).await;
        assert!(matches!(result, Err(Error::HttpStatus { status: 401, .. })));
    }

    #[tokio::test]
    async fn test_accept_rejects_missing_key() {
        let (mut client, server) = duplex(8192);

        let accept = tokio::spawn(accept_async_with_config(server, None));
        client
            .write_all(
                b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\n\
                  Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let result = accept.await.unwrap();
        assert!(matches!(result, Err(Error::NoSecWebsocketKey)));
    }

    #[tokio::test]
    async fn test_accept_answers_with_accept_key_and_subprotocol() {
        let (mut client, server) = duplex(8192);

        let mut ws_config = WebSocketConfig::default();
        ws_config.subprotocols = vec!["chat.v1".to_string()];
        let server_config = ServerConfig {
            web_socket_config: Some(ws_config),
            tls_config: None,
        };
        let accept = tokio::spawn(accept_async_with_config(server, Some(server_config)));

        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\n\
                  Upgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: chat.v1, chat.v0\r\n\r\n",
            )
            .await
            .unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = client.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat.v1\r\n"));

        let connection = accept.await.unwrap().unwrap();
        assert_eq!(connection.subprotocol(), Some("chat.v1"));
    }
}
