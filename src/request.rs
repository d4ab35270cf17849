use crate::compression::ContentCoding;
use crate::error::Error;
use crate::extensions::Extensions;
use crate::headers::Headers;
use url::Url;

/// Default port for every scheme the client speaks, and whether the scheme
/// needs TLS on connect.
pub fn scheme_info(scheme: &str) -> Result<(u16, bool), Error> {
    match scheme {
        "http" | "ws" => Ok((80, false)),
        "https" | "wss" => Ok((443, true)),
        other => Err(Error::InvalidSchemeURL(other.to_string())),
    }
}

/// Host for TCP connects and the value of the `Host` header. The header
/// carries the port only when it isn't the scheme default.
pub fn host_fields(url: &Url) -> Result<(String, u16, String), Error> {
    let (default_port, _) = scheme_info(url.scheme())?;
    let host = url.host_str().ok_or(Error::URLNoHost)?.to_string();
    let port = url.port().unwrap_or(default_port);
    let header_host = match url.port() {
        Some(explicit) => format!("{}:{}", host, explicit),
        None => host.clone(),
    };
    Ok((host, port, header_host))
}

/// One queued client request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    /// Bounds combined redirect and authentication retries; reset whenever a
    /// request reaches a successful disposition.
    pub attempt: usize,
    /// HTTP/2 stream carrying this request; `None` on HTTP/1.1.
    pub stream_id: Option<u32>,
}

impl Request {
    pub fn new(method: &str, url: Url) -> Self {
        Self {
            method: method.to_uppercase(),
            url,
            headers: Headers::new(),
            body: None,
            attempt: 0,
            stream_id: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Request::new("GET", url)
    }

    pub fn post(url: Url, body: Vec<u8>) -> Self {
        let mut request = Request::new("POST", url);
        request.body = Some(body);
        request
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Path plus query, the request target in origin form.
    pub fn target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// Serializes the head and body for HTTP/1.1. `absolute_form` switches
    /// the target to the full URL, used for plain requests through an HTTP
    /// proxy; `keep_alive` drives the `Connection` header.
    pub fn to_h1_bytes(
        &self,
        absolute_form: bool,
        keep_alive: bool,
        accept_encoding: bool,
    ) -> Result<Vec<u8>, Error> {
        let (_, _, header_host) = host_fields(&self.url)?;
        let target = if absolute_form {
            self.url.to_string()
        } else {
            self.target()
        };

        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, target);
        if !self.headers.contains("host") {
            head.push_str(&format!("Host: {}\r\n", header_host));
        }
        head.push_str(&format!(
            "Connection: {}\r\n",
            if keep_alive { "keep-alive" } else { "close" }
        ));
        if accept_encoding && !self.headers.contains("accept-encoding") {
            head.push_str(&format!(
                "Accept-Encoding: {}\r\n",
                ContentCoding::accept_header()
            ));
        }
        for (name, value) in self.headers.iter() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if let Some(body) = &self.body {
            if !self.headers.contains("content-length")
                && !self.headers.has_token("transfer-encoding", "chunked")
            {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if let Some(body) = &self.body {
            if self.headers.has_token("transfer-encoding", "chunked") {
                bytes.extend_from_slice(&chunk_body(body));
            } else {
                bytes.extend_from_slice(body);
            }
        }
        Ok(bytes)
    }
}

/// Wraps a body into a single chunk plus the terminating zero chunk.
fn chunk_body(body: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", body.len()).into_bytes();
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n0\r\n\r\n");
    out
}

/// Builds the RFC 6455 upgrade request for `ws`/`wss` URLs. Returns the
/// request text; the caller already resolved where to connect.
pub fn ws_upgrade_request(
    url: &Url,
    key: &str,
    subprotocols: &[String],
    extensions: Option<&Extensions>,
) -> Result<String, Error> {
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::InvalidSchemeURL(url.scheme().to_string()));
    }
    let (_, _, header_host) = host_fields(url)?;

    let request_path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        request_path, header_host, key,
    );
    if !subprotocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            subprotocols.join(", ")
        ));
    }
    if let Some(value) = extensions.and_then(|e| e.header_value()) {
        request.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", value));
    }
    request.push_str("\r\n");

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_form_request() {
        let request = Request::get(Url::parse("http://example.com/a/b?x=1").unwrap());
        let bytes = request.to_h1_bytes(false, true, false).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /a/b?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn test_absolute_form_through_proxy() {
        let request = Request::get(Url::parse("http://example.com/").unwrap());
        let bytes = request.to_h1_bytes(true, true, false).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET http://example.com/ HTTP/1.1\r\n"));
    }

    #[test]
    fn test_post_carries_content_length() {
        let request = Request::post(Url::parse("http://example.com/submit").unwrap(), b"abc".to_vec());
        let bytes = request.to_h1_bytes(false, false, false).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn test_chunked_body_framing() {
        let mut request = Request::post(Url::parse("http://example.com/u").unwrap(), b"hello".to_vec());
        request.headers.insert("Transfer-Encoding", "chunked");
        let bytes = request.to_h1_bytes(false, true, false).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with("5\r\nhello\r\n0\r\n\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_host_header_keeps_explicit_port() {
        let url = Url::parse("ws://localhost:8080/chat").unwrap();
        let request = ws_upgrade_request(&url, "dGhlIHNhbXBsZSBub25jZQ==", &[], None).unwrap();
        assert!(request.starts_with("GET /chat HTTP/1.1"));
        assert!(request.contains("Host: localhost:8080"));
        assert!(request.contains("Upgrade: websocket"));
        assert!(request.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(request.contains("Sec-WebSocket-Version: 13"));
    }

    #[test]
    fn test_upgrade_request_with_protocols_and_extensions() {
        let url = Url::parse("wss://srv/ws").unwrap();
        let request = ws_upgrade_request(
            &url,
            "a2V5",
            &["chat.v1".to_string(), "chat.v0".to_string()],
            Some(&Extensions::deflate()),
        )
        .unwrap();
        assert!(request.contains("Sec-WebSocket-Protocol: chat.v1, chat.v0\r\n"));
        assert!(request.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
    }

    #[test]
    fn test_rejects_http_scheme_for_upgrade() {
        let url = Url::parse("http://example.com/").unwrap();
        assert!(ws_upgrade_request(&url, "k", &[], None).is_err());
    }
}
