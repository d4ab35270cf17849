use crate::auth::{AuthContext, AuthScheme};
use crate::broker::{disposition, redirect_method, Broker, ConnState, Disposition, Protocol};
use crate::config::ClientConfig;
use crate::dns::DnsResolver;
use crate::error::Error;
use crate::extensions::parse_extensions;
use crate::frame::{close_code, Role};
use crate::handshake::client_handshake;
use crate::http1::{Http1Parser, MessageKind};
use crate::http2::{error_code, H2Event, H2Session, Settings};
use crate::proxy::{http_connect, socks5_handshake, ProxyKind};
use crate::request::{host_fields, scheme_info, Request};
use crate::response::Response;
use crate::split::{PingConfig, WSConnection};
use crate::stream::NetStream;
use crate::tls::{client_config as tls_client_config, wrap, TlsOptions};
use crate::write::Writer;
use bytes::BytesMut;
use log::{debug, info, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use url::Url;

/// The client orchestrator: walks each connection through
/// resolve → connect → proxy handshake → TLS → protocol upgrade →
/// request/response, applying the redirect and authentication policy, and
/// opens Websocket sessions over HTTP/1.1 or an HTTP/2 extended CONNECT
/// tunnel.
pub struct WebClient {
    config: ClientConfig,
    resolver: Arc<DnsResolver>,
    next_broker_id: AtomicU64,
    stopped: AtomicBool,
    /// Writers of live Websocket connections, closed on `stop()`.
    live_writers: Mutex<Vec<(u64, Weak<AsyncMutex<Writer>>)>>,
}

impl Default for WebClient {
    fn default() -> Self {
        Self::new()
    }
}

struct Transported {
    stream: NetStream,
    /// Plain requests through an HTTP proxy use the absolute URL form.
    absolute_form: bool,
    used_ip: Option<(String, IpAddr)>,
    protocol: Protocol,
}

impl WebClient {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            resolver: Arc::new(DnsResolver::new()),
            next_broker_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            live_writers: Mutex::new(Vec::new()),
        }
    }

    /// The resolver backing this client, for cache/blacklist management.
    pub fn resolver(&self) -> &DnsResolver {
        &self.resolver
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn check_running(&self) -> Result<(), Error> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::CommunicationError);
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.next_broker_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Closes every live connection and aborts in-flight DNS lookups.
    /// Calling it twice is the same as calling it once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("client: stopping");
        self.resolver.cancel(crate::dns::Family::V4);
        self.resolver.cancel(crate::dns::Family::V6);

        let writers = match self.live_writers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (id, weak) in writers {
            if let Some(writer) = weak.upgrade() {
                tokio::spawn(async move {
                    debug!("client: closing broker {}", id);
                    let _ = writer
                        .lock()
                        .await
                        .write_close(close_code::GOING_AWAY, "client stopped")
                        .await;
                });
            }
        }
    }

    async fn resolve_host(&self, host: &str) -> Result<IpAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        self.resolver.resolve(host, self.config.family).await
    }

    /// Establishes the transport for `url`: DNS, TCP, proxy handshake and
    /// TLS, in that order. The broker records each state on the way.
    async fn open_transport(&self, url: &Url, broker: &mut Broker) -> Result<Transported, Error> {
        let (_, needs_tls) = scheme_info(url.scheme())?;
        let (host, port, _) = host_fields(url)?;

        let mut absolute_form = false;
        let mut used_ip = None;

        broker.state = ConnState::Resolve;
        let tcp = match &self.config.proxy {
            Some(proxy) => {
                let proxy_host = proxy.host()?;
                let proxy_ip = self.resolve_host(&proxy_host).await?;
                broker.state = ConnState::Connect;
                let tcp = timeout(
                    self.config.connect_timeout,
                    TcpStream::connect((proxy_ip, proxy.port())),
                )
                .await??;

                broker.state = ConnState::ProxyHandshake;
                let mut stream = tcp;
                match proxy.kind {
                    ProxyKind::Socks5 => {
                        socks5_handshake(&mut stream, &host, port, proxy.credentials.as_ref())
                            .await?;
                    }
                    ProxyKind::Http => {
                        if needs_tls || matches!(url.scheme(), "ws") {
                            // Tunneled targets need CONNECT; plain http rides
                            // the proxy with absolute-form requests.
                            http_connect(&mut stream, &host, port, proxy.credentials.as_ref())
                                .await?;
                        } else {
                            absolute_form = true;
                        }
                    }
                }
                // Tunnel established, the connection behaves direct from here.
                stream
            }
            None => {
                let ip = self.resolve_host(&host).await?;
                self.resolver.mark_busy(&host, ip);
                used_ip = Some((host.clone(), ip));
                broker.state = ConnState::Connect;
                timeout(self.config.connect_timeout, TcpStream::connect((ip, port))).await??
            }
        };

        let (stream, protocol) = if needs_tls {
            broker.state = ConnState::TlsHandshake;
            broker.tls = true;
            let options = TlsOptions {
                verify: self.config.verify_tls,
                ca_file: self.config.ca_file.clone(),
                alpn: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            };
            let tls_config = tls_client_config(&options)?;
            let tls_stream = wrap(tcp, &host, tls_config).await?;
            let stream = NetStream::Secure(Box::new(tls_stream.into()));
            let protocol = match stream.alpn_protocol() {
                Some(b"h2") => Protocol::Http2,
                _ => Protocol::Http1,
            };
            (stream, protocol)
        } else {
            (NetStream::Plain(tcp), Protocol::Http1)
        };

        broker.protocol = protocol;
        broker.state = ConnState::Ready;
        debug!(
            "broker {}: transport to {} ready ({:?})",
            broker.id, url, protocol
        );
        Ok(Transported {
            stream,
            absolute_form,
            used_ip,
            protocol,
        })
    }

    fn release(&self, transported: &Transported) {
        if let Some((host, ip)) = &transported.used_ip {
            self.resolver.release_busy(host, *ip);
        }
    }

    /// Encryption runs before compression on outgoing bodies; the receive
    /// path undoes them in reverse order.
    fn prepare_body(&self, request: &mut Request) -> Result<(), Error> {
        let body = match request.body.take() {
            Some(body) => body,
            None => return Ok(()),
        };
        let body = match &self.config.cipher {
            Some(cipher) => cipher.encrypt(&body)?,
            None => body,
        };
        let body = match self.config.request_coding {
            Some(coding) if coding != crate::compression::ContentCoding::Identity => {
                request.headers.set("Content-Encoding", coding.token());
                coding.compress(&body)?
            }
            _ => body,
        };
        request.body = Some(body);
        Ok(())
    }

    fn finish_body(&self, response: &mut Response) -> Result<(), Error> {
        if let Some(cipher) = &self.config.cipher {
            if !response.body.is_empty() {
                response.body = cipher.decrypt(&response.body)?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, url: &str) -> Result<Response, Error> {
        self.execute(Request::get(Url::parse(url)?)).await
    }

    pub async fn post(&self, url: &str, body: Vec<u8>) -> Result<Response, Error> {
        self.execute(Request::post(Url::parse(url)?, body)).await
    }

    /// Runs one logical request to its terminal outcome, following
    /// redirects and answering authentication challenges up to the
    /// configured attempt bound. The attempt counter is per-URL and resets
    /// whenever a response completes successfully.
    pub async fn execute(&self, mut request: Request) -> Result<Response, Error> {
        let mut auth = AuthContext::new(AuthScheme::Basic);
        self.prepare_body(&mut request)?;
        loop {
            self.check_running()?;
            let mut broker = Broker::new(self.next_id(), request.url.clone(), false);
            let transported = self.open_transport(&request.url, &mut broker).await?;

            let outcome = self
                .exchange(transported, &request, &mut broker)
                .await;
            let response = outcome?;

            match disposition(&request, &response, &self.config) {
                Disposition::Done => {
                    request.attempt = 0;
                    let mut response = response;
                    self.finish_body(&mut response)?;
                    return Ok(response);
                }
                Disposition::Retry => {
                    request.attempt += 1;
                    let (challenge_header, answer_header) = if response.status == 407 {
                        ("proxy-authenticate", "Proxy-Authorization")
                    } else {
                        ("www-authenticate", "Authorization")
                    };
                    let challenge = response
                        .headers
                        .get(challenge_header)
                        .ok_or(Error::AuthExhausted)?;
                    auth.prime(challenge)?;
                    let creds = self
                        .config
                        .credentials
                        .as_ref()
                        .ok_or(Error::AuthExhausted)?;
                    let value = auth.header(&request.method, &request.target(), creds)?;
                    request.headers.set(answer_header, value);
                    debug!(
                        "broker {}: retrying {} with {} credentials (attempt {})",
                        broker.id, request.url, challenge_header, request.attempt
                    );
                }
                Disposition::Redirect(target) => {
                    request.attempt += 1;
                    let method = redirect_method(response.status, &request.method);
                    if method == "GET" && request.method != "GET" {
                        request.body = None;
                        request.headers.remove("content-length");
                        request.headers.remove("content-type");
                    }
                    info!(
                        "broker {}: redirect {} -> {} (attempt {})",
                        broker.id, request.url, target, request.attempt
                    );
                    // The redirect URL's scheme wins; a changed scheme means
                    // the next attempt re-runs the TLS stage.
                    request.method = method;
                    request.url = target;
                    request.headers.remove("authorization");
                }
                Disposition::Fault(error) => return Err(error),
            }
        }
    }

    async fn exchange(
        &self,
        mut transported: Transported,
        request: &Request,
        broker: &mut Broker,
    ) -> Result<Response, Error> {
        let result = match transported.protocol {
            Protocol::Http1 => {
                let mut request = request.clone();
                // Plain requests riding an HTTP proxy announce the proxy
                // credentials up front instead of waiting for a 407.
                if transported.absolute_form && !request.headers.contains("proxy-authorization") {
                    if let Some(creds) = self
                        .config
                        .proxy
                        .as_ref()
                        .and_then(|proxy| proxy.credentials.as_ref())
                    {
                        let mut basic = AuthContext::new(AuthScheme::Basic);
                        let value = basic.header(&request.method, &request.target(), creds)?;
                        request.headers.set("Proxy-Authorization", value);
                    }
                }
                self.exchange_h1(&mut transported.stream, &request, transported.absolute_form)
                    .await
                    .map(|(response, _)| response)
            }
            Protocol::Http2 => self
                .exchange_h2(&mut transported.stream, std::slice::from_ref(request))
                .await
                .and_then(|mut responses| {
                    responses.pop().ok_or(Error::IncompleteHTTPMessage)
                }),
        };
        self.release(&transported);
        if result.is_err() {
            broker.state = ConnState::Closed;
        }
        result
    }

    /// One serial HTTP/1.1 exchange. Returns the response and whether the
    /// connection may be reused.
    async fn exchange_h1(
        &self,
        stream: &mut NetStream,
        request: &Request,
        absolute_form: bool,
    ) -> Result<(Response, bool), Error> {
        let bytes = request.to_h1_bytes(
            absolute_form,
            self.config.keep_alive,
            self.config.accept_encoding,
        )?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;

        let mut parser = Http1Parser::new(MessageKind::Response);
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            if parser.feed(&mut buf)? {
                break;
            }
            let mut chunk = [0u8; 8 * 1024];
            let n = timeout(self.config.read_timeout, stream.read(&mut chunk)).await??;
            if n == 0 {
                parser.finish_eof()?;
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let keep_alive = parser.is_keep_alive();
        let response = Response::from_parser(&mut parser)?;
        Ok((response, keep_alive))
    }

    /// Submits every request on one HTTP/2 session and returns the
    /// responses in submission (stream id) order. A dead stream yields a
    /// synthetic 500 so each request still sees a terminal outcome.
    async fn exchange_h2(
        &self,
        stream: &mut NetStream,
        requests: &[Request],
    ) -> Result<Vec<Response>, Error> {
        let mut session = H2Session::new(Settings::client());

        let mut order = Vec::with_capacity(requests.len());
        for request in requests {
            order.push(session.submit_request(request)?);
        }
        let out = session.take_output();
        stream.write_all(&out).await?;
        stream.flush().await?;

        let mut open: std::collections::HashSet<u32> = order.iter().copied().collect();
        let mut failed: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();

        while !open.is_empty() {
            let mut chunk = [0u8; 16 * 1024];
            let n = timeout(self.config.read_timeout, stream.read(&mut chunk)).await??;
            if n == 0 {
                break;
            }
            let events = match session.process(&chunk[..n]) {
                Ok(events) => events,
                Err(error) => {
                    // The GOAWAY queued by the session still goes out.
                    let out = session.take_output();
                    let _ = stream.write_all(&out).await;
                    return Err(error);
                }
            };
            for event in events {
                match event {
                    H2Event::Data {
                        stream_id,
                        data,
                        end_stream,
                    } => {
                        session.consume(stream_id, data.len());
                        if end_stream {
                            open.remove(&stream_id);
                        }
                    }
                    H2Event::Headers {
                        stream_id,
                        end_stream,
                        ..
                    } => {
                        if end_stream {
                            open.remove(&stream_id);
                        }
                    }
                    H2Event::StreamReset {
                        stream_id,
                        error_code,
                    } => {
                        warn!("h2: stream {} reset with code {}", stream_id, error_code);
                        failed.insert(stream_id, error_code);
                        open.remove(&stream_id);
                    }
                    H2Event::GoAway { error_code, .. } => {
                        debug!("h2: peer is going away (code {})", error_code);
                        open.clear();
                    }
                    _ => {}
                }
            }
            let out = session.take_output();
            if !out.is_empty() {
                stream.write_all(&out).await?;
                stream.flush().await?;
            }
        }

        let mut responses = Vec::with_capacity(order.len());
        for stream_id in order {
            if let Some(code) = failed.get(&stream_id) {
                let _ = session.take_stream(stream_id);
                responses.push(Response::synthetic(
                    500,
                    &format!("stream reset with HTTP/2 error code {}", code),
                ));
                continue;
            }
            match session.take_stream(stream_id) {
                Some((headers, body)) if !headers.is_empty() => {
                    responses.push(Response::from_h2(headers, body)?)
                }
                // Interrupted before a response arrived.
                _ => responses.push(Response::synthetic(500, "connection lost")),
            }
        }
        Ok(responses)
    }

    /// Submits a batch on one connection. Responses come back in submission
    /// order: serially on HTTP/1.1, by stream id on HTTP/2. Dispositions are
    /// not applied here; each response is delivered as the server sent it.
    pub async fn execute_many(&self, mut requests: Vec<Request>) -> Result<Vec<Response>, Error> {
        self.check_running()?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for request in &mut requests {
            self.prepare_body(request)?;
        }
        let mut broker = Broker::new(self.next_id(), requests[0].url.clone(), false);
        let mut transported = self.open_transport(&requests[0].url, &mut broker).await?;

        let result = match transported.protocol {
            Protocol::Http2 => self.exchange_h2(&mut transported.stream, &requests).await,
            Protocol::Http1 => {
                let mut responses = Vec::with_capacity(requests.len());
                let mut alive = true;
                for request in &requests {
                    if !alive {
                        responses.push(Response::synthetic(500, "connection not reusable"));
                        continue;
                    }
                    match self
                        .exchange_h1(&mut transported.stream, request, transported.absolute_form)
                        .await
                    {
                        Ok((response, keep_alive)) => {
                            alive = keep_alive;
                            responses.push(response);
                        }
                        Err(error) => {
                            warn!("h1: pipeline broke: {}", error);
                            alive = false;
                            responses.push(Response::synthetic(500, "connection lost"));
                        }
                    }
                }
                Ok(responses)
            }
        };
        self.release(&transported);
        let mut responses = result?;
        for response in &mut responses {
            self.finish_body(response)?;
        }
        Ok(responses)
    }

    /// Opens a Websocket connection to a `ws://` or `wss://` URL, through
    /// the full transport pipeline. When the TLS handshake settles on
    /// HTTP/2, the session tunnels frames through an extended CONNECT
    /// stream instead of the HTTP/1.1 upgrade.
    pub async fn connect_ws(&self, addr: &str) -> Result<WSConnection, Error> {
        self.check_running()?;
        let url = Url::parse(addr)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidSchemeURL(url.scheme().to_string()));
        }

        let mut auth = AuthContext::new(AuthScheme::Basic);
        let mut attempt = 0usize;
        let mut authorization: Option<(String, String)> = None;

        loop {
            self.check_running()?;
            let mut broker = Broker::new(self.next_id(), url.clone(), false);
            let transported = self.open_transport(&url, &mut broker).await?;
            self.release(&transported);

            let connection = match transported.protocol {
                Protocol::Http2 => {
                    self.connect_ws_h2(transported.stream, &url, broker.id).await
                }
                Protocol::Http1 => {
                    self.connect_ws_h1(
                        transported.stream,
                        &url,
                        broker.id,
                        authorization.as_ref(),
                    )
                    .await
                }
            };

            match connection {
                Ok(connection) => {
                    if let Ok(mut guard) = self.live_writers.lock() {
                        guard.retain(|(_, weak)| weak.strong_count() > 0);
                        guard.push((broker.id, Arc::downgrade(&connection.writer_handle())));
                    }
                    return Ok(connection);
                }
                Err(Error::HttpStatus { status, reason }) if status == 401 || status == 407 => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        return Err(Error::AuthExhausted);
                    }
                    // The challenge rode in on the failed upgrade response.
                    let creds = match self.config.credentials.as_ref() {
                        Some(creds) => creds,
                        None => return Err(Error::HttpStatus { status, reason }),
                    };
                    if auth.prime(&reason).is_err() {
                        return Err(Error::HttpStatus { status, reason });
                    }
                    let target = match url.query() {
                        Some(query) => format!("{}?{}", url.path(), query),
                        None => url.path().to_string(),
                    };
                    let value = auth.header("GET", &target, creds)?;
                    let name = if status == 407 {
                        "Proxy-Authorization"
                    } else {
                        "Authorization"
                    };
                    authorization = Some((name.to_string(), value));
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn connect_ws_h1(
        &self,
        mut stream: NetStream,
        url: &Url,
        broker_id: u64,
        authorization: Option<&(String, String)>,
    ) -> Result<WSConnection, Error> {
        let mut ws_config = self.config.web_socket_config.clone();
        let outcome = match authorization {
            None => client_handshake(&mut stream, url, &ws_config).await,
            Some((name, value)) => {
                crate::handshake::client_handshake_with_headers(
                    &mut stream,
                    url,
                    &ws_config,
                    &[(name.as_str(), value.as_str())],
                )
                .await
            }
        }?;

        ws_config.extensions = outcome.extensions.clone();
        let ping_config = if self.config.ping {
            Some(PingConfig {
                interval: self.config.ping_interval,
                wait_pong: self.config.wait_pong,
                broker_id,
            })
        } else {
            None
        };
        Ok(WSConnection::spawn(
            Box::new(stream),
            Role::Client,
            ws_config,
            outcome.extensions,
            outcome.subprotocol,
            outcome.leftover,
            ping_config,
        ))
    }

    /// RFC 8441 path: waits for the server settings, opens the extended
    /// CONNECT stream and bridges its DATA frames into a local duplex pipe
    /// that carries ordinary Websocket framing.
    async fn connect_ws_h2(
        &self,
        mut stream: NetStream,
        url: &Url,
        broker_id: u64,
    ) -> Result<WSConnection, Error> {
        let mut session = H2Session::new(Settings::client());
        let out = session.take_output();
        stream.write_all(&out).await?;
        stream.flush().await?;

        // The server announces extended CONNECT support in its SETTINGS.
        let settings_seen = async {
            loop {
                let mut chunk = [0u8; 16 * 1024];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(Error::IncompleteHTTPMessage);
                }
                let events = session.process(&chunk[..n])?;
                let out = session.take_output();
                if !out.is_empty() {
                    stream.write_all(&out).await?;
                }
                if events
                    .iter()
                    .any(|e| matches!(e, H2Event::SettingsUpdated))
                {
                    return Ok(());
                }
            }
        };
        timeout(self.config.connect_timeout, settings_seen).await??;

        let ws_config = self.config.web_socket_config.clone();
        let stream_id = session.submit_connect(
            url,
            &ws_config.subprotocols,
            ws_config.extensions.as_ref(),
        )?;
        let out = session.take_output();
        stream.write_all(&out).await?;
        stream.flush().await?;

        // Wait for the tunnel to open: a 2xx :status on our stream.
        let mut tunnel_headers = None;
        let opened = async {
            loop {
                let mut chunk = [0u8; 16 * 1024];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(Error::IncompleteHTTPMessage);
                }
                let events = session.process(&chunk[..n])?;
                let out = session.take_output();
                if !out.is_empty() {
                    stream.write_all(&out).await?;
                }
                for event in events {
                    match event {
                        H2Event::Headers {
                            stream_id: id,
                            headers,
                            ..
                        } if id == stream_id => {
                            tunnel_headers = Some(headers);
                            return Ok(());
                        }
                        H2Event::StreamReset {
                            stream_id: id,
                            error_code,
                        } if id == stream_id => {
                            return Err(Error::H2StreamReset {
                                stream_id: id,
                                code: error_code,
                            });
                        }
                        _ => {}
                    }
                }
            }
        };
        timeout(self.config.connect_timeout, opened).await??;

        let headers = tunnel_headers.ok_or(Error::NoUpgrade)?;
        let status = headers
            .iter()
            .find(|(name, _)| name == ":status")
            .map(|(_, value)| value.parse::<u16>().unwrap_or(0))
            .unwrap_or(0);
        if !(200..300).contains(&status) {
            session.rst_stream(stream_id, error_code::CANCEL);
            let out = session.take_output();
            let _ = stream.write_all(&out).await;
            return Err(Error::HttpStatus {
                status,
                reason: "extended CONNECT refused".to_string(),
            });
        }
        let extensions = headers
            .iter()
            .find(|(name, _)| name == "sec-websocket-extensions")
            .and_then(|(_, value)| parse_extensions(value.clone()));
        let subprotocol = headers
            .iter()
            .find(|(name, _)| name == "sec-websocket-protocol")
            .map(|(_, value)| value.trim().to_string());

        // Local duplex pipe: one end runs Websocket framing, the other is
        // shuttled through DATA frames by the driver task.
        let (ws_side, bridge_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(drive_h2_tunnel(stream, session, stream_id, bridge_side));

        let mut config = ws_config;
        config.extensions = extensions.clone();
        let ping_config = if self.config.ping {
            Some(PingConfig {
                interval: self.config.ping_interval,
                wait_pong: self.config.wait_pong,
                broker_id,
            })
        } else {
            None
        };
        Ok(WSConnection::spawn(
            Box::new(ws_side),
            Role::Client,
            config,
            extensions,
            subprotocol,
            BytesMut::new(),
            ping_config,
        ))
    }
}

/// Shuttles bytes between the H2 session's CONNECT stream and the duplex
/// pipe carrying Websocket frames, until either side ends.
async fn drive_h2_tunnel(
    stream: NetStream,
    mut session: H2Session,
    stream_id: u32,
    bridge: tokio::io::DuplexStream,
) {
    let (mut sock_read, mut sock_write) = tokio::io::split(stream);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge);
    let mut socket_buf = [0u8; 16 * 1024];
    let mut bridge_buf = [0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = sock_read.read(&mut socket_buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let events = match session.process(&socket_buf[..n]) {
                    Ok(events) => events,
                    Err(e) => {
                        debug!("h2 tunnel: session error: {}", e);
                        let out = session.take_output();
                        let _ = sock_write.write_all(&out).await;
                        break;
                    }
                };
                let mut finished = false;
                for event in events {
                    match event {
                        H2Event::Data { stream_id: id, data, end_stream } if id == stream_id => {
                            session.consume(id, data.len());
                            if bridge_write.write_all(&data).await.is_err() {
                                finished = true;
                            }
                            if end_stream {
                                finished = true;
                            }
                        }
                        H2Event::StreamReset { stream_id: id, .. } if id == stream_id => {
                            finished = true;
                        }
                        H2Event::GoAway { .. } => {
                            finished = true;
                        }
                        _ => {}
                    }
                }
                let out = session.take_output();
                if !out.is_empty() && sock_write.write_all(&out).await.is_err() {
                    break;
                }
                if finished {
                    break;
                }
            }
            read = bridge_read.read(&mut bridge_buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        // Websocket side is done; half-close the stream.
                        let _ = session.send_data(stream_id, &[], true);
                        let out = session.take_output();
                        let _ = sock_write.write_all(&out).await;
                        break;
                    }
                    Ok(n) => {
                        if session.send_data(stream_id, &bridge_buf[..n], false).is_err() {
                            break;
                        }
                        let out = session.take_output();
                        if !out.is_empty() && sock_write.write_all(&out).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("h2 tunnel: stream {} closed", stream_id);
}
