use crate::error::Error;
use crate::extensions::Extensions;
use crate::hpack::{HpackDecoder, HpackEncoder};
use crate::request::{host_fields, Request};
use bytes::{Buf, BytesMut};
use std::collections::BTreeMap;
use url::Url;

/// HTTP/2 frame types (RFC 7540 Section 6)
pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

/// HTTP/2 frame flags
pub mod flags {
    pub const ACK: u8 = 0x1;
    pub const END_STREAM: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 error codes (RFC 7540 Section 7)
pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const SETTINGS_TIMEOUT: u32 = 0x4;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;
    pub const CONNECT_ERROR: u32 = 0xa;
    pub const ENHANCE_YOUR_CALM: u32 = 0xb;
    pub const INADEQUATE_SECURITY: u32 = 0xc;
    pub const HTTP_1_1_REQUIRED: u32 = 0xd;
}

/// SETTINGS identifiers (RFC 7540 Section 6.5.2 + RFC 8441)
pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
    pub const ENABLE_CONNECT_PROTOCOL: u16 = 0x8;
}

pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const MAX_FRAME_SIZE_MIN: u32 = 1 << 14;
pub const MAX_FRAME_SIZE_MAX: u32 = (1 << 24) - 1;
const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// The settings table of one side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub enable_connect_protocol: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: false,
            max_concurrent_streams: 128,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: MAX_FRAME_SIZE_MIN,
            max_header_list_size: u32::MAX,
            enable_connect_protocol: false,
        }
    }
}

impl Settings {
    /// Values the wire-level peer starts from before any SETTINGS arrive.
    fn peer_initial() -> Self {
        Self {
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            enable_connect_protocol: false,
            ..Default::default()
        }
    }

    /// Client settings: push disabled, extended CONNECT allowed so a
    /// Websocket tunnel can be opened over the session.
    pub fn client() -> Self {
        Self {
            enable_connect_protocol: true,
            ..Default::default()
        }
    }

    fn apply(&mut self, id: u16, value: u32) -> Result<(), Error> {
        match id {
            settings_id::HEADER_TABLE_SIZE => self.header_table_size = value,
            settings_id::ENABLE_PUSH => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => {
                    return Err(Error::H2Connection {
                        code: error_code::PROTOCOL_ERROR,
                        message: "ENABLE_PUSH must be 0 or 1".into(),
                    })
                }
            },
            settings_id::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = value,
            settings_id::INITIAL_WINDOW_SIZE => {
                if value > i32::MAX as u32 {
                    return Err(Error::H2Connection {
                        code: error_code::FLOW_CONTROL_ERROR,
                        message: "INITIAL_WINDOW_SIZE above 2^31-1".into(),
                    });
                }
                self.initial_window_size = value;
            }
            settings_id::MAX_FRAME_SIZE => {
                if !(MAX_FRAME_SIZE_MIN..=MAX_FRAME_SIZE_MAX).contains(&value) {
                    return Err(Error::H2Connection {
                        code: error_code::PROTOCOL_ERROR,
                        message: "MAX_FRAME_SIZE out of range".into(),
                    });
                }
                self.max_frame_size = value;
            }
            settings_id::MAX_HEADER_LIST_SIZE => self.max_header_list_size = value,
            settings_id::ENABLE_CONNECT_PROTOCOL => {
                self.enable_connect_protocol = value == 1;
            }
            // Unknown settings are ignored per spec.
            _ => {}
        }
        Ok(())
    }

    fn entries(&self) -> Vec<(u16, u32)> {
        vec![
            (settings_id::HEADER_TABLE_SIZE, self.header_table_size),
            (settings_id::ENABLE_PUSH, self.enable_push as u32),
            (
                settings_id::MAX_CONCURRENT_STREAMS,
                self.max_concurrent_streams,
            ),
            (settings_id::INITIAL_WINDOW_SIZE, self.initial_window_size),
            (settings_id::MAX_FRAME_SIZE, self.max_frame_size),
            (
                settings_id::ENABLE_CONNECT_PROTOCOL,
                self.enable_connect_protocol as u32,
            ),
        ]
    }
}

/// A parsed 9-byte frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 9 {
            return None;
        }
        let length = ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32);
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & 0x7FFF_FFFF;
        Some(Self {
            length,
            frame_type: data[3],
            flags: data[4],
            stream_id,
        })
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    pub fn is_end_headers(&self) -> bool {
        self.flags & flags::END_HEADERS != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }
}

pub fn build_frame(frame_type: u8, frame_flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u32;
    let mut frame = Vec::with_capacity(9 + payload.len());
    frame.push((length >> 16) as u8);
    frame.push((length >> 8) as u8);
    frame.push(length as u8);
    frame.push(frame_type);
    frame.push(frame_flags);
    frame.extend_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// One client-initiated stream and what has accumulated on it.
#[derive(Debug)]
pub struct H2Stream {
    pub id: u32,
    pub state: StreamState,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    send_window: i64,
    recv_window: i64,
    /// DATA waiting for flow-control credit, with its END_STREAM marker.
    pending_data: Vec<u8>,
    pending_end_stream: bool,
}

impl H2Stream {
    fn new(id: u32, send_window: i64, recv_window: i64) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            headers: Vec::new(),
            body: Vec::new(),
            send_window,
            recv_window,
            pending_data: Vec::new(),
            pending_end_stream: false,
        }
    }

    fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedLocal => StreamState::Closed,
            StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
    }

    fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedRemote => StreamState::Closed,
            StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedLocal,
        };
    }
}

/// Events surfaced to the connection driver.
#[derive(Debug)]
pub enum H2Event {
    Headers {
        stream_id: u32,
        headers: Vec<(String, String)>,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    StreamReset {
        stream_id: u32,
        error_code: u32,
    },
    GoAway {
        last_stream_id: u32,
        error_code: u32,
    },
    /// Peer settings applied (and ACKed automatically).
    SettingsUpdated,
    SettingsAck,
    Ping {
        data: [u8; 8],
    },
    Pong {
        data: [u8; 8],
    },
}

/// Client-side HTTP/2 session over one connection.
///
/// Sans-I/O: feed inbound bytes to [`H2Session::process`], drain outbound
/// bytes with [`H2Session::take_output`]. The HPACK contexts and the stream
/// map live for the whole session; stream ids are odd and strictly
/// increasing.
pub struct H2Session {
    encoder: HpackEncoder,
    decoder: HpackDecoder,
    streams: BTreeMap<u32, H2Stream>,
    next_stream_id: u32,

    local_settings: Settings,
    peer_settings: Settings,

    conn_send_window: i64,
    conn_recv_window: i64,

    buffer: BytesMut,
    output: Vec<u8>,

    goaway_received: bool,
    last_remote_stream: u32,

    pending_headers_stream: Option<u32>,
    pending_headers_end_stream: bool,
    pending_header_block: Vec<u8>,
}

impl H2Session {
    /// Creates the session and queues the connection preface plus the local
    /// SETTINGS frame for sending.
    pub fn new(local_settings: Settings) -> Self {
        let mut session = Self {
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
            streams: BTreeMap::new(),
            next_stream_id: 1,
            local_settings,
            peer_settings: Settings::peer_initial(),
            conn_send_window: DEFAULT_WINDOW_SIZE as i64,
            conn_recv_window: DEFAULT_WINDOW_SIZE as i64,
            buffer: BytesMut::new(),
            output: Vec::new(),
            goaway_received: false,
            last_remote_stream: 0,
            pending_headers_stream: None,
            pending_headers_end_stream: false,
            pending_header_block: Vec::new(),
        };
        session.output.extend_from_slice(CONNECTION_PREFACE);
        let mut payload = Vec::new();
        for (id, value) in local_settings.entries() {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        session
            .output
            .extend_from_slice(&build_frame(frame_type::SETTINGS, 0, 0, &payload));
        session
    }

    pub fn peer_settings(&self) -> &Settings {
        &self.peer_settings
    }

    pub fn is_terminating(&self) -> bool {
        self.goaway_received
    }

    pub fn stream(&self, stream_id: u32) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    /// Outbound bytes produced since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Allocates the next client stream id, always odd, strictly increasing.
    fn allocate_stream(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        let stream = H2Stream::new(
            id,
            self.peer_settings.initial_window_size as i64,
            self.local_settings.initial_window_size as i64,
        );
        self.streams.insert(id, stream);
        id
    }

    /// Submits a request. Pseudo-headers go first, in the order
    /// `:method`, `:scheme`, `:authority`, `:path`; regular header names are
    /// lowercased. Returns the allocated stream id.
    pub fn submit_request(&mut self, request: &Request) -> Result<u32, Error> {
        if self.goaway_received {
            return Err(Error::H2GoAway);
        }
        let (_, _, authority) = host_fields(&request.url)?;

        let mut headers: Vec<(String, String)> = vec![
            (":method".into(), request.method.clone()),
            (":scheme".into(), request.url.scheme().to_string()),
            (":authority".into(), authority),
            (":path".into(), request.target()),
        ];
        for (name, value) in request.headers.iter() {
            let name = name.to_ascii_lowercase();
            // Connection management is frame-level in HTTP/2.
            if matches!(
                name.as_str(),
                "connection" | "keep-alive" | "transfer-encoding" | "host" | "upgrade"
            ) {
                continue;
            }
            headers.push((name, value.to_string()));
        }

        let end_stream = request.body.is_none();
        let stream_id = self.send_headers(headers, end_stream)?;
        if let Some(body) = &request.body {
            self.send_data(stream_id, body, true)?;
        }
        Ok(stream_id)
    }

    /// Opens a Websocket tunnel with extended CONNECT (RFC 8441). The peer
    /// must have advertised ENABLE_CONNECT_PROTOCOL.
    pub fn submit_connect(
        &mut self,
        url: &Url,
        subprotocols: &[String],
        extensions: Option<&Extensions>,
    ) -> Result<u32, Error> {
        if self.goaway_received {
            return Err(Error::H2GoAway);
        }
        if !self.peer_settings.enable_connect_protocol {
            return Err(Error::H2Connection {
                code: error_code::PROTOCOL_ERROR,
                message: "peer did not enable the extended CONNECT protocol".into(),
            });
        }
        let (_, _, authority) = host_fields(url)?;
        let scheme = match url.scheme() {
            "ws" => "http",
            "wss" => "https",
            other => other,
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let mut headers: Vec<(String, String)> = vec![
            (":method".into(), "CONNECT".into()),
            (":protocol".into(), "websocket".into()),
            (":scheme".into(), scheme.to_string()),
            (":authority".into(), authority),
            (":path".into(), path),
            ("sec-websocket-version".into(), "13".into()),
        ];
        if !subprotocols.is_empty() {
            headers.push(("sec-websocket-protocol".into(), subprotocols.join(", ")));
        }
        if let Some(value) = extensions.and_then(|e| e.header_value()) {
            headers.push(("sec-websocket-extensions".into(), value));
        }

        self.send_headers(headers, false)
    }

    fn send_headers(
        &mut self,
        headers: Vec<(String, String)>,
        end_stream: bool,
    ) -> Result<u32, Error> {
        let stream_id = self.allocate_stream();
        let block = self.encoder.encode(&headers);

        let mut frame_flags = flags::END_HEADERS;
        if end_stream {
            frame_flags |= flags::END_STREAM;
        }
        self.output
            .extend_from_slice(&build_frame(frame_type::HEADERS, frame_flags, stream_id, &block));

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = StreamState::Open;
            if end_stream {
                stream.close_local();
            }
        }
        Ok(stream_id)
    }

    /// Writes DATA within the connection and stream windows; the remainder
    /// is parked on the stream until WINDOW_UPDATE credit arrives.
    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> Result<(), Error> {
        let max_frame = self.peer_settings.max_frame_size as usize;
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::H2StreamReset {
                stream_id,
                code: error_code::STREAM_CLOSED,
            })?;

        let mut pending = std::mem::take(&mut stream.pending_data);
        pending.extend_from_slice(data);
        let end_stream = end_stream || stream.pending_end_stream;

        let mut offset = 0;
        while offset < pending.len() {
            let credit = std::cmp::min(stream.send_window, self.conn_send_window);
            if credit <= 0 {
                break;
            }
            let take = pending.len() - offset;
            let take = take.min(credit as usize).min(max_frame);
            let chunk = &pending[offset..offset + take];
            let last = offset + take == pending.len();
            let frame_flags = if last && end_stream { flags::END_STREAM } else { 0 };
            self.output
                .extend_from_slice(&build_frame(frame_type::DATA, frame_flags, stream_id, chunk));
            stream.send_window -= take as i64;
            self.conn_send_window -= take as i64;
            offset += take;
        }

        if offset < pending.len() {
            stream.pending_data = pending.split_off(offset);
            stream.pending_end_stream = end_stream;
        } else {
            stream.pending_end_stream = false;
            if end_stream {
                stream.close_local();
            }
        }

        // Zero-length END_STREAM still needs its empty DATA frame.
        if pending.is_empty() && data.is_empty() && end_stream {
            self.output
                .extend_from_slice(&build_frame(frame_type::DATA, flags::END_STREAM, stream_id, &[]));
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.close_local();
            }
        }
        Ok(())
    }

    /// Reports `n` body bytes of `stream_id` as drained by the consumer and
    /// replenishes both flow-control windows.
    pub fn consume(&mut self, stream_id: u32, n: usize) {
        if n == 0 {
            return;
        }
        let n32 = n as u32;
        self.conn_recv_window += n as i64;
        self.output.extend_from_slice(&build_frame(
            frame_type::WINDOW_UPDATE,
            0,
            0,
            &n32.to_be_bytes(),
        ));
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.state != StreamState::Closed {
                stream.recv_window += n as i64;
                self.output.extend_from_slice(&build_frame(
                    frame_type::WINDOW_UPDATE,
                    0,
                    stream_id,
                    &n32.to_be_bytes(),
                ));
            }
        }
    }

    pub fn ping(&mut self, data: [u8; 8]) {
        self.output
            .extend_from_slice(&build_frame(frame_type::PING, 0, 0, &data));
    }

    pub fn rst_stream(&mut self, stream_id: u32, code: u32) {
        self.output.extend_from_slice(&build_frame(
            frame_type::RST_STREAM,
            0,
            stream_id,
            &code.to_be_bytes(),
        ));
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = StreamState::Closed;
        }
    }

    pub fn goaway(&mut self, code: u32) {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&self.last_remote_stream.to_be_bytes());
        payload.extend_from_slice(&code.to_be_bytes());
        self.output
            .extend_from_slice(&build_frame(frame_type::GOAWAY, 0, 0, &payload));
    }

    fn connection_error(&mut self, code: u32, message: &str) -> Error {
        self.goaway(code);
        Error::H2Connection {
            code,
            message: message.to_string(),
        }
    }

    /// Feeds inbound bytes, producing events. SETTINGS and PING are
    /// acknowledged automatically; the resulting frames land in the output
    /// buffer.
    pub fn process(&mut self, data: &[u8]) -> Result<Vec<H2Event>, Error> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            if self.buffer.len() < 9 {
                break;
            }
            let header = match FrameHeader::parse(&self.buffer) {
                Some(header) => header,
                None => break,
            };
            if header.length > self.local_settings.max_frame_size {
                return Err(self.connection_error(
                    error_code::FRAME_SIZE_ERROR,
                    "frame exceeds advertised MAX_FRAME_SIZE",
                ));
            }
            let total = 9 + header.length as usize;
            if self.buffer.len() < total {
                break;
            }
            self.buffer.advance(9);
            let payload = self.buffer.split_to(header.length as usize).to_vec();

            // A header block in flight only allows CONTINUATION on the same
            // stream in between.
            if self.pending_headers_stream.is_some()
                && header.frame_type != frame_type::CONTINUATION
            {
                return Err(self.connection_error(
                    error_code::PROTOCOL_ERROR,
                    "expected CONTINUATION for the open header block",
                ));
            }

            if header.stream_id != 0 && header.stream_id > self.last_remote_stream {
                self.last_remote_stream = header.stream_id;
            }

            if let Some(event) = self.handle_frame(&header, payload)? {
                events.push(event);
            }
        }

        Ok(events)
    }

    fn handle_frame(
        &mut self,
        header: &FrameHeader,
        payload: Vec<u8>,
    ) -> Result<Option<H2Event>, Error> {
        match header.frame_type {
            frame_type::DATA => {
                let data = extract_data_payload(header, payload)
                    .map_err(|m| self.connection_error(error_code::PROTOCOL_ERROR, m))?;
                self.conn_recv_window -= header.length as i64;
                if self.conn_recv_window < 0 {
                    return Err(self.connection_error(
                        error_code::FLOW_CONTROL_ERROR,
                        "connection receive window exhausted",
                    ));
                }
                let known_open = self
                    .streams
                    .get(&header.stream_id)
                    .map(|stream| stream.state != StreamState::Closed)
                    .unwrap_or(false);
                if !known_open {
                    self.rst_stream(header.stream_id, error_code::STREAM_CLOSED);
                    return Ok(None);
                }
                if let Some(stream) = self.streams.get_mut(&header.stream_id) {
                    stream.recv_window -= header.length as i64;
                    stream.body.extend_from_slice(&data);
                    if header.is_end_stream() {
                        stream.close_remote();
                    }
                }
                Ok(Some(H2Event::Data {
                    stream_id: header.stream_id,
                    data,
                    end_stream: header.is_end_stream(),
                }))
            }
            frame_type::HEADERS => {
                let block = extract_headers_payload(header, payload)
                    .map_err(|m| self.connection_error(error_code::PROTOCOL_ERROR, m))?;
                if header.is_end_headers() {
                    self.commit_header_block(header.stream_id, block, header.is_end_stream())
                        .map(Some)
                } else {
                    self.pending_headers_stream = Some(header.stream_id);
                    self.pending_headers_end_stream = header.is_end_stream();
                    self.pending_header_block = block;
                    Ok(None)
                }
            }
            frame_type::CONTINUATION => {
                let pending = match self.pending_headers_stream {
                    Some(stream_id) if stream_id == header.stream_id => stream_id,
                    _ => {
                        return Err(self.connection_error(
                            error_code::PROTOCOL_ERROR,
                            "unexpected CONTINUATION frame",
                        ))
                    }
                };
                if self.pending_header_block.len() + payload.len() > MAX_HEADER_BLOCK_SIZE {
                    return Err(self.connection_error(
                        error_code::ENHANCE_YOUR_CALM,
                        "header block too large",
                    ));
                }
                self.pending_header_block.extend_from_slice(&payload);
                if header.is_end_headers() {
                    let block = std::mem::take(&mut self.pending_header_block);
                    let end_stream = self.pending_headers_end_stream;
                    self.pending_headers_stream = None;
                    self.pending_headers_end_stream = false;
                    self.commit_header_block(pending, block, end_stream).map(Some)
                } else {
                    Ok(None)
                }
            }
            frame_type::RST_STREAM => {
                if payload.len() != 4 {
                    return Err(self
                        .connection_error(error_code::FRAME_SIZE_ERROR, "RST_STREAM length != 4"));
                }
                let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                if let Some(stream) = self.streams.get_mut(&header.stream_id) {
                    stream.state = StreamState::Closed;
                }
                Ok(Some(H2Event::StreamReset {
                    stream_id: header.stream_id,
                    error_code: code,
                }))
            }
            frame_type::SETTINGS => {
                if header.stream_id != 0 {
                    return Err(self
                        .connection_error(error_code::PROTOCOL_ERROR, "SETTINGS on a stream"));
                }
                if header.is_ack() {
                    if !payload.is_empty() {
                        return Err(self.connection_error(
                            error_code::FRAME_SIZE_ERROR,
                            "SETTINGS ACK with payload",
                        ));
                    }
                    return Ok(Some(H2Event::SettingsAck));
                }
                if payload.len() % 6 != 0 {
                    return Err(self.connection_error(
                        error_code::FRAME_SIZE_ERROR,
                        "SETTINGS length not a multiple of 6",
                    ));
                }
                let old_initial = self.peer_settings.initial_window_size as i64;
                let mut pos = 0;
                while pos + 6 <= payload.len() {
                    let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
                    let value = u32::from_be_bytes([
                        payload[pos + 2],
                        payload[pos + 3],
                        payload[pos + 4],
                        payload[pos + 5],
                    ]);
                    if let Err(error) = self.peer_settings.apply(id, value) {
                        if let Error::H2Connection { code, message } = error {
                            return Err(self.connection_error(code, &message));
                        }
                        return Err(error);
                    }
                    pos += 6;
                }
                // A changed INITIAL_WINDOW_SIZE shifts every open stream's
                // send window by the delta.
                let delta = self.peer_settings.initial_window_size as i64 - old_initial;
                if delta != 0 {
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                self.output
                    .extend_from_slice(&build_frame(frame_type::SETTINGS, flags::ACK, 0, &[]));
                self.flush_pending_data();
                Ok(Some(H2Event::SettingsUpdated))
            }
            frame_type::PING => {
                if payload.len() != 8 {
                    return Err(
                        self.connection_error(error_code::FRAME_SIZE_ERROR, "PING length != 8")
                    );
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                if header.is_ack() {
                    Ok(Some(H2Event::Pong { data }))
                } else {
                    self.output
                        .extend_from_slice(&build_frame(frame_type::PING, flags::ACK, 0, &data));
                    Ok(Some(H2Event::Ping { data }))
                }
            }
            frame_type::GOAWAY => {
                if payload.len() < 8 {
                    return Err(
                        self.connection_error(error_code::FRAME_SIZE_ERROR, "GOAWAY too short")
                    );
                }
                self.goaway_received = true;
                let last_stream_id =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        & 0x7FFF_FFFF;
                let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                Ok(Some(H2Event::GoAway {
                    last_stream_id,
                    error_code: code,
                }))
            }
            frame_type::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(self.connection_error(
                        error_code::FRAME_SIZE_ERROR,
                        "WINDOW_UPDATE length != 4",
                    ));
                }
                let increment =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        & 0x7FFF_FFFF;
                if increment == 0 {
                    return Err(self.connection_error(
                        error_code::PROTOCOL_ERROR,
                        "WINDOW_UPDATE with zero increment",
                    ));
                }
                if header.stream_id == 0 {
                    self.conn_send_window += increment as i64;
                } else if let Some(stream) = self.streams.get_mut(&header.stream_id) {
                    stream.send_window += increment as i64;
                }
                self.flush_pending_data();
                Ok(None)
            }
            // Recorded, not enforced.
            frame_type::PRIORITY => Ok(None),
            frame_type::PUSH_PROMISE => Err(self.connection_error(
                error_code::PROTOCOL_ERROR,
                "PUSH_PROMISE received with push disabled",
            )),
            // Unknown frame types are ignored.
            _ => Ok(None),
        }
    }

    fn commit_header_block(
        &mut self,
        stream_id: u32,
        block: Vec<u8>,
        end_stream: bool,
    ) -> Result<H2Event, Error> {
        let headers = match self.decoder.decode(&block) {
            Ok(headers) => headers,
            Err(_) => {
                return Err(self.connection_error(
                    error_code::COMPRESSION_ERROR,
                    "HPACK decoding failed",
                ))
            }
        };
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.headers.extend(headers.iter().cloned());
            if end_stream {
                stream.close_remote();
            }
        }
        Ok(H2Event::Headers {
            stream_id,
            headers,
            end_stream,
        })
    }

    /// Retries parked DATA after window credit changed.
    fn flush_pending_data(&mut self) {
        let waiting: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.pending_data.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for stream_id in waiting {
            // send_data drains what the windows allow and re-parks the rest.
            let _ = self.send_data(stream_id, &[], false);
        }
    }

    /// Hands the accumulated response of a finished stream to the caller
    /// and forgets the stream.
    pub fn take_stream(&mut self, stream_id: u32) -> Option<(Vec<(String, String)>, Vec<u8>)> {
        self.streams
            .remove(&stream_id)
            .map(|stream| (stream.headers, stream.body))
    }
}

fn extract_data_payload(
    header: &FrameHeader,
    mut payload: Vec<u8>,
) -> Result<Vec<u8>, &'static str> {
    if header.flags & flags::PADDED != 0 {
        if payload.is_empty() {
            return Err("PADDED DATA frame with no payload");
        }
        let pad_length = payload[0] as usize;
        if pad_length >= payload.len() {
            return Err("invalid padding length in DATA frame");
        }
        payload.truncate(payload.len() - pad_length);
        payload.remove(0);
    }
    Ok(payload)
}

fn extract_headers_payload(
    header: &FrameHeader,
    mut payload: Vec<u8>,
) -> Result<Vec<u8>, &'static str> {
    let mut offset = 0;
    let mut end = payload.len();

    if header.flags & flags::PADDED != 0 {
        if payload.is_empty() {
            return Err("PADDED HEADERS frame with no payload");
        }
        let pad_length = payload[0] as usize;
        offset = 1;
        if pad_length >= payload.len() - offset {
            return Err("invalid padding length in HEADERS frame");
        }
        end = payload.len() - pad_length;
    }
    if header.flags & flags::PRIORITY != 0 {
        if payload.len() - offset < 5 {
            return Err("PRIORITY HEADERS frame with insufficient data");
        }
        offset += 5;
    }

    if offset == 0 && end == payload.len() {
        return Ok(payload);
    }
    payload.truncate(end);
    payload.drain(..offset);
    Ok(payload)
}
