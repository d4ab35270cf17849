use crate::error::Error;
use crate::headers::Headers;
use bytes::{Buf, BytesMut};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// Which side of the exchange the parser is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data(u64),
    DataEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    BodyLength(u64),
    BodyChunked(ChunkPhase),
    BodyEof,
    Trailers,
    Done,
}

/// Incremental HTTP/1.1 message parser.
///
/// Feed it bytes as they arrive; it walks
/// start line → headers → body (length-delimited, chunked, or until-EOF)
/// → trailers → done. `Transfer-Encoding: chunked` wins over
/// `Content-Length`; chunk extensions are ignored; trailer headers are
/// appended to the regular header set. A parse error leaves the connection
/// unusable, callers must tear it down.
pub struct Http1Parser {
    kind: MessageKind,
    state: State,
    head: Vec<u8>,

    method: String,
    path: String,
    version_minor: u8,
    status: u16,
    reason: String,

    headers: Headers,
    body: Vec<u8>,
    committed: bool,
    keep_alive: bool,
    chunk_hook: Option<Box<dyn FnMut(&[u8]) + Send>>,
}

impl Http1Parser {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            state: State::StartLine,
            head: Vec::new(),
            method: String::new(),
            path: String::new(),
            version_minor: 1,
            status: 0,
            reason: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
            committed: false,
            keep_alive: true,
            chunk_hook: None,
        }
    }

    /// Inspector called with every body chunk before it joins the assembled
    /// body, for streaming consumers.
    pub fn set_chunk_hook(&mut self, hook: Box<dyn FnMut(&[u8]) + Send>) {
        self.chunk_hook = Some(hook);
    }

    /// Consumes as much of `buf` as possible. Returns true once the message
    /// is complete.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<bool, Error> {
        loop {
            match self.state {
                State::StartLine => {
                    let line = match take_line(buf, self.head.len())? {
                        Some(line) => line,
                        None => return Ok(false),
                    };
                    if line.is_empty() {
                        // Tolerate a stray CRLF before the start line.
                        continue;
                    }
                    self.parse_start_line(&line)?;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let line = match take_line(buf, self.head.len())? {
                        Some(line) => line,
                        None => return Ok(false),
                    };
                    if line.is_empty() {
                        self.parse_header_block()?;
                        self.commit();
                        self.state = self.body_state()?;
                        continue;
                    }
                    self.head.extend_from_slice(&line);
                    self.head.extend_from_slice(b"\r\n");
                    if self.head.len() > MAX_HEAD_SIZE {
                        return Err(Error::HeaderBlockTooLarge);
                    }
                }
                State::BodyLength(remaining) => {
                    if buf.is_empty() {
                        return Ok(false);
                    }
                    let take = std::cmp::min(remaining as usize, buf.len());
                    self.push_body(&buf[..take]);
                    buf.advance(take);
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.state = State::Done;
                    } else {
                        self.state = State::BodyLength(left);
                    }
                }
                State::BodyChunked(phase) => {
                    if !self.feed_chunked(buf, phase)? {
                        return Ok(false);
                    }
                }
                State::BodyEof => {
                    // Everything until the peer closes belongs to the body.
                    if buf.is_empty() {
                        return Ok(false);
                    }
                    let data = buf.split().to_vec();
                    self.push_body(&data);
                }
                State::Trailers => {
                    let line = match take_line(buf, 0)? {
                        Some(line) => line,
                        None => return Ok(false),
                    };
                    if line.is_empty() {
                        self.state = State::Done;
                        continue;
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if let Some((name, value)) = text.split_once(':') {
                        self.headers.insert(name.trim(), value.trim());
                    }
                }
                State::Done => return Ok(true),
            }
        }
    }

    fn feed_chunked(&mut self, buf: &mut BytesMut, phase: ChunkPhase) -> Result<bool, Error> {
        match phase {
            ChunkPhase::Size => {
                let line = match take_line(buf, 0)? {
                    Some(line) => line,
                    None => return Ok(false),
                };
                let text = String::from_utf8_lossy(&line);
                // Chunk extensions after `;` are ignored.
                let size_part = text.split(';').next().unwrap_or("").trim();
                let size =
                    u64::from_str_radix(size_part, 16).map_err(|_| Error::MalformedChunkSize)?;
                if size == 0 {
                    self.state = State::Trailers;
                } else {
                    self.state = State::BodyChunked(ChunkPhase::Data(size));
                }
            }
            ChunkPhase::Data(remaining) => {
                if buf.is_empty() {
                    return Ok(false);
                }
                let take = std::cmp::min(remaining as usize, buf.len());
                self.push_body(&buf[..take]);
                buf.advance(take);
                let left = remaining - take as u64;
                self.state = if left == 0 {
                    State::BodyChunked(ChunkPhase::DataEnd)
                } else {
                    State::BodyChunked(ChunkPhase::Data(left))
                };
            }
            ChunkPhase::DataEnd => {
                if buf.len() < 2 {
                    return Ok(false);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(Error::MalformedChunkSize);
                }
                buf.advance(2);
                self.state = State::BodyChunked(ChunkPhase::Size);
            }
        }
        Ok(true)
    }

    fn parse_start_line(&mut self, line: &[u8]) -> Result<(), Error> {
        let text = std::str::from_utf8(line).map_err(|_| Error::MalformedStartLine)?;
        match self.kind {
            MessageKind::Request => {
                let mut parts = text.split_whitespace();
                let method = parts.next().ok_or(Error::MalformedStartLine)?;
                let path = parts.next().ok_or(Error::MalformedStartLine)?;
                let version = parts.next().ok_or(Error::MalformedStartLine)?;
                self.version_minor = parse_version(version)?;
                self.method = method.to_string();
                self.path = path.to_string();
            }
            MessageKind::Response => {
                let mut parts = text.splitn(3, ' ');
                let version = parts.next().ok_or(Error::MalformedStartLine)?;
                let status = parts.next().ok_or(Error::MalformedStartLine)?;
                self.version_minor = parse_version(version)?;
                self.status = status.parse().map_err(|_| Error::MalformedStartLine)?;
                self.reason = parts.next().unwrap_or("").trim().to_string();
            }
        }
        Ok(())
    }

    fn parse_header_block(&mut self) -> Result<(), Error> {
        if self.head.is_empty() {
            return Ok(());
        }
        // httparse wants the terminating blank line in the block.
        let mut block = std::mem::take(&mut self.head);
        block.extend_from_slice(b"\r\n");

        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        match httparse::parse_headers(&block, &mut parsed)? {
            httparse::Status::Complete((_, headers)) => {
                for header in headers {
                    let value = String::from_utf8_lossy(header.value).into_owned();
                    self.headers.insert(header.name, value);
                }
                Ok(())
            }
            httparse::Status::Partial => Err(Error::IncompleteHTTPMessage),
        }
    }

    /// Freezes the parsed head before body processing starts. Computes
    /// keep-alive from the version and `Connection` header.
    pub fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;
        self.keep_alive = if self.version_minor == 0 {
            self.headers.has_token("connection", "keep-alive")
        } else {
            !self.headers.has_token("connection", "close")
        };
    }

    fn body_state(&self) -> Result<State, Error> {
        // Chunked transfer coding takes precedence over Content-Length.
        if self.headers.has_token("transfer-encoding", "chunked") {
            return Ok(State::BodyChunked(ChunkPhase::Size));
        }
        if let Some(value) = self.headers.get("content-length") {
            let length: u64 = value.trim().parse().map_err(|_| Error::InvalidContentLength)?;
            return Ok(if length == 0 {
                State::Done
            } else {
                State::BodyLength(length)
            });
        }
        match self.kind {
            MessageKind::Request => Ok(State::Done),
            MessageKind::Response => {
                if self.status < 200 || self.status == 204 || self.status == 304 {
                    Ok(State::Done)
                } else {
                    Ok(State::BodyEof)
                }
            }
        }
    }

    fn push_body(&mut self, chunk: &[u8]) {
        if let Some(hook) = self.chunk_hook.as_mut() {
            hook(chunk);
        }
        self.body.extend_from_slice(chunk);
    }

    /// For until-EOF bodies the peer closing the connection finishes the
    /// message; for any other state EOF mid-message is an error.
    pub fn finish_eof(&mut self) -> Result<bool, Error> {
        match self.state {
            State::BodyEof => {
                self.state = State::Done;
                Ok(true)
            }
            State::Done => Ok(true),
            _ => Err(Error::IncompleteHTTPMessage),
        }
    }

    /// Prepares the parser for the next message on a persistent connection.
    pub fn reset(&mut self) {
        let hook = self.chunk_hook.take();
        *self = Http1Parser::new(self.kind);
        self.chunk_hook = hook;
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// True once the start line and headers are frozen.
    pub fn head_complete(&self) -> bool {
        self.committed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// True when the parsed message is a complete Websocket upgrade
    /// (request: RFC 6455 §4.2.1, response: §4.2.2).
    pub fn is_upgrade(&self) -> bool {
        let upgraded = self.headers.has_token("connection", "upgrade")
            && self
                .headers
                .get("upgrade")
                .map(|v| v.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false);
        match self.kind {
            MessageKind::Request => {
                upgraded
                    && self.method.eq_ignore_ascii_case("GET")
                    && self.version_minor >= 1
                    && self.headers.contains("sec-websocket-key")
                    && self
                        .headers
                        .get("sec-websocket-version")
                        .map(|v| v.trim() == "13")
                        .unwrap_or(false)
            }
            MessageKind::Response => {
                upgraded && self.status == 101 && self.headers.contains("sec-websocket-accept")
            }
        }
    }
}

fn parse_version(token: &str) -> Result<u8, Error> {
    match token {
        "HTTP/1.1" => Ok(1),
        "HTTP/1.0" => Ok(0),
        _ => Err(Error::MalformedStartLine),
    }
}

/// Pops one CRLF-terminated line off the buffer, without the terminator.
fn take_line(buf: &mut BytesMut, accumulated: usize) -> Result<Option<Vec<u8>>, Error> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(at) => {
            let line = buf.split_to(at).to_vec();
            buf.advance(2);
            Ok(Some(line))
        }
        None => {
            if accumulated + buf.len() > MAX_HEAD_SIZE {
                return Err(Error::HeaderBlockTooLarge);
            }
            Ok(None)
        }
    }
}
