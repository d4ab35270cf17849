use crate::frame::close_code;
use httparse::Error as HttpParseError;
use pki_types::InvalidDnsNameError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

/// Coarse error families surfaced to callers. Every [`Error`] variant maps
/// to exactly one kind, see [`Error::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Protocol,
    Websocket,
    Http,
    Network,
    Tls,
    Dns,
    Auth,
    Encoding,
}

#[derive(Error, Debug)]
pub enum Error {
    // Channel / task errors
    #[error("channel communication error")]
    CommunicationError,

    // General errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    // Handshake errors
    #[error("Invalid handshake request method and version")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("Host header missing in the request")]
    NoHostHeaderPresent,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("Server didn't upgrade the connection")]
    NoUpgrade,

    #[error("Server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("Server picked subprotocol `{0}` which was never offered")]
    SubprotocolNotOffered(String),

    #[error("Server answered with extension `{0}` which was never offered")]
    ExtensionNotOffered(String),

    // Websocket framing errors
    #[error("RSV not zero")]
    RSVNotZero,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("Masked frame from server")]
    MaskedFrameFromServer,

    #[error("Unmasked frame from client")]
    UnmaskedFrameFromClient,

    #[error("Invalid Opcode")]
    InvalidOpcode,

    #[error("Invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("Incoming fragmented message but there is one already in progress")]
    FragmentedInProgress,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("fragment_size: `{0}` can't be greater than max_frame_size: `{1}`")]
    CustomFragmentSizeExceeded(usize, usize),

    #[error("Max frame size reached")]
    MaxFrameSize,

    #[error("Max message size reached")]
    MaxMessageSize,

    #[error("PING response not received")]
    PongTimeout,

    #[error("Connection closed by peer with code {code}: {reason}")]
    ClosedByPeer { code: u16, reason: String },

    // HTTP/1.1 errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in URL: `{0}`")]
    InvalidSchemeURL(String),

    #[error("URL has no host")]
    URLNoHost,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("Malformed HTTP start line")]
    MalformedStartLine,

    #[error("Content-Length is not a number")]
    InvalidContentLength,

    #[error("Malformed chunk size in chunked body")]
    MalformedChunkSize,

    #[error("Header block exceeds the configured limit")]
    HeaderBlockTooLarge,

    #[error("Incomplete HTTP message")]
    IncompleteHTTPMessage,

    #[error("HTTP request failed with status {status}: {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("Too many redirects or authentication retries for `{0}`")]
    AttemptsExhausted(String),

    // HTTP/2 errors
    #[error("HTTP/2 connection error {code}: {message}")]
    H2Connection { code: u32, message: String },

    #[error("HTTP/2 stream {stream_id} reset with error code {code}")]
    H2StreamReset { stream_id: u32, code: u32 },

    #[error("HPACK coding failure")]
    H2Compression,

    #[error("Peer sent GOAWAY, no new streams accepted")]
    H2GoAway,

    // DNS errors
    #[error("DNS query failed: format error reported by server")]
    DnsFormat,

    #[error("DNS query failed: server failure")]
    DnsServFail,

    #[error("DNS name does not exist")]
    DnsNxDomain,

    #[error("DNS query type not implemented by server")]
    DnsNotImplemented,

    #[error("DNS query refused by server")]
    DnsRefused,

    #[error("No DNS server answered within the timeout")]
    DnsTimeout,

    #[error("DNS response could not be parsed")]
    DnsBadResponse,

    #[error("No address record found for `{0}`")]
    DnsNoRecord(String),

    #[error("DNS resolution cancelled")]
    DnsCancelled,

    #[error("Domain `{0}` could not be encoded to A-labels")]
    DnsBadName(String),

    // TLS errors
    #[error("{source}")]
    DomainError {
        #[from]
        source: InvalidDnsNameError,
    },

    #[error("{source}")]
    TlsError {
        #[from]
        source: rustls::Error,
    },

    #[error("CA file `{0}` contains no usable certificates")]
    EmptyCaFile(String),

    // Proxy errors
    #[error("SOCKS5 proxy answered with unsupported version {0}")]
    SocksVersion(u8),

    #[error("SOCKS5 proxy rejected every offered auth method")]
    SocksNoAcceptableAuth,

    #[error("SOCKS5 proxy rejected the supplied credentials")]
    SocksAuthRejected,

    #[error("SOCKS5 proxy refused the connect request: {0}")]
    SocksConnect(&'static str),

    #[error("Proxy handshake failed with status {0}")]
    ProxyHandshake(u16),

    // Authentication errors
    #[error("Authentication retries exhausted")]
    AuthExhausted,

    #[error("Unsupported authentication challenge: `{0}`")]
    AuthChallenge(String),

    // Compression errors
    #[error("max_window_bits should be a value between 8 and 15")]
    InvalidMaxWindowBits,

    #[error("payload decompression failed: {0}")]
    Decompression(String),

    #[error("payload compression failed: {0}")]
    Compression(String),

    #[error("unknown content coding `{0}`")]
    UnknownContentCoding(String),
}

impl Error {
    /// The error family this error belongs to.
    pub fn kind(&self) -> Kind {
        use Error::*;
        match self {
            RSVNotZero | ControlFramesFragmented | ControlFramePayloadSize
            | MaskedFrameFromServer | UnmaskedFrameFromClient | InvalidOpcode
            | InvalidFrameFragmentation | FragmentedInProgress | InvalidContinuationFrame
            | CustomFragmentSizeExceeded(..) | MaxFrameSize | MaxMessageSize
            | PongTimeout | ClosedByPeer { .. } => Kind::Websocket,

            InvalidHTTPHandshake | NoConnectionHeaderPresent | NoUpgradeHeaderPresent
            | NoHostHeaderPresent | NoSecWebsocketKey | NoUpgrade | InvalidAcceptKey
            | SubprotocolNotOffered(..) | ExtensionNotOffered(..) | MalformedStartLine
            | InvalidContentLength | MalformedChunkSize | HeaderBlockTooLarge
            | IncompleteHTTPMessage | HttpParseError { .. } => Kind::Protocol,

            HttpStatus { .. } | AttemptsExhausted(..) | URLParseError { .. }
            | InvalidSchemeURL(..) | URLNoHost | H2Connection { .. }
            | H2StreamReset { .. } | H2Compression | H2GoAway => Kind::Http,

            DnsFormat | DnsServFail | DnsNxDomain | DnsNotImplemented | DnsRefused
            | DnsTimeout | DnsBadResponse | DnsNoRecord(..) | DnsCancelled
            | DnsBadName(..) => Kind::Dns,

            DomainError { .. } | TlsError { .. } | EmptyCaFile(..) => Kind::Tls,

            SocksVersion(..) | SocksNoAcceptableAuth | SocksAuthRejected
            | SocksConnect(..) | ProxyHandshake(..) => Kind::Network,

            AuthExhausted | AuthChallenge(..) => Kind::Auth,

            InvalidMaxWindowBits | Decompression(..) | Compression(..)
            | UnknownContentCoding(..) => Kind::Encoding,

            CommunicationError | Timeout { .. } | IOError { .. } | FromUtf8Error { .. } => {
                Kind::Network
            }
        }
    }

    /// Websocket close code matching this error, when the error should be
    /// announced to the peer before tearing the connection down.
    pub fn close_code(&self) -> Option<u16> {
        use Error::*;
        match self {
            RSVNotZero | ControlFramesFragmented | ControlFramePayloadSize
            | MaskedFrameFromServer | UnmaskedFrameFromClient | InvalidOpcode
            | InvalidFrameFragmentation | FragmentedInProgress
            | InvalidContinuationFrame => Some(close_code::PROTOCOL_ERROR),
            FromUtf8Error { .. } | Decompression(..) => Some(close_code::INVALID_DATA),
            PongTimeout => Some(close_code::NO_STATUS),
            MaxFrameSize | MaxMessageSize => Some(close_code::TOO_BIG),
            _ => None,
        }
    }
}
