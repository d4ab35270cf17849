use crate::config::ClientConfig;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use url::Url;

/// Protocol spoken on an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// Connection lifecycle, walked strictly left to right. Proxy and TLS
/// stages are skipped when not configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Resolve,
    Connect,
    ProxyHandshake,
    TlsHandshake,
    Upgrade,
    Ready,
    Closed,
}

/// External happenings delivered to a broker. The tokio task owning the
/// broker is the serialization point, so each event is handled to
/// completion before the next.
#[derive(Debug)]
pub enum ConnEvent {
    Open,
    Connect,
    Read(Vec<u8>),
    Write,
    ProxyConnect,
    ProxyRead(Vec<u8>),
    Disconnect,
}

/// Per-connection context owned by the orchestrator. Retry counting lives
/// on the request itself ([`Request::attempt`]), since the policy is
/// per-URL, not per-connection.
#[derive(Debug)]
pub struct Broker {
    pub id: u64,
    pub url: Url,
    pub state: ConnState,
    pub protocol: Protocol,
    pub tls: bool,
    pub closing: bool,
    pub stopped: bool,
}

impl Broker {
    pub fn new(id: u64, url: Url, tls: bool) -> Self {
        Self {
            id,
            url,
            state: ConnState::Resolve,
            protocol: Protocol::Http1,
            tls,
            closing: false,
            stopped: false,
        }
    }
}

/// What to do with a finished response.
#[derive(Debug)]
pub enum Disposition {
    /// Deliver to the caller; the connection may serve the next request.
    Done,
    /// Same URL again, with refreshed credentials.
    Retry,
    /// New location; scheme changes re-run the TLS stage.
    Redirect(Url),
    Fault(Error),
}

/// Applies the response policy: 2xx (or any status when redirects are off
/// and it is one) completes, 401/407 with a challenge and 3xx with a
/// location retry while attempts remain, everything else completes as a
/// plain non-ok response.
pub fn disposition(
    request: &Request,
    response: &Response,
    config: &ClientConfig,
) -> Disposition {
    if response.ok() {
        return Disposition::Done;
    }

    match response.status {
        301 | 302 | 303 | 307 | 308 => {
            if !config.follow_redirects {
                // Redirects disabled: report the status to the caller as-is.
                return Disposition::Done;
            }
            if request.attempt + 1 >= config.max_attempts {
                return Disposition::Fault(Error::AttemptsExhausted(request.url.to_string()));
            }
            match response.headers.get("location") {
                Some(location) => match request.url.join(location) {
                    Ok(target) => Disposition::Redirect(target),
                    Err(e) => Disposition::Fault(e.into()),
                },
                None => Disposition::Done,
            }
        }
        401 | 407 => {
            let challenge_header = if response.status == 401 {
                "www-authenticate"
            } else {
                "proxy-authenticate"
            };
            if config.credentials.is_none() || !response.headers.contains(challenge_header) {
                return Disposition::Done;
            }
            if request.attempt + 1 >= config.max_attempts {
                return Disposition::Fault(Error::AuthExhausted);
            }
            Disposition::Retry
        }
        _ => Disposition::Done,
    }
}

/// Method rewrite on redirect: 301, 307 and 308 keep the request method,
/// 303 always becomes GET, 302 becomes GET for anything that was not
/// GET/HEAD (the de-facto standard behavior).
pub fn redirect_method(status: u16, method: &str) -> String {
    match status {
        303 => "GET".to_string(),
        302 if !matches!(method, "GET" | "HEAD") => "GET".to_string(),
        _ => method.to_string(),
    }
}
