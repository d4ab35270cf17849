use crate::error::Error;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use md5::Md5;
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl HashAlgorithm {
    fn from_token(token: &str) -> Result<Self, Error> {
        match token.trim().to_ascii_uppercase().as_str() {
            "MD5" => Ok(HashAlgorithm::Md5),
            "MD5-SESS" => Ok(HashAlgorithm::Md5Sess),
            "SHA-256" => Ok(HashAlgorithm::Sha256),
            "SHA-256-SESS" => Ok(HashAlgorithm::Sha256Sess),
            other => Err(Error::AuthChallenge(other.to_string())),
        }
    }

    fn token(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Md5Sess => "MD5-sess",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, HashAlgorithm::Md5Sess | HashAlgorithm::Sha256Sess)
    }

    fn hash(&self, input: &str) -> String {
        match self {
            HashAlgorithm::Md5 | HashAlgorithm::Md5Sess => {
                let mut hasher = Md5::new();
                hasher.update(input.as_bytes());
                hex(&hasher.finalize())
            }
            HashAlgorithm::Sha256 | HashAlgorithm::Sha256Sess => {
                let mut hasher = Sha256::new();
                hasher.update(input.as_bytes());
                hex(&hasher.finalize())
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    pub fn new(user: &str, pass: &str) -> Self {
        Self {
            user: user.to_string(),
            pass: pass.to_string(),
        }
    }
}

/// Builds `Authorization` / `Proxy-Authorization` header values.
///
/// Basic needs no server state. Digest is primed with the challenge from a
/// `WWW-Authenticate` or `Proxy-Authenticate` line and then answers with the
/// RFC 7616 response hash, counting nonce uses.
#[derive(Debug, Clone)]
pub struct AuthContext {
    scheme: AuthScheme,
    algorithm: HashAlgorithm,
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop: Option<String>,
    nc: u32,
}

impl AuthContext {
    pub fn new(scheme: AuthScheme) -> Self {
        Self {
            scheme,
            algorithm: HashAlgorithm::Md5,
            realm: String::new(),
            nonce: String::new(),
            opaque: None,
            qop: None,
            nc: 0,
        }
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// Consumes a challenge line and readies the context for [`Self::header`].
    /// Switches scheme to whatever the server demanded.
    pub fn prime(&mut self, challenge: &str) -> Result<(), Error> {
        let challenge = challenge.trim();
        if let Some(rest) = strip_scheme(challenge, "Basic") {
            let _ = rest;
            self.scheme = AuthScheme::Basic;
            return Ok(());
        }
        let rest = strip_scheme(challenge, "Digest")
            .ok_or_else(|| Error::AuthChallenge(challenge.to_string()))?;
        self.scheme = AuthScheme::Digest;
        self.nc = 0;

        for (key, value) in parse_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => self.realm = value,
                "nonce" => self.nonce = value,
                "opaque" => self.opaque = Some(value),
                "algorithm" => self.algorithm = HashAlgorithm::from_token(&value)?,
                // qop is a list; `auth` is the only mode supported here.
                "qop" => {
                    if value.split(',').any(|q| q.trim() == "auth") {
                        self.qop = Some("auth".to_string());
                    }
                }
                _ => {}
            }
        }
        if self.nonce.is_empty() {
            return Err(Error::AuthChallenge(challenge.to_string()));
        }
        Ok(())
    }

    /// Header value for the given request line. Digest requires a prior
    /// successful [`Self::prime`].
    pub fn header(&mut self, method: &str, uri: &str, creds: &Credentials) -> Result<String, Error> {
        match self.scheme {
            AuthScheme::Basic => {
                let token = BASE64_STANDARD.encode(format!("{}:{}", creds.user, creds.pass));
                Ok(format!("Basic {}", token))
            }
            AuthScheme::Digest => self.digest_header(method, uri, creds),
        }
    }

    fn digest_header(
        &mut self,
        method: &str,
        uri: &str,
        creds: &Credentials,
    ) -> Result<String, Error> {
        if self.nonce.is_empty() {
            return Err(Error::AuthChallenge("digest context not primed".into()));
        }
        self.nc += 1;
        let nc = format!("{:08x}", self.nc);
        let cnonce = hex(&thread_rng().gen::<[u8; 8]>());

        let mut ha1 = self
            .algorithm
            .hash(&format!("{}:{}:{}", creds.user, self.realm, creds.pass));
        if self.algorithm.is_session() {
            ha1 = self
                .algorithm
                .hash(&format!("{}:{}:{}", ha1, self.nonce, cnonce));
        }
        let ha2 = self.algorithm.hash(&format!("{}:{}", method, uri));

        let response = match &self.qop {
            Some(qop) => self.algorithm.hash(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.nonce, nc, cnonce, qop, ha2
            )),
            None => self.algorithm.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            creds.user,
            self.realm,
            self.nonce,
            uri,
            self.algorithm.token(),
            response,
        );
        if let Some(qop) = &self.qop {
            header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        Ok(header)
    }
}

fn strip_scheme<'a>(challenge: &'a str, scheme: &str) -> Option<&'a str> {
    let (head, rest) = challenge.split_at(challenge.len().min(scheme.len()));
    if head.eq_ignore_ascii_case(scheme) && (rest.is_empty() || rest.starts_with(' ')) {
        Some(rest.trim_start())
    } else {
        None
    }
}

/// Splits `k="v", k2=v2` parameter lists, honoring quotes.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let eq = match rest.find('=') {
            Some(at) => at,
            None => break,
        };
        let key = rest[..eq].trim().to_string();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            value = stripped[..end].to_string();
            rest = &stripped[stripped.len().min(end + 1)..];
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        params.push((key, value));

        rest = rest.trim_start();
        if let Some(stripped) = rest.strip_prefix(',') {
            rest = stripped.trim_start();
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header() {
        // Scenario from the proxy path: u:p → dTpw
        let mut ctx = AuthContext::new(AuthScheme::Basic);
        let header = ctx
            .header("GET", "/", &Credentials::new("u", "p"))
            .unwrap();
        assert_eq!(header, "Basic dTpw");
    }

    #[test]
    fn test_digest_md5_rfc2617_vector() {
        // The well-known example from RFC 2617 §3.5.
        let mut ctx = AuthContext::new(AuthScheme::Digest);
        ctx.prime(
            "Digest realm=\"testrealm@host.com\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        )
        .unwrap();

        // Without qop the response hash is H(HA1:nonce:HA2); check against a
        // locally recomputed value to keep cnonce out of the equation.
        let alg = HashAlgorithm::Md5;
        let ha1 = alg.hash("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = alg.hash("GET:/dir/index.html");
        let expected = alg.hash(&format!("{}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{}", ha1, ha2));

        let header = ctx
            .header(
                "GET",
                "/dir/index.html",
                &Credentials::new("Mufasa", "Circle Of Life"),
            )
            .unwrap();
        assert!(header.starts_with("Digest username=\"Mufasa\""));
        assert!(header.contains(&format!("response=\"{}\"", expected)));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
        assert!(!header.contains("qop="));
    }

    #[test]
    fn test_digest_qop_increments_nc() {
        let mut ctx = AuthContext::new(AuthScheme::Digest);
        ctx.prime("Digest realm=\"r\", nonce=\"n\", qop=\"auth\", algorithm=SHA-256")
            .unwrap();
        let creds = Credentials::new("alice", "secret");
        let first = ctx.header("GET", "/", &creds).unwrap();
        let second = ctx.header("GET", "/", &creds).unwrap();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
        assert!(first.contains("algorithm=SHA-256"));
    }

    #[test]
    fn test_prime_switches_scheme() {
        let mut ctx = AuthContext::new(AuthScheme::Basic);
        ctx.prime("Digest realm=\"r\", nonce=\"abc\"").unwrap();
        assert_eq!(ctx.scheme(), AuthScheme::Digest);
    }

    #[test]
    fn test_unsupported_challenge() {
        let mut ctx = AuthContext::new(AuthScheme::Basic);
        assert!(ctx.prime("Bearer realm=\"api\"").is_err());
        assert!(ctx.prime("Digest realm=\"r\"").is_err()); // no nonce
    }

    #[test]
    fn test_param_parsing_with_quotes() {
        let params = parse_params("realm=\"a, b\", nonce=xyz, qop=\"auth,auth-int\"");
        assert_eq!(params[0], ("realm".to_string(), "a, b".to_string()));
        assert_eq!(params[1], ("nonce".to_string(), "xyz".to_string()));
        assert_eq!(params[2], ("qop".to_string(), "auth,auth-int".to_string()));
    }
}
