use crate::error::Error;
use log::warn;
use pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{client, TlsConnector};

/// TLS knobs of a client connection.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Certificate chain and hostname verification; turning it off accepts
    /// any peer (`VERIFY_SSL` of the original configuration).
    pub verify: bool,
    /// Extra trust anchors in PEM form, appended to the webpki roots.
    pub ca_file: Option<String>,
    /// ALPN protocols to offer, e.g. `h2` and `http/1.1`.
    pub alpn: Vec<Vec<u8>>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify: true,
            ca_file: None,
            alpn: Vec::new(),
        }
    }
}

/// Builds the rustls client configuration for these options.
pub fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &options.ca_file {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert?;
            if roots.add(cert).is_ok() {
                added += 1;
            }
        }
        if added == 0 {
            return Err(Error::EmptyCaFile(path.clone()));
        }
    }

    let mut config = if options.verify {
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        warn!("tls: certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
            .with_no_client_auth()
    };
    config.alpn_protocols = options.alpn.clone();
    Ok(Arc::new(config))
}

/// Wraps an established TCP stream in TLS toward `host`. Yields on
/// WANT_READ/WANT_WRITE through tokio's readiness machinery.
pub async fn wrap(
    stream: TcpStream,
    host: &str,
    config: Arc<ClientConfig>,
) -> Result<client::TlsStream<TcpStream>, Error> {
    let server_name = ServerName::try_from(host.to_string())?;
    let connector = TlsConnector::from(config);
    Ok(connector.connect(server_name, stream).await?)
}

/// Verifier that accepts any certificate; signatures are still checked so a
/// broken handshake fails loudly rather than silently.
#[derive(Debug)]
struct NoVerification {
    provider: CryptoProvider,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let config = client_config(&TlsOptions::default()).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_alpn_is_carried() {
        let options = TlsOptions {
            alpn: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            ..Default::default()
        };
        let config = client_config(&options).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_no_verify_config_builds() {
        let options = TlsOptions {
            verify: false,
            ..Default::default()
        };
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn test_missing_ca_file_errors() {
        let options = TlsOptions {
            ca_file: Some("/definitely/not/here.pem".to_string()),
            ..Default::default()
        };
        assert!(client_config(&options).is_err());
    }
}
