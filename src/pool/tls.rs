//! TLS client configuration.
//!
//! Two process-wide `rustls` configs are built lazily: the verifying one
//! rooted in the webpki bundle, and a verification-free one for
//! `require_ssl_verification = false`. Both negotiate only `http/1.1`
//! via ALPN.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio_rustls::TlsConnector;

pub(crate) struct TlsContext {
    verified: OnceCell<TlsConnector>,
    unverified: OnceCell<TlsConnector>,
}

impl TlsContext {
    pub(crate) fn new() -> Self {
        TlsContext {
            verified: OnceCell::new(),
            unverified: OnceCell::new(),
        }
    }

    pub(crate) fn connector(&self, verify: bool) -> TlsConnector {
        if verify {
            self.verified.get_or_init(build_verified).clone()
        } else {
            self.unverified.get_or_init(build_unverified).clone()
        }
    }
}

fn build_verified() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsConnector::from(Arc::new(config))
}

fn build_unverified() -> TlsConnector {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsConnector::from(Arc::new(config))
}

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `require_ssl_verification: false` — encryption
/// is desired but peer identity verification is not.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
