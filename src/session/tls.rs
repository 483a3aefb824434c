//! TLS upgrade of an established byte stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{error, warn};

use super::SessionError;

/// Install the rustls crypto provider. Must run before the first handshake.
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Server certificate check for `--dangerous-insecure-tls`: any chain and
/// any name pass. Handshake signatures are still verified, so the peer must
/// hold the key of the certificate it presents.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        let algorithms = &self.provider.signature_verification_algorithms;
        rustls::crypto::verify_tls12_signature(message, cert, dss, algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let algorithms = &self.provider.signature_verification_algorithms;
        rustls::crypto::verify_tls13_signature(message, cert, dss, algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Build a connector trusting the platform's root certificates, or nothing at
/// all when `insecure` is set.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector, SessionError> {
    init_crypto_provider();

    if insecure {
        warn!("TLS certificate verification DISABLED (--dangerous-insecure-tls)");
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(SessionError::Tls(
            "no system root certificates found; install the ca-certificates package".to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| SessionError::Tls(format!("failed to add cert: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the TLS handshake over `stream`, using `domain` for SNI and
/// certificate verification.
pub async fn upgrade_to_tls<S>(
    stream: S,
    domain: &str,
    insecure: bool,
) -> Result<TlsStream<S>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connector = create_tls_connector(insecure)?;
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| SessionError::Tls(format!("invalid server name {}: {}", domain, e)))?;

    connector.connect(server_name, stream).await.map_err(|e| {
        error!(domain, error = %e, "TLS handshake failed");
        SessionError::Tls(format!("handshake with {} failed: {}", domain, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_connector_builds_without_roots() {
        assert!(create_tls_connector(true).is_ok());
    }

    #[test]
    fn test_accept_any_keeps_provider_schemes() {
        let verifier = AcceptAnyServerCert::new();
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_server_name_is_rejected() {
        let (client, _server) = tokio::io::duplex(64);
        let err = upgrade_to_tls(client, "bad name!", true).await.unwrap_err();
        assert!(matches!(err, SessionError::Tls(ref m) if m.contains("invalid server name")));
    }
}
