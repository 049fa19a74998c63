use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error;

/// Represents an X509 certificate used as a trusted root.
#[derive(Clone)]
pub struct Certificate {
    der: CertificateDer<'static>,
}

impl Certificate {
    /// Create a `Certificate` from a binary DER encoded certificate.
    pub fn from_der(der: &[u8]) -> crate::Result<Certificate> {
        Ok(Certificate {
            der: CertificateDer::from(der.to_vec()),
        })
    }

    /// Create a `Certificate` from a PEM encoded certificate.
    ///
    /// # Errors
    ///
    /// If the buffer holds no PEM certificate block, an error is returned.
    pub fn from_pem(pem: &[u8]) -> crate::Result<Certificate> {
        let mut reader = std::io::Cursor::new(pem);
        let der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| error::builder("no PEM certificate found"))?
            .map_err(error::builder)?;
        Ok(Certificate { der })
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate").finish()
    }
}

/// Assemble the rustls client configuration for tunnel upgrades.
///
/// Roots are the webpki bundle plus any caller-supplied certificates;
/// `accept_invalid_certs` swaps verification out entirely.
pub(crate) fn client_config(
    extra_roots: &[Certificate],
    accept_invalid_certs: bool,
) -> crate::Result<Arc<rustls::ClientConfig>> {
    let config = if accept_invalid_certs {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in extra_roots {
            roots.add(cert.der.clone()).map_err(error::builder)?;
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Upgrade an established tunnel with a TLS client handshake, SNI set to
/// the destination host.
pub(crate) async fn handshake(
    stream: TcpStream,
    host: &str,
    config: Arc<rustls::ClientConfig>,
) -> crate::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = match host.parse::<IpAddr>() {
        Ok(ip) => ServerName::IpAddress(ip.into()),
        Err(_) => ServerName::try_from(host)
            .map_err(error::builder)?
            .to_owned(),
    };
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(error::io)
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pem_rejects_garbage() {
        assert!(Certificate::from_pem(b"not a certificate").is_err());
    }

    #[test]
    fn config_builds_with_default_roots() {
        assert!(client_config(&[], false).is_ok());
        assert!(client_config(&[], true).is_ok());
    }
}
