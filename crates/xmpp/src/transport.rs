//! TCP transport with in-place STARTTLS upgrade.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::XmppError;

/// Object-safe duplex stream; the connection machinery is written against
/// this so a TLS upgrade (or an in-memory test stream) changes nothing
/// upstream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Open a plain TCP connection.
pub async fn open_tcp(host: &str, port: u16) -> Result<BoxStream, XmppError> {
    debug!(host, port, "opening TCP connection");
    let stream = TcpStream::connect((host, port)).await?;
    Ok(Box::new(stream))
}

/// Upgrade an established stream to TLS, client side. The server name is
/// the originally configured host. When `trust_server` is set, certificate
/// policy errors are accepted.
pub async fn upgrade_tls(
    stream: BoxStream,
    server_name: &str,
    trust_server: bool,
) -> Result<BoxStream, XmppError> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if trust_server {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustingVerifier {
                schemes: provider
                    .signature_verification_algorithms
                    .supported_schemes(),
            }))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.into(),
        };
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| XmppError::internal(format!("invalid TLS server name: {}", e)))?;

    let connector = TlsConnector::from(Arc::new(config));
    let tls_stream = connector.connect(name, stream).await?;

    debug!(server_name, "TLS upgrade complete");
    Ok(Box::new(tls_stream))
}

/// Certificate verifier used with `trust_server`: signature checks still go
/// through the provider but chain and hostname policy failures are accepted.
#[derive(Debug)]
struct TrustingVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for TrustingVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
