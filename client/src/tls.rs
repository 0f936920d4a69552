//! TLS dial helper for the client side of the untrusted-carrier transport. The peer's
//! certificate is accepted unconditionally (no CA chain, no hostname policy beyond
//! what `rustls` requires structurally) — the actual trust anchor is the server's
//! self-signed `PublicIdentity` returned by `identify` and verified against its own
//! signature. This module only hands the caller the cert's SHA-256 fingerprint so it
//! can be cross-checked out of band, matching the one the operator posts alongside
//! the relay's address.

use sha2::{Digest, Sha256};
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio_rustls::TlsConnector;

#[derive(Debug)]
struct AcceptAny;

impl ServerCertVerifier for AcceptAny {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

pub struct TlsConnection {
    pub stream: TlsStream<TcpStream>,
    pub server_fingerprint_hex: String,
}

/// Dials `addr`, runs the TLS handshake against `server_name` (an SNI value only —
/// the cert isn't checked against it), and returns the wrapped stream plus the
/// server's leaf certificate fingerprint.
pub async fn connect(addr: &str, server_name: &str) -> io::Result<TlsConnection> {
    let tcp = TcpStream::connect(addr).await?;
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAny))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(server_name.to_string()).map_err(io::Error::other)?;
    let stream = connector.connect(name, tcp).await?;
    let fingerprint = peer_fingerprint(&stream)?;
    Ok(TlsConnection { stream, server_fingerprint_hex: fingerprint })
}

fn peer_fingerprint(stream: &TlsStream<TcpStream>) -> io::Result<String> {
    let (_, session) = stream.get_ref();
    let certs = session.peer_certificates().ok_or_else(|| io::Error::other("no peer certificate presented"))?;
    let leaf = certs.first().ok_or_else(|| io::Error::other("empty certificate chain"))?;
    Ok(hex::encode(Sha256::digest(leaf.as_ref())))
}
