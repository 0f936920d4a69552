//! Wraps the plain-TCP listener in TLS when `settings.tls_cert_path`/`tls_key_path`
//! are configured. TLS here is an untrusted carrier, same as the X3DH/SIGMA handshake
//! riding over it expects: the certificate only needs to be well-formed, not
//! CA-signed, since the client's actual trust decision is made against the signed
//! `Identify` reply and the out-of-band fingerprint it prints, not this chain.

use std::io;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Builds an acceptor from a PEM certificate chain and a PEM private key on disk.
pub fn load_acceptor(cert_path: &str, key_path: &str) -> io::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(io::Error::other)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path)?;
    rustls_pemfile::certs(&mut bytes.as_slice()).collect::<Result<Vec<_>, _>>()
}

fn load_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    let bytes = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut bytes.as_slice())?.ok_or_else(|| io::Error::other("no private key found in key file"))
}
