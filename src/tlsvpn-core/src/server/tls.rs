//! TLS configuration for the VPN server.
//!
//! TLS 1.3 only, in both directions. The server requires and verifies a
//! client certificate against the daemon's own CA.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use x509_parser::prelude::{FromDer, X509Certificate};

use tlsvpn_crypto::pki::{CA_CERT_FILE, SERVER_CERT_FILE, SERVER_KEY_FILE};

/// Install the process-wide ring crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Load TLS certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening cert file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing certificates")
}

/// Load a private key from a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .context("parsing private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// Root store holding the daemon CA.
pub fn load_ca_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .context("adding CA certificate to root store")?;
    }
    Ok(roots)
}

/// Server-side rustls config: TLS 1.3 pinned, client certificates required
/// and verified against the CA.
pub fn build_server_config(cert_dir: &Path) -> Result<rustls::ServerConfig> {
    install_crypto_provider();

    let roots = load_ca_roots(&cert_dir.join(CA_CERT_FILE))?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("building client certificate verifier")?;

    let certs = load_certs(&cert_dir.join(SERVER_CERT_FILE))?;
    let key = load_key(&cert_dir.join(SERVER_KEY_FILE))?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("building server TLS config")?;

    Ok(config)
}

/// Common name of the verified peer certificate, read before the stream is
/// split into halves.
pub fn peer_common_name(stream: &TlsStream<TcpStream>) -> Option<String> {
    let (_, connection) = stream.get_ref();
    let cert = connection.peer_certificates()?.first()?;
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}
