//! TLS configuration for the VPN client.
//!
//! TLS 1.3 only. The client trusts the daemon CA for server verification
//! and presents its enrolled client certificate for mutual auth. The server
//! identity is always checked against the `vpn-server` name.

use std::path::Path;

use anyhow::{Context, Result};

use crate::server::tls::{install_crypto_provider, load_ca_roots, load_certs, load_key};
use tlsvpn_crypto::pki::{CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE};

/// ServerName every server certificate is verified against.
pub const SERVER_NAME: &str = "vpn-server";

/// Client-side rustls config: TLS 1.3 pinned, CA-verified server identity,
/// client certificate attached.
pub fn build_client_config(cert_dir: &Path) -> Result<rustls::ClientConfig> {
    install_crypto_provider();

    let roots = load_ca_roots(&cert_dir.join(CA_CERT_FILE))?;
    let certs = load_certs(&cert_dir.join(CLIENT_CERT_FILE))?;
    let key = load_key(&cert_dir.join(CLIENT_KEY_FILE))?;

    let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("building client TLS config")?;

    Ok(config)
}
