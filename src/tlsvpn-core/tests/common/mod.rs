//! Shared fixtures for the integration suites.
//!
//! RSA keygen is the slow part, so the PKI materials for a test binary are
//! generated once (with a reduced key size) and reused read-only.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use tlsvpn_core::config::Config;
use tlsvpn_crypto::pki::{self, CertAuthority, PkiConfig};

/// Reduced key size for tests; production stays at 4096.
pub fn test_pki() -> PkiConfig {
    PkiConfig {
        key_bits: 2048,
        ..Default::default()
    }
}

static CERT_DIR: OnceLock<PathBuf> = OnceLock::new();

/// CA + server + enrolled-client materials shared by one test binary.
pub fn shared_cert_dir() -> &'static Path {
    CERT_DIR.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("tlsvpn-test-certs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let config = test_pki();
        pki::ensure_server_materials(&dir, &config).unwrap();

        // Enroll one client the short way: CSR straight into the CA.
        let ca = CertAuthority::load(&dir, config.clone()).unwrap();
        let (csr_pem, key_pem) = pki::generate_csr("test", &config).unwrap();
        let cert_pem = ca.sign_csr(&csr_pem).unwrap();
        std::fs::write(dir.join("client.pem"), cert_pem).unwrap();
        std::fs::write(dir.join("client-key.pem"), key_pem).unwrap();

        dir
    })
}

/// A free TCP port. Racy by nature, good enough for loopback tests.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Loopback config with short timers.
pub fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.server_address = "127.0.0.1".into();
    config.server_port = port;
    config.session_timeout = Duration::from_secs(30);
    config.session_cleanup_interval = Duration::from_secs(10);
    config.enable_nat = false;
    config
}

/// Poll until `probe` yields true or the deadline passes.
pub async fn wait_for<F, Fut>(mut probe: F, deadline: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
