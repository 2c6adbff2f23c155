//! Out-of-band certificate enrollment.
//!
//! A small HTTP API (port 8081 by convention) accepts a CSR sealed with a
//! single-use token key and answers with the signed client certificate and
//! the CA certificate, each sealed with the same key under a fresh nonce.
//! The channel itself is plain HTTP: knowledge of the token key is both the
//! authentication claim and the confidentiality layer, so the client need
//! not trust anything about the transport.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tlsvpn_crypto::envelope;
use tlsvpn_crypto::error::CryptoError;
use tlsvpn_crypto::pki::{CertAuthority, CLIENT_CERT_FILE, CLIENT_KEY_FILE};

use crate::token::TokenStore;

/// Conventional enrollment port, next to the VPN port.
pub const DEFAULT_ENROLL_PORT: u16 = 8081;

/// `POST /api/cert/request` body. Byte fields travel as standard base64.
#[derive(Debug, Serialize, Deserialize)]
pub struct CertRequestBody {
    pub token_id: String,
    pub encrypted_csr: String,
    pub nonce: String,
}

/// `POST /api/cert/request` response.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CertResponseBody {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CertResponseBody {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

struct EnrollmentState {
    tokens: Arc<TokenStore>,
    ca: Arc<CertAuthority>,
}

/// Running enrollment endpoint.
pub struct EnrollmentServer {
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl EnrollmentServer {
    /// Bind and serve. Port 0 picks an ephemeral port (used in tests).
    pub async fn serve(
        tokens: Arc<TokenStore>,
        ca: Arc<CertAuthority>,
        port: u16,
    ) -> Result<Self> {
        let state = Arc::new(EnrollmentState { tokens, ca });
        let app = Router::new()
            .route("/api/health", get(handle_health))
            .route("/api/cert/request", post(handle_cert_request))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding enrollment API on port {port}"))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "certificate enrollment API listening");

        let handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service).await {
                error!(%e, "enrollment API server failed");
            }
        });

        Ok(Self { handle, local_addr })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn stop(&self) {
        self.handle.abort();
        info!("certificate enrollment API stopped");
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "time": chrono::Local::now().to_rfc3339(),
        "service": "VPN Certificate API",
    }))
}

async fn handle_cert_request(
    State(state): State<Arc<EnrollmentState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CertRequestBody>,
) -> (StatusCode, Json<CertResponseBody>) {
    let caller = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string());

    info!(token = %body.token_id, %caller, "certificate request received");

    let token = match state.tokens.validate_and_consume(&body.token_id, &caller) {
        Ok(token) => token,
        Err(e) => {
            warn!(token = %body.token_id, %e, "token validation failed");
            return (
                StatusCode::UNAUTHORIZED,
                Json(CertResponseBody::failure(format!("token validation failed: {e}"))),
            );
        }
    };

    let (encrypted_csr, nonce) = match (BASE64.decode(&body.encrypted_csr), BASE64.decode(&body.nonce)) {
        (Ok(csr), Ok(nonce)) => (csr, nonce),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(CertResponseBody::failure("request fields are not valid base64")),
            );
        }
    };

    let csr_pem = match envelope::open(&encrypted_csr, &nonce, &token.key)
        .map_err(|e| e.to_string())
        .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()))
    {
        Ok(pem) => pem,
        Err(e) => {
            warn!(token = %token.id, %e, "CSR decryption failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(CertResponseBody::failure(format!("CSR decryption failed: {e}"))),
            );
        }
    };

    let cert_pem = match state.ca.sign_csr(&csr_pem) {
        Ok(pem) => pem,
        Err(CryptoError::Csr(e)) => {
            warn!(token = %token.id, %e, "CSR rejected");
            return (
                StatusCode::BAD_REQUEST,
                Json(CertResponseBody::failure(format!("invalid CSR: {e}"))),
            );
        }
        Err(e) => {
            error!(token = %token.id, %e, "certificate signing failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CertResponseBody::failure(format!("signing failed: {e}"))),
            );
        }
    };

    let sealed = envelope::seal(cert_pem.as_bytes(), &token.key).and_then(|cert| {
        envelope::seal(state.ca.ca_cert_pem().as_bytes(), &token.key).map(|ca| (cert, ca))
    });
    let ((cert_ct, cert_nonce), (ca_ct, ca_nonce)) = match sealed {
        Ok(pair) => pair,
        Err(e) => {
            error!(token = %token.id, %e, "response encryption failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CertResponseBody::failure(format!("response encryption failed: {e}"))),
            );
        }
    };

    info!(token = %token.id, client = %token.client_name, "certificate issued");
    (
        StatusCode::OK,
        Json(CertResponseBody {
            success: true,
            encrypted_cert: Some(BASE64.encode(cert_ct)),
            encrypted_ca: Some(BASE64.encode(ca_ct)),
            nonce: Some(BASE64.encode(cert_nonce)),
            ca_nonce: Some(BASE64.encode(ca_nonce)),
            error: None,
        }),
    )
}

/// Client-side enrollment request parameters.
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub csr_pem: String,
    pub token_id: String,
    /// 32-byte token key.
    pub token_key: Vec<u8>,
    pub server_address: String,
    pub server_port: u16,
}

/// Decrypted enrollment result.
#[derive(Debug)]
pub struct EnrollmentOutcome {
    pub cert_pem: String,
    pub ca_pem: Option<String>,
}

/// Seal the CSR with the token key, POST it, and open the returned
/// certificate and CA.
pub async fn request_certificate(request: &EnrollmentRequest) -> Result<EnrollmentOutcome> {
    let (encrypted_csr, nonce) = envelope::seal(request.csr_pem.as_bytes(), &request.token_key)
        .context("encrypting CSR")?;

    let body = CertRequestBody {
        token_id: request.token_id.clone(),
        encrypted_csr: BASE64.encode(encrypted_csr),
        nonce: BASE64.encode(nonce),
    };

    let url = format!(
        "http://{}:{}/api/cert/request",
        request.server_address, request.server_port
    );
    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("posting enrollment request to {url}"))?;

    let parsed: CertResponseBody = response
        .json()
        .await
        .context("parsing enrollment response")?;
    if !parsed.success {
        bail!(
            "enrollment rejected: {}",
            parsed.error.unwrap_or_else(|| "unknown error".into())
        );
    }

    let cert_pem = open_field(
        parsed.encrypted_cert.as_deref(),
        parsed.nonce.as_deref(),
        &request.token_key,
    )?
    .ok_or_else(|| anyhow::anyhow!("response is missing the certificate"))?;

    let ca_pem = open_field(
        parsed.encrypted_ca.as_deref(),
        parsed.ca_nonce.as_deref(),
        &request.token_key,
    )?;

    Ok(EnrollmentOutcome { cert_pem, ca_pem })
}

fn open_field(
    ciphertext_b64: Option<&str>,
    nonce_b64: Option<&str>,
    key: &[u8],
) -> Result<Option<String>> {
    let (Some(ciphertext_b64), Some(nonce_b64)) = (ciphertext_b64, nonce_b64) else {
        return Ok(None);
    };
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .context("decoding response ciphertext")?;
    let nonce = BASE64.decode(nonce_b64).context("decoding response nonce")?;
    let plaintext = envelope::open(&ciphertext, &nonce, key).context("opening sealed response")?;
    let text = String::from_utf8(plaintext).context("sealed response is not UTF-8")?;
    Ok(Some(text))
}

/// Write the enrolled materials into the certificate directory:
/// `client.pem`, `ca.pem` (when returned) and the private key saved at CSR
/// generation time as `client-key.pem` (0600).
pub fn install_materials(cert_dir: &Path, outcome: &EnrollmentOutcome, key_pem: &str) -> Result<()> {
    std::fs::create_dir_all(cert_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(cert_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    if let Some(ca_pem) = &outcome.ca_pem {
        std::fs::write(cert_dir.join(tlsvpn_crypto::pki::CA_CERT_FILE), ca_pem)
            .context("writing ca.pem")?;
    }
    std::fs::write(cert_dir.join(CLIENT_CERT_FILE), &outcome.cert_pem)
        .context("writing client.pem")?;

    let key_path = cert_dir.join(CLIENT_KEY_FILE);
    std::fs::write(&key_path, key_pem).context("writing client-key.pem")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!(dir = %cert_dir.display(), "enrolled client materials installed");
    Ok(())
}
