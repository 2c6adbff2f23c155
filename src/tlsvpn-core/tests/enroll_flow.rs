//! Enrollment flow over a real HTTP loopback: token-sealed CSR in, sealed
//! certificate and CA out, single-use enforcement.

mod common;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tempfile::tempdir;

use common::{shared_cert_dir, test_pki};
use tlsvpn_core::enroll::{
    self, CertRequestBody, CertResponseBody, EnrollmentRequest, EnrollmentServer,
};
use tlsvpn_core::token::TokenStore;
use tlsvpn_crypto::envelope;
use tlsvpn_crypto::pki::{self, CertAuthority};

async fn start_endpoint(token_dir: &std::path::Path) -> (EnrollmentServer, Arc<TokenStore>) {
    let ca = CertAuthority::load(shared_cert_dir(), test_pki()).unwrap();
    let tokens = Arc::new(TokenStore::open(token_dir).unwrap());
    let server = EnrollmentServer::serve(Arc::clone(&tokens), Arc::new(ca), 0)
        .await
        .unwrap();
    (server, tokens)
}

#[tokio::test]
async fn happy_path_issues_cert_and_ca_then_burns_the_token() {
    let dir = tempdir().unwrap();
    let (server, tokens) = start_endpoint(&dir.path().join("tokens")).await;
    let port = server.port();

    let token = tokens
        .generate("alice", chrono::Duration::hours(24))
        .unwrap();
    assert_eq!(hex::encode(&token.key).len(), 64);

    let (csr_pem, key_pem) = pki::generate_csr("alice", &test_pki()).unwrap();
    let request = EnrollmentRequest {
        csr_pem,
        token_id: token.id.clone(),
        token_key: token.key.clone(),
        server_address: "127.0.0.1".into(),
        server_port: port,
    };

    let outcome = enroll::request_certificate(&request).await.unwrap();
    assert!(outcome.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    let ca_pem = outcome.ca_pem.as_deref().expect("CA missing from response");
    assert!(ca_pem.starts_with("-----BEGIN CERTIFICATE-----"));

    // Install into a separate client-side directory.
    let client_dir = dir.path().join("client-certs");
    enroll::install_materials(&client_dir, &outcome, &key_pem).unwrap();
    assert!(client_dir.join("client.pem").exists());
    assert!(client_dir.join("client-key.pem").exists());
    assert!(client_dir.join("ca.pem").exists());
    assert!(pki::client_materials_exist(&client_dir));

    // The token is single-use: an identical second request is refused.
    let err = enroll::request_certificate(&request).await.unwrap_err();
    assert!(err.to_string().contains("already used"), "{err}");

    server.stop();
}

#[tokio::test]
async fn unknown_token_is_rejected() {
    let dir = tempdir().unwrap();
    let (server, _tokens) = start_endpoint(&dir.path().join("tokens")).await;

    let (csr_pem, _) = pki::generate_csr("mallory", &test_pki()).unwrap();
    let err = enroll::request_certificate(&EnrollmentRequest {
        csr_pem,
        token_id: "nobody-20240101-000000".into(),
        token_key: vec![0u8; 32],
        server_address: "127.0.0.1".into(),
        server_port: server.port(),
    })
    .await
    .unwrap_err();
    assert!(err.to_string().contains("token"), "{err}");

    server.stop();
}

#[tokio::test]
async fn wrong_key_fails_decryption_with_bad_request() {
    let dir = tempdir().unwrap();
    let (server, tokens) = start_endpoint(&dir.path().join("tokens")).await;
    let token = tokens.generate("bob", chrono::Duration::hours(1)).unwrap();

    // Seal with a key that is not the token's key: the token is consumed
    // but the CSR cannot be opened.
    let (csr_pem, _) = pki::generate_csr("bob", &test_pki()).unwrap();
    let wrong_key = [0x42u8; 32];
    let (ciphertext, nonce) = envelope::seal(csr_pem.as_bytes(), &wrong_key).unwrap();

    let body = CertRequestBody {
        token_id: token.id.clone(),
        encrypted_csr: BASE64.encode(ciphertext),
        nonce: BASE64.encode(nonce),
    };
    let response = reqwest::Client::new()
        .post(format!(
            "http://127.0.0.1:{}/api/cert/request",
            server.port()
        ))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let parsed: CertResponseBody = response.json().await.unwrap();
    assert!(!parsed.success);
    assert!(parsed.error.unwrap().contains("decryption"));

    server.stop();
}

#[tokio::test]
async fn garbage_csr_is_a_bad_request() {
    let dir = tempdir().unwrap();
    let (server, tokens) = start_endpoint(&dir.path().join("tokens")).await;
    let token = tokens.generate("carol", chrono::Duration::hours(1)).unwrap();

    let (ciphertext, nonce) = envelope::seal(b"this is not a CSR", &token.key).unwrap();
    let body = CertRequestBody {
        token_id: token.id.clone(),
        encrypted_csr: BASE64.encode(ciphertext),
        nonce: BASE64.encode(nonce),
    };
    let response = reqwest::Client::new()
        .post(format!(
            "http://127.0.0.1:{}/api/cert/request",
            server.port()
        ))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    server.stop();
}

#[tokio::test]
async fn health_endpoint_identifies_the_service() {
    let dir = tempdir().unwrap();
    let (server, _tokens) = start_endpoint(&dir.path().join("tokens")).await;

    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/api/health", server.port()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "VPN Certificate API");
    assert!(body["time"].as_str().unwrap().contains('T'));

    server.stop();
}

#[tokio::test]
async fn issued_certificate_chains_to_the_ca() {
    let dir = tempdir().unwrap();
    let (server, tokens) = start_endpoint(&dir.path().join("tokens")).await;
    let token = tokens.generate("dave", chrono::Duration::hours(1)).unwrap();

    let (csr_pem, _) = pki::generate_csr("dave", &test_pki()).unwrap();
    let outcome = enroll::request_certificate(&EnrollmentRequest {
        csr_pem,
        token_id: token.id,
        token_key: token.key,
        server_address: "127.0.0.1".into(),
        server_port: server.port(),
    })
    .await
    .unwrap();

    use x509_parser::prelude::{FromDer, X509Certificate};
    let (_, pem) = x509_parser::pem::parse_x509_pem(outcome.cert_pem.as_bytes()).unwrap();
    let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap();
    assert_eq!(cn, "vpn-client-dave");
    let issuer_cn = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap();
    assert_eq!(issuer_cn, "VPN-CA");

    server.stop();
}
