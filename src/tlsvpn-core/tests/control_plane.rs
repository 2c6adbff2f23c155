//! Control-plane tests over a real unix socket: one JSON line per
//! connection, dispatch into the service, config persistence, token and
//! certificate verbs, log tailing.

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use common::test_pki;
use tlsvpn_core::control::{ApiResponse, ControlClient, ControlServer};
use tlsvpn_core::logbus::LogBus;
use tlsvpn_core::service::{Service, ServicePaths};

struct Harness {
    _dir: TempDir,
    paths: ServicePaths,
    client: ControlClient,
    logbus: Arc<LogBus>,
    _server: ControlServer,
}

async fn start_harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let paths = ServicePaths {
        config_file: dir.path().join("config.json"),
        cert_dir: dir.path().join("certs"),
        token_dir: dir.path().join("tokens"),
        work_dir: dir.path().to_path_buf(),
        enroll_port: 0,
        pki: test_pki(),
    };

    let service = Arc::new(Service::new(paths.clone()).unwrap());
    let logbus = Arc::new(LogBus::new(100));
    let socket_path = dir.path().join("control.sock");
    let server = ControlServer::new(&socket_path, service, Arc::clone(&logbus));
    server.start().await.unwrap();

    Harness {
        client: ControlClient::new(&socket_path),
        paths,
        logbus,
        _server: server,
        _dir: dir,
    }
}

#[tokio::test]
async fn ping_answers_pong() {
    let h = start_harness().await;
    assert!(h.client.is_service_running().await);

    let resp = h.client.call("ping", None).await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.message.as_deref(), Some("pong"));
}

#[tokio::test]
async fn unknown_action_is_reported() {
    let h = start_harness().await;
    let resp = h.client.call("bogus/verb", None).await.unwrap();
    assert!(!resp.success);
    assert_eq!(resp.error.as_deref(), Some("unknown action: bogus/verb"));
}

#[tokio::test]
async fn malformed_line_yields_error_response() {
    let h = start_harness().await;
    let mut stream = UnixStream::connect(h.client.socket_path()).await.unwrap();
    stream.write_all(b"this is not json\n").await.unwrap();

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let resp: ApiResponse = serde_json::from_str(&line).unwrap();
    assert!(!resp.success);
    assert!(resp.error.unwrap().contains("malformed request"));
}

#[tokio::test]
async fn config_update_validates_and_persists() {
    let h = start_harness().await;

    let config = h.client.config_get().await.unwrap().config;
    assert_eq!(config.server_port, 8080);

    h.client
        .config_update("server_port", json!(9443))
        .await
        .unwrap();
    h.client.config_update("route_mode", json!("full")).await.unwrap();

    let config = h.client.config_get().await.unwrap().config;
    assert_eq!(config.server_port, 9443);
    assert_eq!(config.route_mode, "full");

    // Rejected updates change nothing and surface the reason.
    let err = h
        .client
        .config_update("mtu", json!(10))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("mtu"));

    // The update was durably written: a fresh service sees it.
    let reloaded = Service::new(h.paths.clone()).unwrap();
    assert_eq!(reloaded.config_file().await.server_port, 9443);
}

#[tokio::test]
async fn token_lifecycle_over_the_socket() {
    let h = start_harness().await;

    let generated = h.client.token_generate("alice", 24).await.unwrap();
    assert!(generated.token_id.starts_with("alice-"));
    assert_eq!(generated.token_key.len(), 64);
    assert!(std::path::Path::new(&generated.file_path).exists());

    let listed = h.client.token_list().await.unwrap().tokens;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].client_name, "alice");
    assert_eq!(listed[0].status, "valid");

    h.client.token_delete(1).await.unwrap();
    assert!(h.client.token_list().await.unwrap().tokens.is_empty());

    let err = h.client.token_delete(1).await.unwrap_err();
    assert!(err.to_string().contains("invalid token index"));

    h.client.token_cleanup().await.unwrap();
}

#[tokio::test]
async fn cert_verbs_build_materials_and_csrs() {
    let h = start_harness().await;

    h.client.cert_init_ca().await.unwrap();
    let list = h.client.cert_list().await.unwrap();
    let by_name = |name: &str| list.files.iter().find(|f| f.name == name).unwrap().exists;
    assert!(by_name("ca.pem"));
    assert!(by_name("ca-key.pem"));
    assert!(by_name("server.pem"));
    assert!(by_name("server-key.pem"));
    assert!(!by_name("client.pem"));

    let csr = h.client.cert_gen_csr("alice").await.unwrap();
    assert_eq!(csr.cn, "vpn-client-alice");
    assert!(std::path::Path::new(&csr.csr_file).exists());
    assert!(std::path::Path::new(&csr.key_file).exists());
    assert!(csr.csr_file.ends_with("alice.csr"));
    assert!(csr.key_file.ends_with("alice-key.pem"));
}

#[tokio::test]
async fn idle_roles_report_stopped_and_refuse_role_ops() {
    let h = start_harness().await;

    let status = h.client.server_status().await.unwrap();
    assert!(!status.running);
    assert_eq!(status.client_count, 0);

    let status = h.client.client_status().await.unwrap();
    assert!(!status.connected);
    assert_eq!(status.server_port, 8080);

    let err = h.client.server_kick("10.8.0.2").await.unwrap_err();
    assert!(err.to_string().contains("not running"));

    // No enrolled client certificate yet.
    let err = h.client.client_connect().await.unwrap_err();
    assert!(err.to_string().contains("certificates missing"));

    let err = h.client.client_disconnect().await.unwrap_err();
    assert!(err.to_string().contains("not connected"));
}

#[tokio::test]
async fn log_tailing_returns_only_new_entries() {
    let h = start_harness().await;
    h.logbus.append("info", "daemon started");
    h.logbus.append("warn", "something odd");

    let first = h.client.logs_fetch(0, 10).await.unwrap();
    assert_eq!(first.logs.len(), 2);
    assert_eq!(first.logs[0].message, "daemon started");
    assert_eq!(first.last_seq, 2);
    for pair in first.logs.windows(2) {
        assert!(pair[1].seq > pair[0].seq);
    }

    let empty = h.client.logs_fetch(first.last_seq, 10).await.unwrap();
    assert!(empty.logs.is_empty());
    assert_eq!(empty.last_seq, first.last_seq);

    h.logbus.append("error", "fresh entry");
    let next = h.client.logs_fetch(first.last_seq, 10).await.unwrap();
    assert_eq!(next.logs.len(), 1);
    assert_eq!(next.logs[0].level, "error");
}

#[tokio::test]
async fn each_connection_serves_exactly_one_request() {
    let h = start_harness().await;

    // Two sequential calls work (each opens its own connection).
    assert!(h.client.call("ping", None).await.unwrap().success);
    assert!(h.client.call("ping", None).await.unwrap().success);

    // A second line on the same connection is ignored: the peer closes
    // after one response.
    let mut stream = UnixStream::connect(h.client.socket_path()).await.unwrap();
    stream
        .write_all(b"{\"action\":\"ping\"}\n{\"action\":\"ping\"}\n")
        .await
        .unwrap();
    let mut reader = BufReader::new(stream);
    let mut lines = Vec::new();
    let mut line = String::new();
    while reader.read_line(&mut line).await.unwrap() > 0 {
        lines.push(line.clone());
        line.clear();
    }
    assert_eq!(lines.len(), 1);
}
