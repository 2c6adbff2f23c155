//! End-to-end session tests over real TLS on loopback, tunnel-less: the
//! server runs without a TUN device, which exercises accept, mutual auth,
//! IP assignment, config push, heartbeats, sequence discipline and kick.

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use common::{free_port, shared_cert_dir, test_config, wait_for};
use tlsvpn_core::client::tls::build_client_config;
use tlsvpn_core::client::VpnClient;
use tlsvpn_core::config::ClientConfig;
use tlsvpn_core::protocol::{read_message, Message, MessageKind};
use tlsvpn_core::server::VpnServer;

async fn start_server(config: tlsvpn_core::config::Config) -> Arc<VpnServer> {
    let server = Arc::new(VpnServer::new(config, shared_cert_dir()).unwrap());
    Arc::clone(&server).start().await.unwrap();
    server
}

/// Raw mutually-authenticated TLS connection speaking the frame protocol.
async fn raw_connect(
    port: u16,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let tls = build_client_config(shared_cert_dir()).unwrap();
    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    TlsConnector::from(Arc::new(tls))
        .connect(ServerName::try_from("vpn-server").unwrap(), tcp)
        .await
        .unwrap()
}

#[tokio::test]
async fn client_receives_ip_assignment_and_config_push() {
    let port = free_port();
    let server = start_server(test_config(port)).await;

    let mut stream = raw_connect(port).await;

    let msg = read_message(&mut stream).await.unwrap();
    assert_eq!(msg.kind, MessageKind::IpAssignment);
    assert_eq!(msg.sequence, 0);
    assert_eq!(msg.payload, vec![10, 8, 0, 2]);

    let msg = read_message(&mut stream).await.unwrap();
    assert_eq!(msg.kind, MessageKind::Control);
    assert_eq!(msg.sequence, 1);
    msg.verify_checksum().unwrap();
    let pushed: ClientConfig = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(pushed.assigned_ip, "10.8.0.2/24");
    assert_eq!(pushed.server_ip, "10.8.0.1/24");
    assert_eq!(pushed.route_mode, "split");

    assert!(
        wait_for(|| async { server.session_count().await == 1 }, Duration::from_secs(2)).await
    );
    let sessions = server.list_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].ip, "10.8.0.2");

    server.stop().await;
}

#[tokio::test]
async fn heartbeat_gets_a_heartbeat_reply() {
    let port = free_port();
    let server = start_server(test_config(port)).await;

    let mut stream = raw_connect(port).await;
    let _ip = read_message(&mut stream).await.unwrap();
    let _config = read_message(&mut stream).await.unwrap();

    use tokio::io::AsyncWriteExt;
    stream
        .write_all(&Message::heartbeat().encode())
        .await
        .unwrap();
    stream.flush().await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), read_message(&mut stream))
        .await
        .expect("no heartbeat reply")
        .unwrap();
    assert_eq!(reply.kind, MessageKind::Heartbeat);
    assert_eq!(reply.sequence, 0);
    assert!(reply.payload.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn vpn_client_connect_takes_assignment() {
    let port = free_port();
    let server = start_server(test_config(port)).await;

    let client = VpnClient::new(test_config(port), shared_cert_dir().to_path_buf());
    let mut reader = client.connect().await.unwrap();
    assert!(client.is_connected());
    let assigned = client.assigned_ip().unwrap();
    assert!(assigned >= Ipv4Addr::new(10, 8, 0, 2) && assigned <= Ipv4Addr::new(10, 8, 0, 254));

    client.send_heartbeat().await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), read_message(&mut reader))
        .await
        .expect("no heartbeat reply")
        .unwrap();
    assert_eq!(reply.kind, MessageKind::Heartbeat);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn sequence_regress_is_session_fatal() {
    let port = free_port();
    let server = start_server(test_config(port)).await;

    let mut stream = raw_connect(port).await;
    let _ip = read_message(&mut stream).await.unwrap();
    let _config = read_message(&mut stream).await.unwrap();
    assert!(
        wait_for(|| async { server.session_count().await == 1 }, Duration::from_secs(2)).await
    );

    use tokio::io::AsyncWriteExt;
    let packet = vec![0u8; 32];
    stream
        .write_all(&Message::data(5, packet.clone()).encode())
        .await
        .unwrap();
    stream
        .write_all(&Message::data(3, packet).encode())
        .await
        .unwrap();
    stream.flush().await.unwrap();

    // The replay aborts the session and releases its address.
    assert!(
        wait_for(|| async { server.session_count().await == 0 }, Duration::from_secs(5)).await,
        "replayed session was not removed"
    );

    server.stop().await;
}

#[tokio::test]
async fn connection_ceiling_refuses_extra_clients() {
    let port = free_port();
    let mut config = test_config(port);
    config.max_connections = 1;
    let server = start_server(config).await;

    let mut first = raw_connect(port).await;
    let _ip = read_message(&mut first).await.unwrap();
    assert!(
        wait_for(|| async { server.session_count().await == 1 }, Duration::from_secs(2)).await
    );

    // The second handshake succeeds but the server drops it before any
    // assignment.
    let mut second = raw_connect(port).await;
    let refused = tokio::time::timeout(Duration::from_secs(5), read_message(&mut second)).await;
    assert!(
        matches!(refused, Ok(Err(_))),
        "second client should be refused, got {refused:?}"
    );
    assert_eq!(server.session_count().await, 1);

    server.stop().await;
}

#[tokio::test]
async fn kick_by_ip_recycles_the_address() {
    let port = free_port();
    let server = start_server(test_config(port)).await;

    let mut stream = raw_connect(port).await;
    let msg = read_message(&mut stream).await.unwrap();
    assert_eq!(msg.payload, vec![10, 8, 0, 2]);
    assert!(
        wait_for(|| async { server.session_count().await == 1 }, Duration::from_secs(2)).await
    );

    assert!(server.kick_by_ip(Ipv4Addr::new(10, 8, 0, 2)).await);
    assert!(
        wait_for(|| async { server.session_count().await == 0 }, Duration::from_secs(2)).await
    );
    assert!(!server.kick_by_ip(Ipv4Addr::new(10, 8, 0, 2)).await);

    // The freed octet went to the free-list tail, so the next client gets
    // the following one.
    let mut next = raw_connect(port).await;
    let msg = read_message(&mut next).await.unwrap();
    assert_eq!(msg.payload, vec![10, 8, 0, 3]);

    server.stop().await;
}

#[tokio::test]
async fn stop_closes_all_sessions() {
    let port = free_port();
    let server = start_server(test_config(port)).await;

    let mut stream = raw_connect(port).await;
    let _ip = read_message(&mut stream).await.unwrap();
    let _config = read_message(&mut stream).await.unwrap();
    assert!(
        wait_for(|| async { server.session_count().await == 1 }, Duration::from_secs(2)).await
    );

    server.stop().await;
    assert_eq!(server.session_count().await, 0);
    assert!(!server.is_running());

    // The peer observes the close.
    let read = tokio::time::timeout(Duration::from_secs(5), read_message(&mut stream)).await;
    assert!(matches!(read, Ok(Err(_))));
}
