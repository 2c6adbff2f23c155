//! The VPN server: accept loop, session receive loops, TUN fanout, reaper.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use anyhow::{Context, Result};
use tokio::io::ReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, Config};
use crate::protocol::{read_message, MessageKind, ProtocolError};
use crate::tun::{self, ipv4_destination, NatRule, TunDevice};

use super::session::Session;
use super::state::SessionRegistry;
use super::tls::{build_server_config, peer_common_name};
use super::{generate_session_id, IpPool, SessionInfo, READ_DEADLINE};

/// TLS accept loop, session registry and tunnel fanout for the server role.
pub struct VpnServer {
    config: Config,
    cert_dir: PathBuf,
    registry: SessionRegistry,
    ip_pool: IpPool,
    server_ip: Ipv4Addr,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tun: StdRwLock<Option<Arc<TunDevice>>>,
    nat_rules: StdMutex<Vec<NatRule>>,
    local_addr: StdRwLock<Option<std::net::SocketAddr>>,
}

impl VpnServer {
    pub fn new(config: Config, cert_dir: &Path) -> Result<Self> {
        config.validate().context("server config invalid")?;
        let network = config.vpn_network()?;
        let server_ip = config.server_vpn_ip()?;
        let ip_pool = IpPool::new(network, config.client_ip_start, config.client_ip_end);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            cert_dir: cert_dir.to_path_buf(),
            registry: SessionRegistry::new(),
            ip_pool,
            server_ip,
            running: AtomicBool::new(false),
            shutdown_tx,
            tun: StdRwLock::new(None),
            nat_rules: StdMutex::new(Vec::new()),
            local_addr: StdRwLock::new(None),
        })
    }

    /// Bring up the tunnel device on the server's VPN address and enable IP
    /// forwarding. Separate from `start` so tests can run serverless of a
    /// tunnel.
    pub fn init_tun(&self) -> Result<()> {
        let device = TunDevice::create("", self.server_ip, self.config.mtu)
            .context("creating server tunnel device")?;
        if let Err(e) = tun::nat::enable_ip_forwarding() {
            warn!(%e, "could not enable IP forwarding");
        }
        info!(name = device.name(), ip = %self.server_ip, "server tunnel device ready");
        *self.tun.write().expect("tun lock poisoned") = Some(Arc::new(device));
        Ok(())
    }

    /// Install NAT for the VPN network. Requires the tunnel device. Failure
    /// here is a warning at the call site, never data-plane-fatal.
    pub fn configure_nat(&self) -> Result<()> {
        let tun_name = self
            .tun_name()
            .ok_or_else(|| anyhow::anyhow!("tunnel device not initialized"))?;
        let egress = if self.config.nat_interface.is_empty() {
            tun::routing::detect_default_iface()
                .ok_or_else(|| anyhow::anyhow!("could not detect NAT egress interface"))?
        } else {
            self.config.nat_interface.clone()
        };

        let rules = tun::nat::setup_nat(&self.config.network, &tun_name, &egress)?;
        *self.nat_rules.lock().expect("nat lock poisoned") = rules;
        Ok(())
    }

    /// Bind the TLS listener and spawn the accept loop, tunnel fanout and
    /// session reaper. Returns once the listener is up.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let tls_config = build_server_config(&self.cert_dir)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(("0.0.0.0", self.config.server_port))
            .await
            .with_context(|| format!("binding VPN listener on port {}", self.config.server_port))?;
        self.running.store(true, Ordering::SeqCst);
        *self.local_addr.write().expect("addr lock poisoned") = listener.local_addr().ok();
        info!(port = self.config.server_port, "VPN server listening");

        tokio::spawn(accept_loop(Arc::clone(&self), listener, acceptor));
        if let Some(tun) = self.tun() {
            tokio::spawn(tun_fanout_loop(Arc::clone(&self), tun));
        }
        tokio::spawn(reaper_loop(self));
        Ok(())
    }

    /// Orderly shutdown: stop the loops, close every session outside the
    /// registry lock, undo NAT rules in reverse, release the tunnel device.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let ids = self.registry.ids().await;
        for id in ids {
            self.remove_session(&id).await;
        }

        let rules = std::mem::take(&mut *self.nat_rules.lock().expect("nat lock poisoned"));
        tun::nat::teardown_nat(&rules);

        let tun = self.tun.write().expect("tun lock poisoned").take();
        if let Some(tun) = tun {
            info!(name = tun.name(), "tunnel device released");
        }
        info!("VPN server stopped");
    }

    /// Release the assigned IP, drop both registry entries, then close the
    /// session after the lock is gone.
    pub async fn remove_session(&self, id: &str) {
        if let Some(session) = self.registry.remove(id).await {
            self.ip_pool.release(session.assigned_ip);
            session.close().await;
            info!(
                id = %session.id,
                ip = %session.assigned_ip,
                "session removed, address recycled"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.config.server_port
    }

    /// The actually bound address (differs from the config port when the
    /// config asks for an ephemeral port).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.local_addr.read().expect("addr lock poisoned")
    }

    pub fn network(&self) -> &str {
        &self.config.network
    }

    pub fn tun(&self) -> Option<Arc<TunDevice>> {
        self.tun.read().expect("tun lock poisoned").clone()
    }

    pub fn tun_name(&self) -> Option<String> {
        self.tun().map(|t| t.name().to_string())
    }

    pub async fn session_count(&self) -> usize {
        self.registry.count().await
    }

    /// Session infos sorted by connection time, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = self.registry.snapshot().await;
        sessions.sort_by_key(|s| s.connected_at);
        sessions.iter().map(|s| s.info()).collect()
    }

    /// (total_sent, total_received) over live sessions.
    pub async fn total_bytes(&self) -> (u64, u64) {
        let mut sent = 0u64;
        let mut received = 0u64;
        for session in self.registry.snapshot().await {
            let (s, r) = session.stats();
            sent += s;
            received += r;
        }
        (sent, received)
    }

    pub async fn kick(&self, id: &str) -> bool {
        if self.registry.by_id(id).await.is_none() {
            return false;
        }
        self.remove_session(id).await;
        true
    }

    pub async fn kick_by_ip(&self, ip: Ipv4Addr) -> bool {
        match self.registry.by_ip(ip).await {
            Some(session) => {
                self.remove_session(&session.id).await;
                true
            }
            None => false,
        }
    }
}

/// Fire-and-forget stop, used by loops that detect a fatal tunnel fault
/// from inside the runtime.
fn initiate_stop(server: &Arc<VpnServer>) {
    let server = Arc::clone(server);
    tokio::spawn(async move { server.stop().await });
}

async fn accept_loop(server: Arc<VpnServer>, listener: TcpListener, acceptor: TlsAcceptor) {
    let mut shutdown = server.shutdown_tx.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&server);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        handle_connection(server, acceptor, stream, addr).await;
                    });
                }
                Err(e) => {
                    if !server.is_running() {
                        break;
                    }
                    warn!(%e, "accept failed");
                }
            }
        }
    }
    debug!("accept loop ended");
}

async fn handle_connection(
    server: Arc<VpnServer>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    addr: std::net::SocketAddr,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%addr, %e, "TLS handshake failed");
            return;
        }
    };

    // The verifier already required a client certificate; this also pins
    // the identity we display and log.
    let Some(common_name) = peer_common_name(&tls_stream) else {
        warn!(%addr, "client presented no usable certificate");
        return;
    };

    if server.registry.count().await >= server.config.max_connections {
        warn!(
            %addr,
            limit = server.config.max_connections,
            "connection ceiling reached, refusing client"
        );
        return;
    }

    let Some(assigned_ip) = server.ip_pool.allocate() else {
        warn!(%addr, "IP pool exhausted, refusing client");
        return;
    };

    let id = generate_session_id(&addr);
    let (reader, writer) = tokio::io::split(tls_stream);
    let session = Arc::new(Session::new(
        id.clone(),
        addr,
        writer,
        assigned_ip,
        common_name.clone(),
    ));
    server.registry.insert(Arc::clone(&session)).await;
    info!(%addr, ip = %assigned_ip, cn = %common_name, id = %id, "client connected");

    if let Err(e) = session.send_ip_assignment().await {
        error!(id = %id, %e, "failed to send IP assignment");
        server.remove_session(&id).await;
        return;
    }

    let pushed = ClientConfig::for_session(&server.config, assigned_ip);
    match serde_json::to_vec(&pushed) {
        Ok(json) => {
            // Config push failure is not connection-fatal.
            if let Err(e) = session.send_control(json).await {
                warn!(id = %id, %e, "failed to push client config");
            } else {
                info!(
                    ip = %assigned_ip,
                    mode = %pushed.route_mode,
                    dns = ?pushed.dns,
                    "pushed config to client"
                );
            }
        }
        Err(e) => warn!(id = %id, %e, "failed to serialize client config"),
    }

    session_recv_loop(server, session, reader).await;
}

async fn session_recv_loop(
    server: Arc<VpnServer>,
    session: Arc<Session>,
    mut reader: ReadHalf<TlsStream<TcpStream>>,
) {
    loop {
        if !server.is_running() || session.is_closed() {
            break;
        }

        let msg = match timeout(READ_DEADLINE, read_message(&mut reader)).await {
            Err(_) => {
                if session.idle_for() > server.config.keep_alive_timeout {
                    warn!(id = %session.id, "session keepalive timeout");
                    break;
                }
                continue;
            }
            Ok(Err(ProtocolError::Io(e))) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!(id = %session.id, %e, "session read failed");
                }
                break;
            }
            Ok(Err(e)) => {
                warn!(id = %session.id, %e, "frame error");
                break;
            }
            Ok(Ok(msg)) => msg,
        };

        if let Err(e) = session.recv_seq.validate(msg.kind, msg.sequence) {
            warn!(id = %session.id, %e, "aborting session");
            break;
        }
        if let Err(e) = msg.verify_checksum() {
            warn!(id = %session.id, %e, "aborting session");
            break;
        }
        session.touch();

        match msg.kind {
            MessageKind::Heartbeat => {
                if let Err(e) = session.send_heartbeat().await {
                    warn!(id = %session.id, %e, "heartbeat reply failed");
                    break;
                }
            }
            MessageKind::Data => {
                session.add_bytes_received(msg.payload.len() as u64);
                if msg.payload.is_empty() {
                    continue;
                }
                match server.tun() {
                    Some(tun) => {
                        if let Err(e) = tun.write_packet(&msg.payload).await {
                            error!(id = %session.id, %e, "tunnel write failed, stopping server");
                            initiate_stop(&server);
                            break;
                        }
                    }
                    None => {
                        debug!(id = %session.id, len = msg.payload.len(), "data frame with no tunnel device");
                    }
                }
            }
            other => {
                debug!(id = %session.id, kind = ?other, "ignoring message kind");
            }
        }
    }

    server.remove_session(&session.id).await;
    debug!(id = %session.id, "session receive loop ended");
}

/// Read packets off the tunnel and hand each to the owning session by
/// destination address. Unknown destinations are dropped silently; a send
/// failure to one session never stops the loop.
async fn tun_fanout_loop(server: Arc<VpnServer>, tun: Arc<TunDevice>) {
    let mut shutdown = server.shutdown_tx.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let packet = tokio::select! {
            _ = shutdown.changed() => break,
            res = tun.read_packet() => match res {
                Ok(packet) => packet,
                Err(e) => {
                    if server.is_running() {
                        error!(%e, "tunnel read failed, stopping server");
                        initiate_stop(&server);
                    }
                    break;
                }
            }
        };

        let Some(dst) = ipv4_destination(&packet) else {
            continue;
        };
        if let Some(session) = server.registry.by_ip(dst).await {
            if let Err(e) = session.send_data(&packet).await {
                debug!(ip = %dst, %e, "forward to session failed");
            }
        }
    }
    debug!("tunnel fanout loop ended");
}

/// Periodically remove sessions idle past the session timeout. Ids are
/// collected under the read lock; removal happens after it is dropped.
async fn reaper_loop(server: Arc<VpnServer>) {
    let mut shutdown = server.shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(server.config.session_cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if !server.is_running() {
            break;
        }

        let expired: Vec<String> = server
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.idle_for() > server.config.session_timeout)
            .map(|s| s.id.clone())
            .collect();

        for id in expired {
            info!(id = %id, "reaping idle session");
            server.remove_session(&id).await;
        }
    }
    debug!("session reaper ended");
}
