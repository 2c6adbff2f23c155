//! VPN client: TLS dial with bounded reconnect, config-push intake,
//! TUN pump and heartbeat.
//!
//! One `VpnClient` survives across reconnects. Each successful connect
//! resets the sequence counters, (re)configures the tunnel device and
//! installs routes; session teardown cancels the heartbeat and tunnel-read
//! tasks and removes routes and DNS but keeps the device, which only
//! `close()` releases.

pub mod tls;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, sleep, timeout};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, Config};
use crate::protocol::{
    read_message, Message, MessageKind, ProtocolError, RecvSequence, SequenceCounter,
};
use crate::tun::packet::MIN_IP_HEADER;
use crate::tun::{device, RouteManager, TunDevice};

use self::tls::{build_client_config, SERVER_NAME};

/// TCP connect budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Heartbeat cadence while a session is up.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnect attempts before the client gives up.
const MAX_RETRIES: u32 = 5;

/// Read half of the client's TLS stream, consumed by the data loop.
pub type ClientReader = ReadHalf<TlsStream<TcpStream>>;
type ClientWriter = WriteHalf<TlsStream<TcpStream>>;

/// The client role: dial, pump, reconnect.
pub struct VpnClient {
    config: StdRwLock<Config>,
    cert_dir: PathBuf,
    writer: Mutex<Option<ClientWriter>>,
    assigned_ip: StdRwLock<Option<Ipv4Addr>>,
    tun: StdRwLock<Option<Arc<TunDevice>>>,
    routes: StdMutex<Option<RouteManager>>,
    send_seq: SequenceCounter,
    recv_seq: RecvSequence,
    cancel_tx: watch::Sender<bool>,
    connected: AtomicBool,
    running: AtomicBool,
}

impl VpnClient {
    pub fn new(config: Config, cert_dir: PathBuf) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config: StdRwLock::new(config),
            cert_dir,
            writer: Mutex::new(None),
            assigned_ip: StdRwLock::new(None),
            tun: StdRwLock::new(None),
            routes: StdMutex::new(None),
            send_seq: SequenceCounter::new(),
            recv_seq: RecvSequence::new(),
            cancel_tx,
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Dial the server, upgrade to TLS 1.3, take the IP assignment and the
    /// pushed config. Returns the read half for the data loop.
    pub async fn connect(&self) -> Result<ClientReader> {
        let (address, port) = {
            let config = self.config.read().expect("config lock poisoned");
            (config.server_address.clone(), config.server_port)
        };

        let tcp = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((address.as_str(), port)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("connect to {address}:{port} timed out"))?
        .with_context(|| format!("connecting to {address}:{port}"))?;

        let tls_config = build_client_config(&self.cert_dir)?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name =
            ServerName::try_from(SERVER_NAME.to_string()).context("invalid server name")?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .context("TLS handshake failed")?;

        let (_, session) = stream.get_ref();
        if session.protocol_version() != Some(rustls::ProtocolVersion::TLSv1_3) {
            bail!("server negotiated a TLS version other than 1.3");
        }
        info!(server = %address, port, "connected over TLS 1.3");

        self.send_seq.reset();
        self.recv_seq.reset();
        let (mut reader, writer) = tokio::io::split(stream);

        // First frame: IpAssignment with the 4-byte tunnel address.
        let msg = timeout(CONNECT_TIMEOUT, read_message(&mut reader))
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for IP assignment"))??;
        if msg.kind != MessageKind::IpAssignment || msg.payload.len() < 4 {
            bail!(
                "expected IP assignment, got kind {:?} with {} bytes",
                msg.kind,
                msg.payload.len()
            );
        }
        let assigned = Ipv4Addr::new(msg.payload[0], msg.payload[1], msg.payload[2], msg.payload[3]);
        *self.assigned_ip.write().expect("ip lock poisoned") = Some(assigned);
        info!(ip = %assigned, "received tunnel address");

        // Second frame: pushed config. Optional; its absence is not fatal.
        match timeout(CONNECT_TIMEOUT, read_message(&mut reader)).await {
            Ok(Ok(msg)) if msg.kind == MessageKind::Control && !msg.payload.is_empty() => {
                match serde_json::from_slice::<ClientConfig>(&msg.payload) {
                    Ok(pushed) => self.merge_pushed_config(&pushed),
                    Err(e) => warn!(%e, "unparseable pushed config"),
                }
            }
            Ok(Ok(msg)) => debug!(kind = ?msg.kind, "no config push in second frame"),
            Ok(Err(e)) => warn!(%e, "error reading pushed config"),
            Err(_) => warn!("timed out waiting for pushed config"),
        }

        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        Ok(reader)
    }

    fn merge_pushed_config(&self, pushed: &ClientConfig) {
        let mut config = self.config.write().expect("config lock poisoned");
        if !pushed.route_mode.is_empty() {
            config.route_mode = pushed.route_mode.clone();
        }
        if !pushed.exclude_routes.is_empty() {
            config.exclude_routes = pushed.exclude_routes.clone();
        }
        config.redirect_gateway = pushed.redirect_gateway;
        config.redirect_dns = pushed.redirect_dns;
        if !pushed.dns.is_empty() {
            config.dns_servers = pushed.dns.clone();
        }
        if !pushed.routes.is_empty() {
            config.push_routes = pushed.routes.clone();
        }
        if !pushed.server_ip.is_empty() {
            config.server_ip = pushed.server_ip.clone();
        }
        if pushed.mtu > 0 {
            config.mtu = pushed.mtu;
        }
        info!(
            mode = %config.route_mode,
            redirect_gateway = config.redirect_gateway,
            redirect_dns = config.redirect_dns,
            "applied pushed server config"
        );
    }

    /// The reconnection loop. Honours cancellation at every suspension
    /// point; resets the retry budget after each successful connect.
    pub async fn run(self: Arc<Self>) {
        let mut cancel = self.cancel_tx.subscribe();
        let mut retries = 0u32;
        self.running.store(true, Ordering::SeqCst);

        loop {
            if *cancel.borrow() {
                break;
            }

            let reader = match self.connect().await {
                Ok(reader) => reader,
                Err(e) => {
                    if *cancel.borrow() {
                        break;
                    }
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        error!(%e, retries, "connect failed, retry budget exhausted");
                        break;
                    }
                    let delay = self.reconnect_delay();
                    warn!(%e, attempt = retries, max = MAX_RETRIES, "connect failed, retrying");
                    tokio::select! {
                        _ = cancel.changed() => break,
                        _ = sleep(delay) => {}
                    }
                    continue;
                }
            };
            retries = 0;

            if let Err(e) = self.setup_tunnel() {
                error!(%e, "tunnel setup failed");
                self.teardown_session().await;
                tokio::select! {
                    _ = cancel.changed() => break,
                    _ = sleep(self.reconnect_delay()) => {}
                }
                continue;
            }

            let (session_tx, _) = watch::channel(false);
            tokio::spawn(heartbeat_task(Arc::clone(&self), session_tx.subscribe()));
            if let Some(tun) = self.tun() {
                tokio::spawn(tun_read_task(Arc::clone(&self), tun, session_tx.subscribe()));
            }

            self.data_loop(reader, &mut cancel).await;

            let _ = session_tx.send(true);
            self.teardown_session().await;

            if *cancel.borrow() {
                break;
            }
            info!("connection lost, scheduling reconnect");
            tokio::select! {
                _ = cancel.changed() => break,
                _ = sleep(self.reconnect_delay()) => {}
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        info!("VPN client exited");
    }

    fn reconnect_delay(&self) -> Duration {
        self.config
            .read()
            .expect("config lock poisoned")
            .reconnect_delay
    }

    /// Configure the tunnel device for the assigned address and install
    /// routes per the active route mode.
    fn setup_tunnel(&self) -> Result<()> {
        let assigned = self
            .assigned_ip
            .read()
            .expect("ip lock poisoned")
            .ok_or_else(|| anyhow::anyhow!("no tunnel address assigned"))?;
        let config = self.config.read().expect("config lock poisoned").clone();

        let existing = self.tun_name();
        match existing {
            Some(name) => device::configure_address(&name, assigned, config.mtu)?,
            None => {
                let created = TunDevice::create("", assigned, config.mtu)
                    .context("creating client tunnel device")?;
                *self.tun.write().expect("tun lock poisoned") = Some(Arc::new(created));
            }
        }
        let tun_name = self.tun_name().unwrap_or_default();

        let mut rm = RouteManager::detect().context("detecting default route")?;

        // Keep the encrypted tunnel itself out of the tunnel.
        if let Ok(server_ip) = config.server_address.parse::<Ipv4Addr>() {
            let host_route = format!("{server_ip}/32");
            let gateway = rm.default_gateway().to_string();
            let iface = rm.default_iface().to_string();
            if let Err(e) = rm.add_route(&host_route, &gateway, &iface) {
                warn!(%e, "could not pin route to VPN server");
            }
        } else {
            debug!(
                address = %config.server_address,
                "server address is not an IPv4 literal, skipping host route"
            );
        }

        let pushed = ClientConfig::for_session(&config, assigned);
        let vpn_gateway = pushed.vpn_gateway();

        match config.route_mode.as_str() {
            "full" => {
                info!("configuring full-tunnel routing");
                for half in ["0.0.0.0/1", "128.0.0.0/1"] {
                    if config.exclude_routes.iter().any(|r| r == half) {
                        info!(route = half, "skipping excluded route");
                        continue;
                    }
                    if let Err(e) = rm.add_route(half, &vpn_gateway, &tun_name) {
                        warn!(%e, route = half, "route install failed");
                    }
                }
                let default_gateway = rm.default_gateway().to_string();
                let default_iface = rm.default_iface().to_string();
                for exclude in &config.exclude_routes {
                    if let Err(e) = rm.add_route(exclude, &default_gateway, &default_iface) {
                        warn!(%e, route = %exclude, "exclude route install failed");
                    }
                }
                if config.redirect_dns && !config.dns_servers.is_empty() {
                    if let Err(e) = rm.snapshot_dns() {
                        warn!(%e, "could not snapshot DNS");
                    } else if let Err(e) = rm.set_dns(&config.dns_servers, &tun_name) {
                        warn!(%e, "could not apply pushed DNS");
                    }
                }
            }
            mode => {
                if mode != "split" {
                    warn!(mode, "unknown route mode, falling back to split");
                }
                info!(routes = config.push_routes.len(), "configuring split routing");
                for route in &config.push_routes {
                    if let Err(e) = rm.add_route(route, &vpn_gateway, &tun_name) {
                        warn!(%e, route = %route, "route install failed");
                    }
                }
            }
        }

        *self.routes.lock().expect("route lock poisoned") = Some(rm);
        Ok(())
    }

    /// The TLS read loop: same sequence/CRC discipline as the server side.
    async fn data_loop(&self, mut reader: ClientReader, cancel: &mut watch::Receiver<bool>) {
        loop {
            let keepalive = self
                .config
                .read()
                .expect("config lock poisoned")
                .keep_alive_timeout;

            let msg = tokio::select! {
                _ = cancel.changed() => return,
                res = timeout(keepalive, read_message(&mut reader)) => match res {
                    Err(_) => {
                        warn!("server went silent past the keepalive window");
                        return;
                    }
                    Ok(Err(ProtocolError::Io(e))) => {
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            warn!(%e, "read failed");
                        }
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(%e, "frame error, dropping connection");
                        return;
                    }
                    Ok(Ok(msg)) => msg,
                }
            };

            if let Err(e) = self.recv_seq.validate(msg.kind, msg.sequence) {
                warn!(%e, "dropping connection");
                return;
            }
            if let Err(e) = msg.verify_checksum() {
                warn!(%e, "dropping connection");
                return;
            }

            match msg.kind {
                MessageKind::Heartbeat => {}
                MessageKind::Control => {
                    if msg.payload.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<ClientConfig>(&msg.payload) {
                        Ok(pushed) => self.apply_live_config(&pushed),
                        Err(e) => warn!(%e, "unparseable control payload"),
                    }
                }
                MessageKind::Data => {
                    if msg.payload.is_empty() {
                        continue;
                    }
                    match self.tun() {
                        Some(tun) => {
                            if let Err(e) = tun.write_packet(&msg.payload).await {
                                error!(%e, "tunnel write failed, dropping connection");
                                return;
                            }
                        }
                        None => debug!(len = msg.payload.len(), "data frame with no tunnel device"),
                    }
                }
                other => debug!(kind = ?other, "ignoring message kind"),
            }
        }
    }

    /// Live config update from a mid-session Control frame: merge and
    /// install any newly pushed routes.
    fn apply_live_config(&self, pushed: &ClientConfig) {
        self.merge_pushed_config(pushed);

        let tun_name = self.tun_name().unwrap_or_default();
        let gateway = pushed.vpn_gateway();
        let mut routes = self.routes.lock().expect("route lock poisoned");
        if let Some(rm) = routes.as_mut() {
            for route in &pushed.routes {
                if rm.installed_routes().iter().any(|r| r == route) {
                    continue;
                }
                if let Err(e) = rm.add_route(route, &gateway, &tun_name) {
                    warn!(%e, route = %route, "live route install failed");
                }
            }
        }
    }

    /// Send one IP packet to the server.
    pub async fn send_data(&self, packet: &[u8]) -> Result<()> {
        let seq = self.send_seq.next();
        let msg = Message::data(seq, packet.to_vec());
        self.write(&msg).await
    }

    /// Send a heartbeat (sequence 0, no payload).
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.write(&Message::heartbeat()).await
    }

    async fn write(&self, msg: &Message) -> Result<()> {
        let encoded = msg.encode();
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            bail!("not connected");
        };
        writer.write_all(&encoded).await.context("write failed")?;
        writer.flush().await.context("flush failed")?;
        Ok(())
    }

    /// Close the active connection without touching the tunnel device; used
    /// between reconnects and by tasks that detect a dead peer.
    async fn close_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }

    /// Session teardown: drop the connection and undo routes and DNS. The
    /// tunnel device deliberately survives for the next session.
    async fn teardown_session(&self) {
        self.close_connection().await;
        let rm = self.routes.lock().expect("route lock poisoned").take();
        if let Some(mut rm) = rm {
            rm.cleanup();
        }
    }

    /// Full stop: cancel the run loop, tear the session down, release the
    /// tunnel device. Idempotent.
    pub async fn close(&self) {
        self.cancel_tx.send_replace(true);
        self.teardown_session().await;
        let tun = self.tun.write().expect("tun lock poisoned").take();
        if let Some(tun) = tun {
            info!(name = tun.name(), "client tunnel device released");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn assigned_ip(&self) -> Option<Ipv4Addr> {
        *self.assigned_ip.read().expect("ip lock poisoned")
    }

    pub fn tun(&self) -> Option<Arc<TunDevice>> {
        self.tun.read().expect("tun lock poisoned").clone()
    }

    pub fn tun_name(&self) -> Option<String> {
        self.tun().map(|t| t.name().to_string())
    }
}

/// Heartbeat every 30s; a failed send terminates the session by shutting
/// the connection down, which unblocks the data loop.
async fn heartbeat_task(client: Arc<VpnClient>, mut session_cancel: watch::Receiver<bool>) {
    let mut ticker = interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the session settles.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = session_cancel.changed() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = client.send_heartbeat().await {
            warn!(%e, "heartbeat failed, terminating session");
            client.close_connection().await;
            return;
        }
    }
}

/// Pump packets from the tunnel into the session. Frames shorter than a
/// minimal IP header are dropped.
async fn tun_read_task(
    client: Arc<VpnClient>,
    tun: Arc<TunDevice>,
    mut session_cancel: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            _ = session_cancel.changed() => return,
            res = tun.read_packet() => match res {
                Ok(packet) => packet,
                Err(e) => {
                    if !*session_cancel.borrow() {
                        warn!(%e, "tunnel read failed, terminating session");
                        client.close_connection().await;
                    }
                    return;
                }
            }
        };

        if packet.len() < MIN_IP_HEADER {
            continue;
        }
        if let Err(e) = client.send_data(&packet).await {
            warn!(%e, "send failed, terminating session");
            client.close_connection().await;
            return;
        }
    }
}
