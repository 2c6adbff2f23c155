//! Process-wide coordinator.
//!
//! Owns the configuration, the certificate and token materials, and at most
//! one [`VpnServer`] and one [`VpnClient`] at a time. Public operations map
//! one-to-one onto the control-plane verbs; each holds the service lock only
//! across its synchronous prefix, with background work (server run, client
//! run, enrollment API) spawned outside it. Mutating operations persist the
//! configuration before reporting success.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use tlsvpn_crypto::pki::{self, CertAuthority, PkiConfig};

use crate::client::VpnClient;
use crate::config::{Config, ConfigFile};
use crate::control::{
    CertFile, CertListResponse, ClientStatusResponse, GenCsrResponse, ServerStatusResponse,
    SignedClient, TokenGenerateResponse, TokenInfo,
};
use crate::enroll::{self, EnrollmentRequest, EnrollmentServer, DEFAULT_ENROLL_PORT};
use crate::server::{SessionInfo, VpnServer};
use crate::token::TokenStore;

/// Filesystem and port layout for one daemon instance.
#[derive(Debug, Clone)]
pub struct ServicePaths {
    pub config_file: PathBuf,
    pub cert_dir: PathBuf,
    pub token_dir: PathBuf,
    /// Where gen-csr drops `<name>.csr` / `<name>-key.pem`.
    pub work_dir: PathBuf,
    pub enroll_port: u16,
    pub pki: PkiConfig,
}

impl Default for ServicePaths {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("./config.json"),
            cert_dir: PathBuf::from("./certs"),
            token_dir: PathBuf::from("./tokens"),
            work_dir: PathBuf::from("."),
            enroll_port: DEFAULT_ENROLL_PORT,
            pki: PkiConfig::default(),
        }
    }
}

struct ServiceInner {
    config: Config,
    server: Option<Arc<VpnServer>>,
    client: Option<Arc<VpnClient>>,
    enroll: Option<EnrollmentServer>,
}

/// The daemon's business-operation surface.
pub struct Service {
    paths: ServicePaths,
    tokens: Arc<TokenStore>,
    inner: Mutex<ServiceInner>,
}

impl Service {
    /// Build a service: load the config file when present, otherwise start
    /// from defaults; reconstitute the token index.
    pub fn new(paths: ServicePaths) -> Result<Self> {
        let config = match Config::load(&paths.config_file) {
            Ok(config) => config,
            Err(_) => Config::default(),
        };
        let tokens = Arc::new(TokenStore::open(&paths.token_dir)?);

        Ok(Self {
            paths,
            tokens,
            inner: Mutex::new(ServiceInner {
                config,
                server: None,
                client: None,
                enroll: None,
            }),
        })
    }

    pub fn paths(&self) -> &ServicePaths {
        &self.paths
    }

    // ---- server role ----

    pub async fn start_server(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.server.as_ref().map(|s| s.is_running()).unwrap_or(false) {
            bail!("server already running");
        }

        pki::ensure_server_materials(&self.paths.cert_dir, &self.paths.pki)
            .context("preparing certificates")?;

        let server = Arc::new(VpnServer::new(inner.config.clone(), &self.paths.cert_dir)?);
        server.init_tun().context("initializing tunnel device")?;

        if inner.config.enable_nat {
            if let Err(e) = server.configure_nat() {
                warn!(%e, "NAT setup failed, continuing without it");
            }
        }

        Arc::clone(&server).start().await?;

        // Enrollment rides along with the server role. Missing CA key means
        // no signing capability; the data plane still runs.
        match CertAuthority::load(&self.paths.cert_dir, self.paths.pki.clone()) {
            Ok(ca) => {
                match EnrollmentServer::serve(
                    Arc::clone(&self.tokens),
                    Arc::new(ca),
                    self.paths.enroll_port,
                )
                .await
                {
                    Ok(enroll) => inner.enroll = Some(enroll),
                    Err(e) => warn!(%e, "enrollment API failed to start"),
                }
            }
            Err(e) => warn!(%e, "CA unavailable, enrollment API disabled"),
        }

        inner.server = Some(server);
        Ok(())
    }

    pub async fn stop_server(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(server) = inner.server.take() else {
            bail!("server not running");
        };
        server.stop().await;
        if let Some(enroll) = inner.enroll.take() {
            enroll.stop();
        }
        Ok(())
    }

    pub async fn server_status(&self) -> ServerStatusResponse {
        let inner = self.inner.lock().await;
        let Some(server) = inner.server.as_ref().filter(|s| s.is_running()) else {
            return ServerStatusResponse::default();
        };
        let (total_sent, total_recv) = server.total_bytes().await;
        ServerStatusResponse {
            running: true,
            port: server.port(),
            tun_device: server.tun_name().unwrap_or_default(),
            network: server.network().to_string(),
            client_count: server.session_count().await,
            total_sent,
            total_recv,
        }
    }

    pub async fn server_clients(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().await;
        match inner.server.as_ref().filter(|s| s.is_running()) {
            Some(server) => server.list_sessions().await,
            None => Vec::new(),
        }
    }

    pub async fn kick_client(&self, ip: &str) -> Result<()> {
        let addr: Ipv4Addr = ip.parse().with_context(|| format!("invalid ip: {ip}"))?;
        let inner = self.inner.lock().await;
        let Some(server) = inner.server.as_ref().filter(|s| s.is_running()) else {
            bail!("server not running");
        };
        if !server.kick_by_ip(addr).await {
            bail!("no client at {ip}");
        }
        Ok(())
    }

    // ---- client role ----

    pub async fn connect_client(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.client.as_ref().map(|c| c.is_running()).unwrap_or(false) {
            bail!("client already running");
        }
        if !pki::client_materials_exist(&self.paths.cert_dir) {
            bail!(
                "client certificates missing in {} (request one with a token first)",
                self.paths.cert_dir.display()
            );
        }

        let client = Arc::new(VpnClient::new(
            inner.config.clone(),
            self.paths.cert_dir.clone(),
        ));
        tokio::spawn(Arc::clone(&client).run());
        inner.client = Some(client);
        Ok(())
    }

    pub async fn disconnect_client(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(client) = inner.client.take() else {
            bail!("client not connected");
        };
        client.close().await;
        Ok(())
    }

    pub async fn client_status(&self) -> ClientStatusResponse {
        let inner = self.inner.lock().await;
        let mut status = ClientStatusResponse {
            connected: false,
            server_address: inner.config.server_address.clone(),
            server_port: inner.config.server_port,
            assigned_ip: String::new(),
            tun_device: String::new(),
        };
        if let Some(client) = inner.client.as_ref() {
            status.connected = client.is_connected();
            if let Some(ip) = client.assigned_ip() {
                status.assigned_ip = ip.to_string();
            }
            if let Some(name) = client.tun_name() {
                status.tun_device = name;
            }
        }
        status
    }

    // ---- certificates ----

    pub async fn init_ca(&self) -> Result<()> {
        Ok(pki::ensure_server_materials(&self.paths.cert_dir, &self.paths.pki)?)
    }

    pub fn certificates_exist(&self) -> bool {
        pki::server_materials_exist(&self.paths.cert_dir)
            && pki::client_materials_exist(&self.paths.cert_dir)
    }

    pub fn cert_list(&self) -> CertListResponse {
        let names = [
            "ca.pem",
            "ca-key.pem",
            "server.pem",
            "server-key.pem",
            "client.pem",
            "client-key.pem",
        ];
        let files = names
            .iter()
            .map(|name| {
                let path = self.paths.cert_dir.join(name);
                match std::fs::metadata(&path) {
                    Ok(meta) => CertFile {
                        name: name.to_string(),
                        exists: true,
                        size: Some(meta.len()),
                        modified: meta
                            .modified()
                            .ok()
                            .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
                    },
                    Err(_) => CertFile {
                        name: name.to_string(),
                        exists: false,
                        size: None,
                        modified: None,
                    },
                }
            })
            .collect();

        CertListResponse {
            cert_dir: self.paths.cert_dir.display().to_string(),
            files,
        }
    }

    /// Client certificates the CA has signed, i.e. `*.pem` files other than
    /// the fixed server/client/CA materials.
    pub fn signed_clients(&self) -> Vec<SignedClient> {
        let fixed = ["ca.pem", "server.pem", "client.pem"];
        let Ok(entries) = std::fs::read_dir(&self.paths.cert_dir) else {
            return Vec::new();
        };

        let mut clients = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".pem") || name.ends_with("-key.pem") || fixed.contains(&name.as_str())
            {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_default();
            clients.push(SignedClient { name, modified });
        }
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        clients
    }

    /// Generate a keypair + CSR for `client_name`, dropping
    /// `<name>.csr` and `<name>-key.pem` into the work directory.
    pub fn generate_csr(&self, client_name: &str) -> Result<GenCsrResponse> {
        if client_name.is_empty() {
            bail!("client name must not be empty");
        }

        let (csr_pem, key_pem) = pki::generate_csr(client_name, &self.paths.pki)?;
        let csr_file = self.paths.work_dir.join(format!("{client_name}.csr"));
        let key_file = self.paths.work_dir.join(format!("{client_name}-key.pem"));

        std::fs::write(&csr_file, &csr_pem)
            .with_context(|| format!("writing {}", csr_file.display()))?;
        std::fs::write(&key_file, &key_pem)
            .with_context(|| format!("writing {}", key_file.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_file, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(GenCsrResponse {
            csr_file: csr_file.display().to_string(),
            key_file: key_file.display().to_string(),
            cn: format!("vpn-client-{client_name}"),
        })
    }

    /// Run the token-enrollment exchange against a (possibly remote)
    /// daemon and install the returned materials.
    pub async fn request_certificate(
        &self,
        csr_file: &str,
        token_file: Option<&str>,
        token_id: Option<&str>,
        token_key_hex: Option<&str>,
        server_address: &str,
        server_port: u16,
    ) -> Result<()> {
        let (token_id, token_key_hex) = match token_file {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("reading token file {path}"))?;
                let token: crate::token::Token =
                    serde_json::from_str(&data).context("parsing token file")?;
                (token.id.clone(), hex::encode(&token.key))
            }
            None => (
                token_id.unwrap_or_default().to_string(),
                token_key_hex.unwrap_or_default().to_string(),
            ),
        };
        if token_id.is_empty() || token_key_hex.is_empty() {
            bail!("token id and key are required");
        }

        let token_key = hex::decode(&token_key_hex).context("token key is not hex")?;
        if token_key.len() != crate::token::TOKEN_KEY_LEN {
            bail!("token key must be 32 bytes");
        }

        let csr_pem = std::fs::read_to_string(csr_file)
            .with_context(|| format!("reading CSR file {csr_file}"))?;

        let outcome = enroll::request_certificate(&EnrollmentRequest {
            csr_pem,
            token_id,
            token_key,
            server_address: server_address.to_string(),
            server_port,
        })
        .await?;

        let key_file = csr_file.strip_suffix(".csr").unwrap_or(csr_file).to_string() + "-key.pem";
        let key_pem = match std::fs::read_to_string(&key_file) {
            Ok(pem) => pem,
            Err(e) => {
                warn!(%e, key_file, "private key not found next to CSR; writing certs only");
                String::new()
            }
        };

        if key_pem.is_empty() {
            // Still install what came back so the operator can recover.
            std::fs::create_dir_all(&self.paths.cert_dir)?;
            if let Some(ca) = &outcome.ca_pem {
                std::fs::write(self.paths.cert_dir.join("ca.pem"), ca)?;
            }
            std::fs::write(self.paths.cert_dir.join("client.pem"), &outcome.cert_pem)?;
        } else {
            enroll::install_materials(&self.paths.cert_dir, &outcome, &key_pem)?;
        }

        info!("certificate enrollment completed");
        Ok(())
    }

    // ---- tokens ----

    pub fn generate_token(
        &self,
        client_name: &str,
        duration_hours: i64,
    ) -> Result<TokenGenerateResponse> {
        let hours = if duration_hours <= 0 { 24 } else { duration_hours };
        let token = self
            .tokens
            .generate(client_name, chrono::Duration::hours(hours))?;

        Ok(TokenGenerateResponse {
            token_id: token.id.clone(),
            token_key: hex::encode(&token.key),
            client_name: token.client_name.clone(),
            expires_at: token.expires_at.to_rfc3339(),
            file_path: self.tokens.token_path(&token.id).display().to_string(),
        })
    }

    pub fn token_list(&self) -> Vec<TokenInfo> {
        self.tokens
            .list()
            .into_iter()
            .map(|t| TokenInfo {
                id: t.id.clone(),
                client_name: t.client_name.clone(),
                status: t.status().to_string(),
                expires_at: t.expires_at.to_rfc3339(),
            })
            .collect()
    }

    /// Delete by 1-based position in the id-ordered list.
    pub fn delete_token(&self, index: usize) -> Result<()> {
        let mut ids: Vec<String> = self.tokens.list().into_iter().map(|t| t.id).collect();
        ids.sort();
        if index == 0 || index > ids.len() {
            bail!("invalid token index {index} (1-{})", ids.len());
        }
        self.tokens.revoke(&ids[index - 1])
    }

    pub fn cleanup_tokens(&self) -> usize {
        self.tokens.cleanup_expired_or_used()
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    // ---- config ----

    pub async fn config_file(&self) -> ConfigFile {
        ConfigFile::from(self.inner.lock().await.config.clone())
    }

    pub async fn update_config(&self, field: &str, value: &Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        apply_config_update(&mut inner.config, field, value)?;
        inner.config.save(&self.paths.config_file)
    }

    pub async fn save_config(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.config.save(&self.paths.config_file)
    }

    pub async fn load_config(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.config = Config::load(&self.paths.config_file)?;
        Ok(())
    }

    pub async fn reset_config(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.config = Config::default();
        inner.config.save(&self.paths.config_file)
    }

    // ---- lifecycle ----

    /// Tear everything down: server (with its sessions, NAT and tunnel),
    /// client (with its routes and DNS), enrollment API.
    pub async fn cleanup(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(server) = inner.server.take() {
            server.stop().await;
        }
        if let Some(client) = inner.client.take() {
            client.close().await;
        }
        if let Some(enroll) = inner.enroll.take() {
            enroll.stop();
        }
        info!("service cleaned up");
    }
}

/// Apply one validated `config/update` field. Unknown fields and
/// out-of-range values fail without mutating anything.
pub fn apply_config_update(config: &mut Config, field: &str, value: &Value) -> Result<()> {
    match field {
        "server_port" => {
            let port = value_as_u64(value).context("server_port must be a number")?;
            if !(1..=65535).contains(&port) {
                bail!("server_port must be in 1-65535");
            }
            config.server_port = port as u16;
        }
        "server_address" => {
            let addr = value.as_str().context("server_address must be a string")?;
            if addr.is_empty() {
                bail!("server_address must not be empty");
            }
            config.server_address = addr.to_string();
        }
        "network" => {
            let network = value.as_str().context("network must be a string")?;
            let _: ipnetwork::Ipv4Network = network
                .parse()
                .with_context(|| format!("invalid network CIDR: {network}"))?;
            config.network = network.to_string();
        }
        "mtu" => {
            let mtu = value_as_u64(value).context("mtu must be a number")?;
            if !(576..=9000).contains(&mtu) {
                bail!("mtu must be in 576-9000");
            }
            config.mtu = mtu as u16;
        }
        "route_mode" => {
            let mode = value.as_str().context("route_mode must be a string")?;
            if mode != "full" && mode != "split" {
                bail!("route_mode must be full or split");
            }
            config.route_mode = mode.to_string();
        }
        "enable_nat" => {
            config.enable_nat = value.as_bool().context("enable_nat must be a bool")?;
        }
        "redirect_gateway" => {
            config.redirect_gateway = value.as_bool().context("redirect_gateway must be a bool")?;
        }
        "redirect_dns" => {
            config.redirect_dns = value.as_bool().context("redirect_dns must be a bool")?;
        }
        "nat_interface" => {
            config.nat_interface = value
                .as_str()
                .context("nat_interface must be a string")?
                .to_string();
        }
        "max_connections" => {
            let max = value_as_u64(value).context("max_connections must be a number")?;
            if !(1..=10000).contains(&max) {
                bail!("max_connections must be in 1-10000");
            }
            config.max_connections = max as usize;
        }
        "push_routes" => {
            let routes = value.as_array().context("push_routes must be an array")?;
            let mut parsed = Vec::with_capacity(routes.len());
            for route in routes {
                let cidr = route.as_str().context("push_routes entries must be strings")?;
                if cidr.is_empty() {
                    continue;
                }
                let _: ipnetwork::Ipv4Network = cidr
                    .parse()
                    .with_context(|| format!("invalid route CIDR: {cidr}"))?;
                parsed.push(cidr.to_string());
            }
            config.push_routes = parsed;
        }
        "dns_servers" => {
            let servers = value.as_array().context("dns_servers must be an array")?;
            let mut parsed = Vec::with_capacity(servers.len());
            for server in servers {
                let addr = server.as_str().context("dns_servers entries must be strings")?;
                let _: Ipv4Addr = addr
                    .parse()
                    .with_context(|| format!("invalid DNS server: {addr}"))?;
                parsed.push(addr.to_string());
            }
            config.dns_servers = parsed;
        }
        other => bail!("unknown config field: {other}"),
    }
    Ok(())
}

fn value_as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_accepts_valid_fields() {
        let mut config = Config::default();

        apply_config_update(&mut config, "server_port", &json!(9443)).unwrap();
        assert_eq!(config.server_port, 9443);

        apply_config_update(&mut config, "mtu", &json!(1400)).unwrap();
        assert_eq!(config.mtu, 1400);

        apply_config_update(&mut config, "route_mode", &json!("full")).unwrap();
        assert_eq!(config.route_mode, "full");

        apply_config_update(&mut config, "redirect_dns", &json!(true)).unwrap();
        assert!(config.redirect_dns);

        apply_config_update(
            &mut config,
            "push_routes",
            &json!(["192.168.10.0/24", "172.16.0.0/16"]),
        )
        .unwrap();
        assert_eq!(config.push_routes.len(), 2);

        apply_config_update(&mut config, "dns_servers", &json!(["1.1.1.1"])).unwrap();
        assert_eq!(config.dns_servers, vec!["1.1.1.1".to_string()]);
    }

    #[test]
    fn update_rejects_bad_values_without_mutation() {
        let mut config = Config::default();
        let original_port = config.server_port;

        assert!(apply_config_update(&mut config, "server_port", &json!(0)).is_err());
        assert!(apply_config_update(&mut config, "server_port", &json!(70000)).is_err());
        assert_eq!(config.server_port, original_port);

        assert!(apply_config_update(&mut config, "mtu", &json!(100)).is_err());
        assert!(apply_config_update(&mut config, "route_mode", &json!("hybrid")).is_err());
        assert!(apply_config_update(&mut config, "network", &json!("nope")).is_err());
        assert!(apply_config_update(&mut config, "push_routes", &json!(["bad/99"])).is_err());
        assert!(apply_config_update(&mut config, "dns_servers", &json!(["nope"])).is_err());
        assert!(apply_config_update(&mut config, "no_such_field", &json!(1)).is_err());
    }

    #[test]
    fn update_accepts_float_encoded_numbers() {
        // JSON numbers often arrive as floats from loosely typed callers.
        let mut config = Config::default();
        apply_config_update(&mut config, "server_port", &json!(8443.0)).unwrap();
        assert_eq!(config.server_port, 8443);
    }
}
