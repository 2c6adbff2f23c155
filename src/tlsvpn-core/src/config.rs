//! VPN configuration: the runtime form, its on-disk JSON form, and the
//! config subset the server pushes to connecting clients.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// Runtime configuration. Timeouts are [`Duration`]s; the on-disk form
/// ([`ConfigFile`]) stores them as integer seconds.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub server_port: u16,
    pub client_address: String,
    /// VPN network in CIDR form, e.g. `10.8.0.0/24`.
    pub network: String,
    pub mtu: u16,
    pub keep_alive_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_connections: usize,
    pub session_timeout: Duration,
    pub session_cleanup_interval: Duration,
    /// Server's address inside the VPN, e.g. `10.8.0.1/24`.
    pub server_ip: String,
    /// First host octet handed to clients.
    pub client_ip_start: u8,
    /// Last host octet handed to clients.
    pub client_ip_end: u8,
    pub dns_servers: Vec<String>,
    pub push_routes: Vec<String>,
    /// `full` or `split`.
    pub route_mode: String,
    pub exclude_routes: Vec<String>,
    pub redirect_gateway: bool,
    pub redirect_dns: bool,
    pub enable_nat: bool,
    /// NAT egress interface; empty means auto-detect.
    pub nat_interface: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: "localhost".into(),
            server_port: 8080,
            client_address: "10.8.0.2/24".into(),
            network: "10.8.0.0/24".into(),
            mtu: 1500,
            keep_alive_timeout: Duration::from_secs(90),
            reconnect_delay: Duration::from_secs(5),
            max_connections: 100,
            session_timeout: Duration::from_secs(300),
            session_cleanup_interval: Duration::from_secs(30),
            server_ip: "10.8.0.1/24".into(),
            client_ip_start: 2,
            client_ip_end: 254,
            dns_servers: vec!["8.8.8.8".into(), "8.8.4.4".into()],
            push_routes: vec![],
            route_mode: "split".into(),
            exclude_routes: vec![],
            redirect_gateway: false,
            redirect_dns: false,
            enable_nat: true,
            nat_interface: String::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.server_address.is_empty() {
            bail!("server address must not be empty");
        }
        if self.server_port == 0 {
            bail!("server port must be in 1-65535");
        }
        let _: Ipv4Network = self
            .network
            .parse()
            .with_context(|| format!("invalid VPN network: {}", self.network))?;
        if !(576..=9000).contains(&self.mtu) {
            bail!("MTU must be in 576-9000");
        }
        if self.keep_alive_timeout < Duration::from_secs(10) {
            bail!("keepalive timeout must be at least 10s");
        }
        if self.reconnect_delay < Duration::from_secs(1) {
            bail!("reconnect delay must be at least 1s");
        }
        if self.max_connections == 0 || self.max_connections > 10000 {
            bail!("max connections must be in 1-10000");
        }
        if self.session_timeout < Duration::from_secs(30) {
            bail!("session timeout must be at least 30s");
        }
        if self.session_cleanup_interval < Duration::from_secs(10) {
            bail!("session cleanup interval must be at least 10s");
        }
        if !(2..=253).contains(&self.client_ip_start) {
            bail!("client ip start must be in 2-253");
        }
        if self.client_ip_end < self.client_ip_start {
            bail!("client ip end must not precede start");
        }
        if !self.server_ip.is_empty() {
            let _: Ipv4Network = self
                .server_ip
                .parse()
                .with_context(|| format!("invalid server VPN ip: {}", self.server_ip))?;
        }
        match self.route_mode.as_str() {
            "full" | "split" => {}
            other => bail!("route mode must be full or split, got {other}"),
        }
        Ok(())
    }

    /// The server's IPv4 inside the VPN. Defaults to host `.1` of the VPN
    /// network when `server_ip` is unset.
    pub fn server_vpn_ip(&self) -> Result<Ipv4Addr> {
        if !self.server_ip.is_empty() {
            let net: Ipv4Network = self
                .server_ip
                .parse()
                .with_context(|| format!("invalid server VPN ip: {}", self.server_ip))?;
            return Ok(net.ip());
        }
        let net: Ipv4Network = self
            .network
            .parse()
            .with_context(|| format!("invalid VPN network: {}", self.network))?;
        let base = net.network().octets();
        Ok(Ipv4Addr::new(base[0], base[1], base[2], 1))
    }

    /// The VPN network.
    pub fn vpn_network(&self) -> Result<Ipv4Network> {
        self.network
            .parse()
            .with_context(|| format!("invalid VPN network: {}", self.network))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(file.into())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = ConfigFile::from(self.clone());
        let data = serde_json::to_string_pretty(&file).context("serializing config")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, data)
            .with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }
}

/// On-disk JSON form with second-granularity timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub server_address: String,
    pub server_port: u16,
    pub client_address: String,
    pub network: String,
    pub mtu: u16,
    pub keep_alive_timeout_sec: u64,
    pub reconnect_delay_sec: u64,
    pub max_connections: usize,
    pub session_timeout_sec: u64,
    pub session_cleanup_interval_sec: u64,
    pub server_ip: String,
    pub client_ip_start: u8,
    pub client_ip_end: u8,
    pub dns_servers: Vec<String>,
    pub push_routes: Vec<String>,
    pub route_mode: String,
    pub exclude_routes: Vec<String>,
    pub redirect_gateway: bool,
    pub redirect_dns: bool,
    pub enable_nat: bool,
    pub nat_interface: String,
}

impl From<Config> for ConfigFile {
    fn from(c: Config) -> Self {
        Self {
            server_address: c.server_address,
            server_port: c.server_port,
            client_address: c.client_address,
            network: c.network,
            mtu: c.mtu,
            keep_alive_timeout_sec: c.keep_alive_timeout.as_secs(),
            reconnect_delay_sec: c.reconnect_delay.as_secs(),
            max_connections: c.max_connections,
            session_timeout_sec: c.session_timeout.as_secs(),
            session_cleanup_interval_sec: c.session_cleanup_interval.as_secs(),
            server_ip: c.server_ip,
            client_ip_start: c.client_ip_start,
            client_ip_end: c.client_ip_end,
            dns_servers: c.dns_servers,
            push_routes: c.push_routes,
            route_mode: c.route_mode,
            exclude_routes: c.exclude_routes,
            redirect_gateway: c.redirect_gateway,
            redirect_dns: c.redirect_dns,
            enable_nat: c.enable_nat,
            nat_interface: c.nat_interface,
        }
    }
}

impl From<ConfigFile> for Config {
    fn from(f: ConfigFile) -> Self {
        Self {
            server_address: f.server_address,
            server_port: f.server_port,
            client_address: f.client_address,
            network: f.network,
            mtu: f.mtu,
            keep_alive_timeout: Duration::from_secs(f.keep_alive_timeout_sec),
            reconnect_delay: Duration::from_secs(f.reconnect_delay_sec),
            max_connections: f.max_connections,
            session_timeout: Duration::from_secs(f.session_timeout_sec),
            session_cleanup_interval: Duration::from_secs(f.session_cleanup_interval_sec),
            server_ip: f.server_ip,
            client_ip_start: f.client_ip_start,
            client_ip_end: f.client_ip_end,
            dns_servers: f.dns_servers,
            push_routes: f.push_routes,
            route_mode: f.route_mode,
            exclude_routes: f.exclude_routes,
            redirect_gateway: f.redirect_gateway,
            redirect_dns: f.redirect_dns,
            enable_nat: f.enable_nat,
            nat_interface: f.nat_interface,
        }
    }
}

/// Config subset pushed server→client in the first Control frame. Tells the
/// client how to set up its tunnel address, routes and DNS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Assigned tunnel address with prefix, e.g. `10.8.0.2/24`.
    pub assigned_ip: String,
    /// Server's VPN address with prefix, e.g. `10.8.0.1/24`.
    pub server_ip: String,
    pub dns: Vec<String>,
    pub routes: Vec<String>,
    pub mtu: u16,
    pub route_mode: String,
    pub exclude_routes: Vec<String>,
    pub redirect_gateway: bool,
    pub redirect_dns: bool,
}

impl ClientConfig {
    /// Derive the pushed config from the live server config plus a session's
    /// assigned address.
    pub fn for_session(config: &Config, assigned: Ipv4Addr) -> Self {
        Self {
            assigned_ip: format!("{assigned}/24"),
            server_ip: config.server_ip.clone(),
            dns: config.dns_servers.clone(),
            routes: config.push_routes.clone(),
            mtu: config.mtu,
            route_mode: config.route_mode.clone(),
            exclude_routes: config.exclude_routes.clone(),
            redirect_gateway: config.redirect_gateway,
            redirect_dns: config.redirect_dns,
        }
    }

    /// Gateway address for routes through the tunnel: `server_ip` without
    /// its prefix, falling back to `10.8.0.1`.
    pub fn vpn_gateway(&self) -> String {
        let ip = self.server_ip.split('/').next().unwrap_or("");
        if ip.is_empty() {
            "10.8.0.1".to_string()
        } else {
            ip.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn save_load_roundtrip_preserves_durations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.server_port = 9443;
        config.session_timeout = Duration::from_secs(120);
        config.push_routes = vec!["192.168.50.0/24".into()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server_port, 9443);
        assert_eq!(loaded.session_timeout, Duration::from_secs(120));
        assert_eq!(loaded.push_routes, vec!["192.168.50.0/24".to_string()]);
    }

    #[test]
    fn file_timeouts_are_integer_seconds() {
        let file = ConfigFile::from(Config::default());
        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains("\"keep_alive_timeout_sec\":90"));
        assert!(json.contains("\"session_timeout_sec\":300"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut c = Config::default();
        c.mtu = 100;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.network = "not-a-cidr".into();
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.route_mode = "hybrid".into();
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.client_ip_start = 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn server_vpn_ip_defaults_to_host_one() {
        let mut c = Config::default();
        c.server_ip = String::new();
        assert_eq!(c.server_vpn_ip().unwrap(), Ipv4Addr::new(10, 8, 0, 1));

        c.server_ip = "10.9.0.7/24".into();
        assert_eq!(c.server_vpn_ip().unwrap(), Ipv4Addr::new(10, 9, 0, 7));
    }

    #[test]
    fn client_config_derivation() {
        let mut config = Config::default();
        config.redirect_dns = true;
        let pushed = ClientConfig::for_session(&config, Ipv4Addr::new(10, 8, 0, 5));
        assert_eq!(pushed.assigned_ip, "10.8.0.5/24");
        assert_eq!(pushed.vpn_gateway(), "10.8.0.1");
        assert!(pushed.redirect_dns);
    }
}
