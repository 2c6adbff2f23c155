//! Host route table management for the VPN client.
//!
//! Tracks every route it installs so teardown can undo them in reverse
//! order, and carries the DNS override used by full-tunnel mode. All host
//! mutations go through the `ip` tool; the data plane never assumes any
//! particular route survived.

use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use super::dns::DnsOverride;

/// Route and DNS state for one client lifetime.
pub struct RouteManager {
    default_gateway: String,
    default_iface: String,
    installed: Vec<String>,
    dns: DnsOverride,
}

impl RouteManager {
    /// Snapshot the pre-VPN default route. Routes added later for server
    /// reachability and exclusions go through this gateway.
    pub fn detect() -> Result<Self> {
        let (gateway, iface) = default_route()
            .context("detecting default route")?
            .ok_or_else(|| anyhow::anyhow!("no default route present"))?;
        debug!(gateway = %gateway, iface = %iface, "captured pre-VPN default route");
        Ok(Self {
            default_gateway: gateway,
            default_iface: iface,
            installed: Vec::new(),
            dns: DnsOverride::new(),
        })
    }

    pub fn default_gateway(&self) -> &str {
        &self.default_gateway
    }

    pub fn default_iface(&self) -> &str {
        &self.default_iface
    }

    /// Install `cidr via gateway dev iface` and remember it for cleanup.
    pub fn add_route(&mut self, cidr: &str, gateway: &str, iface: &str) -> Result<()> {
        let output = Command::new("ip")
            .args(["route", "add", cidr, "via", gateway, "dev", iface])
            .output()
            .context("running ip route add")?;
        if !output.status.success() {
            bail!(
                "ip route add {cidr} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        self.installed.push(cidr.to_string());
        info!(cidr, gateway, iface, "route installed");
        Ok(())
    }

    /// Remove a single route installed earlier.
    pub fn delete_route(&mut self, cidr: &str) {
        let status = Command::new("ip").args(["route", "del", cidr]).status();
        match status {
            Ok(s) if s.success() => debug!(cidr, "route removed"),
            _ => warn!(cidr, "failed to remove route"),
        }
        self.installed.retain(|r| r != cidr);
    }

    /// Snapshot the current system DNS configuration.
    pub fn snapshot_dns(&mut self) -> Result<()> {
        self.dns.snapshot()
    }

    /// Override system DNS with the pushed server list. The interface hint
    /// is used on platforms with per-interface resolvers; here the override
    /// is system-wide.
    pub fn set_dns(&mut self, servers: &[String], iface_hint: &str) -> Result<()> {
        debug!(iface = iface_hint, "applying DNS override system-wide");
        self.dns.apply(servers)
    }

    /// Restore the DNS configuration captured by `snapshot_dns`.
    pub fn restore_dns(&mut self) {
        if let Err(e) = self.dns.restore() {
            warn!(%e, "failed to restore DNS configuration");
        }
    }

    /// Undo everything: installed routes in reverse order, then DNS.
    pub fn cleanup(&mut self) {
        let routes = std::mem::take(&mut self.installed);
        for cidr in routes.iter().rev() {
            let status = Command::new("ip").args(["route", "del", cidr]).status();
            match status {
                Ok(s) if s.success() => debug!(cidr = %cidr, "route removed"),
                _ => warn!(cidr = %cidr, "failed to remove route during cleanup"),
            }
        }
        self.restore_dns();
    }

    pub fn installed_routes(&self) -> &[String] {
        &self.installed
    }
}

/// Parse `ip route show default` into (gateway, interface).
pub fn default_route() -> Result<Option<(String, String)>> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .context("running ip route show default")?;
    if !output.status.success() {
        return Ok(None);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let mut gateway = None;
        let mut iface = None;
        let mut parts = line.split_whitespace();
        while let Some(tok) = parts.next() {
            match tok {
                "via" => gateway = parts.next().map(str::to_string),
                "dev" => iface = parts.next().map(str::to_string),
                _ => {}
            }
        }
        if let (Some(gateway), Some(iface)) = (gateway, iface) {
            return Ok(Some((gateway, iface)));
        }
    }
    Ok(None)
}

/// Default-route interface name, when one exists.
pub fn detect_default_iface() -> Option<String> {
    default_route().ok().flatten().map(|(_, iface)| iface)
}
