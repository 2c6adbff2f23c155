//! System DNS override for full-tunnel mode.
//!
//! Snapshots `/etc/resolv.conf`, rewrites it with the pushed server list,
//! and restores the snapshot on teardown. A symlinked resolv.conf (e.g.
//! systemd-resolved stub) is left alone.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Saved-then-overridden DNS state.
pub struct DnsOverride {
    saved: Option<String>,
    active: bool,
}

impl DnsOverride {
    pub fn new() -> Self {
        Self {
            saved: None,
            active: false,
        }
    }

    /// Capture the current resolv.conf contents.
    pub fn snapshot(&mut self) -> Result<()> {
        if self.saved.is_some() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(RESOLV_CONF)
            .with_context(|| format!("reading {RESOLV_CONF}"))?;
        self.saved = Some(contents);
        Ok(())
    }

    /// Replace resolv.conf with the given nameserver list.
    pub fn apply(&mut self, servers: &[String]) -> Result<()> {
        if servers.is_empty() {
            bail!("at least one DNS server is required");
        }
        if is_symlink(Path::new(RESOLV_CONF)) {
            bail!("{RESOLV_CONF} is a symlink, refusing to overwrite");
        }
        if self.saved.is_none() {
            self.snapshot()?;
        }

        let mut contents = String::from("# written by tls-vpn, original restored on disconnect\n");
        for server in servers {
            contents.push_str(&format!("nameserver {server}\n"));
        }
        std::fs::write(RESOLV_CONF, contents)
            .with_context(|| format!("writing {RESOLV_CONF}"))?;
        self.active = true;
        info!(servers = ?servers, "DNS override active");
        Ok(())
    }

    /// Write the snapshot back. A no-op when no override is active.
    pub fn restore(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let Some(saved) = self.saved.take() else {
            warn!("DNS override active but no snapshot saved");
            self.active = false;
            return Ok(());
        };
        std::fs::write(RESOLV_CONF, saved)
            .with_context(|| format!("restoring {RESOLV_CONF}"))?;
        self.active = false;
        info!("DNS configuration restored");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Default for DnsOverride {
    fn default() -> Self {
        Self::new()
    }
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}
