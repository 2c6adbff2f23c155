//! TUN device wrapper.
//!
//! Exposes the capability set the data plane depends on: blocking read of
//! one IP packet, atomic write of one IP packet, the OS-visible interface
//! name, and teardown on drop. The underlying driver hands out a vector of
//! queue handles; this wrapper adapts that to the single-device capability
//! the rest of the code uses. Address, netmask, MTU and link state are
//! configured at build time, with `configure_address` available to repoint
//! an existing device between sessions.

use std::net::Ipv4Addr;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tokio_tun::{Tun, TunBuilder};
use tracing::{info, warn};

/// An up-and-configured layer-3 tunnel interface.
pub struct TunDevice {
    tun: Tun,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Create a TUN device, assign `address/24`, set the MTU and bring the
    /// link up. An empty name lets the kernel pick the next free `tunN`.
    pub fn create(name: &str, address: Ipv4Addr, mtu: u16) -> Result<Self> {
        let mut builder = TunBuilder::new();
        if !name.is_empty() {
            builder = builder.name(name);
        }
        let tun = builder
            .address(address)
            .netmask(Ipv4Addr::new(255, 255, 255, 0))
            .mtu(mtu as i32)
            .up()
            .try_build()
            .map_err(|e| anyhow::anyhow!("creating TUN device: {e}"))?;

        let name = tun.name().to_string();
        info!(name = %name, address = %address, mtu, "TUN device created");
        Ok(Self { tun, name, mtu })
    }

    /// OS-visible interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Read one complete IP packet. Blocks until a packet arrives.
    pub async fn read_packet(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.mtu as usize + 4];
        let n = self
            .tun
            .recv(&mut buf)
            .await
            .context("reading from TUN device")?;
        if n == 0 {
            bail!("TUN device closed");
        }
        buf.truncate(n);
        Ok(buf)
    }

    /// Write one complete IP packet.
    pub async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        self.tun
            .send(packet)
            .await
            .context("writing to TUN device")?;
        Ok(())
    }
}

/// Re-point an existing device at a new address and MTU between sessions.
pub fn configure_address(name: &str, address: Ipv4Addr, mtu: u16) -> Result<()> {
    let addr_cidr = format!("{address}/24");

    let status = Command::new("ip")
        .args(["addr", "replace", &addr_cidr, "dev", name])
        .status()
        .context("running ip addr replace")?;
    if !status.success() {
        warn!(name, addr = %addr_cidr, "ip addr replace failed");
    }

    let status = Command::new("ip")
        .args(["link", "set", name, "mtu", &mtu.to_string(), "up"])
        .status()
        .context("running ip link set")?;
    if !status.success() {
        bail!("failed to configure interface {name}");
    }

    info!(name, address = %address, mtu, "TUN device reconfigured");
    Ok(())
}
