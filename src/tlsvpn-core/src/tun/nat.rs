//! NAT masquerading for the VPN server.
//!
//! Every iptables rule installed is recorded as a [`NatRule`]; on shutdown
//! the server replays the list in reverse with `-D`. Failures to install or
//! remove rules are warnings, never data-plane-fatal.

use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// One installed iptables rule, stored as the arguments that appended it.
#[derive(Debug, Clone)]
pub struct NatRule {
    pub table: String,
    pub chain: String,
    pub args: Vec<String>,
}

/// Enable IPv4 forwarding (server mode).
pub fn enable_ip_forwarding() -> Result<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1").context("enabling IP forwarding")?;
    info!("IP forwarding enabled");
    Ok(())
}

/// Install masquerading for the VPN network plus the two forward rules
/// between the tunnel and the egress interface. Returns the rules that were
/// actually installed, in install order.
pub fn setup_nat(vpn_network: &str, tun_name: &str, out_iface: &str) -> Result<Vec<NatRule>> {
    let mut installed = Vec::new();

    let masq = NatRule {
        table: "nat".into(),
        chain: "POSTROUTING".into(),
        args: str_args(&["-s", vpn_network, "-o", out_iface, "-j", "MASQUERADE"]),
    };
    if rule_exists(&masq) {
        info!("NAT masquerade rule already present, skipping");
    } else {
        append_rule(&masq)?;
        installed.push(masq);
    }

    let forward_out = NatRule {
        table: "filter".into(),
        chain: "FORWARD".into(),
        args: str_args(&["-i", tun_name, "-o", out_iface, "-j", "ACCEPT"]),
    };
    match append_rule(&forward_out) {
        Ok(()) => installed.push(forward_out),
        Err(e) => warn!(%e, "failed to add forward rule (tun -> egress)"),
    }

    let forward_back = NatRule {
        table: "filter".into(),
        chain: "FORWARD".into(),
        args: str_args(&[
            "-i",
            out_iface,
            "-o",
            tun_name,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]),
    };
    match append_rule(&forward_back) {
        Ok(()) => installed.push(forward_back),
        Err(e) => warn!(%e, "failed to add forward rule (egress -> tun)"),
    }

    info!(network = vpn_network, tun = tun_name, egress = out_iface, "NAT configured");
    Ok(installed)
}

/// Undo installed rules in reverse order. Removal failures are warnings.
pub fn teardown_nat(rules: &[NatRule]) {
    for rule in rules.iter().rev() {
        let mut args = vec!["-t".to_string(), rule.table.clone(), "-D".into(), rule.chain.clone()];
        args.extend(rule.args.iter().cloned());

        let output = Command::new("iptables").args(&args).output();
        match output {
            Ok(out) if out.status.success() => info!(?args, "NAT rule removed"),
            Ok(out) => warn!(
                ?args,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "failed to remove NAT rule"
            ),
            Err(e) => warn!(?args, %e, "failed to run iptables"),
        }
    }
}

fn rule_exists(rule: &NatRule) -> bool {
    let mut args = vec!["-t".to_string(), rule.table.clone(), "-C".into(), rule.chain.clone()];
    args.extend(rule.args.iter().cloned());
    Command::new("iptables")
        .args(&args)
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn append_rule(rule: &NatRule) -> Result<()> {
    let mut args = vec!["-t".to_string(), rule.table.clone(), "-A".into(), rule.chain.clone()];
    args.extend(rule.args.iter().cloned());

    let output = Command::new("iptables")
        .args(&args)
        .output()
        .context("running iptables")?;
    if !output.status.success() {
        bail!(
            "iptables {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn str_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
