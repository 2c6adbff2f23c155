//! VPN server: TLS accept loop, per-session receive loops, TUN fanout and
//! the session reaper.

pub mod ip_pool;
pub mod session;
pub mod state;
pub mod tls;
mod vpn;

pub use ip_pool::IpPool;
pub use session::{Session, SessionInfo};
pub use state::SessionRegistry;
pub use vpn::VpnServer;

use std::time::{SystemTime, UNIX_EPOCH};

/// Read deadline applied to every session read; a timed-out read only
/// breaks the session once the keepalive window is also exceeded.
pub const READ_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

/// Session id: remote address + monotonic nanosecond timestamp + random
/// suffix. Unique within a server lifetime.
pub fn generate_session_id(remote: &std::net::SocketAddr) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let random = tlsvpn_crypto::rng::random_u64() & 0x7fff_ffff;
    format!("{remote}-{nanos}-{random}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let remote: std::net::SocketAddr = "198.51.100.9:45000".parse().unwrap();
        let a = generate_session_id(&remote);
        let b = generate_session_id(&remote);
        assert_ne!(a, b);
        assert!(a.starts_with("198.51.100.9:45000-"));
    }
}
