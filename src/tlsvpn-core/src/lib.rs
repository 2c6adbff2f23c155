//! # tlsvpn-core
//!
//! Core of the tls-vpn daemon: a mutually-authenticated TLS 1.3 layer-3 VPN
//! with an out-of-band certificate enrollment channel and a local control
//! plane.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        daemon                            │
//! │  ┌─────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │ Service │───│  VpnServer   │───│ Sessions ↔ TUN   │   │
//! │  │         │   │  VpnClient   │   │ (frame protocol) │   │
//! │  └────┬────┘   └──────────────┘   └──────────────────┘   │
//! │       │        ┌──────────────┐   ┌──────────────────┐   │
//! │       ├────────│ Enrollment   │   │ TokenStore + CA  │   │
//! │       │        │ HTTP (8081)  │───│ (AES-GCM sealed) │   │
//! │       │        └──────────────┘   └──────────────────┘   │
//! │  ┌────┴────────────┐  ┌────────┐                         │
//! │  │ ControlPlane    │  │ LogBus │                         │
//! │  │ (unix socket)   │  │ (ring) │                         │
//! │  └─────────────────┘  └────────┘                         │
//! └──────────────────────────────────────────────────────────┘
//! ```

/// VPN client: TLS dial, reconnect loop, TUN pump, heartbeat
pub mod client;
/// Runtime configuration and its on-disk JSON form
pub mod config;
/// Local control plane: unix-socket JSON RPC server and client stub
pub mod control;
/// Certificate enrollment HTTP endpoint and enrollment client
pub mod enroll;
/// Sequenced in-memory log ring consumed over the control plane
pub mod logbus;
/// Wire protocol: 13-byte-header framed messages, CRC, sequence discipline
pub mod protocol;
/// VPN server: accept loop, session registry, TUN fanout, reaper
pub mod server;
/// Process-wide coordinator owning server, client, enrollment and config
pub mod service;
/// Single-use enrollment tokens with per-file persistence
pub mod token;
/// TUN device, route/DNS management and NAT rule tracking
pub mod tun;
