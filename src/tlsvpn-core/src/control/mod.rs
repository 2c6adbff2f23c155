//! Local control plane: newline-delimited JSON RPC over a unix socket.
//!
//! Every connection carries exactly one request line and one response line.
//! The same types serve the daemon-side dispatcher and the client stub used
//! by `--status`, `--stop` and the presentation process.

pub mod client;
pub mod server;

pub use client::ControlClient;
pub use server::ControlServer;

use serde::{Deserialize, Serialize};

use crate::logbus::LogEntry;
use crate::server::SessionInfo;

/// Conventional control socket path.
pub const CONTROL_SOCKET_PATH: &str = "/var/run/vpn_control.sock";

/// One request line.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiRequest {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// One response line.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_data<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                ..Default::default()
            },
            Err(e) => Self::failure(format!("response serialization failed: {e}")),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

// ---- server role ----

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerStatusResponse {
    pub running: bool,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tun_device: String,
    #[serde(default)]
    pub network: String,
    pub client_count: usize,
    pub total_sent: u64,
    pub total_recv: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientListResponse {
    pub clients: Vec<SessionInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KickRequest {
    pub ip: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_sent: u64,
    pub total_recv: u64,
    pub client_count: usize,
    pub clients: Vec<SessionInfo>,
}

// ---- client role ----

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClientStatusResponse {
    pub connected: bool,
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub server_port: u16,
    #[serde(default)]
    pub assigned_ip: String,
    #[serde(default)]
    pub tun_device: String,
}

// ---- certificates ----

#[derive(Debug, Serialize, Deserialize)]
pub struct CertFile {
    pub name: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CertListResponse {
    pub cert_dir: String,
    pub files: Vec<CertFile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignedClient {
    pub name: String,
    pub modified: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignedClientsResponse {
    pub clients: Vec<SignedClient>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CertStatusResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenCsrRequest {
    pub client_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenCsrResponse {
    pub csr_file: String,
    pub key_file: String,
    pub cn: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CertRequestAction {
    pub csr_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_key: Option<String>,
    pub server_address: String,
    pub server_port: u16,
}

// ---- tokens ----

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenGenerateRequest {
    pub client_name: String,
    #[serde(default)]
    pub duration_hours: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenGenerateResponse {
    pub token_id: String,
    pub token_key: String,
    pub client_name: String,
    pub expires_at: String,
    pub file_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenInfo {
    pub id: String,
    pub client_name: String,
    pub status: String,
    pub expires_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenListResponse {
    pub tokens: Vec<TokenInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenDeleteRequest {
    /// 1-based position in the id-ordered token list.
    pub index: usize,
}

// ---- config ----

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub config: crate::config::ConfigFile,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigUpdateRequest {
    pub field: String,
    pub value: serde_json::Value,
}

// ---- logs ----

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LogFetchRequest {
    #[serde(default)]
    pub since: u64,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogFetchResponse {
    pub logs: Vec<LogEntry>,
    pub last_seq: u64,
}
