//! Client stub for the control socket, used by `--status`, `--stop`, the
//! smart-start path and the presentation process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use super::{
    ApiRequest, ApiResponse, CertListResponse, CertRequestAction, ClientListResponse,
    ClientStatusResponse, ConfigResponse, ConfigUpdateRequest, GenCsrRequest, GenCsrResponse,
    KickRequest, LogFetchRequest, LogFetchResponse, ServerStatusResponse, TokenDeleteRequest,
    TokenGenerateRequest, TokenGenerateResponse, TokenListResponse, CONTROL_SOCKET_PATH,
};

/// One-request-per-connection control client.
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new(CONTROL_SOCKET_PATH)
    }
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one action and read the response line.
    pub async fn call(&self, action: &str, data: Option<serde_json::Value>) -> Result<ApiResponse> {
        let run = async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .with_context(|| {
                    format!("connecting to control socket {}", self.socket_path.display())
                })?;

            let request = ApiRequest {
                action: action.to_string(),
                data,
            };
            let mut payload = serde_json::to_vec(&request).context("serializing request")?;
            payload.push(b'\n');
            stream.write_all(&payload).await.context("sending request")?;

            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .await
                .context("reading response")?;
            serde_json::from_str(&line).context("parsing response")
        };

        timeout(self.timeout, run)
            .await
            .map_err(|_| anyhow::anyhow!("control request timed out"))?
    }

    async fn call_with<T: Serialize>(&self, action: &str, data: &T) -> Result<ApiResponse> {
        let value = serde_json::to_value(data).context("serializing request data")?;
        self.call(action, Some(value)).await
    }

    fn expect_data<T: DeserializeOwned>(response: ApiResponse) -> Result<T> {
        if !response.success {
            bail!(response.error.unwrap_or_else(|| "request failed".into()));
        }
        let data = response
            .data
            .ok_or_else(|| anyhow::anyhow!("response carried no data"))?;
        serde_json::from_value(data).context("parsing response data")
    }

    fn expect_ok(response: ApiResponse) -> Result<ApiResponse> {
        if !response.success {
            bail!(response.error.unwrap_or_else(|| "request failed".into()));
        }
        Ok(response)
    }

    /// Whether a daemon answers on the socket.
    pub async fn is_service_running(&self) -> bool {
        matches!(self.call("ping", None).await, Ok(resp) if resp.success)
    }

    pub async fn shutdown(&self) -> Result<ApiResponse> {
        Self::expect_ok(self.call("shutdown", None).await?)
    }

    // ---- server role ----

    pub async fn server_start(&self) -> Result<ApiResponse> {
        Self::expect_ok(self.call("server/start", None).await?)
    }

    pub async fn server_stop(&self) -> Result<ApiResponse> {
        Self::expect_ok(self.call("server/stop", None).await?)
    }

    pub async fn server_status(&self) -> Result<ServerStatusResponse> {
        Self::expect_data(self.call("server/status", None).await?)
    }

    pub async fn server_clients(&self) -> Result<ClientListResponse> {
        Self::expect_data(self.call("server/clients", None).await?)
    }

    pub async fn server_kick(&self, ip: &str) -> Result<ApiResponse> {
        Self::expect_ok(
            self.call_with("server/kick", &KickRequest { ip: ip.into() })
                .await?,
        )
    }

    // ---- client role ----

    pub async fn client_connect(&self) -> Result<ApiResponse> {
        Self::expect_ok(self.call("client/connect", None).await?)
    }

    pub async fn client_disconnect(&self) -> Result<ApiResponse> {
        Self::expect_ok(self.call("client/disconnect", None).await?)
    }

    pub async fn client_status(&self) -> Result<ClientStatusResponse> {
        Self::expect_data(self.call("client/status", None).await?)
    }

    // ---- certificates ----

    pub async fn cert_init_ca(&self) -> Result<ApiResponse> {
        Self::expect_ok(self.call("cert/init-ca", None).await?)
    }

    pub async fn cert_list(&self) -> Result<CertListResponse> {
        Self::expect_data(self.call("cert/list", None).await?)
    }

    pub async fn cert_gen_csr(&self, client_name: &str) -> Result<GenCsrResponse> {
        Self::expect_data(
            self.call_with(
                "cert/gen-csr",
                &GenCsrRequest {
                    client_name: client_name.into(),
                },
            )
            .await?,
        )
    }

    pub async fn cert_request(&self, request: &CertRequestAction) -> Result<ApiResponse> {
        Self::expect_ok(self.call_with("cert/request", request).await?)
    }

    // ---- tokens ----

    pub async fn token_generate(
        &self,
        client_name: &str,
        duration_hours: i64,
    ) -> Result<TokenGenerateResponse> {
        Self::expect_data(
            self.call_with(
                "token/generate",
                &TokenGenerateRequest {
                    client_name: client_name.into(),
                    duration_hours,
                },
            )
            .await?,
        )
    }

    pub async fn token_list(&self) -> Result<TokenListResponse> {
        Self::expect_data(self.call("token/list", None).await?)
    }

    pub async fn token_delete(&self, index: usize) -> Result<ApiResponse> {
        Self::expect_ok(
            self.call_with("token/delete", &TokenDeleteRequest { index })
                .await?,
        )
    }

    pub async fn token_cleanup(&self) -> Result<ApiResponse> {
        Self::expect_ok(self.call("token/cleanup", None).await?)
    }

    // ---- config ----

    pub async fn config_get(&self) -> Result<ConfigResponse> {
        Self::expect_data(self.call("config/get", None).await?)
    }

    pub async fn config_update(&self, field: &str, value: serde_json::Value) -> Result<ApiResponse> {
        Self::expect_ok(
            self.call_with(
                "config/update",
                &ConfigUpdateRequest {
                    field: field.into(),
                    value,
                },
            )
            .await?,
        )
    }

    // ---- logs ----

    pub async fn logs_fetch(&self, since: u64, limit: usize) -> Result<LogFetchResponse> {
        Self::expect_data(
            self.call_with("logs/fetch", &LogFetchRequest { since, limit })
                .await?,
        )
    }
}
