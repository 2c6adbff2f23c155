//! Control-plane server: accepts one request line per connection on a
//! group-accessible unix socket, dispatches to the [`Service`], writes one
//! response line, closes. Connection errors never take the daemon down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::logbus::LogBus;
use crate::service::Service;

use super::{
    ApiRequest, ApiResponse, CertRequestAction, CertStatusResponse, ClientListResponse,
    ConfigResponse, ConfigUpdateRequest, GenCsrRequest, KickRequest, LogFetchRequest,
    LogFetchResponse, SignedClientsResponse, StatsResponse, TokenDeleteRequest,
    TokenGenerateRequest, TokenListResponse,
};

/// The unix-socket RPC front of the daemon.
pub struct ControlServer {
    socket_path: PathBuf,
    service: Arc<Service>,
    logbus: Arc<LogBus>,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlServer {
    pub fn new(socket_path: impl Into<PathBuf>, service: Arc<Service>, logbus: Arc<LogBus>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            socket_path: socket_path.into(),
            service,
            logbus,
            shutdown_tx,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket (replacing any stale file), set group permissions and
    /// spawn the accept loop.
    pub async fn start(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding control socket {}", self.socket_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;
        }
        info!(path = %self.socket_path.display(), "control API listening");

        let service = Arc::clone(&self.service);
        let logbus = Arc::clone(&self.logbus);
        let socket_path = self.socket_path.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let service = Arc::clone(&service);
                            let logbus = Arc::clone(&logbus);
                            let socket_path = socket_path.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, service, logbus, socket_path).await;
                            });
                        }
                        Err(e) => {
                            warn!(%e, "control accept failed");
                        }
                    }
                }
            }
            debug!("control accept loop ended");
        });
        Ok(())
    }

    /// Stop accepting and remove the socket file.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = std::fs::remove_file(&self.socket_path);
        info!("control API stopped");
    }
}

async fn handle_connection(
    stream: UnixStream,
    service: Arc<Service>,
    logbus: Arc<LogBus>,
    socket_path: PathBuf,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    if reader.read_line(&mut line).await.is_err() {
        return;
    }

    let (response, shutdown) = match serde_json::from_str::<ApiRequest>(&line) {
        Ok(request) => dispatch(&service, &logbus, request).await,
        Err(e) => (ApiResponse::failure(format!("malformed request: {e}")), false),
    };

    let mut payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%e, "could not serialize control response");
            return;
        }
    };
    payload.push(b'\n');
    let _ = write_half.write_all(&payload).await;
    let _ = write_half.flush().await;

    // Shutdown answers first, then unwinds the daemon.
    if shutdown {
        tokio::spawn(async move {
            service.cleanup().await;
            let _ = std::fs::remove_file(&socket_path);
            info!("daemon exiting on control request");
            std::process::exit(0);
        });
    }
}

async fn dispatch(
    service: &Arc<Service>,
    logbus: &Arc<LogBus>,
    request: ApiRequest,
) -> (ApiResponse, bool) {
    let action = request.action.as_str();
    debug!(action, "control request");

    let response = match action {
        "ping" => ApiResponse::ok_with("pong"),
        "shutdown" => return (ApiResponse::ok_with("service shutting down"), true),

        "server/start" => match service.start_server().await {
            Ok(()) => {
                let status = service.server_status().await;
                ApiResponse::ok_with(format!(
                    "server started (port {}, tun {})",
                    status.port, status.tun_device
                ))
            }
            Err(e) => ApiResponse::failure(e.to_string()),
        },
        "server/stop" => result_response(service.stop_server().await, "server stopped"),
        "server/status" => ApiResponse::with_data(&service.server_status().await),
        "server/clients" => ApiResponse::with_data(&ClientListResponse {
            clients: service.server_clients().await,
        }),
        "server/kick" => match parse_data::<KickRequest>(&request.data) {
            Ok(req) => result_response(
                service.kick_client(&req.ip).await,
                format!("kicked client {}", req.ip),
            ),
            Err(resp) => resp,
        },
        "server/stats" => {
            let status = service.server_status().await;
            let clients = service.server_clients().await;
            ApiResponse::with_data(&StatsResponse {
                total_sent: status.total_sent,
                total_recv: status.total_recv,
                client_count: clients.len(),
                clients,
            })
        }

        "client/connect" => result_response(service.connect_client().await, "client connecting"),
        "client/disconnect" => {
            result_response(service.disconnect_client().await, "client disconnected")
        }
        "client/status" => ApiResponse::with_data(&service.client_status().await),

        "cert/init-ca" => result_response(service.init_ca().await, "CA materials ready"),
        "cert/list" => ApiResponse::with_data(&service.cert_list()),
        "cert/clients" => ApiResponse::with_data(&SignedClientsResponse {
            clients: service.signed_clients(),
        }),
        "cert/status" => ApiResponse::with_data(&CertStatusResponse {
            exists: service.certificates_exist(),
        }),
        "cert/gen-csr" => match parse_data::<GenCsrRequest>(&request.data) {
            Ok(req) => match service.generate_csr(&req.client_name) {
                Ok(resp) => {
                    let mut api = ApiResponse::with_data(&resp);
                    api.message = Some("CSR generated".into());
                    api
                }
                Err(e) => ApiResponse::failure(e.to_string()),
            },
            Err(resp) => resp,
        },
        "cert/request" => match parse_data::<CertRequestAction>(&request.data) {
            Ok(req) => result_response(
                service
                    .request_certificate(
                        &req.csr_file,
                        req.token_file.as_deref(),
                        req.token_id.as_deref(),
                        req.token_key.as_deref(),
                        &req.server_address,
                        req.server_port,
                    )
                    .await,
                "certificate enrolled and installed",
            ),
            Err(resp) => resp,
        },

        "token/generate" => match parse_data::<TokenGenerateRequest>(&request.data) {
            Ok(req) => match service.generate_token(&req.client_name, req.duration_hours) {
                Ok(resp) => {
                    let mut api = ApiResponse::with_data(&resp);
                    api.message = Some("token generated".into());
                    api
                }
                Err(e) => ApiResponse::failure(e.to_string()),
            },
            Err(resp) => resp,
        },
        "token/list" => ApiResponse::with_data(&TokenListResponse {
            tokens: service.token_list(),
        }),
        "token/delete" => match parse_data::<TokenDeleteRequest>(&request.data) {
            Ok(req) => result_response(service.delete_token(req.index), "token deleted"),
            Err(resp) => resp,
        },
        "token/cleanup" => {
            let count = service.cleanup_tokens();
            ApiResponse::ok_with(format!("removed {count} stale tokens"))
        }

        "config/get" => ApiResponse::with_data(&ConfigResponse {
            config: service.config_file().await,
        }),
        "config/update" => match parse_data::<ConfigUpdateRequest>(&request.data) {
            Ok(req) => result_response(
                service.update_config(&req.field, &req.value).await,
                "config updated",
            ),
            Err(resp) => resp,
        },
        "config/save" => result_response(service.save_config().await, "config saved"),
        "config/load" => result_response(service.load_config().await, "config loaded"),
        "config/reset" => result_response(service.reset_config().await, "config reset to defaults"),

        "logs/fetch" => {
            let req = parse_data::<LogFetchRequest>(&request.data).unwrap_or_default();
            let (logs, last_seq) = logbus.since(req.since, req.limit);
            ApiResponse::with_data(&LogFetchResponse { logs, last_seq })
        }

        other => ApiResponse::failure(format!("unknown action: {other}")),
    };

    (response, false)
}

fn result_response(result: Result<()>, message: impl Into<String>) -> ApiResponse {
    match result {
        Ok(()) => ApiResponse::ok_with(message),
        Err(e) => ApiResponse::failure(e.to_string()),
    }
}

fn parse_data<T: DeserializeOwned>(data: &Option<serde_json::Value>) -> Result<T, ApiResponse> {
    let Some(data) = data else {
        return Err(ApiResponse::failure("missing request data"));
    };
    serde_json::from_value(data.clone())
        .map_err(|e| ApiResponse::failure(format!("invalid request data: {e}")))
}
