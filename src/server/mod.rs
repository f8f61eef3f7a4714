//! Unix socket JSON-RPC server for dashboards and API routes.
//!
//! Listens on `~/.statuswatch/statuswatch.sock` for newline-delimited
//! JSON-RPC 2.0 requests. Local-only, no TCP exposure.
//!
//! Methods:
//! - `status.all`: every enabled provider, cache first
//! - `status.provider {id}`: one provider
//! - `status.refresh {id?}`: bypass the cache for one or all providers
//! - `status.health`: aggregate health, circuits, cache counters
//! - `status.metrics`: scheduler counters
//! - `status.resetCircuit {id}`: operator override for a breaker
//!
//! Every request is counted against the connecting process's quota for the
//! method's endpoint class. Quotas are keyed on the peer's uid from the
//! socket credentials. The optional `caller` param is a label for logs only
//! and does not select a quota.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::fetcher::StatusFetcher;
use crate::limiter::{ClientLimits, EndpointClass};

/// Bound on one request line.
const MAX_REQUEST_BYTES: u64 = 1_048_576;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }
    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError { code, message, data: None }),
            id,
        }
    }
    fn rate_limited(id: Option<Value>, retry_after_ms: u64) -> Self {
        let retry_after_secs = retry_after_ms.div_ceil(1000);
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError {
                code: -32002,
                message: format!("Rate limited — retry after {} seconds", retry_after_secs),
                data: Some(json!({ "retryAfter": retry_after_secs, "retryAfterMs": retry_after_ms })),
            }),
            id,
        }
    }
    /// Serialize `value` as the result.
    fn from_serializable<T: Serialize>(id: Option<Value>, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Self::success(id, v),
            Err(e) => Self::error(id, -32603, format!("Internal error: {}", e)),
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// Quota key for a connection: the peer's uid, or one shared bucket when
/// the platform cannot report credentials.
fn peer_key(stream: &UnixStream) -> String {
    match stream.peer_cred() {
        Ok(cred) => format!("uid:{}", cred.uid()),
        Err(e) => {
            debug!("Peer credentials unavailable: {}", e);
            "uid:unknown".to_string()
        }
    }
}

pub struct Server {
    socket_path: PathBuf,
    fetcher: Arc<StatusFetcher>,
    limits: Arc<ClientLimits>,
}

impl Server {
    pub fn new(socket_path: PathBuf, fetcher: Arc<StatusFetcher>, limits: Arc<ClientLimits>) -> Self {
        Self { socket_path, fetcher, limits }
    }

    pub async fn run(&self) -> Result<()> {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove stale socket {}", self.socket_path.display()))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "📡 Status server listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let peer = peer_key(&stream);
            let fetcher = Arc::clone(&self.fetcher);
            let limits = Arc::clone(&self.limits);

            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader.take(MAX_REQUEST_BYTES));
                let mut line = String::new();

                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) if line.trim().is_empty() => continue,
                        Ok(_) => {
                            let response = handle_request(&line, &peer, &fetcher, &limits).await;
                            let resp_json = serde_json::to_string(&response).unwrap_or_default();
                            if writer.write_all(resp_json.as_bytes()).await.is_err() { break; }
                            if writer.write_all(b"\n").await.is_err() { break; }
                        }
                        Err(e) => {
                            debug!("Connection read failed: {}", e);
                            break;
                        }
                    }
                }
            });
        }
    }
}

// ── Request Handling ────────────────────────────────────────────────

/// Quota bucket for a method; `None` for methods that do not exist.
fn endpoint_class(method: &str) -> Option<EndpointClass> {
    match method {
        "status.all" | "status.refresh" => Some(EndpointClass::Status),
        "status.health" | "status.metrics" => Some(EndpointClass::Health),
        "status.provider" | "status.resetCircuit" => Some(EndpointClass::Provider),
        _ => None,
    }
}

async fn handle_request(
    raw: &str,
    peer: &str,
    fetcher: &Arc<StatusFetcher>,
    limits: &ClientLimits,
) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, -32700, format!("Parse error: {}", e)),
    };

    let Some(class) = endpoint_class(&req.method) else {
        return JsonRpcResponse::error(req.id, -32601, format!("Unknown method: {}", req.method));
    };

    let params = req.params.unwrap_or(Value::Null);
    let caller = params.get("caller").and_then(Value::as_str).unwrap_or("anonymous");

    let decision = limits.check(class, peer).await;
    if !decision.allowed {
        warn!(peer = peer, caller = caller, method = %req.method, "Rate limited");
        return JsonRpcResponse::rate_limited(req.id, decision.retry_after_ms.unwrap_or(0));
    }

    let provider_id = params.get("id").and_then(Value::as_str);

    match req.method.as_str() {
        "status.all" => {
            let results = fetcher.current().await;
            JsonRpcResponse::from_serializable(req.id, &json!({ "providers": results }))
        }
        "status.provider" => {
            let Some(pid) = provider_id else {
                return JsonRpcResponse::error(req.id, -32602, "Invalid params: missing \"id\"".into());
            };
            match fetcher.provider(pid).await {
                Some(result) => JsonRpcResponse::from_serializable(req.id, &result),
                None => JsonRpcResponse::error(req.id, -32004, format!("Unknown provider: {}", pid)),
            }
        }
        "status.refresh" => match provider_id {
            Some(pid) => match fetcher.refresh(pid).await {
                Some(result) => JsonRpcResponse::from_serializable(req.id, &result),
                None => JsonRpcResponse::error(req.id, -32004, format!("Unknown provider: {}", pid)),
            },
            None => {
                let results = fetcher.refresh_all().await;
                JsonRpcResponse::from_serializable(req.id, &json!({ "providers": results }))
            }
        },
        "status.health" => JsonRpcResponse::from_serializable(req.id, &fetcher.health()),
        "status.metrics" => JsonRpcResponse::from_serializable(req.id, &fetcher.metrics()),
        "status.resetCircuit" => {
            let Some(pid) = provider_id else {
                return JsonRpcResponse::error(req.id, -32602, "Invalid params: missing \"id\"".into());
            };
            if fetcher.descriptor(pid).is_none() {
                return JsonRpcResponse::error(req.id, -32004, format!("Unknown provider: {}", pid));
            }
            fetcher.breakers().reset(pid);
            JsonRpcResponse::success(req.id, json!({ "id": pid, "state": fetcher.breakers().state(pid) }))
        }
        _ => JsonRpcResponse::error(req.id, -32601, format!("Unknown method: {}", req.method)),
    }
}
