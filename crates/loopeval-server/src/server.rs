use crate::config::ServerConfig;
use crate::methods::{self, MethodContext, MethodError, INVALID_REQUEST, PARSE_ERROR};
use anyhow::Result;
use loopeval_core::EvalError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

static RID: AtomicU64 = AtomicU64::new(1);

fn next_rid() -> String {
    let n = RID.fetch_add(1, Ordering::Relaxed);
    format!("r-{n:06}")
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonRpcRequest {
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
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: Option<Value>, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError { code, message, data }),
            id,
        }
    }

    fn from_method_error(id: Option<Value>, e: &MethodError) -> Self {
        Self::error(id, e.code(), e.message(), e.data())
    }
}

pub struct Server;

impl Server {
    /// Serves stdin/stdout until stdin closes.
    pub async fn run(ctx: &MethodContext, cfg: ServerConfig) -> Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        Self::serve(ctx, &cfg, stdin, stdout).await
    }

    /// One JSON-RPC message per line in, one response per line out.
    /// Notifications (no `id`) get no response.
    pub async fn serve<R, W>(ctx: &MethodContext, cfg: &ServerConfig, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let rid = next_rid();

            if line.len() > cfg.max_msg_bytes {
                tracing::warn!(
                    target: "loopeval_server",
                    event = "limit_exceeded",
                    rid = %rid,
                    bytes_in = line.len(),
                    max = cfg.max_msg_bytes
                );
                let resp = JsonRpcResponse::error(
                    None,
                    INVALID_REQUEST,
                    format!("message bytes={} > max={}", line.len(), cfg.max_msg_bytes),
                    None,
                );
                send(&mut writer, &resp).await?;
                continue;
            }

            if line.trim().is_empty() {
                continue;
            }

            let req: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(event = "json_parse_error", rid = %rid, error = %e);
                    let resp = JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {}", e), None);
                    send(&mut writer, &resp).await?;
                    continue;
                }
            };

            let resp = match req.method.as_str() {
                "initialize" => JsonRpcResponse::ok(
                    req.id.clone(),
                    serde_json::json!({
                        "serverInfo": {
                            "name": "loopeval-server",
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                        "methods": methods::list_methods(),
                    }),
                ),
                "methods/list" => JsonRpcResponse::ok(
                    req.id.clone(),
                    serde_json::json!({ "methods": methods::list_methods() }),
                ),
                _ => dispatch(ctx, cfg, &req, &rid, line.len()).await,
            };

            if req.id.is_none() {
                tracing::debug!(event = "notification_handled", rid = %rid, method = %req.method);
                continue;
            }
            send(&mut writer, &resp).await?;
        }
        Ok(())
    }
}

async fn dispatch(ctx: &MethodContext, cfg: &ServerConfig, req: &JsonRpcRequest, rid: &str, bytes_in: usize) -> JsonRpcResponse {
    let empty = Value::Object(Default::default());
    let params = req.params.as_ref().unwrap_or(&empty);
    let start = std::time::Instant::now();
    tracing::info!(
        event = "rpc_call_start",
        rid = %rid,
        rpc_id = ?req.id,
        method = %req.method,
        bytes_in = bytes_in,
    );
    loopeval_core::usage::log_usage_event("rpc_call", 1);

    let fut = methods::handle_call(ctx, &req.method, params, rid);
    let result = match timeout(Duration::from_millis(cfg.timeout_ms), fut).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(
                event = "rpc_call_timeout",
                rid = %rid,
                method = %req.method,
                duration_ms = start.elapsed().as_millis() as u64,
            );
            Err(MethodError::Eval(EvalError::UpstreamUnavailable(format!(
                "request exceeded {}ms",
                cfg.timeout_ms
            ))))
        }
    };

    let dur = start.elapsed().as_millis() as u64;
    match result {
        Ok(v) => {
            tracing::info!(event = "rpc_call_done", rid = %rid, method = %req.method, duration_ms = dur, outcome = "ok");
            JsonRpcResponse::ok(req.id.clone(), v)
        }
        Err(e) => {
            tracing::info!(
                event = "rpc_call_done",
                rid = %rid,
                method = %req.method,
                duration_ms = dur,
                outcome = "error",
                code = e.code(),
                error = %e.message(),
            );
            JsonRpcResponse::from_method_error(req.id.clone(), &e)
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, resp: &JsonRpcResponse) -> Result<()> {
    let mut text = serde_json::to_string(resp)?;
    text.push('\n');
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
