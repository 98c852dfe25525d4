//! Daemon mode – newline-delimited JSON requests over a Unix socket.
//!
//! Every connection shares one [`ToolContext`], so concurrent clients share
//! one engine load.

use convert_engine::types::*;
use convert_engine::{ToolContext, ToolRegistry};
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

struct Daemon {
    ctx: ToolContext,
    registry: ToolRegistry,
}

pub async fn run_daemon(
    socket_path: PathBuf,
    ctx: ToolContext,
    registry: ToolRegistry,
) -> anyhow::Result<()> {
    // Remove stale socket if it exists
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path).map_err(|e| {
        anyhow::anyhow!("cannot bind socket {}: {}", socket_path.display(), e)
    })?;
    tracing::info!(socket = %socket_path.display(), "daemon listening");
    eprintln!("convertctl daemon listening on {}", socket_path.display());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    serve(listener, ctx, registry, shutdown).await;

    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("daemon stopped");
    Ok(())
}

async fn serve(
    listener: UnixListener,
    ctx: ToolContext,
    registry: ToolRegistry,
    shutdown: impl Future<Output = ()>,
) {
    let daemon = Arc::new(Daemon { ctx, registry });
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    tokio::spawn(handle_connection(stream, Arc::clone(&daemon)));
                }
                Err(e) => tracing::warn!(error = %e, "accept error"),
            },
            _ = &mut shutdown => break,
        }
    }
}

async fn handle_connection(stream: UnixStream, daemon: Arc<Daemon>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_request(&line, &daemon.ctx, &daemon.registry).await;
        let mut resp_json = match serde_json::to_string(&response) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode response");
                continue;
            }
        };
        resp_json.push('\n');
        if writer.write_all(resp_json.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn invalid(message: String) -> ToolResult<Value> {
    ToolResult::err(message).with_metadata("error_code", ErrorCode::InvalidInput.to_string())
}

fn to_data<T: serde::Serialize>(value: &T) -> ToolResult<Value> {
    match serde_json::to_value(value) {
        Ok(v) => ToolResult::ok(v),
        Err(e) => ToolResult::err(e.to_string())
            .with_metadata("error_code", ErrorCode::InternalError.to_string()),
    }
}

async fn handle_request(line: &str, ctx: &ToolContext, registry: &ToolRegistry) -> DaemonResponse {
    let req: DaemonRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return DaemonResponse {
                id: "unknown".into(),
                result: invalid(format!("invalid JSON request: {}", e)),
            };
        }
    };
    tracing::debug!(id = %req.id, method = %req.method, "daemon request");

    let result = match req.method.as_str() {
        "call" => {
            let tool = req.params.get("tool").and_then(Value::as_str);
            let args = req.params.get("args").cloned().unwrap_or_else(|| json!({}));
            let timeout = req
                .params
                .get("timeout_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis);
            match (tool, timeout) {
                (None, _) => invalid("'call' requires params.tool".into()),
                (Some(tool), Some(limit)) => {
                    registry.execute_with_timeout(tool, &args, ctx, limit).await
                }
                (Some(tool), None) => registry.execute(tool, &args, ctx).await,
            }
        }
        "state" => to_data(&ctx.engine().state()),
        "acquire" => match ctx.acquire_engine().await {
            Ok(handle) => ToolResult::ok(json!({
                "engine_id": handle.id().to_string(),
                "backend": handle.backend_name(),
            })),
            Err(e) => {
                ToolResult::err(e.to_string()).with_metadata("error_code", e.error_code().to_string())
            }
        },
        "reset" => {
            ctx.engine().reset();
            to_data(&ctx.engine().state())
        }
        "list" => to_data(&registry.catalog()),
        other => invalid(format!("unknown method: {}", other)),
    };

    DaemonResponse { id: req.id, result }
}
