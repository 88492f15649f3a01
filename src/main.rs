use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mcp_runtime::{
    build_transport, config::Config, logging, serve, BoxError, Handler, LogLevel, McpServer, Method,
    RequestContext, RpcError, ServerInfo,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CLOCK_URI: &str = "clock://now";

/// Small demo surface: an echo tool, a counting tool that reports progress and a
/// clock resource that pushes updates to subscribers.
struct DemoHandler;

#[async_trait]
impl Handler for DemoHandler {
    async fn handle(&self, ctx: RequestContext, method: Method, params: Option<Value>) -> Result<Value, BoxError> {
        let params = params.unwrap_or(Value::Null);
        match method {
            Method::ToolsList => Ok(json!({
                "tools": [
                    {
                        "name": "echo",
                        "description": "Returns its arguments",
                        "inputSchema": {"type": "object"}
                    },
                    {
                        "name": "count",
                        "description": "Counts to n, reporting progress",
                        "inputSchema": {"type": "object", "properties": {"n": {"type": "integer"}}}
                    }
                ]
            })),
            Method::ToolsCall => match params.get("name").and_then(Value::as_str) {
                Some("echo") => {
                    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                    Ok(json!({"content": [{"type": "text", "text": arguments.to_string()}]}))
                }
                Some("count") => {
                    let n = params
                        .pointer("/arguments/n")
                        .and_then(Value::as_u64)
                        .unwrap_or(5)
                        .min(100);
                    for step in 1..=n {
                        if ctx.is_cancelled() {
                            return Err(RpcError::cancelled().into());
                        }
                        ctx.progress().report(step as f64, Some(n as f64)).await?;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    if let Some(session) = ctx.session() {
                        session.log(LogLevel::Info, Some("count"), json!({"counted": n})).await?;
                    }
                    Ok(json!({"content": [{"type": "text", "text": format!("counted to {n}")}]}))
                }
                Some(other) => Err(RpcError::not_found(format!("unknown tool: {other}")).into()),
                None => Err(RpcError::invalid_params("params.name is required").into()),
            },
            Method::ResourcesList => Ok(json!({
                "resources": [{"uri": CLOCK_URI, "name": "clock", "mimeType": "text/plain"}]
            })),
            Method::ResourcesRead => match params.get("uri").and_then(Value::as_str) {
                Some(CLOCK_URI) => Ok(json!({
                    "contents": [{"uri": CLOCK_URI, "mimeType": "text/plain", "text": chrono::Utc::now().to_rfc3339()}]
                })),
                _ => Err(RpcError::not_found("unknown resource").into()),
            },
            Method::ResourceTemplatesList => Ok(json!({"resourceTemplates": []})),
            Method::PromptsList => Ok(json!({"prompts": []})),
            other => Err(RpcError::method_not_found(other.as_str()).into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let transport = build_transport(&config)?;
    let server = Arc::new(McpServer::new(Arc::new(DemoHandler)).with_info(ServerInfo {
        instructions: Some("Demo server: try the echo and count tools.".to_string()),
        ..ServerInfo::default()
    }));

    info!(
        transport = %config.transport,
        addr = %transport.addr(),
        "server starting"
    );

    let scope = CancellationToken::new();
    let ticker = tokio::spawn(tick_clock(Arc::clone(&server), scope.clone()));
    let on_signal = tokio::spawn(drain_on_signal(Arc::clone(&server), config.clone(), scope.clone()));

    serve(transport.as_ref(), server, scope.clone()).await?;
    scope.cancel();
    let _ = ticker.await;
    on_signal.abort();
    Ok(())
}

async fn tick_clock(server: Arc<McpServer>, scope: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            _ = interval.tick() => {
                server.sessions().notify_resource_updated(CLOCK_URI).await;
            }
        }
    }
}

/// First Ctrl-C drains in-flight requests before stopping the transport; a second one
/// skips the wait.
async fn drain_on_signal(server: Arc<McpServer>, config: Config, scope: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");

    let force = CancellationToken::new();
    tokio::spawn({
        let force = force.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second shutdown signal, skipping drain");
                force.cancel();
            }
        }
    });

    drain(&server, &config, &force).await;
    scope.cancel();
}

/// Waits for in-flight requests within the configured budget, or until `force` fires.
async fn drain(server: &McpServer, config: &Config, force: &CancellationToken) {
    let shutdown_config = config.shutdown();
    tokio::select! {
        result = server.shutdown().shutdown(force, &shutdown_config) => {
            if let Err(err) = result {
                warn!(error = %err, "drain incomplete");
            }
        }
        _ = force.cancelled() => {}
    }
}
