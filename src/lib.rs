use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod config;
pub mod errors;
pub mod logging;
pub mod mcp;
pub mod shutdown;
pub mod transport;

pub use errors::{SessionError, ShutdownError, TransportError};
pub use mcp::{
    context::RequestContext,
    method::Method,
    rpc::{Message, RequestId, RpcError},
    server::{BoxError, Handler, McpServer, ServerInfo},
    session::{LogLevel, Session},
    sessions::ListKind,
};

use config::{Config, ConfigError, TransportKind};
use transport::{HttpTransport, StdioTransport, Transport, WebSocketTransport};

/// Builds the transport binding selected by the configuration.
pub fn build_transport(config: &Config) -> Result<Box<dyn Transport>, ConfigError> {
    let transport: Box<dyn Transport> = match config.transport {
        TransportKind::Stdio => Box::new(StdioTransport::stdio()),
        TransportKind::Http => Box::new(
            HttpTransport::new(config.bind_socket()?).with_timeouts(config.read_timeout, config.write_timeout),
        ),
        TransportKind::WebSocket => Box::new(
            WebSocketTransport::new(config.bind_socket()?).with_timeouts(config.read_timeout, config.write_timeout),
        ),
    };
    Ok(transport)
}

/// Serves until `scope` is cancelled, then closes any sessions left behind.
pub async fn serve(
    transport: &dyn Transport,
    server: Arc<McpServer>,
    scope: CancellationToken,
) -> Result<(), TransportError> {
    let result = transport.serve(scope, Arc::clone(&server)).await;
    let closed = server.sessions().close_all();
    info!(transport = %transport.addr(), sessions_closed = closed, "transport stopped");
    result
}
