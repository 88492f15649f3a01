//! HTTP binding for the Model Context Protocol
//!
//! `POST /mcp` answers one message per call, `GET /sse` opens a server-push stream
//! bound to a fresh session, and `GET /health` is a static probe.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use parking_lot::RwLock;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info};

use super::{PeerSender, Transport};
use crate::errors::TransportError;
use crate::logging;
use crate::mcp::{rpc::Message, server::McpServer};

pub mod handlers;

pub const SESSION_HEADER: &str = "mcp-session-id";

const SSE_QUEUE_CAPACITY: usize = 64;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound queues of the connected push-stream clients, keyed by session id.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, mpsc::Sender<Message>>>,
}

impl ClientRegistry {
    pub fn register(&self, id: &str, queue: mpsc::Sender<Message>) {
        self.clients.write().insert(id.to_string(), queue);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.clients.write().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<mpsc::Sender<Message>> {
        self.clients.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    fn clear(&self) {
        self.clients.write().clear();
    }
}

/// Pushes messages onto one client's event stream.
pub struct SseSender {
    queue: mpsc::Sender<Message>,
    timeout: Duration,
}

impl SseSender {
    pub fn new(queue: mpsc::Sender<Message>, timeout: Duration) -> Self {
        Self { queue, timeout }
    }
}

#[async_trait]
impl PeerSender for SseSender {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        tokio::time::timeout(self.timeout, self.queue.send(message))
            .await
            .map_err(|_| TransportError::WriteTimeout(self.timeout))?
            .map_err(|_| TransportError::Closed)
    }
}

#[derive(Clone)]
pub struct HttpState {
    pub server: Arc<McpServer>,
    pub scope: CancellationToken,
    pub clients: Arc<ClientRegistry>,
    pub write_timeout: Duration,
}

pub struct HttpTransport {
    bind: SocketAddr,
    request_timeout: Duration,
    write_timeout: Duration,
    bound: OnceLock<SocketAddr>,
    clients: Arc<ClientRegistry>,
}

impl HttpTransport {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            write_timeout: DEFAULT_REQUEST_TIMEOUT,
            bound: OnceLock::new(),
            clients: Arc::new(ClientRegistry::default()),
        }
    }

    pub fn with_timeouts(mut self, request_timeout: Duration, write_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self.write_timeout = write_timeout;
        self
    }

    /// The listener's actual address, once serving.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn router(&self, server: Arc<McpServer>, scope: CancellationToken) -> Router {
        let state = HttpState {
            server,
            scope,
            clients: Arc::clone(&self.clients),
            write_timeout: self.write_timeout,
        };

        // Push streams are long-lived, so only the request endpoint gets a deadline.
        let requests = Router::new()
            .route("/mcp", post(handlers::mcp_endpoint))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.request_timeout,
            ));

        Router::new()
            .route("/health", get(handlers::health))
            .route("/sse", get(handlers::sse_endpoint))
            .merge(requests)
            .layer(middleware::from_fn(logging::request_logging_middleware))
            .with_state(state)
    }

    /// Queues `message` for every connected push-stream client; returns how many accepted it.
    pub fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for id in self.clients.ids() {
            let Some(queue) = self.clients.get(&id) else {
                continue;
            };
            match queue.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(client_id = %id, error = %err, "push stream did not accept broadcast"),
            }
        }
        delivered
    }

    pub async fn send_to_client(&self, id: &str, message: Message) -> Result<(), TransportError> {
        let queue = self
            .clients
            .get(id)
            .ok_or_else(|| TransportError::UnknownClient(id.to_string()))?;
        SseSender::new(queue, self.write_timeout).send(message).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn serve(&self, scope: CancellationToken, server: Arc<McpServer>) -> Result<(), TransportError> {
        if self.bound.get().is_some() {
            return Err(TransportError::AlreadyServing);
        }
        let listener = TcpListener::bind(self.bind).await?;
        let local = listener.local_addr()?;
        self.bound.set(local).map_err(|_| TransportError::AlreadyServing)?;

        info!(bind_addr = %local, "http transport listening");
        let app = self.router(server, scope.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(scope.cancelled_owned())
            .await?;

        self.clients.clear();
        info!(bind_addr = %local, "http transport stopped");
        Ok(())
    }

    fn addr(&self) -> String {
        self.bound_addr().unwrap_or(self.bind).to_string()
    }
}
