//! Full-duplex WebSocket binding
//!
//! Each connection gets its own session, a writer task that owns the socket's sink
//! (and pings idle peers), a read stage and a sequential dispatch stage. Cancelling
//! the serving scope closes every live socket with a close frame.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as Frame, WebSocket, WebSocketUpgrade},
        State,
    },
    middleware,
    response::Response,
    routing::get,
    Router,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::RwLock;
use tokio::{net::TcpListener, sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{dispatch_stage, read_stage, Inbound, PeerSender, Transport};
use crate::errors::TransportError;
use crate::logging;
use crate::mcp::{rpc::Message, server::McpServer, session::Session};

const OUTBOUND_CAPACITY: usize = 256;
const HANDOFF_CAPACITY: usize = 16;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum Outgoing {
    Message(Message),
    Close,
}

/// Outbound queues of live connections, keyed by session id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, mpsc::Sender<Outgoing>>>,
}

impl ConnectionRegistry {
    fn insert(&self, id: &str, queue: mpsc::Sender<Outgoing>) {
        self.connections.write().insert(id.to_string(), queue);
    }

    fn remove(&self, id: &str) -> bool {
        self.connections.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Asks every live connection to send a close frame and stop; returns how many were asked.
    pub fn close_all(&self) -> usize {
        let queues: Vec<(String, mpsc::Sender<Outgoing>)> = self
            .connections
            .read()
            .iter()
            .map(|(id, queue)| (id.clone(), queue.clone()))
            .collect();
        let mut closed = 0;
        for (id, queue) in queues {
            match queue.try_send(Outgoing::Close) {
                Ok(()) => closed += 1,
                Err(err) => debug!(session_id = %id, error = %err, "connection already closing"),
            }
        }
        closed
    }
}

struct WsSender {
    queue: mpsc::Sender<Outgoing>,
    timeout: Duration,
}

#[async_trait]
impl PeerSender for WsSender {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        time::timeout(self.timeout, self.queue.send(Outgoing::Message(message)))
            .await
            .map_err(|_| TransportError::WriteTimeout(self.timeout))?
            .map_err(|_| TransportError::Closed)
    }
}

#[derive(Clone)]
struct WsState {
    server: Arc<McpServer>,
    scope: CancellationToken,
    connections: Arc<ConnectionRegistry>,
    read_timeout: Duration,
    write_timeout: Duration,
}

pub struct WebSocketTransport {
    bind: SocketAddr,
    read_timeout: Duration,
    write_timeout: Duration,
    bound: OnceLock<SocketAddr>,
    connections: Arc<ConnectionRegistry>,
}

impl WebSocketTransport {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            bound: OnceLock::new(),
            connections: Arc::new(ConnectionRegistry::default()),
        }
    }

    /// `read_timeout` closes connections that stay silent for that long; pings go out
    /// at half that interval so a live peer always answers in time.
    pub fn with_timeouts(mut self, read_timeout: Duration, write_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.write_timeout = write_timeout;
        self
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn router(&self, server: Arc<McpServer>, scope: CancellationToken) -> Router {
        let state = WsState {
            server,
            scope,
            connections: Arc::clone(&self.connections),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        };
        Router::new()
            .route("/ws", get(upgrade))
            .layer(middleware::from_fn(logging::request_logging_middleware))
            .with_state(state)
    }
}

async fn upgrade(State(state): State<WsState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state))
}

async fn run_connection(socket: WebSocket, state: WsState) {
    let (sink, stream) = socket.split();
    let (queue, outgoing) = mpsc::channel(OUTBOUND_CAPACITY);
    let sender = Arc::new(WsSender {
        queue: queue.clone(),
        timeout: state.write_timeout,
    });
    let session = state.server.sessions().create(sender.clone());
    let id = session.id().to_string();
    state.connections.insert(&id, queue.clone());
    info!(session_id = %id, "websocket connected");

    let writer = tokio::spawn(write_loop(
        sink,
        outgoing,
        state.read_timeout / 2,
        state.write_timeout,
        id.clone(),
    ));

    let connection = state.scope.child_token();
    let (handoff, inbound) = mpsc::channel(HANDOFF_CAPACITY);
    let dispatcher = tokio::spawn(dispatch_loop(
        Arc::clone(&state.server),
        connection.clone(),
        Arc::clone(&session),
        sender,
        inbound,
    ));

    match read_loop(stream, &state, &connection, &session, handoff).await {
        Ok(()) => {}
        Err(TransportError::ReadTimeout(timeout)) => {
            debug!(session_id = %id, timeout = ?timeout, "closing idle websocket")
        }
        Err(err) => warn!(session_id = %id, error = %err, "websocket read failed"),
    }

    connection.cancel();
    if let Err(err) = dispatcher.await {
        warn!(session_id = %id, error = %err, "dispatch task failed");
    }
    state.connections.remove(&id);
    state.server.sessions().remove(&id);

    let _ = queue.send(Outgoing::Close).await;
    drop(queue);
    match time::timeout(state.write_timeout, writer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => debug!(session_id = %id, error = %err, "websocket write failed"),
        Ok(Err(err)) => warn!(session_id = %id, error = %err, "writer task failed"),
        Err(_) => warn!(session_id = %id, "writer did not finish in time"),
    }
    info!(session_id = %id, "websocket disconnected");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &WsState,
    connection: &CancellationToken,
    session: &Arc<Session>,
    handoff: mpsc::Sender<Inbound>,
) -> Result<(), TransportError> {
    loop {
        let read = tokio::select! {
            _ = connection.cancelled() => return Ok(()),
            read = time::timeout(state.read_timeout, stream.next()) => read.ok(),
        };
        let Some(frame) = next_frame(read, state.read_timeout)? else {
            return Ok(());
        };

        let inbound = match &frame {
            Frame::Text(text) => read_stage(&state.server, session, text.as_str().as_bytes()),
            Frame::Binary(data) => read_stage(&state.server, session, data),
            Frame::Close(_) => return Ok(()),
            Frame::Ping(_) | Frame::Pong(_) => continue,
        };
        if let Some(inbound) = inbound {
            if handoff.send(inbound).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Folds one read attempt into the next frame. `None` means the read timed out;
/// `Some(None)` is the end of the stream.
fn next_frame(
    read: Option<Option<Result<Frame, axum::Error>>>,
    read_timeout: Duration,
) -> Result<Option<Frame>, TransportError> {
    match read {
        None => Err(TransportError::ReadTimeout(read_timeout)),
        Some(None) => Ok(None),
        Some(Some(frame)) => Ok(Some(frame?)),
    }
}

async fn dispatch_loop(
    server: Arc<McpServer>,
    connection: CancellationToken,
    session: Arc<Session>,
    sender: Arc<WsSender>,
    mut inbound: mpsc::Receiver<Inbound>,
) {
    loop {
        let next = tokio::select! {
            _ = connection.cancelled() => return,
            next = inbound.recv() => next,
        };
        let Some(next) = next else {
            return;
        };
        if let Some(response) = dispatch_stage(&server, &connection, &session, next).await {
            if let Err(err) = sender.send(response.into()).await {
                debug!(session_id = %session.id(), error = %err, "failed to queue response");
                return;
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Frame>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    ping_interval: Duration,
    write_timeout: Duration,
    id: String,
) -> Result<(), TransportError> {
    let mut ping = time::interval(ping_interval.max(Duration::from_millis(10)));
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            next = outgoing.recv() => match next {
                Some(Outgoing::Message(message)) => match message.encode() {
                    Ok(text) => Frame::Text(text.into()),
                    Err(err) => {
                        warn!(session_id = %id, error = %err, "dropping unencodable message");
                        continue;
                    }
                },
                Some(Outgoing::Close) => {
                    let close = Frame::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "server closing connection".into(),
                    }));
                    let _ = time::timeout(write_timeout, sink.send(close)).await;
                    return Ok(());
                }
                None => return Ok(()),
            },
            _ = ping.tick() => Frame::Ping(Vec::new().into()),
        };

        time::timeout(write_timeout, sink.send(frame))
            .await
            .map_err(|_| TransportError::WriteTimeout(write_timeout))??;
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn serve(&self, scope: CancellationToken, server: Arc<McpServer>) -> Result<(), TransportError> {
        if self.bound.get().is_some() {
            return Err(TransportError::AlreadyServing);
        }
        let listener = TcpListener::bind(self.bind).await?;
        let local = listener.local_addr()?;
        self.bound.set(local).map_err(|_| TransportError::AlreadyServing)?;

        info!(bind_addr = %local, "websocket transport listening");
        let app = self.router(server, scope.clone());
        let connections = Arc::clone(&self.connections);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                scope.cancelled().await;
                let closed = connections.close_all();
                info!(connections = closed, "closing websocket connections");
            })
            .await?;
        Ok(())
    }

    fn addr(&self) -> String {
        self.bound_addr().unwrap_or(self.bind).to_string()
    }
}
