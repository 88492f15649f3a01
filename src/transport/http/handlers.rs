//! Axum handlers for the HTTP binding

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClientRegistry, HttpState, SseSender, SESSION_HEADER, SSE_QUEUE_CAPACITY};
use crate::mcp::{
    rpc::{Message, RpcError},
    server::McpServer,
};
use crate::transport::DetachedSender;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

fn requested_session(headers: &HeaderMap, query: &SessionQuery) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.session_id.clone())
        .filter(|id| !id.trim().is_empty())
}

pub async fn mcp_endpoint(
    State(state): State<HttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message = match Message::decode(&body) {
        Ok(message) => message,
        Err(err) => {
            return match err.into_response() {
                Some(response) => (StatusCode::OK, Json(response)).into_response(),
                None => StatusCode::ACCEPTED.into_response(),
            };
        }
    };

    let sessions = state.server.sessions();
    let (session, _ephemeral) = match requested_session(&headers, &query) {
        Some(id) => match sessions.get(&id) {
            Some(session) => (session, None),
            None => {
                debug!(session_id = %id, "request for unknown session");
                let response = crate::mcp::rpc::Response::error(
                    request_id(&message),
                    RpcError::not_found(format!("unknown session: {id}")),
                );
                return (StatusCode::NOT_FOUND, Json(response)).into_response();
            }
        },
        None => {
            let session = sessions.create(Arc::new(DetachedSender));
            let guard = EphemeralSession {
                id: session.id().to_string(),
                server: Arc::clone(&state.server),
            };
            (session, Some(guard))
        }
    };

    let reply = state.server.handle_message(&state.scope, &session, message).await;

    match reply {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

fn request_id(message: &Message) -> Option<crate::mcp::rpc::RequestId> {
    match message {
        Message::Request(request) => Some(request.id.clone()),
        _ => None,
    }
}

/// Removes a per-call session however the call ends, including a timed-out or
/// abandoned request future.
struct EphemeralSession {
    id: String,
    server: Arc<McpServer>,
}

impl Drop for EphemeralSession {
    fn drop(&mut self) {
        self.server.sessions().remove(&self.id);
    }
}

/// Drops the client's queue and session when the event stream goes away.
struct StreamGuard {
    id: String,
    server: Arc<McpServer>,
    clients: Arc<ClientRegistry>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.clients.remove(&self.id);
        self.server.sessions().remove(&self.id);
        info!(session_id = %self.id, "push stream closed");
    }
}

pub async fn sse_endpoint(State(state): State<HttpState>) -> Response {
    let (queue, outbound) = mpsc::channel(SSE_QUEUE_CAPACITY);
    let session = state
        .server
        .sessions()
        .create(Arc::new(SseSender::new(queue.clone(), state.write_timeout)));
    let id = session.id().to_string();
    state.clients.register(&id, queue);
    info!(session_id = %id, "push stream opened");

    let guard = StreamGuard {
        id: id.clone(),
        server: Arc::clone(&state.server),
        clients: Arc::clone(&state.clients),
    };
    let endpoint = Event::default().event("endpoint").data(format!("/mcp?sessionId={id}"));
    let events = stream::once(async move { Ok::<_, Infallible>(endpoint) })
        .chain(message_events(outbound, state.scope.clone(), guard));

    let mut response = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn message_events(
    outbound: mpsc::Receiver<Message>,
    scope: CancellationToken,
    guard: StreamGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((outbound, scope, guard), |(mut outbound, scope, guard)| async move {
        loop {
            let message = tokio::select! {
                _ = scope.cancelled() => return None,
                message = outbound.recv() => message?,
            };
            match message.encode() {
                Ok(data) => {
                    let event = Event::default().event("message").data(data);
                    return Some((Ok(event), (outbound, scope, guard)));
                }
                Err(err) => warn!(session_id = %guard.id, error = %err, "skipping unencodable message"),
            }
        }
    })
}
