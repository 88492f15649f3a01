use std::{io, time::Duration};

use thiserror::Error;

use crate::mcp::{rpc::RpcError, session::Feature};

/// Failures of a transport binding's read or write path.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
    #[error("connection closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("peer silent for {0:?}")]
    ReadTimeout(Duration),
    #[error("unknown client: {0}")]
    UnknownClient(String),
    #[error("transport is already serving")]
    AlreadyServing,
}

/// What a caller of an outbound request can get back besides a result.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer does not support {0}")]
    Unsupported(Feature),
    #[error("peer returned an error: {0}")]
    Peer(#[from] RpcError),
    #[error("request was cancelled")]
    Cancelled,
    #[error("request timed out")]
    Timeout,
    #[error("session closed before the peer replied")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("peer sent an unexpected result: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown timed out after {timeout:?} with {in_flight} request(s) still in flight")]
    Timeout { timeout: Duration, in_flight: usize },
    #[error("shutdown was cancelled before draining started")]
    Cancelled,
}
