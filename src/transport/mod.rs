//! Transport bindings for the Model Context Protocol
//!
//! Every binding serves one [`McpServer`] until its scope is cancelled and provides a
//! [`PeerSender`] so sessions can push notifications and requests back to the peer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::TransportError;
use crate::mcp::{
    rpc::{DecodeError, Message, Response},
    server::McpServer,
    session::Session,
};

pub mod http;
pub mod stdio;
pub mod websocket;

pub use http::HttpTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Blocks until `scope` is cancelled or an unrecoverable I/O error occurs.
    async fn serve(&self, scope: CancellationToken, server: Arc<McpServer>) -> Result<(), TransportError>;

    fn addr(&self) -> String;
}

/// The send half of one connection.
#[async_trait]
pub trait PeerSender: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), TransportError>;
}

/// Sender for requests that arrived without a push channel (plain HTTP POSTs).
/// Notifications are dropped; there is nobody to deliver them to.
pub struct DetachedSender;

#[async_trait]
impl PeerSender for DetachedSender {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        debug!(method = message.method().unwrap_or("response"), "dropping message without push channel");
        Ok(())
    }
}

/// What the read stage hands to the dispatch stage of a connection.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Message),
    Malformed(DecodeError),
}

/// Decodes one payload and settles whatever can be settled without waiting for the
/// dispatch stage: peer responses and cancellation notices.
pub(crate) fn read_stage(server: &McpServer, session: &Session, payload: &[u8]) -> Option<Inbound> {
    match Message::decode(payload) {
        Ok(message) => server.route_inbound(session, message).map(Inbound::Message),
        Err(err) => Some(Inbound::Malformed(err)),
    }
}

pub(crate) async fn dispatch_stage(
    server: &McpServer,
    scope: &CancellationToken,
    session: &Arc<Session>,
    inbound: Inbound,
) -> Option<Response> {
    match inbound {
        Inbound::Message(message) => server.dispatch(scope, session, message).await,
        Inbound::Malformed(err) => {
            debug!(session_id = %session.id(), error = %err, "undecodable message");
            err.into_response()
        }
    }
}
