//! Per-connection protocol state
//!
//! A [`Session`] knows what the peer can do, correlates the requests the server sends
//! to it, gates log notifications by level and caches the peer's workspace roots.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::{SessionError, TransportError};
use crate::mcp::{
    cancellation::CancellationRegistry,
    context::{RequestContext, ScopeEnd},
    method::notifications,
    rpc::{Notification, Request, RequestId, Response, RpcError},
    subscriptions::SubscriptionRegistry,
};
use crate::transport::PeerSender;

/// Severity of a `notifications/message` log entry, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        }
    }
}

impl FromStr for LogLevel {
    type Err = RpcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(value.to_string()))
            .map_err(|_| RpcError::invalid_params(format!("unknown log level: {value}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

/// What the peer declared in its `initialize` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Peer features that gate server-initiated traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Server-initiated completion requests (`sampling/createMessage`).
    Sampling,
    Roots,
    RootsListChanged,
    Elicitation,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sampling => "sampling",
            Self::Roots => "roots",
            Self::RootsListChanged => "roots.listChanged",
            Self::Elicitation => "elicitation",
        })
    }
}

/// Requests the server may send to its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundRequest {
    CreateMessage,
    ListRoots,
    Elicit,
    Ping,
}

impl OutboundRequest {
    pub fn method(self) -> &'static str {
        match self {
            Self::CreateMessage => "sampling/createMessage",
            Self::ListRoots => "roots/list",
            Self::Elicit => "elicitation/create",
            Self::Ping => "ping",
        }
    }

    pub fn required_feature(self) -> Option<Feature> {
        match self {
            Self::CreateMessage => Some(Feature::Sampling),
            Self::ListRoots => Some(Feature::Roots),
            Self::Elicit => Some(Feature::Elicitation),
            Self::Ping => None,
        }
    }
}

pub type RootsCallback = Arc<dyn Fn(&[Root]) + Send + Sync>;

type Pending = HashMap<RequestId, oneshot::Sender<Result<Value, RpcError>>>;

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    sender: Arc<dyn PeerSender>,
    subscriptions: Arc<SubscriptionRegistry>,
    cancellations: Arc<CancellationRegistry>,
    capabilities: RwLock<Option<ClientCapabilities>>,
    peer_info: RwLock<Option<PeerInfo>>,
    protocol_version: RwLock<Option<String>>,
    initialized: AtomicBool,
    log_level: RwLock<LogLevel>,
    roots: RwLock<Option<Vec<Root>>>,
    roots_callback: RwLock<Option<RootsCallback>>,
    next_request_id: AtomicI64,
    // The closed flag lives under the same lock so no waiter can register after close.
    pending: Mutex<(bool, Pending)>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        sender: Arc<dyn PeerSender>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            sender,
            subscriptions,
            cancellations: Arc::new(CancellationRegistry::new()),
            capabilities: RwLock::new(None),
            peer_info: RwLock::new(None),
            protocol_version: RwLock::new(None),
            initialized: AtomicBool::new(false),
            log_level: RwLock::new(LogLevel::Info),
            roots: RwLock::new(None),
            roots_callback: RwLock::new(None),
            next_request_id: AtomicI64::new(0),
            pending: Mutex::new((false, HashMap::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn sender(&self) -> Arc<dyn PeerSender> {
        Arc::clone(&self.sender)
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    // Capability negotiation

    pub fn set_capabilities(&self, capabilities: ClientCapabilities) {
        *self.capabilities.write() = Some(capabilities);
    }

    pub fn capabilities(&self) -> Option<ClientCapabilities> {
        self.capabilities.read().clone()
    }

    pub fn set_peer(&self, protocol_version: &str, peer_info: Option<PeerInfo>) {
        *self.protocol_version.write() = Some(protocol_version.to_string());
        *self.peer_info.write() = peer_info;
    }

    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.peer_info.read().clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().clone()
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn supports(&self, feature: Feature) -> bool {
        let capabilities = self.capabilities.read();
        let Some(capabilities) = capabilities.as_ref() else {
            return false;
        };
        match feature {
            Feature::Sampling => capabilities.sampling.is_some(),
            Feature::Roots => capabilities.roots.is_some(),
            Feature::RootsListChanged => capabilities
                .roots
                .as_ref()
                .is_some_and(|roots| roots.list_changed),
            Feature::Elicitation => capabilities.elicitation.is_some(),
        }
    }

    // Outbound requests

    /// Sends a request to the peer and waits for its reply.
    ///
    /// Only the calling operation waits; the connection keeps reading. The wait ends
    /// early when `ctx` is cancelled or expires, in which case the peer is told the
    /// request was cancelled.
    pub async fn send_request(
        &self,
        ctx: &RequestContext,
        kind: OutboundRequest,
        params: Option<Value>,
    ) -> Result<Value, SessionError> {
        if let Some(feature) = kind.required_feature() {
            if !self.supports(feature) {
                return Err(SessionError::Unsupported(feature));
            }
        }

        let id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.0 {
                return Err(SessionError::Closed);
            }
            pending.1.insert(id.clone(), tx);
        }

        debug!(session_id = %self.id, request_id = %id, method = kind.method(), "sending outbound request");
        let request = Request::new(id.clone(), kind.method(), params);
        if let Err(err) = self.sender.send(request.into()).await {
            self.pending.lock().1.remove(&id);
            return Err(err.into());
        }

        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(error)) => Err(SessionError::Peer(error)),
                Err(_) => Err(SessionError::Closed),
            },
            end = ctx.done() => {
                self.pending.lock().1.remove(&id);
                let (error, reason) = match end {
                    ScopeEnd::Cancelled => (SessionError::Cancelled, "cancelled"),
                    ScopeEnd::DeadlineExceeded => (SessionError::Timeout, "timed out"),
                };
                if let Err(err) = self.notify_cancelled(&id, Some(reason)).await {
                    debug!(session_id = %self.id, request_id = %id, error = %err, "failed to notify peer of cancellation");
                }
                Err(error)
            }
        }
    }

    /// Delivers a peer reply to the waiting caller. Returns `false` for unknown ids.
    pub fn handle_response(&self, response: Response) -> bool {
        let Some(id) = response.id else {
            warn!(session_id = %self.id, "peer sent a response without an id");
            return false;
        };
        let waiter = self.pending.lock().1.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response.outcome);
                true
            }
            None => {
                debug!(session_id = %self.id, request_id = %id, "no outbound request waiting for response");
                false
            }
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().1.len()
    }

    pub async fn create_message(&self, ctx: &RequestContext, params: Value) -> Result<Value, SessionError> {
        self.send_request(ctx, OutboundRequest::CreateMessage, Some(params)).await
    }

    pub async fn elicit(&self, ctx: &RequestContext, params: Value) -> Result<Value, SessionError> {
        self.send_request(ctx, OutboundRequest::Elicit, Some(params)).await
    }

    pub async fn ping(&self, ctx: &RequestContext) -> Result<(), SessionError> {
        self.send_request(ctx, OutboundRequest::Ping, None).await.map(|_| ())
    }

    pub async fn list_roots(&self, ctx: &RequestContext) -> Result<Vec<Root>, SessionError> {
        let mut result = self.send_request(ctx, OutboundRequest::ListRoots, None).await?;
        let roots = result.get_mut("roots").map(Value::take).unwrap_or(Value::Null);
        serde_json::from_value(roots).map_err(SessionError::Decode)
    }

    /// Fetches the peer's roots and replaces the cached list.
    pub async fn refresh_roots(&self, ctx: &RequestContext) -> Result<Vec<Root>, SessionError> {
        let roots = self.list_roots(ctx).await?;
        self.set_roots(roots.clone());
        Ok(roots)
    }

    // Notifications

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.sender.send(Notification::new(method, params).into()).await
    }

    /// Tells the peer that a request it is handling for us was abandoned.
    pub async fn notify_cancelled(&self, id: &RequestId, reason: Option<&str>) -> Result<(), TransportError> {
        let mut params = json!({ "requestId": id });
        if let Some(reason) = reason {
            params["reason"] = json!(reason);
        }
        self.notify(notifications::CANCELLED, Some(params)).await
    }

    pub async fn notify_resource_updated(&self, uri: &str) -> Result<(), TransportError> {
        self.notify(notifications::RESOURCE_UPDATED, Some(json!({ "uri": uri }))).await
    }

    // Logging

    pub fn set_log_level(&self, level: LogLevel) {
        *self.log_level.write() = level;
    }

    pub fn log_level(&self) -> LogLevel {
        *self.log_level.read()
    }

    pub fn should_emit(&self, level: LogLevel) -> bool {
        level >= self.log_level()
    }

    /// Sends a log entry if it passes the level gate; returns whether it was sent.
    pub async fn log(&self, level: LogLevel, logger: Option<&str>, data: Value) -> Result<bool, TransportError> {
        if !self.should_emit(level) {
            return Ok(false);
        }
        let mut params = json!({ "level": level, "data": data });
        if let Some(logger) = logger {
            params["logger"] = json!(logger);
        }
        self.notify(notifications::MESSAGE, Some(params)).await?;
        Ok(true)
    }

    // Roots

    pub fn roots(&self) -> Option<Vec<Root>> {
        self.roots.read().clone()
    }

    pub fn set_roots(&self, roots: Vec<Root>) {
        *self.roots.write() = Some(roots.clone());
        let callback = self.roots_callback.read().clone();
        if let Some(callback) = callback {
            callback(&roots);
        }
    }

    pub fn on_roots_changed<F>(&self, callback: F)
    where
        F: Fn(&[Root]) + Send + Sync + 'static,
    {
        *self.roots_callback.write() = Some(Arc::new(callback));
    }

    // Subscriptions

    pub fn subscribe(&self, uri: &str) -> bool {
        self.subscriptions.subscribe(&self.id, uri)
    }

    pub fn unsubscribe(&self, uri: &str) -> bool {
        self.subscriptions.unsubscribe(&self.id, uri)
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.subscriptions.is_subscribed(&self.id, uri)
    }

    // Cancellation

    /// Aborts one of this session's in-flight operations locally.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        self.cancellations.cancel(id)
    }

    /// Fails every outstanding outbound request, aborts in-flight operations and
    /// drops the session's subscriptions.
    pub fn close(&self) {
        let waiters = {
            let mut pending = self.pending.lock();
            pending.0 = true;
            std::mem::take(&mut pending.1)
        };
        let cancelled = self.cancellations.cancel_all();
        let unsubscribed = self.subscriptions.unsubscribe_all(&self.id);
        debug!(
            session_id = %self.id,
            pending = waiters.len(),
            cancelled,
            unsubscribed,
            "session closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::mcp::rpc::Message;
    use crate::transport::testing::RecordingSender;

    fn session_with(sender: Arc<RecordingSender>) -> Arc<Session> {
        Arc::new(Session::new("s1", sender, Arc::new(SubscriptionRegistry::new())))
    }

    fn context(session: &Arc<Session>) -> RequestContext {
        RequestContext::new(CancellationToken::new(), session.sender()).with_session(Arc::clone(session))
    }

    fn full_capabilities() -> ClientCapabilities {
        ClientCapabilities {
            roots: Some(RootsCapability { list_changed: true }),
            sampling: Some(json!({})),
            elicitation: Some(json!({})),
            experimental: None,
        }
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Message>) -> Request {
        loop {
            match rx.recv().await.expect("sender alive") {
                Message::Request(request) => return request,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn unsupported_feature_fails_without_traffic() {
        let sender = Arc::new(RecordingSender::default());
        let session = session_with(sender.clone());
        let ctx = context(&session);

        let err = session.create_message(&ctx, json!({})).await.expect_err("must fail");
        assert!(matches!(err, SessionError::Unsupported(Feature::Sampling)));
        let err = session.list_roots(&ctx).await.expect_err("must fail");
        assert!(matches!(err, SessionError::Unsupported(Feature::Roots)));
        assert!(sender.messages().is_empty());
    }

    #[test]
    fn features_follow_declared_capabilities() {
        let session = session_with(Arc::new(RecordingSender::default()));
        assert!(!session.supports(Feature::Roots));

        session.set_capabilities(ClientCapabilities {
            roots: Some(RootsCapability { list_changed: false }),
            ..ClientCapabilities::default()
        });
        assert!(session.supports(Feature::Roots));
        assert!(!session.supports(Feature::RootsListChanged));
        assert!(!session.supports(Feature::Sampling));
        assert!(!session.supports(Feature::Elicitation));
    }

    #[tokio::test]
    async fn replies_are_matched_by_id_not_arrival_order() {
        let (sender, mut rx) = RecordingSender::with_channel();
        let session = session_with(Arc::new(sender));
        session.set_capabilities(full_capabilities());
        let ctx = context(&session);

        let first = tokio::spawn({
            let (session, ctx) = (Arc::clone(&session), ctx.clone());
            async move { session.create_message(&ctx, json!({"n": 1})).await }
        });
        let first_request = next_request(&mut rx).await;
        let second = tokio::spawn({
            let (session, ctx) = (Arc::clone(&session), ctx.clone());
            async move { session.elicit(&ctx, json!({"n": 2})).await }
        });
        let second_request = next_request(&mut rx).await;

        assert_eq!(first_request.id, RequestId::Integer(1));
        assert_eq!(second_request.id, RequestId::Integer(2));
        assert_eq!(first_request.method, "sampling/createMessage");
        assert_eq!(second_request.method, "elicitation/create");

        assert!(session.handle_response(Response::success(second_request.id, json!("second"))));
        assert!(session.handle_response(Response::success(first_request.id, json!("first"))));

        assert_eq!(first.await.expect("task").expect("reply"), json!("first"));
        assert_eq!(second.await.expect("task").expect("reply"), json!("second"));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn peer_errors_are_typed() {
        let (sender, mut rx) = RecordingSender::with_channel();
        let session = session_with(Arc::new(sender));
        let ctx = context(&session);

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.ping(&ctx).await }
        });
        let request = next_request(&mut rx).await;
        session.handle_response(Response::error(Some(request.id), RpcError::unauthorized("no")));

        let err = call.await.expect("task").expect_err("peer error");
        assert!(matches!(err, SessionError::Peer(ref rpc) if rpc.is(crate::mcp::rpc::codes::UNAUTHORIZED)));
    }

    #[tokio::test]
    async fn cancelled_wait_tells_the_peer() {
        let (sender, mut rx) = RecordingSender::with_channel();
        let session = session_with(Arc::new(sender));
        session.set_capabilities(full_capabilities());
        let ctx = context(&session);

        let call = tokio::spawn({
            let (session, ctx) = (Arc::clone(&session), ctx.clone());
            async move { session.list_roots(&ctx).await }
        });
        let request = next_request(&mut rx).await;
        ctx.cancel();

        let err = call.await.expect("task").expect_err("cancelled");
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(session.pending_requests(), 0);

        let Some(Message::Notification(notice)) = rx.recv().await else {
            panic!("expected cancellation notice");
        };
        assert_eq!(notice.method, notifications::CANCELLED);
        assert_eq!(notice.params.expect("params")["requestId"], json!(request.id));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_into_timeout() {
        let session = session_with(Arc::new(RecordingSender::default()));
        let ctx = context(&session).with_timeout(Duration::from_secs(1));

        let err = session.ping(&ctx).await.expect_err("timeout");
        assert!(matches!(err, SessionError::Timeout));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn send_failure_surfaces_and_keeps_the_session() {
        let session = session_with(Arc::new(RecordingSender::failing()));
        let ctx = context(&session);

        let err = session.ping(&ctx).await.expect_err("send fails");
        assert!(matches!(err, SessionError::Transport(TransportError::Closed)));
        assert!(!session.is_closed());
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_rejects_new_requests() {
        let (sender, mut rx) = RecordingSender::with_channel();
        let session = session_with(Arc::new(sender));
        let ctx = context(&session);

        let call = tokio::spawn({
            let (session, ctx) = (Arc::clone(&session), ctx.clone());
            async move { session.ping(&ctx).await }
        });
        next_request(&mut rx).await;
        session.close();

        assert!(matches!(call.await.expect("task"), Err(SessionError::Closed)));
        assert!(matches!(session.ping(&ctx).await, Err(SessionError::Closed)));
    }

    #[test]
    fn unknown_response_ids_are_reported() {
        let session = session_with(Arc::new(RecordingSender::default()));
        assert!(!session.handle_response(Response::success(RequestId::Integer(99), json!({}))));
        assert!(!session.handle_response(Response::error(None, RpcError::parse_error())));
    }

    #[tokio::test]
    async fn log_gate_follows_minimum_level() {
        let sender = Arc::new(RecordingSender::default());
        let session = session_with(sender.clone());
        assert_eq!(session.log_level(), LogLevel::Info);

        session.set_log_level(LogLevel::Warning);
        assert!(!session.should_emit(LogLevel::Info));
        assert!(session.should_emit(LogLevel::Warning));
        assert!(session.should_emit(LogLevel::Emergency));

        assert!(!session.log(LogLevel::Notice, None, json!("quiet")).await.expect("log"));
        assert!(session.log(LogLevel::Error, Some("db"), json!("loud")).await.expect("log"));

        let messages = sender.messages();
        assert_eq!(messages.len(), 1);
        let Message::Notification(notification) = &messages[0] else {
            panic!("expected notification");
        };
        assert_eq!(
            notification.params,
            Some(json!({"level": "error", "logger": "db", "data": "loud"}))
        );
    }

    #[test]
    fn log_levels_parse_and_order() {
        assert_eq!("critical".parse::<LogLevel>().expect("level"), LogLevel::Critical);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert!(LogLevel::Debug < LogLevel::Emergency);
        assert_eq!(LogLevel::Notice.as_str(), "notice");
    }

    #[tokio::test]
    async fn refreshed_roots_are_cached_and_reported() {
        let (sender, mut rx) = RecordingSender::with_channel();
        let session = session_with(Arc::new(sender));
        session.set_capabilities(full_capabilities());
        let seen = Arc::new(Mutex::new(Vec::new()));
        session.on_roots_changed({
            let seen = Arc::clone(&seen);
            move |roots: &[Root]| seen.lock().push(roots.len())
        });
        let ctx = context(&session);

        let call = tokio::spawn({
            let (session, ctx) = (Arc::clone(&session), ctx.clone());
            async move { session.refresh_roots(&ctx).await }
        });
        let request = next_request(&mut rx).await;
        assert_eq!(request.method, "roots/list");
        session.handle_response(Response::success(
            request.id,
            json!({"roots": [{"uri": "file:///repo", "name": "repo"}]}),
        ));

        let roots = call.await.expect("task").expect("roots");
        assert_eq!(roots[0].uri, "file:///repo");
        assert_eq!(session.roots(), Some(roots));
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn subscriptions_are_scoped_to_the_session() {
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let a = Session::new("a", Arc::new(RecordingSender::default()), Arc::clone(&subscriptions));
        let b = Session::new("b", Arc::new(RecordingSender::default()), Arc::clone(&subscriptions));

        assert!(a.subscribe("file:///x"));
        assert!(!a.subscribe("file:///x"));
        assert!(a.is_subscribed("file:///x"));
        assert!(!b.is_subscribed("file:///x"));

        a.close();
        assert!(!subscriptions.has_subscribers("file:///x"));
    }

    #[test]
    fn local_cancel_targets_one_operation() {
        let session = session_with(Arc::new(RecordingSender::default()));
        let parent = CancellationToken::new();
        let (first, _g1) = session.cancellations().track(&parent, RequestId::Integer(1));
        let (second, _g2) = session.cancellations().track(&parent, RequestId::Integer(2));

        assert!(session.cancel_request(&RequestId::Integer(1)));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!session.cancel_request(&RequestId::Integer(1)));
    }
}
