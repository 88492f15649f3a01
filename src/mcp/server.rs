//! The central Model Context Protocol engine
//!
//! Routes decoded messages for a session: peer responses and cancellation notices go
//! straight to the session, core methods (`initialize`, `ping`, `logging/setLevel`,
//! resource subscriptions) are answered here, everything else reaches the [`Handler`].

use std::{error::Error as StdError, sync::Arc};

use async_trait::async_trait;
use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ServerCapabilities, ServerCapabilitiesPrompts,
    ServerCapabilitiesResources, ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::SessionError;
use crate::mcp::{
    context::RequestContext,
    method::{notifications, Method},
    progress::{ProgressReporter, ProgressToken},
    rpc::{Message, Notification, Request, RequestId, Response, RpcError},
    session::{ClientCapabilities, Feature, LogLevel, PeerInfo, Session},
    sessions::SessionRegistry,
};
use crate::shutdown::ShutdownCoordinator;

/// Newest first; an unknown offer is answered with the first entry.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Application side of the engine: answers every non-core method.
///
/// Returning an [`RpcError`] (boxed) sends that error to the peer unchanged; any other
/// error is reported as an internal error.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, method: Method, params: Option<Value>) -> Result<Value, BoxError>;

    async fn on_notification(&self, _ctx: RequestContext, notification: Notification) {
        debug!(method = %notification.method, "ignoring notification");
    }
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub title: Option<String>,
    pub instructions: Option<String>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            instructions: None,
        }
    }
}

pub struct McpServer {
    info: ServerInfo,
    handler: Arc<dyn Handler>,
    sessions: SessionRegistry,
    shutdown: Arc<ShutdownCoordinator>,
}

impl McpServer {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            info: ServerInfo::default(),
            handler,
            sessions: SessionRegistry::new(),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownCoordinator>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Read-stage routing: settles peer responses and cancellation notices right away
    /// and returns whatever still needs dispatching.
    pub fn route_inbound(&self, session: &Session, message: Message) -> Option<Message> {
        match message {
            Message::Response(response) => {
                session.handle_response(response);
                None
            }
            Message::Notification(notification) if notification.method == notifications::CANCELLED => {
                handle_peer_cancel(session, notification.params.as_ref());
                None
            }
            other => Some(other),
        }
    }

    /// Dispatches one message and returns the response owed to the peer, if any.
    pub async fn dispatch(&self, scope: &CancellationToken, session: &Arc<Session>, message: Message) -> Option<Response> {
        match message {
            Message::Request(request) => Some(self.handle_request(scope, session, request).await),
            Message::Notification(notification) => {
                self.handle_notification(scope, session, notification).await;
                None
            }
            Message::Response(response) => {
                session.handle_response(response);
                None
            }
        }
    }

    /// Both stages in one call, for bindings that handle a single message at a time.
    pub async fn handle_message(&self, scope: &CancellationToken, session: &Arc<Session>, message: Message) -> Option<Response> {
        let message = self.route_inbound(session, message)?;
        self.dispatch(scope, session, message).await
    }

    pub async fn handle_payload(&self, scope: &CancellationToken, session: &Arc<Session>, payload: &[u8]) -> Option<Response> {
        match Message::decode(payload) {
            Ok(message) => self.handle_message(scope, session, message).await,
            Err(err) => {
                debug!(session_id = %session.id(), error = %err, "dropping undecodable payload");
                err.into_response()
            }
        }
    }

    async fn handle_request(&self, scope: &CancellationToken, session: &Arc<Session>, request: Request) -> Response {
        let Request { id, method, params } = request;

        let Some(_in_flight) = self.shutdown.begin_request() else {
            debug!(session_id = %session.id(), method = %method, "rejecting request while draining");
            return Response::error(Some(id), RpcError::shutting_down());
        };

        let audit_params = redact_audit_params(params.as_ref());
        let outcome = match Method::parse(&method) {
            None => Err(RpcError::method_not_found(&method)),
            Some(known) => {
                let (token, _tracked) = session.cancellations().track(scope, id.clone());
                let progress = ProgressReporter::new(ProgressToken::from_params(params.as_ref()), session.sender());
                let ctx = RequestContext::new(token, session.sender())
                    .with_session(Arc::clone(session))
                    .with_request(id.clone(), progress);

                if known.is_core() {
                    self.handle_core(session, known, params)
                } else {
                    self.handler
                        .handle(ctx, known, params)
                        .await
                        .map_err(|err| into_rpc_error(&method, err))
                }
            }
        };

        info!(
            session_id = %session.id(),
            request_id = %id,
            method = %method,
            params = %audit_params,
            outcome = if outcome.is_ok() { "success" } else { "failure" },
            "mcp action audited"
        );

        match outcome {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::error(Some(id), error),
        }
    }

    fn handle_core(&self, session: &Session, method: Method, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            Method::Initialize => self.initialize(session, params.as_ref()),
            Method::Ping => Ok(json!({})),
            Method::SetLogLevel => {
                let level = string_param(params.as_ref(), "level")?.parse::<LogLevel>()?;
                session.set_log_level(level);
                Ok(json!({}))
            }
            Method::Subscribe => {
                session.subscribe(string_param(params.as_ref(), "uri")?);
                Ok(json!({}))
            }
            Method::Unsubscribe => {
                session.unsubscribe(string_param(params.as_ref(), "uri")?);
                Ok(json!({}))
            }
            other => Err(RpcError::method_not_found(other.as_str())),
        }
    }

    fn initialize(&self, session: &Session, params: Option<&Value>) -> Result<Value, RpcError> {
        let protocol_version = negotiate_protocol_version(params)?;

        let capabilities = match params.and_then(|params| params.get("capabilities")) {
            Some(value) => serde_json::from_value::<ClientCapabilities>(value.clone())
                .map_err(|err| RpcError::invalid_params(format!("invalid client capabilities: {err}")))?,
            None => ClientCapabilities::default(),
        };
        let peer_info = params
            .and_then(|params| params.get("clientInfo"))
            .and_then(|value| serde_json::from_value::<PeerInfo>(value.clone()).ok());

        session.set_capabilities(capabilities);
        session.set_peer(protocol_version, peer_info.clone());
        info!(
            session_id = %session.id(),
            protocol_version,
            client = peer_info.as_ref().map(|peer| peer.name.as_str()).unwrap_or("unknown"),
            "session initialized"
        );

        let initialize_result = InitializeResult {
            server_info: Implementation {
                name: self.info.name.clone(),
                version: self.info.version.clone(),
                title: self.info.title.clone(),
                description: None,
                icons: vec![],
                website_url: None,
            },
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(true),
                }),
                resources: Some(ServerCapabilitiesResources {
                    subscribe: Some(true),
                    list_changed: Some(true),
                }),
                prompts: Some(ServerCapabilitiesPrompts {
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            protocol_version: protocol_version.to_string(),
            instructions: self.info.instructions.clone(),
            meta: None,
        };

        let mut result = serde_json::to_value(initialize_result)
            .map_err(|err| RpcError::internal(format!("failed to encode initialize result: {err}")))?;
        result["capabilities"]["logging"] = json!({});
        Ok(result)
    }

    async fn handle_notification(&self, scope: &CancellationToken, session: &Arc<Session>, notification: Notification) {
        match notification.method.as_str() {
            notifications::INITIALIZED => session.mark_initialized(),
            notifications::CANCELLED => handle_peer_cancel(session, notification.params.as_ref()),
            notifications::ROOTS_LIST_CHANGED => self.refresh_roots_in_background(scope, session),
            _ => {
                let ctx = RequestContext::new(scope.child_token(), session.sender()).with_session(Arc::clone(session));
                self.handler.on_notification(ctx, notification).await;
            }
        }
    }

    fn refresh_roots_in_background(&self, scope: &CancellationToken, session: &Arc<Session>) {
        if !session.supports(Feature::Roots) {
            debug!(session_id = %session.id(), "roots changed but peer cannot list them");
            return;
        }
        let ctx = RequestContext::new(scope.child_token(), session.sender()).with_session(Arc::clone(session));
        let session = Arc::clone(session);
        tokio::spawn(async move {
            match session.refresh_roots(&ctx).await {
                Ok(roots) => debug!(session_id = %session.id(), count = roots.len(), "roots refreshed"),
                Err(err) => warn!(session_id = %session.id(), error = %err, "failed to refresh roots"),
            }
        });
    }
}

fn handle_peer_cancel(session: &Session, params: Option<&Value>) {
    let Some(id) = params
        .and_then(|params| params.get("requestId"))
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok())
    else {
        debug!(session_id = %session.id(), "cancellation notice without a usable requestId");
        return;
    };
    let reason = params
        .and_then(|params| params.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or("unspecified");
    let found = session.cancel_request(&id);
    debug!(session_id = %session.id(), request_id = %id, reason, found, "peer cancelled request");
}

fn string_param<'a>(params: Option<&'a Value>, key: &str) -> Result<&'a str, RpcError> {
    params
        .and_then(|params| params.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RpcError::invalid_params(format!("params.{key} is required")))
}

fn into_rpc_error(method: &str, err: BoxError) -> RpcError {
    let err = match err.downcast::<RpcError>() {
        Ok(rpc) => return *rpc,
        Err(other) => other,
    };
    match err.downcast::<SessionError>() {
        Ok(session_err) => match *session_err {
            SessionError::Peer(rpc) => rpc,
            SessionError::Cancelled | SessionError::Timeout => RpcError::cancelled(),
            other => {
                error!(method, error = %other, "handler failed on an outbound request");
                RpcError::internal("Internal error")
            }
        },
        Err(other) => {
            error!(method, error = %other, "handler failed");
            RpcError::internal("Internal error")
        }
    }
}

pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<&'static str, RpcError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| RpcError::invalid_params("initialize params.protocolVersion is required"))?;

    Ok(SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|supported| *supported == offered_version)
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]))
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    // progressToken is protocol plumbing, not a credential.
    if normalized == "progresstoken" {
        return false;
    }
    matches!(normalized.as_str(), "authorization" | "bearer" | "api_key" | "apikey")
        || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}
