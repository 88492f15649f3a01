//! Per-operation execution scope handed to handlers.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::TransportError;
use crate::mcp::{
    progress::ProgressReporter,
    rpc::{Notification, RequestId},
    session::Session,
};
use crate::transport::PeerSender;

/// Why a scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeEnd {
    Cancelled,
    DeadlineExceeded,
}

/// Cancellation signal, optional deadline and the send path of the connection the
/// operation arrived on. Cloning is cheap; clones share the same token.
#[derive(Clone)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    request_id: Option<RequestId>,
    session: Option<Arc<Session>>,
    sender: Arc<dyn PeerSender>,
    progress: ProgressReporter,
}

impl RequestContext {
    pub fn new(token: CancellationToken, sender: Arc<dyn PeerSender>) -> Self {
        Self {
            token,
            deadline: None,
            request_id: None,
            session: None,
            sender,
            progress: ProgressReporter::disabled(),
        }
    }

    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_request(mut self, id: RequestId, progress: ProgressReporter) -> Self {
        self.request_id = Some(id);
        self.progress = progress;
        self
    }

    /// Derives a child scope that also ends once `timeout` has elapsed.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        });
        child
    }

    /// Derives a child scope that can be cancelled without affecting this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            ..self.clone()
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resolves when the scope is cancelled or its deadline passes.
    pub async fn done(&self) -> ScopeEnd {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ScopeEnd::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ScopeEnd::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ScopeEnd::Cancelled
            }
        }
    }

    /// Pushes a notification to the peer this operation came from.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.sender.send(Notification::new(method, params).into()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DetachedSender;

    fn context() -> RequestContext {
        RequestContext::new(CancellationToken::new(), Arc::new(DetachedSender))
    }

    #[tokio::test]
    async fn cancelling_the_parent_ends_children() {
        let parent = context();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.done().await, ScopeEnd::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_a_child_leaves_the_parent_running() {
        let parent = context();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_the_scope() {
        let scope = context().with_timeout(Duration::from_secs(5));
        assert!(!scope.is_cancelled());
        assert_eq!(scope.done().await, ScopeEnd::DeadlineExceeded);
        assert!(scope.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn nested_timeouts_keep_the_earliest_deadline() {
        let outer = context().with_timeout(Duration::from_secs(1));
        let inner = outer.with_timeout(Duration::from_secs(60));
        assert_eq!(inner.deadline(), outer.deadline());
    }
}
