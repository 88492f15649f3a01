use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::mcp::{method::notifications, session::Session, subscriptions::SubscriptionRegistry};
use crate::transport::PeerSender;

/// Which catalogue changed, for `notifications/*/list_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Tools,
    Resources,
    Prompts,
}

impl ListKind {
    pub fn notification(self) -> &'static str {
        match self {
            Self::Tools => notifications::TOOLS_LIST_CHANGED,
            Self::Resources => notifications::RESOURCES_LIST_CHANGED,
            Self::Prompts => notifications::PROMPTS_LIST_CHANGED,
        }
    }
}

/// Every live session of one server, plus the subscription table they share.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn create(&self, sender: Arc<dyn PeerSender>) -> Arc<Session> {
        self.create_with_id(Uuid::new_v4().to_string(), sender)
    }

    pub fn create_with_id(&self, id: impl Into<String>, sender: Arc<dyn PeerSender>) -> Arc<Session> {
        let session = Arc::new(Session::new(id, sender, Arc::clone(&self.subscriptions)));
        let previous = self
            .sessions
            .write()
            .insert(session.id().to_string(), Arc::clone(&session));
        if let Some(previous) = previous {
            warn!(session_id = %previous.id(), "replacing live session with the same id");
            previous.close();
        }
        debug!(session_id = %session.id(), "session created");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Forgets the session, closing it and dropping its subscriptions.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().remove(id)?;
        session.close();
        debug!(session_id = %id, "session removed");
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Sends `notifications/resources/updated` to the sessions subscribed to `uri` and
    /// returns how many were notified.
    pub async fn notify_resource_updated(&self, uri: &str) -> usize {
        let targets: Vec<Arc<Session>> = self
            .subscriptions
            .subscribers(uri)
            .iter()
            .filter_map(|id| self.get(id))
            .collect();

        let mut delivered = 0;
        for session in targets {
            match session.notify_resource_updated(uri).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(session_id = %session.id(), uri, error = %err, "failed to deliver resource update")
                }
            }
        }
        delivered
    }

    pub async fn notify_list_changed(&self, kind: ListKind) -> usize {
        self.broadcast(kind.notification(), None).await
    }

    /// Sends one notification to every live session; returns the number delivered.
    pub async fn broadcast(&self, method: &str, params: Option<Value>) -> usize {
        let mut delivered = 0;
        for session in self.snapshot() {
            match session.notify(method, params.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => warn!(session_id = %session.id(), method, error = %err, "broadcast delivery failed"),
            }
        }
        delivered
    }

    /// Closes every session; used when the serving scope ends.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, session)| session).collect();
        for session in &drained {
            session.close();
        }
        drained.len()
    }

    pub fn describe(&self) -> Value {
        let sessions: Vec<Value> = self
            .snapshot()
            .iter()
            .map(|session| {
                json!({
                    "id": session.id(),
                    "createdAt": session.created_at().to_rfc3339(),
                    "initialized": session.is_initialized(),
                })
            })
            .collect();
        json!({ "sessions": sessions, "subscribedResources": self.subscriptions.count() })
    }
}
