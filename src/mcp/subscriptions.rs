//! Resource subscription registry shared by every session of a server.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

/// Resource uri to the ids of the sessions watching it.
///
/// A resource whose last subscriber leaves is removed right away, so
/// [`SubscriptionRegistry::count`] only ever counts watched resources.
#[derive(Default)]
pub struct SubscriptionRegistry {
    resources: RwLock<HashMap<String, HashSet<String>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the session was already subscribed.
    pub fn subscribe(&self, session_id: &str, resource: &str) -> bool {
        self.resources
            .write()
            .entry(resource.to_string())
            .or_default()
            .insert(session_id.to_string())
    }

    pub fn unsubscribe(&self, session_id: &str, resource: &str) -> bool {
        let mut resources = self.resources.write();
        let Some(sessions) = resources.get_mut(resource) else {
            return false;
        };
        let removed = sessions.remove(session_id);
        if sessions.is_empty() {
            resources.remove(resource);
        }
        removed
    }

    /// Drops every subscription held by the session; returns how many were removed.
    pub fn unsubscribe_all(&self, session_id: &str) -> usize {
        let mut removed = 0;
        self.resources.write().retain(|_, sessions| {
            if sessions.remove(session_id) {
                removed += 1;
            }
            !sessions.is_empty()
        });
        removed
    }

    pub fn subscribers(&self, resource: &str) -> HashSet<String> {
        self.resources
            .read()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, resource: &str) -> bool {
        self.resources.read().contains_key(resource)
    }

    pub fn is_subscribed(&self, session_id: &str, resource: &str) -> bool {
        self.resources
            .read()
            .get(resource)
            .is_some_and(|sessions| sessions.contains(session_id))
    }

    /// Number of resources with at least one subscriber.
    pub fn count(&self) -> usize {
        self.resources.read().len()
    }
}
