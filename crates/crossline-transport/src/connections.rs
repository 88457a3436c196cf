//! Table of live sessions.

use std::sync::Arc;

use crossline_core::{CrosslineError, Message, Result, SubscriberId};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::session::Session;

/// Live sessions keyed by connection id.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    sessions: DashMap<String, Arc<Session>>,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session.
    pub fn add(&self, session: Arc<Session>) {
        debug!(session_id = session.id(), remote = session.remote(), "tracking session");
        let _ = self.sessions.insert(session.id().to_owned(), session);
    }

    /// Stop tracking a session.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Look up a session by connection id.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Open sessions logged in as `peer`, newest first.
    pub fn find_by_peer(&self, peer: &SubscriberId) -> Vec<Arc<Session>> {
        let mut found: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| !entry.is_closed() && entry.peer().as_ref() == Some(peer))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        found.sort_by_key(|s| s.age());
        found
    }

    /// Send a message on the newest open session logged in as `peer`.
    pub async fn send_to_peer(&self, peer: &SubscriberId, message: Message) -> Result<()> {
        let Some(session) = self.find_by_peer(peer).into_iter().next() else {
            return Err(CrosslineError::connection_closed(format!(
                "no open session for subscriber {peer}"
            )));
        };
        session.send(message).await
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every tracked session.
    pub fn close_all(&self, reason: &str) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if !sessions.is_empty() {
            info!(count = sessions.len(), reason, "closing all sessions");
        }
        for session in sessions {
            session.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use crate::session::SessionConfig;
    use crossline_core::errors::CONNECTION_CLOSED;
    use crossline_core::{MessageFactory, ObjectType, PayloadObject, PeerRole, SystemId};
    use serde_json::json;

    fn pair() -> (Arc<Session>, Arc<Session>) {
        Session::in_memory_pair(
            SessionConfig::default(),
            Arc::new(HandlerRegistry::new()),
            Arc::new(HandlerRegistry::new()),
        )
    }

    #[tokio::test]
    async fn add_get_remove() {
        let table = ConnectionTable::new();
        let (a, _b) = pair();
        table.add(Arc::clone(&a));
        assert_eq!(table.len(), 1);
        assert!(table.get(a.id()).is_some());
        assert!(table.remove(a.id()).is_some());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn find_by_peer_skips_unbound_and_closed() {
        let table = ConnectionTable::new();
        let (a, _a2) = pair();
        let (b, _b2) = pair();
        let (c, _c2) = pair();
        a.bind_peer(SubscriberId::from("platform"));
        b.bind_peer(SubscriberId::from("platform"));
        b.close("gone");
        table.add(Arc::clone(&a));
        table.add(b);
        table.add(c);

        let found = table.find_by_peer(&SubscriberId::from("platform"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), a.id());
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let table = ConnectionTable::new();
        let msg = MessageFactory::new("utcs", PeerRole::Lower)
            .push(
                &SystemId::from("platform"),
                PayloadObject::from_value(ObjectType::CrossState, json!({"crossId": "c1"})),
            )
            .unwrap();
        let err = table
            .send_to_peer(&SubscriberId::from("platform"), msg)
            .await
            .unwrap_err();
        assert_eq!(err.code(), CONNECTION_CLOSED);
    }

    #[tokio::test]
    async fn close_all_closes_sessions() {
        let table = ConnectionTable::new();
        let (a, _a2) = pair();
        table.add(Arc::clone(&a));
        table.close_all("shutdown");
        assert!(a.is_closed());
    }
}
