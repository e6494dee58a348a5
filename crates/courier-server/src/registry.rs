use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use courier_shared::protocol::ServerFrame;
use courier_shared::types::{ConnectionId, UserId};

use crate::connection::Outbox;

/// Live session of one authenticated user.
///
/// Holds the connection's id and outbox, never the connection itself, so
/// the registry can't keep a closed socket alive.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub username: String,
    outbox: Outbox,
}

impl SessionHandle {
    pub fn conn_id(&self) -> ConnectionId {
        self.outbox.conn_id()
    }

    /// Push a frame to the session's connection. `false` if it is closing.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.outbox.send(frame)
    }
}

/// Process-wide map from user id to that user's single live session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<UserId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any existing one for the same user
    /// (last login wins). Returns the replaced session, if any.
    ///
    /// The replaced connection is detached, not closed.
    pub async fn add(&self, user_id: UserId, username: &str, outbox: Outbox) -> Option<SessionHandle> {
        let handle = SessionHandle {
            username: username.to_string(),
            outbox,
        };
        let conn_id = handle.conn_id();

        let mut sessions = self.sessions.write().await;
        let previous = sessions.insert(user_id, handle);

        info!(
            user_id = %user_id,
            username = %username,
            conn = %conn_id,
            sessions = sessions.len(),
            "session added"
        );
        if let Some(prev) = &previous {
            if prev.conn_id() != conn_id {
                info!(
                    user_id = %user_id,
                    previous = %prev.conn_id(),
                    "previous session detached"
                );
            }
        }

        previous
    }

    /// Unconditionally drop the session for `user_id`.
    #[cfg(test)]
    pub async fn remove(&self, user_id: UserId) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(&user_id);
        if removed.is_some() {
            debug!(user_id = %user_id, sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Drop the session for `user_id` only if it still belongs to `conn_id`.
    ///
    /// A connection that was displaced by a newer login must not evict the
    /// newer session when it closes.
    pub async fn release(&self, user_id: UserId, conn_id: ConnectionId) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&user_id) {
            Some(handle) if handle.conn_id() == conn_id => {
                sessions.remove(&user_id);
                debug!(user_id = %user_id, conn = %conn_id, sessions = sessions.len(), "session released");
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub async fn is_active(&self, user_id: UserId) -> bool {
        self.sessions.read().await.contains_key(&user_id)
    }

    /// Whether `conn_id` currently holds the session for `user_id`.
    pub async fn is_current(&self, user_id: UserId, conn_id: ConnectionId) -> bool {
        self.sessions
            .read()
            .await
            .get(&user_id)
            .map(|h| h.conn_id() == conn_id)
            .unwrap_or(false)
    }

    pub async fn get(&self, user_id: UserId) -> Option<SessionHandle> {
        self.sessions.read().await.get(&user_id).cloned()
    }

    /// Linear scan; the map only ever holds online users.
    pub async fn get_by_username(&self, username: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .values()
            .find(|h| h.username == username)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox(id: u64) -> Outbox {
        Outbox::new(ConnectionId(id)).0
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.add(UserId(1), "alice", outbox(10)).await.is_none());

        assert!(registry.is_active(UserId(1)).await);
        assert_eq!(registry.get(UserId(1)).await.unwrap().conn_id(), ConnectionId(10));
        assert_eq!(
            registry.get_by_username("alice").await.unwrap().conn_id(),
            ConnectionId(10)
        );
        assert!(registry.get_by_username("Alice").await.is_none());

        assert!(registry.remove(UserId(1)).await.is_some());
        assert!(!registry.is_active(UserId(1)).await);
        assert!(registry.remove(UserId(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_last_login_wins() {
        let registry = SessionRegistry::new();
        registry.add(UserId(1), "alice", outbox(10)).await;
        let replaced = registry.add(UserId(1), "alice", outbox(11)).await.unwrap();

        assert_eq!(replaced.conn_id(), ConnectionId(10));
        assert_eq!(registry.len().await, 1);
        assert!(registry.is_current(UserId(1), ConnectionId(11)).await);
        assert!(!registry.is_current(UserId(1), ConnectionId(10)).await);
    }

    #[tokio::test]
    async fn test_release_ignores_displaced_connection() {
        let registry = SessionRegistry::new();
        registry.add(UserId(1), "alice", outbox(10)).await;
        registry.add(UserId(1), "alice", outbox(11)).await;

        assert!(!registry.release(UserId(1), ConnectionId(10)).await);
        assert!(registry.is_active(UserId(1)).await);

        assert!(registry.release(UserId(1), ConnectionId(11)).await);
        assert!(!registry.is_active(UserId(1)).await);
    }

    #[tokio::test]
    async fn test_handle_send_reaches_outbox() {
        let registry = SessionRegistry::new();
        let (outbox, mut rx) = Outbox::new(ConnectionId(5));
        registry.add(UserId(2), "bob", outbox).await;

        let handle = registry.get_by_username("bob").await.unwrap();
        assert!(handle.send(ServerFrame::typing("alice", true)));
        assert!(matches!(rx.try_recv().unwrap(), ServerFrame::Typing(_)));
    }

    #[tokio::test]
    async fn test_concurrent_adds_keep_one_entry_per_user() {
        let registry = SessionRegistry::new();
        let mut tasks = Vec::new();
        for i in 0..32u64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.add(UserId((i % 4) as i64), "user", outbox(i)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.len().await, 4);
    }
}
