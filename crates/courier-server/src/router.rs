//! Delivery decisions for direct messages and typing indicators.
//!
//! Every accepted message is persisted first, flagged with whether its
//! recipient was online at that moment. Online recipients get the message
//! pushed straight away; for offline recipients the stored row is the
//! pending queue entry, flushed on their next login.
//!
//! Delivery to a user and the login flush for that user are serialized by
//! a per-recipient inbox lock, so a live message can never overtake an
//! older stored one from the same sender.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use tracing::{debug, error, info, warn};

use courier_shared::constants::UNKNOWN_SENDER;
use courier_shared::protocol::ServerFrame;
use courier_shared::types::UserId;

use crate::connection::Outbox;
use crate::error::ServerError;
use crate::registry::SessionRegistry;
use crate::store::Store;

/// What happened to an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed to the recipient's live connection.
    Relayed,
    /// Stored for the recipient's next login.
    Queued,
    /// No such user; the message was dropped.
    UnknownRecipient,
}

#[derive(Clone)]
pub struct MessageRouter {
    store: Store,
    registry: SessionRegistry,
    /// One lock per recipient that has ever been delivered to or logged in.
    inboxes: Arc<Mutex<HashMap<UserId, Arc<Mutex<()>>>>>,
}

impl MessageRouter {
    pub fn new(store: Store, registry: SessionRegistry) -> Self {
        Self {
            store,
            registry,
            inboxes: Arc::default(),
        }
    }

    /// Exclusive access to `user_id`'s inbox.
    ///
    /// Held by [`deliver`](Self::deliver) from the online check until the
    /// message is stored or pushed, and by login from registering the
    /// session until the pending flush is done.
    pub async fn lock_inbox(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = self.inboxes.lock().await.entry(user_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Persist and, if possible, relay a message from `sender_id`.
    ///
    /// An unknown recipient is not an error: the message is logged and
    /// dropped. Store failures abort delivery and are returned.
    pub async fn deliver(
        &self,
        sender_id: UserId,
        sender_name: &str,
        receiver_name: &str,
        content: &str,
    ) -> Result<Delivery, ServerError> {
        let Some(receiver) = self.store.find_user_by_name(receiver_name).await? else {
            info!(
                from = %sender_name,
                to = %receiver_name,
                "recipient not found, dropping message"
            );
            return Ok(Delivery::UnknownRecipient);
        };

        let _inbox = self.lock_inbox(receiver.id).await;
        let session = self.registry.get(receiver.id).await;
        let stored = self
            .store
            .append_message(sender_id, receiver.id, content, session.is_some())
            .await?;

        let Some(session) = session else {
            debug!(
                from = %sender_name,
                to = %receiver_name,
                message_id = stored.id,
                "recipient offline, message stored"
            );
            return Ok(Delivery::Queued);
        };

        if session.send(ServerFrame::live_message(sender_name, content)) {
            debug!(
                from = %sender_name,
                to = %receiver_name,
                conn = %session.conn_id(),
                "message relayed"
            );
            return Ok(Delivery::Relayed);
        }

        // The recipient's connection is closing or its outbox overflowed.
        warn!(
            to = %receiver_name,
            message_id = stored.id,
            "recipient connection closing, requeueing message"
        );
        self.store.requeue_message(stored.id).await?;
        Ok(Delivery::Queued)
    }

    /// Push a typing indicator to `to_username` if they are online.
    /// Indicators for offline users are dropped, never queued.
    pub async fn relay_typing(&self, from_username: &str, to_username: &str, is_typing: bool) -> bool {
        let Some(session) = self.registry.get_by_username(to_username).await else {
            debug!(from = %from_username, to = %to_username, "typing target offline");
            return false;
        };
        session.send(ServerFrame::typing(from_username, is_typing))
    }

    /// Deliver every pending message for `user_id` to `outbox`, oldest
    /// first, and return how many were pushed.
    ///
    /// Runs once per successful login, with the user's inbox lock held.
    /// Failures are logged, never reported to the client; if the connection
    /// goes away mid-flush the remaining messages are put back in the queue.
    pub async fn flush_pending(&self, user_id: UserId, outbox: &Outbox) -> usize {
        let pending = match self.store.fetch_and_clear_pending_for(user_id).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "failed to fetch pending messages");
                return 0;
            }
        };
        if pending.is_empty() {
            return 0;
        }

        let mut senders: HashMap<UserId, String> = HashMap::new();
        for (i, msg) in pending.iter().enumerate() {
            let from = match senders.get(&msg.sender_id) {
                Some(name) => name.clone(),
                None => {
                    let name = self.sender_name(msg.sender_id).await;
                    senders.insert(msg.sender_id, name.clone());
                    name
                }
            };

            let frame = ServerFrame::stored_message(from, &msg.content, msg.sent_at.to_rfc3339());
            if !outbox.send(frame) {
                warn!(
                    user_id = %user_id,
                    remaining = pending.len() - i,
                    "connection closed during flush, requeueing"
                );
                for rest in &pending[i..] {
                    if let Err(e) = self.store.requeue_message(rest.id).await {
                        error!(message_id = rest.id, error = %e, "failed to requeue message");
                    }
                }
                return i;
            }
        }

        info!(user_id = %user_id, count = pending.len(), "flushed pending messages");
        pending.len()
    }

    async fn sender_name(&self, id: UserId) -> String {
        match self.store.find_user_by_id(id).await {
            Ok(Some(user)) => user.username,
            Ok(None) => UNKNOWN_SENDER.to_string(),
            Err(e) => {
                warn!(sender_id = %id, error = %e, "failed to resolve sender");
                UNKNOWN_SENDER.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{memory_store, register_user};
    use std::time::Duration;

    use courier_shared::protocol::MessageRelay;
    use courier_shared::types::ConnectionId;

    async fn setup() -> (MessageRouter, Store, SessionRegistry, UserId, UserId) {
        let store = memory_store();
        let registry = SessionRegistry::new();
        let alice = register_user(&store, "alice").await;
        let bob = register_user(&store, "bob").await;
        let router = MessageRouter::new(store.clone(), registry.clone());
        (router, store, registry, alice, bob)
    }

    fn relay(frame: ServerFrame) -> MessageRelay {
        match frame {
            ServerFrame::Message(m) => m,
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_online_recipient_gets_live_message() {
        let (router, store, registry, alice, bob) = setup().await;
        let (outbox, mut rx) = Outbox::new(ConnectionId(1));
        registry.add(bob, "bob", outbox).await;

        let delivery = router.deliver(alice, "alice", "bob", "hi").await.unwrap();
        assert_eq!(delivery, Delivery::Relayed);

        let msg = relay(rx.try_recv().unwrap());
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.content, "hi");
        assert!(msg.delivered);
        assert!(!msg.stored);

        // Persisted, but not pending.
        assert_eq!(store.count_pending(bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_recipient_is_queued() {
        let (router, store, _registry, alice, bob) = setup().await;

        let delivery = router.deliver(alice, "alice", "bob", "later").await.unwrap();
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(store.count_pending(bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_dropped() {
        let (router, _store, _registry, alice, _bob) = setup().await;
        let delivery = router.deliver(alice, "alice", "nobody", "hi").await.unwrap();
        assert_eq!(delivery, Delivery::UnknownRecipient);
    }

    #[tokio::test]
    async fn test_closing_recipient_is_requeued() {
        let (router, store, registry, alice, bob) = setup().await;
        let (outbox, _rx) = Outbox::new(ConnectionId(1));
        registry.add(bob, "bob", outbox.clone()).await;
        outbox.mark_closing();

        let delivery = router.deliver(alice, "alice", "bob", "hi").await.unwrap();
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(store.count_pending(bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flush_in_order_then_empty() {
        let (router, _store, _registry, alice, bob) = setup().await;
        router.deliver(alice, "alice", "bob", "one").await.unwrap();
        router.deliver(alice, "alice", "bob", "two").await.unwrap();

        let (outbox, mut rx) = Outbox::new(ConnectionId(2));
        assert_eq!(router.flush_pending(bob, &outbox).await, 2);

        let first = relay(rx.try_recv().unwrap());
        let second = relay(rx.try_recv().unwrap());
        assert_eq!((first.content.as_str(), second.content.as_str()), ("one", "two"));
        assert!(first.stored && first.original_time.is_some());
        assert_eq!(first.from, "alice");

        assert_eq!(router.flush_pending(bob, &outbox).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_to_closed_connection_requeues() {
        let (router, store, _registry, alice, bob) = setup().await;
        router.deliver(alice, "alice", "bob", "one").await.unwrap();

        let (outbox, _rx) = Outbox::new(ConnectionId(2));
        outbox.mark_closing();
        assert_eq!(router.flush_pending(bob, &outbox).await, 0);
        assert_eq!(store.count_pending(bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_typing_only_reaches_online_users() {
        let (router, _store, registry, _alice, bob) = setup().await;
        assert!(!router.relay_typing("alice", "bob", true).await);

        let (outbox, mut rx) = Outbox::new(ConnectionId(3));
        registry.add(bob, "bob", outbox).await;
        assert!(router.relay_typing("alice", "bob", true).await);

        match rx.try_recv().unwrap() {
            ServerFrame::Typing(t) => {
                assert_eq!(t.from, "alice");
                assert!(t.is_typing);
            }
            other => panic!("expected typing frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_live_message_waits_for_login_flush() {
        let (router, _store, registry, alice, bob) = setup().await;
        router.deliver(alice, "alice", "bob", "m1").await.unwrap();

        // Bob is mid-login: registered, stored messages not yet flushed.
        let (outbox, mut rx) = Outbox::new(ConnectionId(4));
        let inbox = router.lock_inbox(bob).await;
        registry.add(bob, "bob", outbox.clone()).await;

        let sender = router.clone();
        let live = tokio::spawn(async move { sender.deliver(alice, "alice", "bob", "m2").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "m2 was pushed before the flush");

        assert_eq!(router.flush_pending(bob, &outbox).await, 1);
        drop(inbox);
        assert_eq!(live.await.unwrap().unwrap(), Delivery::Relayed);

        let order: Vec<String> = (0..2).map(|_| relay(rx.try_recv().unwrap()).content).collect();
        assert_eq!(order, ["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_login_racing_delivery_keeps_order_and_loses_nothing() {
        for round in 0..20u64 {
            let (router, store, registry, alice, bob) = setup().await;
            router.deliver(alice, "alice", "bob", "m1").await.unwrap();

            let (outbox, mut rx) = Outbox::new(ConnectionId(round));
            let login = async {
                let _inbox = router.lock_inbox(bob).await;
                registry.add(bob, "bob", outbox.clone()).await;
                router.flush_pending(bob, &outbox).await;
            };
            let (_, delivered) = tokio::join!(login, router.deliver(alice, "alice", "bob", "m2"));
            delivered.unwrap();

            let order: Vec<String> = (0..2).map(|_| relay(rx.try_recv().unwrap()).content).collect();
            assert_eq!(order, ["m1", "m2"], "round {round}");
            assert_eq!(store.count_pending(bob).await.unwrap(), 0, "round {round}");
        }
    }
}
