use chrono::{DateTime, Utc};
use rusqlite::params;

use courier_shared::types::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::StoredMessage;

impl Database {
    /// Persist a message. `delivered` records whether the recipient had a
    /// live session when the message was accepted.
    pub fn append_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
        delivered: bool,
    ) -> Result<StoredMessage> {
        let now = Utc::now();

        self.conn().execute(
            "INSERT INTO messages (sender_id, receiver_id, content, sent_at, delivered)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sender_id.0, receiver_id.0, content, now.to_rfc3339(), delivered],
        )?;

        Ok(StoredMessage {
            id: self.conn().last_insert_rowid(),
            sender_id,
            receiver_id,
            content: content.to_string(),
            sent_at: now,
            delivered,
        })
    }

    /// Take every undelivered message addressed to `user_id`, oldest first,
    /// and mark them delivered in the same transaction.
    ///
    /// Two racing callers never both receive the same message.
    pub fn fetch_and_clear_pending_for(&mut self, user_id: UserId) -> Result<Vec<StoredMessage>> {
        let tx = self.conn_mut().transaction()?;

        let messages = {
            let mut stmt = tx.prepare(
                "SELECT id, sender_id, receiver_id, content, sent_at, delivered
                 FROM messages
                 WHERE receiver_id = ?1 AND delivered = 0
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![user_id.0], row_to_message)?;

            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            messages
        };

        tx.execute(
            "UPDATE messages SET delivered = 1 WHERE receiver_id = ?1 AND delivered = 0",
            params![user_id.0],
        )?;
        tx.commit()?;

        if !messages.is_empty() {
            tracing::debug!(user_id = %user_id, count = messages.len(), "cleared pending messages");
        }

        Ok(messages)
    }

    /// Put a message back into its recipient's pending queue.
    pub fn requeue_message(&self, id: i64) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET delivered = 0 WHERE id = ?1",
            params![id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Number of messages still waiting for `user_id`.
    pub fn count_pending(&self, user_id: UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND delivered = 0",
            params![user_id.0],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let ts_str: String = row.get(4)?;
    let sent_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(StoredMessage {
        id: row.get(0)?,
        sender_id: UserId(row.get(1)?),
        receiver_id: UserId(row.get(2)?),
        content: row.get(3)?,
        sent_at,
        delivered: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_users(db: &Database) -> (UserId, UserId) {
        let a = db.create_user("alice", "a@example.com", "h").unwrap();
        let b = db.create_user("bob", "b@example.com", "h").unwrap();
        (a.id, b.id)
    }

    #[test]
    fn pending_flush_preserves_append_order() {
        let mut db = Database::open_in_memory().unwrap();
        let (alice, bob) = two_users(&db);

        db.append_message(alice, bob, "one", false).unwrap();
        db.append_message(alice, bob, "two", false).unwrap();
        db.append_message(alice, bob, "three", false).unwrap();
        assert_eq!(db.count_pending(bob).unwrap(), 3);

        let pending = db.fetch_and_clear_pending_for(bob).unwrap();
        let contents: Vec<&str> = pending.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["one", "two", "three"]);
        assert!(pending.iter().all(|m| m.sender_id == alice && !m.delivered));
    }

    #[test]
    fn flush_is_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        let (alice, bob) = two_users(&db);
        db.append_message(alice, bob, "hi", false).unwrap();

        assert_eq!(db.fetch_and_clear_pending_for(bob).unwrap().len(), 1);
        assert!(db.fetch_and_clear_pending_for(bob).unwrap().is_empty());
        assert_eq!(db.count_pending(bob).unwrap(), 0);
    }

    #[test]
    fn delivered_messages_are_not_pending() {
        let mut db = Database::open_in_memory().unwrap();
        let (alice, bob) = two_users(&db);
        db.append_message(alice, bob, "live", true).unwrap();
        db.append_message(bob, alice, "for alice", false).unwrap();

        assert!(db.fetch_and_clear_pending_for(bob).unwrap().is_empty());
        assert_eq!(db.count_pending(alice).unwrap(), 1);
    }

    #[test]
    fn requeue_makes_message_pending_again() {
        let mut db = Database::open_in_memory().unwrap();
        let (alice, bob) = two_users(&db);
        let msg = db.append_message(alice, bob, "retry me", true).unwrap();

        db.requeue_message(msg.id).unwrap();
        let pending = db.fetch_and_clear_pending_for(bob).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "retry me");
    }

    #[test]
    fn requeue_unknown_message_fails() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.requeue_message(404), Err(StoreError::NotFound)));
    }
}
