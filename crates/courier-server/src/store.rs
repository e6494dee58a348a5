//! Async handle over the SQLite store.
//!
//! `rusqlite` is blocking, so every call runs on tokio's blocking pool
//! behind a process-wide mutex. Each call is atomic from the caller's
//! point of view; the await on it is one of a connection task's
//! suspension points.

use std::sync::{Arc, Mutex};

use courier_shared::types::UserId;
use courier_store::{Database, StoredMessage, User};

use crate::error::ServerError;

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&mut Database) -> courier_store::StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| ServerError::StoreLockPoisoned)?;
            f(&mut *guard).map_err(ServerError::from)
        })
        .await?
    }

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: String,
    ) -> Result<User, ServerError> {
        let username = username.to_string();
        let email = email.to_string();
        self.run(move |db| db.create_user(&username, &email, &password_hash))
            .await
    }

    pub async fn find_user_by_name(&self, username: &str) -> Result<Option<User>, ServerError> {
        let username = username.to_string();
        self.run(move |db| db.find_user_by_name(&username)).await
    }

    pub async fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, ServerError> {
        self.run(move |db| db.find_user_by_id(id)).await
    }

    pub async fn append_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
        delivered: bool,
    ) -> Result<StoredMessage, ServerError> {
        let content = content.to_string();
        self.run(move |db| db.append_message(sender_id, receiver_id, &content, delivered))
            .await
    }

    pub async fn fetch_and_clear_pending_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredMessage>, ServerError> {
        self.run(move |db| db.fetch_and_clear_pending_for(user_id))
            .await
    }

    pub async fn requeue_message(&self, id: i64) -> Result<(), ServerError> {
        self.run(move |db| db.requeue_message(id)).await
    }

    /// Run raw SQL against the database, for tests that need to break it.
    #[cfg(test)]
    pub async fn execute_batch(&self, sql: &'static str) -> Result<(), ServerError> {
        self.run(move |db| Ok(db.conn().execute_batch(sql)?)).await
    }

    #[cfg(test)]
    pub async fn count_pending(&self, user_id: UserId) -> Result<u64, ServerError> {
        self.run(move |db| db.count_pending(user_id)).await
    }
}
