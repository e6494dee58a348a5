//! Shared fixtures for the server's unit tests.

use std::sync::Arc;

use courier_shared::types::UserId;
use courier_store::Database;

use crate::credentials::{Blake3Credentials, CredentialVerifier};
use crate::dispatcher::Dispatcher;
use crate::registry::SessionRegistry;
use crate::store::Store;

pub const TEST_PASSWORD: &str = "password123";

pub fn memory_store() -> Store {
    Store::new(Database::open_in_memory().expect("in-memory database"))
}

/// Create `name` directly in the store, bypassing the protocol.
pub async fn register_user(store: &Store, name: &str) -> UserId {
    let hash = Blake3Credentials.hash(TEST_PASSWORD);
    store
        .create_user(name, &format!("{name}@example.com"), hash)
        .await
        .expect("create user")
        .id
}

pub fn dispatcher(store: Store) -> Dispatcher {
    dispatcher_with(store, SessionRegistry::new())
}

pub fn dispatcher_with(store: Store, registry: SessionRegistry) -> Dispatcher {
    Dispatcher::new(store, registry, Arc::new(Blake3Credentials))
}
