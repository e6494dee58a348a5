//! # courier-store
//!
//! Durable storage for the courier server, backed by SQLite.
//!
//! Holds the user directory (credentials included) and every accepted
//! direct message. Messages addressed to offline users double as their
//! pending queue: they stay flagged undelivered until the recipient's next
//! login flushes them. The crate exposes a synchronous [`Database`] handle
//! that wraps a `rusqlite::Connection`.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result as StoreResult, StoreError};
pub use models::*;
