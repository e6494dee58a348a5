//! Domain model structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::types::UserId;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Store-assigned numeric id.
    pub id: UserId,
    /// Unique, case-sensitive login name.
    pub username: String,
    pub email: String,
    /// Opaque verification material produced by the server's credential
    /// verifier. Never leaves the server.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A direct message between two users.
///
/// `delivered == false` means the message is still waiting for its
/// recipient's next login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    /// When the server accepted the message.
    pub sent_at: DateTime<Utc>,
    pub delivered: bool,
}
