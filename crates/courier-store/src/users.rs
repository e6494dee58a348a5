use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::types::UserId;

use crate::database::Database;
use crate::error::{map_insert_error, Result};
use crate::models::User;

const USER_COLUMNS: &str = "id, username, email, password_hash, created_at";

impl Database {
    /// Insert a new user. Fails with [`StoreError::AlreadyExists`] when the
    /// username or email is taken.
    ///
    /// [`StoreError::AlreadyExists`]: crate::StoreError::AlreadyExists
    pub fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<User> {
        let now = Utc::now();

        self.conn()
            .execute(
                "INSERT INTO users (username, email, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![username, email, password_hash, now.to_rfc3339()],
            )
            .map_err(map_insert_error)?;

        Ok(User {
            id: UserId(self.conn().last_insert_rowid()),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now,
        })
    }

    pub fn find_user_by_name(&self, username: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_user_by_id(&self, id: UserId) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.0],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let ts_str: String = row.get(4)?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(User {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;

    #[test]
    fn create_and_find() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "alice@example.com", "h1").unwrap();

        let by_name = db.find_user_by_name("alice").unwrap().unwrap();
        assert_eq!(by_name, alice);

        let by_id = db.find_user_by_id(alice.id).unwrap().unwrap();
        assert_eq!(by_id.username, "alice");
        assert_eq!(by_id.password_hash, "h1");
    }

    #[test]
    fn ids_are_unique() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("alice", "a@example.com", "h").unwrap();
        let b = db.create_user("bob", "b@example.com", "h").unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn duplicate_username_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", "a@example.com", "h").unwrap();

        let err = db.create_user("alice", "other@example.com", "h").unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
    }

    #[test]
    fn duplicate_email_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", "a@example.com", "h").unwrap();

        let err = db.create_user("alicia", "a@example.com", "h").unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
    }

    #[test]
    fn usernames_are_case_sensitive() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", "a@example.com", "h").unwrap();

        assert!(db.find_user_by_name("Alice").unwrap().is_none());
        assert!(db.create_user("Alice", "b@example.com", "h").is_ok());
    }

    #[test]
    fn missing_user_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.find_user_by_name("ghost").unwrap().is_none());
        assert!(db.find_user_by_id(UserId(99)).unwrap().is_none());
    }
}
