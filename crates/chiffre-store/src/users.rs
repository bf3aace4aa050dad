//! Credential-record CRUD.
//!
//! All lookups key on the normalized username. Single-row updates are
//! naturally atomic; the multi-table rename runs in one transaction so the
//! friend graph and message queue can never disagree with the user table
//! about who exists.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Store;
use crate::error::{Result, StoreError};
use crate::models::UserRecord;

impl Store {
    /// Insert a new user. Returns `false` (without writing) if the username
    /// key is already taken.
    pub fn create_user(&self, record: &UserRecord) -> Result<bool> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let taken: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![record.username],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO users (username, display_name, password_hash, salt, public_key,
                                failed_attempts, lockout_stage, lockout_expiry, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.username,
                record.display_name,
                record.password_hash,
                record.salt,
                record.public_key,
                record.failed_attempts,
                record.lockout_stage,
                record.lockout_expiry.map(|t| t.to_rfc3339()),
                record.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>> {
        self.conn()
            .query_row(
                "SELECT username, display_name, password_hash, salt, public_key,
                        failed_attempts, lockout_stage, lockout_expiry, created_at
                 FROM users WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn user_exists(&self, username: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Persist the outcome of one login attempt.
    pub fn update_lockout(
        &self,
        username: &str,
        failed_attempts: u32,
        lockout_stage: u32,
        lockout_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET failed_attempts = ?2, lockout_stage = ?3, lockout_expiry = ?4
             WHERE username = ?1",
            params![
                username,
                failed_attempts,
                lockout_stage,
                lockout_expiry.map(|t| t.to_rfc3339()),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_password(&self, username: &str, password_hash: &str, salt: &str) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET password_hash = ?2, salt = ?3 WHERE username = ?1",
            params![username, password_hash, salt],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_public_key(&self, username: &str, public_key: &str) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET public_key = ?2 WHERE username = ?1",
            params![username, public_key],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Rename a user, rewriting every reference across the friend graph and
    /// the message queue in one transaction.
    ///
    /// Returns `false` if the old key does not exist or the new key is taken
    /// by a different user (a pure casing change of one's own name is fine).
    pub fn rename_user(&self, old: &str, new: &str, new_display: &str) -> Result<bool> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![old],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }

        if new != old {
            let taken: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM users WHERE username = ?1",
                    params![new],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Ok(false);
            }
        }

        tx.execute(
            "UPDATE users SET username = ?2, display_name = ?3 WHERE username = ?1",
            params![old, new, new_display],
        )?;
        tx.execute(
            "UPDATE friends SET username = ?2 WHERE username = ?1",
            params![old, new],
        )?;
        tx.execute(
            "UPDATE friends SET friend = ?2 WHERE friend = ?1",
            params![old, new],
        )?;
        tx.execute(
            "UPDATE friend_requests SET sender = ?2 WHERE sender = ?1",
            params![old, new],
        )?;
        tx.execute(
            "UPDATE friend_requests SET recipient = ?2 WHERE recipient = ?1",
            params![old, new],
        )?;
        tx.execute(
            "UPDATE undelivered SET sender = ?2 WHERE sender = ?1",
            params![old, new],
        )?;
        tx.execute(
            "UPDATE undelivered SET recipient = ?2 WHERE recipient = ?1",
            params![old, new],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Case-insensitive substring search over usernames, excluding `exclude`.
    /// Returns display names in key order.
    pub fn search_users(&self, needle: &str, exclude: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT display_name FROM users
             WHERE instr(username, ?1) > 0 AND username <> ?2
             ORDER BY username",
        )?;
        let rows = stmt.query_map(params![needle, exclude], |row| row.get(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    pub fn user_count(&self) -> Result<u64> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let lockout_expiry: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok(UserRecord {
        username: row.get(0)?,
        display_name: row.get(1)?,
        password_hash: row.get(2)?,
        salt: row.get(3)?,
        public_key: row.get(4)?,
        failed_attempts: row.get(5)?,
        lockout_stage: row.get(6)?,
        lockout_expiry: lockout_expiry
            .map(|ts| parse_rfc3339(&ts, 7))
            .transpose()?,
        created_at: parse_rfc3339(&created_at, 8)?,
    })
}

fn parse_rfc3339(ts: &str, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user(name: &str) -> UserRecord {
        UserRecord {
            username: name.to_lowercase(),
            display_name: name.to_string(),
            password_hash: "aa".repeat(32),
            salt: "bb".repeat(16),
            public_key: None,
            failed_attempts: 0,
            lockout_stage: 0,
            lockout_expiry: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_and_get_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.create_user(&sample_user("Alice")).unwrap());

        let loaded = store.get_user("alice").unwrap().unwrap();
        assert_eq!(loaded.display_name, "Alice");
        assert_eq!(loaded.failed_attempts, 0);
        assert!(loaded.lockout_expiry.is_none());

        assert!(store.get_user("nobody").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_username_refused() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.create_user(&sample_user("Alice")).unwrap());
        // Same normalized key, different casing.
        assert!(!store.create_user(&sample_user("ALICE")).unwrap());
    }

    #[test]
    fn test_lockout_fields_persist() {
        let store = Store::open_in_memory().unwrap();
        store.create_user(&sample_user("alice")).unwrap();

        let expiry = Utc::now() + chrono::Duration::minutes(5);
        store
            .update_lockout("alice", 3, 1, Some(expiry))
            .unwrap();

        let loaded = store.get_user("alice").unwrap().unwrap();
        assert_eq!(loaded.failed_attempts, 3);
        assert_eq!(loaded.lockout_stage, 1);
        assert_eq!(
            loaded.lockout_expiry.unwrap().timestamp(),
            expiry.timestamp()
        );
    }

    #[test]
    fn test_update_missing_user_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.update_password("ghost", "xx", "yy"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_rename_rewrites_references() {
        let store = Store::open_in_memory().unwrap();
        store.create_user(&sample_user("Alice")).unwrap();
        store.create_user(&sample_user("Bob")).unwrap();

        store.insert_request("alice", "bob", Utc::now()).unwrap();
        store.enqueue("bob", "alice", "cipher", Utc::now()).unwrap();

        assert!(store.rename_user("alice", "alicia", "Alicia").unwrap());

        assert!(store.get_user("alice").unwrap().is_none());
        assert_eq!(
            store.get_user("alicia").unwrap().unwrap().display_name,
            "Alicia"
        );
        let pending = store.pending_for("bob").unwrap();
        assert_eq!(pending.incoming, vec!["Alicia".to_string()]);
        let queued = store.undelivered_for("alicia", "bob").unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[test]
    fn test_rename_to_taken_name_refused() {
        let store = Store::open_in_memory().unwrap();
        store.create_user(&sample_user("Alice")).unwrap();
        store.create_user(&sample_user("Bob")).unwrap();

        assert!(!store.rename_user("alice", "bob", "Bob").unwrap());
        // Casing-only change of one's own name is allowed.
        assert!(store.rename_user("alice", "alice", "ALICE").unwrap());
        assert_eq!(
            store.get_user("alice").unwrap().unwrap().display_name,
            "ALICE"
        );
    }

    #[test]
    fn test_search_excludes_self() {
        let store = Store::open_in_memory().unwrap();
        store.create_user(&sample_user("Anna")).unwrap();
        store.create_user(&sample_user("Annika")).unwrap();
        store.create_user(&sample_user("Bob")).unwrap();

        let hits = store.search_users("ann", "anna").unwrap();
        assert_eq!(hits, vec!["Annika".to_string()]);
        assert!(store.search_users("zzz", "anna").unwrap().is_empty());
    }
}
