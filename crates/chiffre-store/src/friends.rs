//! Friend-edge and pending-request CRUD.
//!
//! Friendship is symmetric and stored as two directed rows; both rows are
//! always written or removed inside one transaction, so a reader can never
//! observe a half-friendship. Pending requests are single directed rows.
//!
//! Reads join `users` so callers get display casing back, not the
//! normalized keys the edges are stored under.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Store;
use crate::error::Result;
use crate::models::PendingRequests;

/// Outcome of [`Store::try_insert_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestInsert {
    Inserted,
    /// One of the endpoints is not a registered user.
    UnknownUser,
    /// The two users are already friends; no pending edge may exist.
    AlreadyFriends,
    /// An identical pending edge already exists.
    AlreadyPending,
}

impl Store {
    pub fn are_friends(&self, a: &str, b: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM friends WHERE username = ?1 AND friend = ?2",
                params![a, b],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn request_exists(&self, sender: &str, recipient: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM friend_requests WHERE sender = ?1 AND recipient = ?2",
                params![sender, recipient],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record a pending request edge. Inserting an edge that already exists
    /// is a no-op.
    pub fn insert_request(
        &self,
        sender: &str,
        recipient: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO friend_requests (sender, recipient, created_at)
             VALUES (?1, ?2, ?3)",
            params![sender, recipient, created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Validate and record a pending request edge in one transaction.
    ///
    /// The invariant checks (both users exist, not already friends, no
    /// duplicate edge) and the insert happen atomically, so a concurrent
    /// accept or remove on the same pair can never leave a pending edge
    /// between users who are already friends.
    pub fn try_insert_request(
        &self,
        sender: &str,
        recipient: &str,
        created_at: DateTime<Utc>,
    ) -> Result<RequestInsert> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let users: i64 = tx.query_row(
            "SELECT COUNT(*) FROM users WHERE username IN (?1, ?2)",
            params![sender, recipient],
            |row| row.get(0),
        )?;
        if users != 2 {
            return Ok(RequestInsert::UnknownUser);
        }

        let friends: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM friends WHERE username = ?1 AND friend = ?2",
                params![sender, recipient],
                |row| row.get(0),
            )
            .optional()?;
        if friends.is_some() {
            return Ok(RequestInsert::AlreadyFriends);
        }

        let pending: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM friend_requests WHERE sender = ?1 AND recipient = ?2",
                params![sender, recipient],
                |row| row.get(0),
            )
            .optional()?;
        if pending.is_some() {
            return Ok(RequestInsert::AlreadyPending);
        }

        tx.execute(
            "INSERT INTO friend_requests (sender, recipient, created_at) VALUES (?1, ?2, ?3)",
            params![sender, recipient, created_at.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(RequestInsert::Inserted)
    }

    /// Remove the directed `(sender, recipient)` pending edge, if present.
    pub fn delete_request(&self, sender: &str, recipient: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM friend_requests WHERE sender = ?1 AND recipient = ?2",
            params![sender, recipient],
        )?;
        Ok(())
    }

    /// Resolve a pending request into a friendship.
    ///
    /// Removes any pending edge between the two users in either direction
    /// and inserts the symmetric friend edge, all in one transaction.
    pub fn accept_request(&self, requester: &str, target: &str) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "DELETE FROM friend_requests
             WHERE (sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1)",
            params![requester, target],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO friends (username, friend) VALUES (?1, ?2)",
            params![requester, target],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO friends (username, friend) VALUES (?1, ?2)",
            params![target, requester],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove the symmetric friend edge in both directions.
    pub fn remove_friend(&self, user: &str, friend: &str) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "DELETE FROM friends
             WHERE (username = ?1 AND friend = ?2) OR (username = ?2 AND friend = ?1)",
            params![user, friend],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Display names of `username`'s friends, in key order.
    pub fn friends_of(&self, username: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT COALESCE(u.display_name, f.friend)
             FROM friends f LEFT JOIN users u ON u.username = f.friend
             WHERE f.username = ?1
             ORDER BY f.friend",
        )?;
        let rows = stmt.query_map(params![username], |row| row.get(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Pending request edges touching `username`, split by direction.
    pub fn pending_for(&self, username: &str) -> Result<PendingRequests> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT COALESCE(u.display_name, r.sender)
             FROM friend_requests r LEFT JOIN users u ON u.username = r.sender
             WHERE r.recipient = ?1
             ORDER BY r.created_at, r.sender",
        )?;
        let rows = stmt.query_map(params![username], |row| row.get(0))?;
        let mut incoming = Vec::new();
        for row in rows {
            incoming.push(row?);
        }

        let mut stmt = conn.prepare(
            "SELECT COALESCE(u.display_name, r.recipient)
             FROM friend_requests r LEFT JOIN users u ON u.username = r.recipient
             WHERE r.sender = ?1
             ORDER BY r.created_at, r.recipient",
        )?;
        let rows = stmt.query_map(params![username], |row| row.get(0))?;
        let mut outgoing = Vec::new();
        for row in rows {
            outgoing.push(row?);
        }

        Ok(PendingRequests { incoming, outgoing })
    }
}
