//! Undelivered-message queue CRUD.
//!
//! The relay appends here whenever a message cannot be pushed to a live
//! connection, and drains on a history request. Per (sender, recipient)
//! pair, rowid order is insertion order, so ascending-id reads give the
//! FIFO delivery the protocol promises.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Store;
use crate::error::Result;
use crate::models::QueuedMessage;

impl Store {
    /// Append a ciphertext message for later delivery. Returns the queue id.
    pub fn enqueue(
        &self,
        sender: &str,
        recipient: &str,
        cipher: &str,
        queued_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO undelivered (sender, recipient, cipher, queued_at, delivered)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![sender, recipient, cipher, queued_at.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Undelivered messages from `peer` addressed to `recipient`, oldest
    /// first.
    pub fn undelivered_for(&self, recipient: &str, peer: &str) -> Result<Vec<QueuedMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, sender, recipient, cipher, queued_at, delivered
             FROM undelivered
             WHERE recipient = ?1 AND sender = ?2 AND delivered = 0
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![recipient, peer], row_to_queued)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Mark the given queue entries delivered, then purge every delivered
    /// entry for the `(peer -> recipient)` pair. One transaction, so a
    /// concurrent enqueue for the same pair is never caught half-drained.
    pub fn finish_delivery(&self, recipient: &str, peer: &str, ids: &[i64]) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        for id in ids {
            tx.execute(
                "UPDATE undelivered SET delivered = 1 WHERE id = ?1",
                params![id],
            )?;
        }
        tx.execute(
            "DELETE FROM undelivered WHERE recipient = ?1 AND sender = ?2 AND delivered = 1",
            params![recipient, peer],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Total undelivered entries across all pairs.
    pub fn undelivered_count(&self) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM undelivered WHERE delivered = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_queued(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let queued_at: String = row.get(4)?;
    let delivered: i64 = row.get(5)?;

    Ok(QueuedMessage {
        id: row.get(0)?,
        sender: row.get(1)?,
        recipient: row.get(2)?,
        cipher: row.get(3)?,
        queued_at: DateTime::parse_from_rfc3339(&queued_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        delivered: delivered != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_per_pair() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue("alice", "bob", "m1", Utc::now()).unwrap();
        store.enqueue("carol", "bob", "other", Utc::now()).unwrap();
        store.enqueue("alice", "bob", "m2", Utc::now()).unwrap();

        let queued = store.undelivered_for("bob", "alice").unwrap();
        let ciphers: Vec<_> = queued.iter().map(|m| m.cipher.as_str()).collect();
        assert_eq!(ciphers, vec!["m1", "m2"]);
    }

    #[test]
    fn test_finish_delivery_drains_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue("alice", "bob", "m1", Utc::now()).unwrap();
        store.enqueue("alice", "bob", "m2", Utc::now()).unwrap();
        // Reverse direction must survive the drain.
        store.enqueue("bob", "alice", "reply", Utc::now()).unwrap();

        let queued = store.undelivered_for("bob", "alice").unwrap();
        let ids: Vec<i64> = queued.iter().map(|m| m.id).collect();
        store.finish_delivery("bob", "alice", &ids).unwrap();

        assert!(store.undelivered_for("bob", "alice").unwrap().is_empty());
        assert_eq!(store.undelivered_for("alice", "bob").unwrap().len(), 1);
    }

    #[test]
    fn test_partial_delivery_keeps_remainder() {
        let store = Store::open_in_memory().unwrap();
        let first = store.enqueue("alice", "bob", "m1", Utc::now()).unwrap();
        store.enqueue("alice", "bob", "m2", Utc::now()).unwrap();

        store.finish_delivery("bob", "alice", &[first]).unwrap();

        let left = store.undelivered_for("bob", "alice").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].cipher, "m2");
        assert_eq!(store.undelivered_count().unwrap(), 1);
    }
}
