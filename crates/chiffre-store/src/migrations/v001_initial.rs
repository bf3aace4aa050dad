//! v001 -- Initial schema creation.
//!
//! Creates the three persisted entity groups: `users`, the friend graph
//! (`friends` + `friend_requests`), and the `undelivered` message queue.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    username        TEXT PRIMARY KEY NOT NULL, -- normalized (lowercased) key
    display_name    TEXT NOT NULL,             -- casing chosen at registration
    password_hash   TEXT NOT NULL,             -- hex digest
    salt            TEXT NOT NULL,             -- hex
    public_key      TEXT,                      -- normalized base64, nullable
    failed_attempts INTEGER NOT NULL DEFAULT 0,
    lockout_stage   INTEGER NOT NULL DEFAULT 0,
    lockout_expiry  TEXT,                      -- ISO-8601 / RFC-3339, nullable
    created_at      TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Friend edges (symmetric: stored as two directed rows)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friends (
    username TEXT NOT NULL,
    friend   TEXT NOT NULL,

    PRIMARY KEY (username, friend)
);

-- ----------------------------------------------------------------
-- Pending friend-request edges (directed)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friend_requests (
    sender     TEXT NOT NULL,
    recipient  TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (sender, recipient)
);

CREATE INDEX IF NOT EXISTS idx_requests_recipient ON friend_requests(recipient);

-- ----------------------------------------------------------------
-- Undelivered messages (store-and-forward queue)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS undelivered (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    sender    TEXT NOT NULL,
    recipient TEXT NOT NULL,
    cipher    TEXT NOT NULL,                   -- opaque ciphertext
    queued_at TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0       -- boolean 0/1
);

CREATE INDEX IF NOT EXISTS idx_undelivered_pair
    ON undelivered(recipient, sender, delivered);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
