//! Domain model structs persisted in the server database.

use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account.
///
/// `username` is the normalized (lowercased) identity key used for every
/// comparison; `display_name` preserves the casing chosen at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub display_name: String,
    /// Hex-encoded salted digest of the password.
    pub password_hash: String,
    /// Hex-encoded random salt.
    pub salt: String,
    /// Normalized base64 public key, if the client has announced one.
    pub public_key: Option<String>,
    /// Consecutive failed login attempts since the last success or lockout.
    pub failed_attempts: u32,
    /// How many lockouts this account has already served.
    pub lockout_stage: u32,
    /// When the current lockout ends. `None` when the account is not locked.
    pub lockout_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Pending friend requests
// ---------------------------------------------------------------------------

/// The unresolved request edges touching one user, split by direction.
/// Names carry display casing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingRequests {
    /// Users who have requested to befriend this user.
    pub incoming: Vec<String>,
    /// Users this user has requested to befriend.
    pub outgoing: Vec<String>,
}

// ---------------------------------------------------------------------------
// Undelivered messages
// ---------------------------------------------------------------------------

/// A ciphertext message awaiting delivery.
///
/// `id` is the SQLite rowid; per (sender, recipient) pair, ascending `id`
/// order is insertion order, which is the delivery order the relay must
/// preserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: i64,
    pub sender: String,
    pub recipient: String,
    /// Opaque ciphertext; the server never interprets it.
    pub cipher: String,
    pub queued_at: DateTime<Utc>,
    pub delivered: bool,
}
