//! # chiffre-store
//!
//! Durable server-side state for Chiffre, backed by SQLite.
//!
//! The crate exposes a [`Store`] handle that wraps a `rusqlite::Connection`
//! and provides typed helpers for the three persisted entities: credential
//! records, friend/pending-request edges, and the undelivered-message queue.
//!
//! Every mutation runs inside a transaction scoped to the affected rows, so
//! two connection tasks operating on overlapping users cannot lose an update
//! the way a load-everything/save-everything cycle would. Usernames are keyed
//! by their lowercased form; the registration casing is kept in
//! `display_name` for presentation.

pub mod database;
pub mod friends;
pub mod migrations;
pub mod models;
pub mod queue;
pub mod users;

mod error;

pub use database::Store;
pub use error::{Result, StoreError};
pub use friends::RequestInsert;
pub use models::*;
