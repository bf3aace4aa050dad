//! # chiffre-proto
//!
//! The logical wire protocol shared by the Chiffre server and its clients.
//!
//! A conversation is a stream of [`Envelope`] records, one JSON object per
//! line. The server never interprets chat payloads -- the `content` of a
//! `CHAT_MESSAGE` is opaque ciphertext produced by the sending client and
//! decrypted only by the receiving client. This crate also owns the
//! normalization rules for the base64 public keys that clients exchange
//! through the server.

pub mod envelope;
pub mod keys;

mod error;

pub use envelope::{Envelope, MessageKind, SERVER_SENDER};
pub use error::ProtoError;
