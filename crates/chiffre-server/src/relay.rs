//! Message relay.
//!
//! Decides between forwarding a ciphertext envelope to a live connection and
//! parking it in the undelivered queue. A direct push happens only when the
//! receiver is online *and* actively viewing a chat with the sender; in any
//! other case -- offline, online-but-elsewhere, or a push that fails against
//! a dead connection -- the message is queued and delivered later through a
//! history request, preserving per-pair FIFO order.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use chiffre_proto::keys::normalize_public_key;
use chiffre_proto::{Envelope, MessageKind};
use chiffre_store::Store;

use crate::auth::normalize_username;
use crate::error::ServerError;
use crate::sessions::{PushOutcome, SessionRegistry};

/// How [`MessageRelay::relay`] disposed of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed directly to the receiver's connection.
    Forwarded,
    /// Appended to the undelivered queue.
    Queued,
}

/// Result of a public-key lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLookup {
    Key(String),
    NoKey,
    UnknownUser,
}

pub struct MessageRelay {
    store: Arc<Store>,
    registry: Arc<SessionRegistry>,
}

impl MessageRelay {
    pub fn new(store: Arc<Store>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Forward `cipher` from `sender` (normalized key) to the named
    /// recipient, or queue it.
    pub async fn relay(
        &self,
        sender: &str,
        sender_display: &str,
        recipient: &str,
        cipher: &str,
    ) -> Result<Delivery, ServerError> {
        let recipient_key = normalize_username(recipient);

        let in_chat_with_sender =
            self.registry.partner_of(&recipient_key).await.as_deref() == Some(sender);
        if in_chat_with_sender {
            let envelope =
                Envelope::new(MessageKind::ChatMessage, sender_display, recipient, cipher);
            match self.registry.push(&recipient_key, envelope).await {
                PushOutcome::Delivered => {
                    debug!(from = %sender, to = %recipient_key, "message forwarded directly");
                    return Ok(Delivery::Forwarded);
                }
                PushOutcome::Offline | PushOutcome::Stale => {
                    warn!(to = %recipient_key, "direct push failed, queueing instead");
                }
            }
        }

        self.store
            .enqueue(sender, &recipient_key, cipher, Utc::now())?;
        debug!(from = %sender, to = %recipient_key, "message queued for later delivery");
        Ok(Delivery::Queued)
    }

    /// Drain the undelivered queue from `peer` to `me`, pushing each message
    /// in insertion order, then purge what was delivered. Returns how many
    /// messages were delivered.
    ///
    /// Entries whose push fails stay queued for the next request; nothing is
    /// purged before it has been handed to the receiver's connection.
    pub async fn fetch_history(
        &self,
        me: &str,
        me_display: &str,
        peer: &str,
    ) -> Result<usize, ServerError> {
        let peer_key = normalize_username(peer);
        let queued = self.store.undelivered_for(me, &peer_key)?;
        if queued.is_empty() {
            debug!(user = %me, peer = %peer_key, "no undelivered messages");
            return Ok(0);
        }

        let peer_display = self
            .store
            .get_user(&peer_key)?
            .map(|u| u.display_name)
            .unwrap_or_else(|| peer_key.clone());

        let mut delivered = Vec::with_capacity(queued.len());
        for message in &queued {
            let envelope = Envelope::new(
                MessageKind::HistoryResponse,
                peer_display.clone(),
                me_display,
                message.cipher.clone(),
            );
            match self.registry.push(me, envelope).await {
                PushOutcome::Delivered => delivered.push(message.id),
                PushOutcome::Offline | PushOutcome::Stale => {
                    warn!(user = %me, "history push failed, keeping remainder queued");
                    break;
                }
            }
        }

        if !delivered.is_empty() {
            self.store.finish_delivery(me, &peer_key, &delivered)?;
        }
        debug!(
            user = %me,
            peer = %peer_key,
            count = delivered.len(),
            "history drained"
        );
        Ok(delivered.len())
    }

    /// Look up a user's announced public key. Never mutates state.
    pub fn request_public_key(&self, target: &str) -> Result<KeyLookup, ServerError> {
        let key = normalize_username(target);
        let Some(user) = self.store.get_user(&key)? else {
            return Ok(KeyLookup::UnknownUser);
        };

        Ok(match user.public_key {
            Some(stored) => KeyLookup::Key(normalize_public_key(&stored).unwrap_or(stored)),
            None => KeyLookup::NoKey,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn relay() -> (MessageRelay, Arc<SessionRegistry>, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(SessionRegistry::new());
        (
            MessageRelay::new(store.clone(), registry.clone()),
            registry,
            store,
        )
    }

    #[tokio::test]
    async fn test_direct_forward_when_receiver_in_chat() {
        let (relay, registry, store) = relay();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("bob", "Bob", tx).await;
        registry.set_partner("bob", Some("alice".into())).await;

        let delivery = relay.relay("alice", "Alice", "Bob", "cipher-1").await.unwrap();
        assert_eq!(delivery, Delivery::Forwarded);

        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.kind, MessageKind::ChatMessage);
        assert_eq!(pushed.sender, "Alice");
        assert_eq!(pushed.content, "cipher-1");

        // No queue entry was created for a direct forward.
        assert_eq!(store.undelivered_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_online_but_not_in_chat_queues() {
        let (relay, registry, store) = relay();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("bob", "Bob", tx).await;
        registry.set_partner("bob", Some("carol".into())).await;

        let delivery = relay.relay("alice", "Alice", "bob", "cipher-1").await.unwrap();
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(store.undelivered_count().unwrap(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_connection_degrades_to_queue() {
        let (relay, registry, store) = relay();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("bob", "Bob", tx).await;
        registry.set_partner("bob", Some("alice".into())).await;
        drop(rx);

        let delivery = relay.relay("alice", "Alice", "bob", "cipher-1").await.unwrap();
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(store.undelivered_count().unwrap(), 1);
        // The stale session was evicted on the failed push.
        assert!(!registry.is_online("bob").await);
    }

    #[tokio::test]
    async fn test_history_drains_fifo_exactly_once() {
        let (relay, registry, _store) = relay();

        // Bob is offline: both messages queue, in order.
        relay.relay("alice", "Alice", "bob", "m1").await.unwrap();
        relay.relay("alice", "Alice", "bob", "m2").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("bob", "Bob", tx).await;

        let count = relay.fetch_history("bob", "Bob", "alice").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(rx.recv().await.unwrap().content, "m1");
        assert_eq!(rx.recv().await.unwrap().content, "m2");

        // A second drain finds nothing.
        let count = relay.fetch_history("bob", "Bob", "alice").await.unwrap();
        assert_eq!(count, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_public_key_lookup() {
        let (relay, _registry, store) = relay();
        assert_eq!(
            relay.request_public_key("ghost").unwrap(),
            KeyLookup::UnknownUser
        );

        let auth = crate::auth::AuthAuthority::new(store);
        auth.register("Bob", "pw").unwrap();
        assert_eq!(relay.request_public_key("bob").unwrap(), KeyLookup::NoKey);

        auth.update_public_key("bob", "ab-cd_ef").unwrap();
        assert_eq!(
            relay.request_public_key("Bob").unwrap(),
            KeyLookup::Key("ab+cd/ef".into())
        );
    }
}
