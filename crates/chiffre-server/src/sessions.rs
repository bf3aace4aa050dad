//! Session registry.
//!
//! Process-wide presence state: which users currently have a connection and
//! which peer, if any, each of them is actively viewing. The map never leaks
//! out of this component -- callers get atomic operations only, so there is
//! no way to observe or mutate it without holding the internal lock.
//!
//! Sessions are ephemeral by design: a crash loses them all, and clients
//! reconnect and re-announce presence.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::info;

use chiffre_proto::Envelope;

/// Outcome of attempting to push an envelope to a user's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Handed to the connection's writer task.
    Delivered,
    /// No session registered for the user.
    Offline,
    /// A session existed but its channel was closed; the stale entry has
    /// been evicted.
    Stale,
}

struct Session {
    display_name: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    active_partner: Option<String>,
}

/// Thread-safe username -> session map. Keys are normalized usernames.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user as online. A second login for the same user replaces
    /// the earlier session (last login wins).
    pub async fn register(
        &self,
        username: &str,
        display_name: &str,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) {
        let session = Session {
            display_name: display_name.to_string(),
            outbound,
            active_partner: None,
        };
        let replaced = self
            .inner
            .write()
            .await
            .insert(username.to_string(), session);

        if replaced.is_some() {
            info!(user = %username, "session replaced by a newer login");
        } else {
            info!(user = %username, "user connected");
        }
    }

    /// Remove a user's session and chat-partner state. Idempotent; safe to
    /// call for users that never logged in.
    pub async fn remove(&self, username: &str) {
        if self.inner.write().await.remove(username).is_some() {
            info!(user = %username, "user disconnected");
        }
    }

    /// Remove a user's session only if it still belongs to the given
    /// connection channel.
    ///
    /// Disconnect cleanup uses this so that a dying connection cannot evict
    /// the session of a newer login under the same username.
    pub async fn remove_matching(
        &self,
        username: &str,
        outbound: &mpsc::UnboundedSender<Envelope>,
    ) {
        let mut sessions = self.inner.write().await;
        let owns_session = sessions
            .get(username)
            .map(|session| session.outbound.same_channel(outbound))
            .unwrap_or(false);
        if owns_session {
            sessions.remove(username);
            info!(user = %username, "user disconnected");
        }
    }

    /// Record which peer `username` is actively viewing (`None` = no chat
    /// open). No-op when the user has no session.
    pub async fn set_partner(&self, username: &str, partner: Option<String>) {
        if let Some(session) = self.inner.write().await.get_mut(username) {
            session.active_partner = partner;
        }
    }

    /// The peer `username` is actively viewing, if any.
    pub async fn partner_of(&self, username: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(username)
            .and_then(|s| s.active_partner.clone())
    }

    pub async fn is_online(&self, username: &str) -> bool {
        self.inner.read().await.contains_key(username)
    }

    pub async fn display_name_of(&self, username: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(username)
            .map(|s| s.display_name.clone())
    }

    pub async fn online_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Push an envelope to a user's connection, evicting the session if its
    /// channel turns out to be dead.
    pub async fn push(&self, username: &str, envelope: Envelope) -> PushOutcome {
        let mut sessions = self.inner.write().await;
        let Some(session) = sessions.get(username) else {
            return PushOutcome::Offline;
        };

        if session.outbound.send(envelope).is_ok() {
            PushOutcome::Delivered
        } else {
            sessions.remove(username);
            info!(user = %username, "evicted stale session");
            PushOutcome::Stale
        }
    }
}
