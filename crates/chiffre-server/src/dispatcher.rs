//! Per-connection dispatcher.
//!
//! Each accepted TCP connection gets one task running [`run_connection`]:
//! read a JSON-line envelope, route it by kind, repeat until the stream
//! closes. Outgoing envelopes -- both replies on this connection and pushes
//! from other users' handlers -- flow through an unbounded channel drained
//! by a paired writer task, so no handler ever blocks on a slow peer socket.
//!
//! A connection authenticates at most one user (via `LOGIN`); user-scoped
//! operations act as that identity and ignore whatever the envelope's
//! `sender` field claims. Decode failures and unknown kinds are answered
//! with a generic error envelope, never by dropping the connection; any
//! failure of this connection is contained to this task plus an idempotent
//! session cleanup.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use chiffre_proto::{Envelope, MessageKind};
use chiffre_store::{PendingRequests, Store};

use crate::auth::{normalize_username, AuthAuthority, AuthOutcome};
use crate::error::ServerError;
use crate::friends::{FriendGraph, RequestDisposition};
use crate::relay::{KeyLookup, MessageRelay};
use crate::sessions::SessionRegistry;

/// Shared handles every connection works against.
pub struct ServerState {
    pub auth: AuthAuthority,
    pub friends: FriendGraph,
    pub relay: MessageRelay,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<Store>,
}

impl ServerState {
    pub fn new(store: Arc<Store>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            auth: AuthAuthority::new(store.clone()),
            friends: FriendGraph::new(store.clone()),
            relay: MessageRelay::new(store.clone(), registry.clone()),
            registry,
            store,
        }
    }
}

/// Whether the read loop keeps going after a handled envelope.
enum Flow {
    Continue,
    Close,
}

struct Connection {
    state: Arc<ServerState>,
    outbound: mpsc::UnboundedSender<Envelope>,
    /// `(normalized key, display name)`, set once `LOGIN` succeeds.
    user: Option<(String, String)>,
}

/// Drive one client connection until it closes or errors.
pub async fn run_connection(state: Arc<ServerState>, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbox) = mpsc::unbounded_channel::<Envelope>();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbox.recv().await {
            let line = match envelope.to_line() {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "failed to encode outgoing envelope");
                    continue;
                }
            };
            if write_half.write_all(line.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut conn = Connection {
        state: state.clone(),
        outbound: outbound.clone(),
        user: None,
    };
    let mut lines = BufReader::new(read_half).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let envelope = match Envelope::from_line(&line) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!(error = %e, "undecodable envelope");
                        conn.send_error("Unknown request.");
                        continue;
                    }
                };
                match conn.handle(envelope).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break,
                    Err(e) => {
                        error!(error = %e, "request handling failed");
                        conn.send_error("Internal server error.");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        }
    }

    // Idempotent cleanup: safe when the connection never logged in, and a
    // newer login under the same name keeps its session.
    if let Some((key, _)) = conn.user.take() {
        state.registry.remove_matching(&key, &outbound).await;
    }

    drop(conn);
    drop(outbound);
    let _ = writer.await;
}

impl Connection {
    fn send(&self, envelope: Envelope) {
        // A closed channel means the connection is already tearing down.
        let _ = self.outbound.send(envelope);
    }

    fn send_error(&self, text: &str) {
        let receiver = self
            .user
            .as_ref()
            .map(|(_, display)| display.clone())
            .unwrap_or_default();
        self.send(Envelope::from_server(MessageKind::Error, receiver, text));
    }

    /// The authenticated `(key, display)` pair, or an error envelope.
    fn require_login(&self) -> Option<(String, String)> {
        match &self.user {
            Some(user) => Some(user.clone()),
            None => {
                self.send_error("Not logged in.");
                None
            }
        }
    }

    async fn handle(&mut self, envelope: Envelope) -> Result<Flow, ServerError> {
        match envelope.kind {
            MessageKind::Register => self.handle_register(envelope),
            MessageKind::Login => self.handle_login(envelope).await,
            MessageKind::Logout => self.handle_logout().await,
            MessageKind::ChangePassword => self.handle_change_password(envelope),
            MessageKind::ChangeUsername => self.handle_change_username(envelope).await,
            MessageKind::UpdatePublicKey => self.handle_update_public_key(envelope),
            MessageKind::RequestPublicKey => self.handle_request_public_key(envelope),
            MessageKind::SearchUser => self.handle_search_user(envelope),
            MessageKind::SendFriendRequest => self.handle_send_friend_request(envelope).await,
            MessageKind::AcceptFriendRequest => self.handle_accept_request(envelope).await,
            MessageKind::RejectFriendRequest => self.handle_reject_request(envelope).await,
            MessageKind::RemoveFriend => self.handle_remove_friend(envelope).await,
            MessageKind::ViewPendingRequests => self.handle_view_pending(),
            MessageKind::ListFriends => self.handle_list_friends(),
            MessageKind::ChatStateUpdate => self.handle_chat_state(envelope).await,
            MessageKind::ChatMessage => self.handle_chat_message(envelope).await,
            MessageKind::HistoryRequest => self.handle_history_request(envelope).await,

            // Response kinds are server-originated; a client sending one is
            // a protocol error, answered like any other unknown request.
            MessageKind::RegisterSuccess
            | MessageKind::RegisterFailure
            | MessageKind::LoginSuccess
            | MessageKind::LoginFailure
            | MessageKind::LogoutSuccess
            | MessageKind::ChangePasswordSuccess
            | MessageKind::ChangePasswordFailure
            | MessageKind::ChangeUsernameSuccess
            | MessageKind::ChangeUsernameFailure
            | MessageKind::PublicKeyResponse
            | MessageKind::UserFound
            | MessageKind::UserNotFound
            | MessageKind::FriendRequestSent
            | MessageKind::FriendRequestFailed
            | MessageKind::FriendAdded
            | MessageKind::FriendAddFailed
            | MessageKind::FriendRequestRejected
            | MessageKind::FriendRequestRejectFailed
            | MessageKind::FriendRemoved
            | MessageKind::FriendRemoveFailed
            | MessageKind::PendingRequestsList
            | MessageKind::FriendsList
            | MessageKind::HistoryResponse
            | MessageKind::Error => {
                self.send_error("Unknown request.");
                Ok(Flow::Continue)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Account lifecycle
    // -----------------------------------------------------------------------

    fn handle_register(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let username = envelope.receiver;
        let pass = envelope.content;

        if username.trim().is_empty() || pass.is_empty() {
            self.send(Envelope::from_server(
                MessageKind::RegisterFailure,
                username,
                "Username & password required.",
            ));
            return Ok(Flow::Continue);
        }

        match self.state.auth.register(&username, &pass) {
            Ok(()) => self.send(Envelope::from_server(
                MessageKind::RegisterSuccess,
                username,
                "OK",
            )),
            Err(ServerError::UsernameTaken) => self.send(Envelope::from_server(
                MessageKind::RegisterFailure,
                username.clone(),
                format!("Username '{}' is already taken.", username.trim()),
            )),
            Err(e) => return Err(e),
        }
        Ok(Flow::Continue)
    }

    async fn handle_login(&mut self, envelope: Envelope) -> Result<Flow, ServerError> {
        let username = envelope.receiver;
        let pass = envelope.content;

        let outcome = self.state.auth.authenticate(&username, &pass)?;
        let reply = match outcome {
            AuthOutcome::Success => {
                let key = normalize_username(&username);
                let display = self
                    .state
                    .store
                    .get_user(&key)?
                    .map(|u| u.display_name)
                    .unwrap_or_else(|| username.clone());

                self.state
                    .registry
                    .register(&key, &display, self.outbound.clone())
                    .await;
                self.user = Some((key, display));
                Envelope::from_server(MessageKind::LoginSuccess, username, "OK")
            }
            AuthOutcome::NoSuchUser => Envelope::from_server(
                MessageKind::LoginFailure,
                username.clone(),
                format!("Account '{}' does not exist.", username),
            ),
            AuthOutcome::Locked { seconds_remaining } => Envelope::from_server(
                MessageKind::LoginFailure,
                username,
                format!("Account locked. Try again in {}s.", seconds_remaining),
            ),
            AuthOutcome::PermanentlyLocked => Envelope::from_server(
                MessageKind::LoginFailure,
                username,
                "Account permanently locked. Contact support.",
            ),
            AuthOutcome::BadPassword { tries_remaining } => Envelope::from_server(
                MessageKind::LoginFailure,
                username,
                format!("Password incorrect ({} tries left).", tries_remaining),
            ),
        };
        self.send(reply);
        Ok(Flow::Continue)
    }

    async fn handle_logout(&mut self) -> Result<Flow, ServerError> {
        let receiver = self
            .user
            .as_ref()
            .map(|(_, display)| display.clone())
            .unwrap_or_default();
        self.send(Envelope::from_server(
            MessageKind::LogoutSuccess,
            receiver,
            "OK",
        ));

        if let Some((key, _)) = self.user.take() {
            self.state
                .registry
                .remove_matching(&key, &self.outbound)
                .await;
        }
        Ok(Flow::Close)
    }

    fn handle_change_password(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };

        let (old, new) = match envelope.content.split_once(':') {
            Some((old, new)) => (old.to_string(), new.to_string()),
            None => (envelope.content, String::new()),
        };

        if !new.is_empty() && self.state.auth.change_password(&key, &old, &new)? {
            self.send(Envelope::from_server(
                MessageKind::ChangePasswordSuccess,
                display,
                "Password updated.",
            ));
        } else {
            self.send(Envelope::from_server(
                MessageKind::ChangePasswordFailure,
                display,
                "Could not change password.",
            ));
        }
        Ok(Flow::Continue)
    }

    async fn handle_change_username(&mut self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };

        let (new_name, pass) = match envelope.content.split_once(':') {
            Some((new_name, pass)) => (new_name.to_string(), pass.to_string()),
            None => (envelope.content, String::new()),
        };

        if self.state.auth.change_username(&key, &new_name, &pass)? {
            let new_key = normalize_username(&new_name);
            let new_display = new_name.trim().to_string();

            // Move the live session over to the new identity.
            self.state.registry.remove_matching(&key, &self.outbound).await;
            self.state
                .registry
                .register(&new_key, &new_display, self.outbound.clone())
                .await;
            self.user = Some((new_key, new_display.clone()));

            self.send(Envelope::from_server(
                MessageKind::ChangeUsernameSuccess,
                new_display.clone(),
                new_display,
            ));
        } else {
            self.send(Envelope::from_server(
                MessageKind::ChangeUsernameFailure,
                display,
                "Could not change username.",
            ));
        }
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // Public keys and search
    // -----------------------------------------------------------------------

    fn handle_update_public_key(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, _)) = self.require_login() else {
            return Ok(Flow::Continue);
        };
        // Malformed key material is logged inside; no response either way.
        self.state.auth.update_public_key(&key, &envelope.content)?;
        Ok(Flow::Continue)
    }

    fn handle_request_public_key(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((_, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };

        let content = match self.state.relay.request_public_key(&envelope.receiver)? {
            KeyLookup::Key(key) => key,
            KeyLookup::NoKey => "NO_KEY".to_string(),
            KeyLookup::UnknownUser => "USER_NOT_FOUND".to_string(),
        };
        self.send(Envelope::from_server(
            MessageKind::PublicKeyResponse,
            display,
            content,
        ));
        Ok(Flow::Continue)
    }

    fn handle_search_user(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };

        let needle = envelope.content.trim().to_lowercase();
        let matches = self.state.store.search_users(&needle, &key)?;
        if matches.is_empty() {
            self.send(Envelope::from_server(
                MessageKind::UserNotFound,
                display,
                envelope.content,
            ));
        } else {
            self.send(Envelope::from_server(
                MessageKind::UserFound,
                display,
                matches.join(","),
            ));
        }
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // Friend lifecycle
    // -----------------------------------------------------------------------

    async fn handle_send_friend_request(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };
        let target = envelope.content;

        match self.state.friends.send_request(&key, &target) {
            Ok(RequestDisposition::Sent) => {
                self.send(Envelope::from_server(
                    MessageKind::FriendRequestSent,
                    display,
                    format!("Request sent to {}", target.trim()),
                ));
                self.push_pending_list(&normalize_username(&target)).await?;
            }
            // Already-resolved states are acknowledged idempotently.
            Ok(RequestDisposition::AlreadyFriends) | Ok(RequestDisposition::AlreadyPending) => {
                self.send(Envelope::from_server(
                    MessageKind::FriendRequestSent,
                    display,
                    format!("Request sent to {}", target.trim()),
                ));
            }
            Ok(RequestDisposition::SelfRequest) => {
                self.send(Envelope::from_server(
                    MessageKind::FriendRequestFailed,
                    display,
                    "Cannot send a friend request to yourself.",
                ));
            }
            Ok(RequestDisposition::UnknownUser) => {
                self.send(Envelope::from_server(
                    MessageKind::FriendRequestFailed,
                    display,
                    format!("No such user: {}", target.trim()),
                ));
            }
            Err(e) => {
                warn!(error = %e, "friend request failed");
                self.send(Envelope::from_server(
                    MessageKind::FriendRequestFailed,
                    display,
                    "Error sending request",
                ));
            }
        }
        Ok(Flow::Continue)
    }

    /// Push a fresh pending-requests list to a user, if online.
    async fn push_pending_list(&self, user_key: &str) -> Result<(), ServerError> {
        if !self.state.registry.is_online(user_key).await {
            return Ok(());
        }
        let pending = self.state.friends.pending_for(user_key)?;
        let display = self
            .state
            .registry
            .display_name_of(user_key)
            .await
            .unwrap_or_else(|| user_key.to_string());
        self.state
            .registry
            .push(
                user_key,
                Envelope::from_server(
                    MessageKind::PendingRequestsList,
                    display,
                    format_pending(&pending),
                ),
            )
            .await;
        Ok(())
    }

    async fn handle_accept_request(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };
        let requester = envelope.content;
        let requester_key = normalize_username(&requester);

        match self.state.friends.accept_request(&requester_key, &key) {
            Ok(()) => {
                let requester_display = self
                    .state
                    .store
                    .get_user(&requester_key)?
                    .map(|u| u.display_name)
                    .unwrap_or_else(|| requester.trim().to_string());

                self.send(Envelope::from_server(
                    MessageKind::FriendAdded,
                    display.clone(),
                    requester_display.clone(),
                ));
                self.state
                    .registry
                    .push(
                        &requester_key,
                        Envelope::from_server(MessageKind::FriendAdded, requester_display, display),
                    )
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "accepting friend request failed");
                self.send(Envelope::from_server(
                    MessageKind::FriendAddFailed,
                    display,
                    "Error accepting request",
                ));
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_reject_request(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };
        let requester = envelope.content;
        let requester_key = normalize_username(&requester);

        match self.state.friends.reject_request(&requester_key, &key) {
            Ok(()) => {
                self.send(Envelope::from_server(
                    MessageKind::FriendRequestRejected,
                    display.clone(),
                    format!("Rejected friend request from {}", requester.trim()),
                ));
                self.state
                    .registry
                    .push(
                        &requester_key,
                        Envelope::from_server(
                            MessageKind::FriendRequestRejected,
                            requester.trim(),
                            format!("{} rejected your friend request", display),
                        ),
                    )
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "rejecting friend request failed");
                self.send(Envelope::from_server(
                    MessageKind::FriendRequestRejectFailed,
                    display,
                    "Error rejecting request",
                ));
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_remove_friend(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };
        let friend = envelope.content;
        let friend_key = normalize_username(&friend);

        match self.state.friends.remove_friend(&key, &friend_key) {
            Ok(()) => {
                self.send(Envelope::from_server(
                    MessageKind::FriendRemoved,
                    display.clone(),
                    format!("Removed friend: {}", friend.trim()),
                ));
                self.state
                    .registry
                    .push(
                        &friend_key,
                        Envelope::from_server(
                            MessageKind::FriendRemoved,
                            friend.trim(),
                            format!("{} has removed you", display),
                        ),
                    )
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "removing friend failed");
                self.send(Envelope::from_server(
                    MessageKind::FriendRemoveFailed,
                    display,
                    "Error removing friend",
                ));
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_view_pending(&self) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };
        let pending = self.state.friends.pending_for(&key)?;
        self.send(Envelope::from_server(
            MessageKind::PendingRequestsList,
            display,
            format_pending(&pending),
        ));
        Ok(Flow::Continue)
    }

    fn handle_list_friends(&self) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };
        let friends = self.state.friends.friends_of(&key)?;
        self.send(Envelope::from_server(
            MessageKind::FriendsList,
            display,
            friends.join(","),
        ));
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    async fn handle_chat_state(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, _)) = self.require_login() else {
            return Ok(Flow::Continue);
        };

        if envelope.content == "IN_CHAT" {
            let partner = normalize_username(&envelope.receiver);
            info!(user = %key, partner = %partner, "now viewing chat");
            self.state.registry.set_partner(&key, Some(partner)).await;
        } else {
            info!(user = %key, "no longer in a chat");
            self.state.registry.set_partner(&key, None).await;
        }
        Ok(Flow::Continue)
    }

    async fn handle_chat_message(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };

        // Payload is `cipher` optionally suffixed with a client-side chat
        // state hint; only the registry's partner state decides routing.
        let cipher = envelope
            .content
            .split_once('|')
            .map(|(cipher, _)| cipher)
            .unwrap_or(&envelope.content);

        self.state
            .relay
            .relay(&key, &display, &envelope.receiver, cipher)
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_history_request(&self, envelope: Envelope) -> Result<Flow, ServerError> {
        let Some((key, display)) = self.require_login() else {
            return Ok(Flow::Continue);
        };
        self.state
            .relay
            .fetch_history(&key, &display, &envelope.receiver)
            .await?;
        Ok(Flow::Continue)
    }
}

/// Wire encoding of a pending-requests snapshot:
/// `INCOMING:a,b;OUTGOING:c,d`.
fn format_pending(pending: &PendingRequests) -> String {
    format!(
        "INCOMING:{};OUTGOING:{}",
        pending.incoming.join(","),
        pending.outgoing.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;

    async fn spawn_server() -> std::net::SocketAddr {
        let state = Arc::new(ServerState::new(Arc::new(
            Store::open_in_memory().expect("in-memory store"),
        )));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(run_connection(state.clone(), stream));
            }
        });
        addr
    }

    struct TestClient {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: std::net::SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, write) = stream.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn send(&mut self, envelope: Envelope) {
            let mut line = envelope.to_line().unwrap();
            line.push('\n');
            self.write.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.write.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            let line = self.lines.next_line().await.unwrap().unwrap();
            Envelope::from_line(&line).unwrap()
        }

        async fn register_and_login(&mut self, name: &str) {
            self.send(Envelope::new(MessageKind::Register, "", name, "pw"))
                .await;
            assert_eq!(self.recv().await.kind, MessageKind::RegisterSuccess);
            self.send(Envelope::new(MessageKind::Login, "", name, "pw"))
                .await;
            assert_eq!(self.recv().await.kind, MessageKind::LoginSuccess);
        }
    }

    #[tokio::test]
    async fn test_offline_queue_and_history_drain_over_wire() {
        let addr = spawn_server().await;
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        alice.register_and_login("Alice").await;
        bob.register_and_login("Bob").await;

        // Bob is online but not viewing Alice: both messages queue.
        alice
            .send(Envelope::new(
                MessageKind::ChatMessage,
                "Alice",
                "Bob",
                "cipher-1|IN_CHAT",
            ))
            .await;
        alice
            .send(Envelope::new(
                MessageKind::ChatMessage,
                "Alice",
                "Bob",
                "cipher-2",
            ))
            .await;
        // Fence on Alice's connection so both messages are queued before
        // Bob asks for history.
        alice
            .send(Envelope::new(MessageKind::ListFriends, "Alice", "", ""))
            .await;
        assert_eq!(alice.recv().await.kind, MessageKind::FriendsList);

        // Drain via history request: FIFO order.
        bob.send(Envelope::new(MessageKind::HistoryRequest, "Bob", "Alice", ""))
            .await;
        let first = bob.recv().await;
        assert_eq!(first.kind, MessageKind::HistoryResponse);
        assert_eq!(first.content, "cipher-1");
        assert_eq!(first.sender, "Alice");
        let second = bob.recv().await;
        assert_eq!(second.content, "cipher-2");

        // A second drain yields nothing; the fence request answers first.
        bob.send(Envelope::new(MessageKind::HistoryRequest, "Bob", "Alice", ""))
            .await;
        bob.send(Envelope::new(
            MessageKind::ViewPendingRequests,
            "Bob",
            "",
            "",
        ))
        .await;
        let fence = bob.recv().await;
        assert_eq!(fence.kind, MessageKind::PendingRequestsList);
    }

    #[tokio::test]
    async fn test_direct_forward_when_receiver_in_chat() {
        let addr = spawn_server().await;
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        alice.register_and_login("Alice").await;
        bob.register_and_login("Bob").await;

        bob.send(Envelope::new(
            MessageKind::ChatStateUpdate,
            "Bob",
            "Alice",
            "IN_CHAT",
        ))
        .await;
        // Fence so the state update is applied before Alice sends.
        bob.send(Envelope::new(MessageKind::ListFriends, "Bob", "", ""))
            .await;
        assert_eq!(bob.recv().await.kind, MessageKind::FriendsList);

        alice
            .send(Envelope::new(
                MessageKind::ChatMessage,
                "Alice",
                "Bob",
                "cipher-live",
            ))
            .await;
        let pushed = bob.recv().await;
        assert_eq!(pushed.kind, MessageKind::ChatMessage);
        assert_eq!(pushed.sender, "Alice");
        assert_eq!(pushed.content, "cipher-live");
    }

    #[tokio::test]
    async fn test_friend_lifecycle_with_cross_session_pushes() {
        let addr = spawn_server().await;
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        alice.register_and_login("Alice").await;
        bob.register_and_login("Bob").await;

        alice
            .send(Envelope::new(
                MessageKind::SendFriendRequest,
                "Alice",
                "",
                "Bob",
            ))
            .await;
        assert_eq!(alice.recv().await.kind, MessageKind::FriendRequestSent);

        // Bob, being online, is pushed the refreshed pending list.
        let pushed = bob.recv().await;
        assert_eq!(pushed.kind, MessageKind::PendingRequestsList);
        assert_eq!(pushed.content, "INCOMING:Alice;OUTGOING:");

        bob.send(Envelope::new(
            MessageKind::AcceptFriendRequest,
            "Bob",
            "",
            "Alice",
        ))
        .await;
        let ack = bob.recv().await;
        assert_eq!(ack.kind, MessageKind::FriendAdded);
        assert_eq!(ack.content, "Alice");
        // Alice gets the cross-session push.
        let pushed = alice.recv().await;
        assert_eq!(pushed.kind, MessageKind::FriendAdded);
        assert_eq!(pushed.content, "Bob");

        alice
            .send(Envelope::new(MessageKind::ListFriends, "Alice", "", ""))
            .await;
        assert_eq!(alice.recv().await.content, "Bob");
    }

    #[tokio::test]
    async fn test_unauthenticated_and_malformed_requests() {
        let addr = spawn_server().await;
        let mut client = TestClient::connect(addr).await;

        // User-scoped request before login.
        client
            .send(Envelope::new(MessageKind::ListFriends, "", "", ""))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(reply.content, "Not logged in.");

        // Unparseable line.
        client.send_raw("this is not an envelope\n").await;
        assert_eq!(client.recv().await.kind, MessageKind::Error);

        // Unknown kind.
        client
            .send_raw("{\"kind\":\"FROBNICATE\",\"sender\":\"\",\"receiver\":\"\",\"content\":\"\"}\n")
            .await;
        assert_eq!(client.recv().await.kind, MessageKind::Error);

        // The connection survived all of it.
        client
            .send(Envelope::new(MessageKind::Register, "", "Carl", "pw"))
            .await;
        assert_eq!(client.recv().await.kind, MessageKind::RegisterSuccess);
    }

    #[tokio::test]
    async fn test_logout_closes_connection() {
        let addr = spawn_server().await;
        let mut client = TestClient::connect(addr).await;
        client.register_and_login("Dave").await;

        client
            .send(Envelope::new(MessageKind::Logout, "Dave", "", ""))
            .await;
        assert_eq!(client.recv().await.kind, MessageKind::LogoutSuccess);
        // Server closes the stream after the acknowledgement.
        assert!(client.lines.next_line().await.unwrap().is_none());
    }
}
