//! The logical message envelope.
//!
//! Every request and response on the wire is one [`Envelope`]: a `kind` tag,
//! a `sender`, a `receiver`, and an opaque string `content` whose structure
//! depends on the kind. Adding a kind is a compile-time-checked change --
//! the server dispatches on [`MessageKind`] with an exhaustive `match`.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Sender name used by the server for every envelope it originates.
pub const SERVER_SENDER: &str = "Server";

/// Closed set of envelope kinds.
///
/// Serialized as `SCREAMING_SNAKE_CASE` tags (`"CHAT_MESSAGE"`, ...), so the
/// wire spelling matches the protocol documentation exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    // -- client -> server requests --
    Register,
    Login,
    Logout,
    ChangePassword,
    ChangeUsername,
    UpdatePublicKey,
    RequestPublicKey,
    SearchUser,
    SendFriendRequest,
    AcceptFriendRequest,
    RejectFriendRequest,
    RemoveFriend,
    ViewPendingRequests,
    ListFriends,
    ChatStateUpdate,
    ChatMessage,
    HistoryRequest,

    // -- server -> client responses --
    RegisterSuccess,
    RegisterFailure,
    LoginSuccess,
    LoginFailure,
    LogoutSuccess,
    ChangePasswordSuccess,
    ChangePasswordFailure,
    ChangeUsernameSuccess,
    ChangeUsernameFailure,
    PublicKeyResponse,
    UserFound,
    UserNotFound,
    FriendRequestSent,
    FriendRequestFailed,
    FriendAdded,
    FriendAddFailed,
    FriendRequestRejected,
    FriendRequestRejectFailed,
    FriendRemoved,
    FriendRemoveFailed,
    PendingRequestsList,
    FriendsList,
    HistoryResponse,
    Error,
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Originating user. Empty for administrative client requests
    /// (registration, login) where no identity is established yet.
    pub sender: String,
    /// Addressed user, or the acting user for administrative kinds.
    pub receiver: String,
    /// Opaque payload; structure depends on `kind`.
    pub content: String,
}

impl Envelope {
    pub fn new(
        kind: MessageKind,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender: sender.into(),
            receiver: receiver.into(),
            content: content.into(),
        }
    }

    /// Build a server-originated envelope addressed to `receiver`.
    pub fn from_server(
        kind: MessageKind,
        receiver: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(kind, SERVER_SENDER, receiver, content)
    }

    /// Serialize to a single JSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one JSON line into an envelope.
    ///
    /// Unknown `kind` tags fail here, which the server answers with a
    /// generic error envelope rather than dropping the connection.
    pub fn from_line(line: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new(MessageKind::ChatMessage, "alice", "bob", "deadbeef==");
        let line = env.to_line().unwrap();
        let restored = Envelope::from_line(&line).unwrap();
        assert_eq!(env, restored);
    }

    #[test]
    fn test_kind_wire_spelling() {
        let env = Envelope::from_server(MessageKind::PendingRequestsList, "alice", "");
        let line = env.to_line().unwrap();
        assert!(line.contains("\"PENDING_REQUESTS_LIST\""));

        let parsed = Envelope::from_line(
            r#"{"kind":"CHAT_STATE_UPDATE","sender":"a","receiver":"b","content":"IN_CHAT"}"#,
        )
        .unwrap();
        assert_eq!(parsed.kind, MessageKind::ChatStateUpdate);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = Envelope::from_line(
            r#"{"kind":"SELF_DESTRUCT","sender":"","receiver":"","content":""}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_garbage_line_rejected() {
        assert!(Envelope::from_line("not json at all").is_err());
    }
}
