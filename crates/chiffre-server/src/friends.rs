//! Friend graph manager.
//!
//! Mutates friend and pending-request edges with the invariant checks the
//! graph depends on: no self-edges, no pending edge between existing
//! friends, at most one pending edge per ordered pair, and symmetric
//! friendship. The store performs each mutation in a transaction over the
//! affected pair, so accept/reject/send/remove are atomic with respect to
//! each other for any user involved.
//!
//! Refused requests are silent no-ops from the graph's point of view; the
//! dispatcher decides what, if anything, to tell the client.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use chiffre_store::{PendingRequests, RequestInsert, Store};

use crate::auth::normalize_username;
use crate::error::ServerError;

/// How a friend-request submission was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDisposition {
    Sent,
    SelfRequest,
    UnknownUser,
    AlreadyFriends,
    AlreadyPending,
}

pub struct FriendGraph {
    store: Arc<Store>,
}

impl FriendGraph {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a pending request edge from `from` (a normalized key) to the
    /// named target.
    pub fn send_request(&self, from: &str, to: &str) -> Result<RequestDisposition, ServerError> {
        let to = normalize_username(to);
        if from == to {
            debug!(user = %from, "ignoring self-targeted friend request");
            return Ok(RequestDisposition::SelfRequest);
        }

        let disposition = match self.store.try_insert_request(from, &to, Utc::now())? {
            RequestInsert::Inserted => {
                info!(from = %from, to = %to, "friend request recorded");
                RequestDisposition::Sent
            }
            RequestInsert::UnknownUser => RequestDisposition::UnknownUser,
            RequestInsert::AlreadyFriends => {
                debug!(from = %from, to = %to, "already friends, request ignored");
                RequestDisposition::AlreadyFriends
            }
            RequestInsert::AlreadyPending => {
                debug!(from = %from, to = %to, "duplicate friend request ignored");
                RequestDisposition::AlreadyPending
            }
        };
        Ok(disposition)
    }

    /// Resolve the `(requester, target)` pending edge into a friendship.
    pub fn accept_request(&self, requester: &str, target: &str) -> Result<(), ServerError> {
        let requester = normalize_username(requester);
        self.store.accept_request(&requester, target)?;
        info!(requester = %requester, target = %target, "friend request accepted");
        Ok(())
    }

    /// Drop the `(requester, target)` pending edge without befriending.
    pub fn reject_request(&self, requester: &str, target: &str) -> Result<(), ServerError> {
        let requester = normalize_username(requester);
        self.store.delete_request(&requester, target)?;
        info!(requester = %requester, target = %target, "friend request rejected");
        Ok(())
    }

    /// Remove the symmetric friendship between `user` and the named friend.
    pub fn remove_friend(&self, user: &str, friend: &str) -> Result<(), ServerError> {
        let friend = normalize_username(friend);
        self.store.remove_friend(user, &friend)?;
        info!(user = %user, friend = %friend, "friendship removed");
        Ok(())
    }

    pub fn friends_of(&self, user: &str) -> Result<Vec<String>, ServerError> {
        Ok(self.store.friends_of(user)?)
    }

    pub fn pending_for(&self, user: &str) -> Result<PendingRequests, ServerError> {
        Ok(self.store.pending_for(user)?)
    }
}
