//! Authentication authority.
//!
//! Owns credential checks and the escalating-lockout state machine. Five
//! consecutive bad passwords lock the account for 1 minute; each further
//! lockout escalates through 5, 10, 20 and 60 minutes, and once the table is
//! exhausted the account locks permanently. Expiry is evaluated lazily on
//! the next login attempt -- there is no background timer. Every branch
//! persists the updated record before returning.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use chiffre_proto::keys::normalize_public_key;
use chiffre_store::{Store, UserRecord};

use crate::error::ServerError;
use crate::password;

/// Bad attempts tolerated before a lockout fires.
pub const MAX_BAD_TRIES: u32 = 5;

/// Lockout duration per stage, in minutes. A stage beyond the end of this
/// table is a permanent lock.
pub const LOCKOUT_MINUTES: [i64; 5] = [1, 5, 10, 20, 60];

/// Normalized identity key for a username.
///
/// Usernames are compared case-insensitively on every path; the casing the
/// user registered with survives only as a display form.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    NoSuchUser,
    Locked { seconds_remaining: i64 },
    PermanentlyLocked,
    BadPassword { tries_remaining: u32 },
}

/// Validates credentials against the store and drives the lockout machine.
pub struct AuthAuthority {
    store: Arc<Store>,
}

impl AuthAuthority {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create an account. Fails with [`ServerError::UsernameTaken`] when the
    /// normalized username already exists.
    pub fn register(&self, username: &str, pass: &str) -> Result<(), ServerError> {
        let salt = password::generate_salt();
        let record = UserRecord {
            username: normalize_username(username),
            display_name: username.trim().to_string(),
            password_hash: password::hash_password(pass, &salt),
            salt,
            public_key: None,
            failed_attempts: 0,
            lockout_stage: 0,
            lockout_expiry: None,
            created_at: Utc::now(),
        };

        if self.store.create_user(&record)? {
            info!(user = %record.username, "registered new account");
            Ok(())
        } else {
            Err(ServerError::UsernameTaken)
        }
    }

    pub fn authenticate(&self, username: &str, pass: &str) -> Result<AuthOutcome, ServerError> {
        self.authenticate_at(username, pass, Utc::now())
    }

    fn authenticate_at(
        &self,
        username: &str,
        pass: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthOutcome, ServerError> {
        let key = normalize_username(username);
        let Some(user) = self.store.get_user(&key)? else {
            return Ok(AuthOutcome::NoSuchUser);
        };

        if user.lockout_stage as usize > LOCKOUT_MINUTES.len() {
            return Ok(AuthOutcome::PermanentlyLocked);
        }

        if let Some(expiry) = user.lockout_expiry {
            if expiry > now {
                return Ok(AuthOutcome::Locked {
                    seconds_remaining: (expiry - now).num_seconds(),
                });
            }
        }

        if password::verify_password(pass, &user.salt, &user.password_hash) {
            self.store.update_lockout(&key, 0, 0, None)?;
            return Ok(AuthOutcome::Success);
        }

        let failed = user.failed_attempts + 1;
        if failed >= MAX_BAD_TRIES {
            let stage = user.lockout_stage + 1;
            if (stage as usize) <= LOCKOUT_MINUTES.len() {
                let minutes = LOCKOUT_MINUTES[stage as usize - 1];
                self.store
                    .update_lockout(&key, 0, stage, Some(now + Duration::minutes(minutes)))?;
                warn!(user = %key, stage, minutes, "account locked after repeated failures");
                return Ok(AuthOutcome::Locked {
                    seconds_remaining: minutes * 60,
                });
            }

            self.store.update_lockout(&key, 0, stage, None)?;
            warn!(user = %key, "account permanently locked");
            return Ok(AuthOutcome::PermanentlyLocked);
        }

        self.store
            .update_lockout(&key, failed, user.lockout_stage, user.lockout_expiry)?;
        Ok(AuthOutcome::BadPassword {
            tries_remaining: MAX_BAD_TRIES - failed,
        })
    }

    /// Verify the old password and replace it, regenerating the salt.
    /// Returns `false` when the user is unknown or the old password is wrong.
    pub fn change_password(&self, username: &str, old: &str, new: &str) -> Result<bool, ServerError> {
        let key = normalize_username(username);
        let Some(user) = self.store.get_user(&key)? else {
            return Ok(false);
        };
        if !password::verify_password(old, &user.salt, &user.password_hash) {
            return Ok(false);
        }

        let salt = password::generate_salt();
        self.store
            .update_password(&key, &password::hash_password(new, &salt), &salt)?;
        info!(user = %key, "password changed");
        Ok(true)
    }

    /// Verify the password and rename the account, rewriting friend-graph
    /// and queue references. Returns `false` when the password is wrong, the
    /// new name is empty, or the new name is taken by someone else.
    pub fn change_username(
        &self,
        username: &str,
        new_name: &str,
        pass: &str,
    ) -> Result<bool, ServerError> {
        let key = normalize_username(username);
        let new_display = new_name.trim();
        let new_key = normalize_username(new_name);
        if new_key.is_empty() {
            return Ok(false);
        }

        let Some(user) = self.store.get_user(&key)? else {
            return Ok(false);
        };
        if !password::verify_password(pass, &user.salt, &user.password_hash) {
            return Ok(false);
        }

        let renamed = self.store.rename_user(&key, &new_key, new_display)?;
        if renamed {
            info!(old = %key, new = %new_key, "username changed");
        }
        Ok(renamed)
    }

    /// Store a client-announced public key in normalized form.
    ///
    /// Key material that still fails to decode after normalization is
    /// rejected and logged; it is not an error the connection needs to see.
    pub fn update_public_key(&self, username: &str, key_material: &str) -> Result<(), ServerError> {
        let key = normalize_username(username);
        match normalize_public_key(key_material) {
            Ok(normalized) => {
                self.store.set_public_key(&key, &normalized)?;
                info!(user = %key, "public key updated");
            }
            Err(e) => {
                warn!(user = %key, error = %e, "rejecting malformed public key");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> AuthAuthority {
        AuthAuthority::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn test_register_rejects_case_insensitive_duplicate() {
        let auth = authority();
        auth.register("Alice", "pw").unwrap();
        assert!(matches!(
            auth.register("ALICE", "other"),
            Err(ServerError::UsernameTaken)
        ));
    }

    #[test]
    fn test_login_is_case_insensitive() {
        let auth = authority();
        auth.register("Alice", "pw").unwrap();
        assert_eq!(auth.authenticate("aLiCe", "pw").unwrap(), AuthOutcome::Success);
    }

    #[test]
    fn test_unknown_user() {
        let auth = authority();
        assert_eq!(
            auth.authenticate("ghost", "pw").unwrap(),
            AuthOutcome::NoSuchUser
        );
    }

    #[test]
    fn test_lockout_ladder() {
        let auth = authority();
        auth.register("alice", "pw").unwrap();
        let now = Utc::now();

        for left in (1..=4).rev() {
            assert_eq!(
                auth.authenticate_at("alice", "wrong", now).unwrap(),
                AuthOutcome::BadPassword {
                    tries_remaining: left
                }
            );
        }
        // Fifth failure locks for the first stage: one minute.
        assert_eq!(
            auth.authenticate_at("alice", "wrong", now).unwrap(),
            AuthOutcome::Locked {
                seconds_remaining: 60
            }
        );
        // Still locked, with less time remaining.
        assert_eq!(
            auth.authenticate_at("alice", "wrong", now + Duration::seconds(30))
                .unwrap(),
            AuthOutcome::Locked {
                seconds_remaining: 30
            }
        );
        // After expiry the correct password clears all counters.
        assert_eq!(
            auth.authenticate_at("alice", "pw", now + Duration::seconds(61))
                .unwrap(),
            AuthOutcome::Success
        );
        let user = auth.store.get_user("alice").unwrap().unwrap();
        assert_eq!(user.failed_attempts, 0);
        assert_eq!(user.lockout_stage, 0);
        assert!(user.lockout_expiry.is_none());
    }

    #[test]
    fn test_escalation_to_permanent_lock() {
        let auth = authority();
        auth.register("alice", "pw").unwrap();
        let mut now = Utc::now();

        for stage in 0..LOCKOUT_MINUTES.len() {
            for _ in 0..MAX_BAD_TRIES - 1 {
                assert!(matches!(
                    auth.authenticate_at("alice", "wrong", now).unwrap(),
                    AuthOutcome::BadPassword { .. }
                ));
            }
            assert_eq!(
                auth.authenticate_at("alice", "wrong", now).unwrap(),
                AuthOutcome::Locked {
                    seconds_remaining: LOCKOUT_MINUTES[stage] * 60
                }
            );
            now += Duration::minutes(LOCKOUT_MINUTES[stage]) + Duration::seconds(1);
        }

        // Stages exhausted: the sixth escalation locks permanently.
        for _ in 0..MAX_BAD_TRIES - 1 {
            assert!(matches!(
                auth.authenticate_at("alice", "wrong", now).unwrap(),
                AuthOutcome::BadPassword { .. }
            ));
        }
        assert_eq!(
            auth.authenticate_at("alice", "wrong", now).unwrap(),
            AuthOutcome::PermanentlyLocked
        );
        // No amount of waiting or correct passwords helps now.
        assert_eq!(
            auth.authenticate_at("alice", "pw", now + Duration::days(365))
                .unwrap(),
            AuthOutcome::PermanentlyLocked
        );
    }

    #[test]
    fn test_change_password() {
        let auth = authority();
        auth.register("alice", "old").unwrap();

        assert!(!auth.change_password("alice", "wrong", "new").unwrap());
        assert!(auth.change_password("alice", "old", "new").unwrap());
        assert_eq!(
            auth.authenticate("alice", "new").unwrap(),
            AuthOutcome::Success
        );
        assert!(matches!(
            auth.authenticate("alice", "old").unwrap(),
            AuthOutcome::BadPassword { .. }
        ));
    }

    #[test]
    fn test_change_username() {
        let auth = authority();
        auth.register("alice", "pw").unwrap();
        auth.register("bob", "pw").unwrap();

        assert!(!auth.change_username("alice", "bob", "pw").unwrap());
        assert!(!auth.change_username("alice", "alicia", "wrong").unwrap());
        assert!(auth.change_username("alice", "Alicia", "pw").unwrap());
        assert_eq!(
            auth.authenticate("alicia", "pw").unwrap(),
            AuthOutcome::Success
        );
    }

    #[test]
    fn test_update_public_key_normalizes_and_tolerates_garbage() {
        let auth = authority();
        auth.register("alice", "pw").unwrap();

        auth.update_public_key("alice", "ab-cd_ef").unwrap();
        let user = auth.store.get_user("alice").unwrap().unwrap();
        assert_eq!(user.public_key.as_deref(), Some("ab+cd/ef"));

        // Garbage is logged and dropped, not an error.
        auth.update_public_key("alice", "%%%").unwrap();
        let user = auth.store.get_user("alice").unwrap().unwrap();
        assert_eq!(user.public_key.as_deref(), Some("ab+cd/ef"));
    }
}
