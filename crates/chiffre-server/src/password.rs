//! Password hashing and verification.
//!
//! A password is stored as `blake3(salt || password)` in hex, next to its
//! random 16-byte salt. The scheme satisfies the one contract the rest of
//! the server relies on: `verify(password, record) -> bool`, with the
//! comparison done in constant time.

use rand::RngCore;
use subtle::ConstantTimeEq;

const SALT_LEN: usize = 16;

/// Generate a fresh random salt, hex-encoded.
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    hex::encode(salt)
}

/// Salted digest of a password, hex-encoded.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Constant-time check of a candidate password against the stored digest.
pub fn verify_password(password: &str, salt: &str, stored_hash: &str) -> bool {
    let computed = hash_password(password, salt);
    let computed = computed.as_bytes();
    let stored = stored_hash.as_bytes();

    computed.len() == stored.len() && computed.ct_eq(stored).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_round_trip() {
        let salt = generate_salt();
        let hash = hash_password("hunter2", &salt);

        assert!(verify_password("hunter2", &salt, &hash));
        assert!(!verify_password("hunter3", &salt, &hash));
    }

    #[test]
    fn test_salt_changes_digest() {
        let h1 = hash_password("hunter2", &generate_salt());
        let h2 = hash_password("hunter2", &generate_salt());
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_wrong_length_hash_rejected() {
        let salt = generate_salt();
        assert!(!verify_password("hunter2", &salt, "deadbeef"));
    }
}
