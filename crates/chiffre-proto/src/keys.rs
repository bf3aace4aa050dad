//! Public-key normalization.
//!
//! Clients submit base64 key material in whatever shape their crypto library
//! produced: PEM-armored, line-wrapped, URL-safe alphabet, padding stripped.
//! The server stores and serves a single canonical form so that every client
//! receives a key its decoder accepts.
//!
//! Normalization is idempotent: applying it to an already-normalized key is
//! a no-op.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::ProtoError;

const PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_FOOTER: &str = "-----END PUBLIC KEY-----";

/// Normalize base64 key material to the standard alphabet with full padding.
///
/// Steps: strip any PEM wrapper, drop all whitespace, remap the URL-safe
/// alphabet (`-`, `_`) to the standard one (`+`, `/`), and rebuild the `=`
/// padding. The result must decode as standard base64 or the input is
/// rejected.
pub fn normalize_public_key(raw: &str) -> Result<String, ProtoError> {
    let stripped = raw.replace(PEM_HEADER, "").replace(PEM_FOOTER, "");

    let mut cleaned: String = stripped
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    // Rebuild padding from scratch so over- and under-padded inputs both
    // converge on the same canonical form.
    while cleaned.ends_with('=') {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        return Err(ProtoError::EmptyKeyMaterial);
    }
    match cleaned.len() % 4 {
        0 => {}
        rem => cleaned.extend(std::iter::repeat('=').take(4 - rem)),
    }

    STANDARD
        .decode(&cleaned)
        .map_err(|_| ProtoError::InvalidKeyMaterial)?;

    Ok(cleaned)
}
