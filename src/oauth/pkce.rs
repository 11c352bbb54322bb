//! PKCE (RFC 7636) verification and correlation-state helpers

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// `BASE64URL(SHA256(verifier))`
#[must_use]
pub fn s256_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Constant-time check of a verifier against an S256 challenge
#[must_use]
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    let computed = s256_challenge(verifier);
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}

/// Generate a random state parameter
#[must_use]
pub fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
