//! Signed token codec - HS256 JWTs carrying bridge claims.
//!
//! The codec only checks integrity, structure and issuer. It never looks at
//! `exp`; expiry is enforced by the provider's loaders so that a codec
//! consumer (e.g. the `inspect` command) can still read an expired token.

use std::collections::HashSet;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::{IssuedToken, TokenKind, unix_now};
use crate::{Error, Result};

/// Wire claims of a signed token
#[derive(Debug, Serialize, Deserialize)]
struct SignedClaims {
    token: String,
    client_id: String,
    scopes: Vec<String>,
    expires_at: u64,
    typ: TokenKind,
    jti: String,
    exp: u64,
    iat: u64,
    sub: String,
    iss: String,
}

/// A verified token plus the codec-added claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    /// The issued claims, exactly as encoded
    pub claims: IssuedToken,
    /// Issue time (Unix seconds)
    pub issued_at: u64,
    /// Issuer URL
    pub issuer: String,
}

/// Encodes and verifies signed bridge tokens with a server-held secret
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl TokenCodec {
    /// Create a codec for `issuer` signing with `secret`
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::from(["sub".to_string(), "iss".to_string()]);
        validation.set_issuer(&[issuer.as_str()]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer,
        }
    }

    /// Issuer stamped into every token
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign `claims` into a compact token string
    pub fn encode(&self, claims: &IssuedToken) -> Result<String> {
        let signed = SignedClaims {
            token: claims.token.clone(),
            client_id: claims.client_id.clone(),
            scopes: claims.scopes.clone(),
            expires_at: claims.expires_at,
            typ: claims.kind,
            jti: claims.jti.clone(),
            exp: claims.expires_at,
            iat: unix_now(),
            sub: claims.client_id.clone(),
            iss: self.issuer.clone(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &signed, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }

    /// Verify `token` and return its claims.
    ///
    /// Fails with [`Error::InvalidToken`] on a bad signature, a foreign
    /// issuer, a different algorithm, or a malformed structure.
    pub fn decode(&self, token: &str) -> Result<DecodedToken> {
        let data = jsonwebtoken::decode::<SignedClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "Signed token rejected");
                Error::InvalidToken(e.to_string())
            })?;
        let c = data.claims;

        if c.sub != c.client_id {
            return Err(Error::InvalidToken("subject does not match client_id".to_string()));
        }

        Ok(DecodedToken {
            claims: IssuedToken {
                token: c.token,
                client_id: c.client_id,
                scopes: c.scopes,
                expires_at: c.expires_at,
                kind: c.typ,
                jti: c.jti,
            },
            issued_at: c.iat,
            issuer: c.iss,
        })
    }
}
