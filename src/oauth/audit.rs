//! Audit logging for bridge flow and token lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the serialized event in the
//! `audit` field, so the trail can be filtered out of ordinary logs.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `client.registered` | A client record was saved |
//! | `client.registration_failed` | The registry refused to save a client |
//! | `flow.started` | `authorize` cached a flow and built the upstream URL |
//! | `flow.redirected` | The upstream callback re-keyed a flow under its code |
//! | `flow.denied` | The upstream callback carried an error instead of a code |
//! | `code.exchanged` | A downstream client consumed its authorization code |
//! | `token.issued` | A signed token pair was issued for a code |
//! | `token.refreshed` | A signed token pair was issued for a refresh token |
//! | `token.refresh_rejected` | The upstream provider refused a refresh |
//! | `token.rejected` | A signed token failed to load |
//! | `token.revoked` | `revoke_token` was called |
//!
//! Raw token strings are never part of an event.

use serde::Serialize;

use super::models::{IssuedToken, TokenKind};

/// Structured audit event emitted for every lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// Client the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Flow correlation state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// JTI of the affected token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_jti: Option<String>,
    /// Access or refresh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<TokenKind>,
    /// Granted scopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Human-readable reason for denial or error events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            client_id: None,
            state: None,
            token_jti: None,
            kind: None,
            scopes: None,
            reason: None,
        }
    }

    fn for_token(event: &'static str, token: &IssuedToken) -> Self {
        Self {
            client_id: Some(token.client_id.clone()),
            token_jti: Some(token.jti.clone()),
            kind: Some(token.kind),
            scopes: Some(token.scopes.clone()),
            ..Self::new(event)
        }
    }

    /// Construct a `client.registered` event.
    #[must_use]
    pub fn client_registered(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            ..Self::new("client.registered")
        }
    }

    /// Construct a `client.registration_failed` event.
    #[must_use]
    pub fn client_registration_failed(client_id: &str, reason: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            reason: Some(reason.into()),
            ..Self::new("client.registration_failed")
        }
    }

    /// Construct a `flow.started` event.
    #[must_use]
    pub fn flow_started(client_id: &str, state: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            state: Some(state.to_string()),
            ..Self::new("flow.started")
        }
    }

    /// Construct a `flow.redirected` event.
    #[must_use]
    pub fn flow_redirected(client_id: &str, state: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            state: Some(state.to_string()),
            ..Self::new("flow.redirected")
        }
    }

    /// Construct a `flow.denied` event.
    #[must_use]
    pub fn flow_denied(client_id: &str, state: &str, reason: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            state: Some(state.to_string()),
            reason: Some(reason.into()),
            ..Self::new("flow.denied")
        }
    }

    /// Construct a `code.exchanged` event.
    #[must_use]
    pub fn code_exchanged(client_id: &str, scopes: &[String]) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            scopes: Some(scopes.to_vec()),
            ..Self::new("code.exchanged")
        }
    }

    /// Construct a `token.issued` event for the access half of a new pair.
    #[must_use]
    pub fn token_issued(token: &IssuedToken) -> Self {
        Self::for_token("token.issued", token)
    }

    /// Construct a `token.refreshed` event for the access half of a new pair.
    #[must_use]
    pub fn token_refreshed(token: &IssuedToken) -> Self {
        Self::for_token("token.refreshed", token)
    }

    /// Construct a `token.refresh_rejected` event.
    #[must_use]
    pub fn token_refresh_rejected(refresh: &IssuedToken) -> Self {
        Self {
            reason: Some("upstream rejected refresh token".to_string()),
            ..Self::for_token("token.refresh_rejected", refresh)
        }
    }

    /// Construct a `token.rejected` event.
    #[must_use]
    pub fn token_rejected(kind: TokenKind, reason: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            reason: Some(reason.into()),
            ..Self::new("token.rejected")
        }
    }

    /// Construct a `token.revoked` event.
    #[must_use]
    pub fn token_revoked(token: &IssuedToken, deny_listed: bool) -> Self {
        let reason = if deny_listed {
            "deny-listed until expiry"
        } else {
            "accepted without effect"
        };
        Self {
            reason: Some(reason.to_string()),
            ..Self::for_token("token.revoked", token)
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO oauth_bridge::oauth::audit audit={"event":"flow.started","client_id":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "oauth bridge audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
