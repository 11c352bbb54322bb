//! Records exchanged between the bridge, its collaborators and the
//! surrounding protocol layer.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use url::Url;

use crate::{Error, Result};

/// Auth method for public clients that hold no secret
pub const AUTH_METHOD_NONE: &str = "none";

/// Default auth method for confidential clients
pub const AUTH_METHOD_CLIENT_SECRET_POST: &str = "client_secret_post";

/// Current Unix time in seconds
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Split a space-delimited scope string
#[must_use]
pub fn parse_scope(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Join scopes into a space-delimited string
#[must_use]
pub fn format_scope(scopes: &[String]) -> String {
    scopes.join(" ")
}

/// A dynamically registered downstream client.
///
/// Immutable once saved; looked up by `client_id` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Server-generated client identifier
    pub client_id: String,

    /// Client secret, absent for public clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Registered redirect URIs (non-empty, absolute)
    pub redirect_uris: Vec<String>,

    /// Space-delimited scope string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Human-readable client name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// Token endpoint auth method (`none` or `client_secret_post`)
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,

    /// Allowed grant types
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,

    /// Allowed response types
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,

    /// Registration time (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
}

fn default_auth_method() -> String {
    AUTH_METHOD_CLIENT_SECRET_POST.to_string()
}

fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".to_string(), "refresh_token".to_string()]
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

/// RFC 7591 registration request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientRegistrationRequest {
    /// Requested redirect URIs
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Requested scope string
    #[serde(default)]
    pub scope: Option<String>,
    /// Client display name
    #[serde(default)]
    pub client_name: Option<String>,
    /// Requested auth method
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
    /// Requested grant types
    #[serde(default)]
    pub grant_types: Vec<String>,
    /// Requested response types
    #[serde(default)]
    pub response_types: Vec<String>,
}

impl ClientRegistration {
    /// Build a registration record from RFC 7591 metadata.
    ///
    /// Generates the client id, a secret unless the client asked for
    /// `token_endpoint_auth_method = none`, and the issue timestamp.
    pub fn from_request(request: ClientRegistrationRequest) -> Result<Self> {
        let auth_method = request
            .token_endpoint_auth_method
            .unwrap_or_else(default_auth_method);

        let client_secret = if auth_method == AUTH_METHOD_NONE {
            None
        } else {
            Some(generate_secret())
        };

        let registration = Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            client_secret,
            redirect_uris: request.redirect_uris,
            scope: request.scope.filter(|s| !s.trim().is_empty()),
            client_name: request.client_name,
            token_endpoint_auth_method: auth_method,
            grant_types: if request.grant_types.is_empty() {
                default_grant_types()
            } else {
                request.grant_types
            },
            response_types: if request.response_types.is_empty() {
                default_response_types()
            } else {
                request.response_types
            },
            client_id_issued_at: Some(unix_now()),
        };
        registration.validate()?;
        Ok(registration)
    }

    /// Check the invariants every stored record must satisfy
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::InvalidClientMetadata("client_id is empty".to_string()));
        }
        if self.redirect_uris.is_empty() {
            return Err(Error::InvalidClientMetadata(
                "at least one redirect_uri is required".to_string(),
            ));
        }
        for uri in &self.redirect_uris {
            let parsed = Url::parse(uri).map_err(|e| {
                Error::InvalidClientMetadata(format!("redirect_uri {uri} is not absolute: {e}"))
            })?;
            if parsed.fragment().is_some() {
                return Err(Error::InvalidClientMetadata(format!(
                    "redirect_uri {uri} must not contain a fragment"
                )));
            }
        }
        if !self.response_types.iter().any(|t| t == "code") {
            return Err(Error::InvalidClientMetadata(
                "response_types must include \"code\"".to_string(),
            ));
        }
        Ok(())
    }

    /// Exact-match membership test against the registered redirect URIs
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == redirect_uri)
    }

    /// Registered scopes as a list
    pub fn scopes(&self) -> Vec<String> {
        self.scope.as_deref().map(parse_scope).unwrap_or_default()
    }

    /// Verify a presented client secret in constant time.
    ///
    /// Public clients (no stored secret) accept only an absent or empty secret.
    pub fn authenticate(&self, presented: Option<&str>) -> bool {
        match (self.client_secret.as_deref(), presented) {
            (None, None) => true,
            (None, Some(p)) => p.is_empty(),
            (Some(_), None) => false,
            (Some(expected), Some(p)) => expected.as_bytes().ct_eq(p.as_bytes()).into(),
        }
    }
}

fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Parameters a downstream client sends to the authorize endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationParams {
    /// Where the downstream client wants its code delivered
    pub redirect_uri: String,

    /// Opaque correlation string; generated when absent or empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// PKCE challenge (S256)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,

    /// Requested scopes
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Whether the client named the redirect URI itself
    #[serde(default = "default_true")]
    pub redirect_uri_provided_explicitly: bool,
}

fn default_true() -> bool {
    true
}

impl AuthorizationParams {
    /// Params with just a redirect URI
    pub fn new(redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            state: None,
            code_challenge: None,
            scopes: Vec::new(),
            redirect_uri_provided_explicitly: true,
        }
    }

    /// Set the correlation state
    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Set the PKCE challenge
    #[must_use]
    pub fn with_code_challenge(mut self, challenge: impl Into<String>) -> Self {
        self.code_challenge = Some(challenge.into());
        self
    }

    /// Set requested scopes
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }
}

/// What the cache holds for one in-flight authorization.
///
/// Stored under `state`, then re-keyed under the upstream `code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    /// Client that started the flow
    pub client_id: String,
    /// Params with `state` always populated
    pub params: AuthorizationParams,
}

impl PendingAuthorization {
    /// The flow's correlation state
    pub fn state(&self) -> &str {
        self.params.state.as_deref().unwrap_or_default()
    }
}

/// A single-use authorization code, synthesized at exchange time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    /// The upstream-issued code string
    pub code: String,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Expiry (Unix seconds)
    pub expires_at: u64,
    /// Client the code was issued to
    pub client_id: String,
    /// Downstream redirect URI the code was delivered to
    pub redirect_uri: String,
    /// Whether the client named the redirect URI itself
    pub redirect_uri_provided_explicitly: bool,
    /// PKCE challenge from the authorize request
    pub code_challenge: Option<String>,
}

impl AuthorizationCode {
    /// Returns `true` once `expires_at` has passed
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }

    /// Check a PKCE verifier against the stored S256 challenge.
    ///
    /// Codes issued without a challenge accept any verifier.
    pub fn verify_code_verifier(&self, verifier: &str) -> bool {
        match self.code_challenge.as_deref() {
            Some(challenge) => super::pkce::verify_s256(verifier, challenge),
            None => true,
        }
    }
}

/// Which half of a token pair a signed token is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Bearer token for resource requests
    Access,
    /// Token for the refresh grant
    Refresh,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// The logical content of a signed token; the server keeps no row for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    /// The wrapped upstream token
    pub token: String,
    /// Client the token was issued to
    pub client_id: String,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Expiry (Unix seconds)
    pub expires_at: u64,
    /// Access or refresh
    pub kind: TokenKind,
    /// Unique token id (deny-list key)
    pub jti: String,
}

impl IssuedToken {
    /// Returns `true` once `expires_at` has passed
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }

    /// Time left before expiry, `None` if already expired
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        let now = unix_now();
        (self.expires_at > now).then(|| Duration::from_secs(self.expires_at - now))
    }
}

/// Claims of a verified access token
pub type AccessToken = IssuedToken;

/// Claims of a verified refresh token
pub type RefreshToken = IssuedToken;

/// Token endpoint response handed back to the downstream client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Signed access token
    pub access_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Granted scope string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Signed refresh token, absent when the upstream issued none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uris: &[&str]) -> ClientRegistrationRequest {
        ClientRegistrationRequest {
            redirect_uris: uris.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn from_request_generates_id_and_secret() {
        let reg = ClientRegistration::from_request(request(&["https://app/cb"])).unwrap();

        assert!(!reg.client_id.is_empty());
        assert!(reg.client_secret.is_some());
        assert!(reg.client_id_issued_at.is_some());
        assert_eq!(reg.grant_types, vec!["authorization_code", "refresh_token"]);
        assert_eq!(reg.response_types, vec!["code"]);
    }

    #[test]
    fn public_client_has_no_secret() {
        let mut req = request(&["http://localhost:8001/"]);
        req.token_endpoint_auth_method = Some("none".to_string());

        let reg = ClientRegistration::from_request(req).unwrap();

        assert!(reg.client_secret.is_none());
        assert!(reg.authenticate(None));
        assert!(reg.authenticate(Some("")));
        assert!(!reg.authenticate(Some("guess")));
    }

    #[test]
    fn registration_requires_redirect_uris() {
        let err = ClientRegistration::from_request(request(&[])).unwrap_err();
        assert!(matches!(err, Error::InvalidClientMetadata(_)));
    }

    #[test]
    fn registration_rejects_relative_redirect_uri() {
        let err = ClientRegistration::from_request(request(&["/cb"])).unwrap_err();
        assert!(matches!(err, Error::InvalidClientMetadata(_)));
    }

    #[test]
    fn registration_rejects_fragment() {
        let err = ClientRegistration::from_request(request(&["https://app/cb#frag"])).unwrap_err();
        assert!(matches!(err, Error::InvalidClientMetadata(_)));
    }

    #[test]
    fn redirect_uri_match_is_exact() {
        let reg = ClientRegistration::from_request(request(&["https://app/cb"])).unwrap();

        assert!(reg.has_redirect_uri("https://app/cb"));
        assert!(!reg.has_redirect_uri("https://app/cb/"));
        assert!(!reg.has_redirect_uri("https://app/cb?x=1"));
        assert!(!reg.has_redirect_uri("https://evil/cb"));
    }

    #[test]
    fn confidential_client_secret_check() {
        let reg = ClientRegistration::from_request(request(&["https://app/cb"])).unwrap();
        let secret = reg.client_secret.clone().unwrap();

        assert!(reg.authenticate(Some(&secret)));
        assert!(!reg.authenticate(Some("wrong")));
        assert!(!reg.authenticate(None));
    }

    #[test]
    fn empty_scope_is_dropped() {
        let mut req = request(&["https://app/cb"]);
        req.scope = Some("  ".to_string());

        let reg = ClientRegistration::from_request(req).unwrap();

        assert!(reg.scope.is_none());
        assert!(reg.scopes().is_empty());
    }

    #[test]
    fn scope_helpers_split_and_join() {
        let scopes = parse_scope("identify  email guilds");
        assert_eq!(scopes, vec!["identify", "email", "guilds"]);
        assert_eq!(format_scope(&scopes), "identify email guilds");
    }

    #[test]
    fn registration_deserializes_with_defaults() {
        let json = r#"{"client_id":"abc","redirect_uris":["https://app/cb"]}"#;
        let reg: ClientRegistration = serde_json::from_str(json).unwrap();

        assert_eq!(reg.token_endpoint_auth_method, "client_secret_post");
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn token_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TokenKind::Refresh).unwrap(), "\"refresh\"");
        assert_eq!(TokenKind::Access.to_string(), "access");
    }

    #[test]
    fn issued_token_lifetime() {
        let token = IssuedToken {
            token: "A".to_string(),
            client_id: "c".to_string(),
            scopes: Vec::new(),
            expires_at: unix_now() + 120,
            kind: TokenKind::Access,
            jti: "j".to_string(),
        };
        assert!(!token.is_expired());
        assert!(token.remaining_lifetime().is_some());

        let expired = IssuedToken {
            expires_at: 0,
            ..token
        };
        assert!(expired.is_expired());
        assert!(expired.remaining_lifetime().is_none());
    }
}
