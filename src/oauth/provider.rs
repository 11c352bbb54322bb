//! Bridge authorization provider
//!
//! Drives the downstream authorization-code flow while authenticating the end
//! user against the upstream provider. A flow lives only in the correlation
//! cache:
//!
//! ```text
//! authorize                 -> params cached under `flow:state:<state>`
//! handle_upstream_redirect  -> state key consumed, params cached under `flow:code:<code>`
//! load_authorization_code   -> code key consumed
//! exchange_authorization_code -> signed token pair
//! ```
//!
//! Every cache key carries a prefix for its kind, so a caller-chosen `state`
//! or `code` can never address a deny-list entry or a key of the other kind.
//!
//! Refresh is a separate single step. Issued tokens are self-contained signed
//! strings; validating them needs only the signing secret.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use url::Url;

use super::audit::{self, AuditEvent};
use super::codec::TokenCodec;
use super::models::{
    AccessToken, AuthorizationCode, AuthorizationParams, ClientRegistration,
    ClientRegistrationRequest, IssuedToken, PendingAuthorization, RefreshToken, TokenKind,
    TokenPair, format_scope, unix_now,
};
use super::pkce::generate_state;
use super::upstream::{UpstreamIdp, UpstreamToken};
use crate::cache::{CorrelationCache, set_json_if_absent, take_json};
use crate::config::Config;
use crate::registry::ClientRegistry;
use crate::{Error, Result};

/// Cache key prefix for flows awaiting the upstream redirect
const STATE_PREFIX: &str = "flow:state:";

/// Cache key prefix for flows awaiting the downstream code exchange
const CODE_PREFIX: &str = "flow:code:";

/// Cache key prefix for revoked token ids
const REVOKED_PREFIX: &str = "revoked:";

/// Settings the provider needs from the configuration
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Absolute URL the upstream provider redirects back to
    pub callback_url: String,
    /// How long a flow waits for the upstream redirect
    pub state_ttl: Duration,
    /// How long a delivered code stays exchangeable
    pub code_ttl: Duration,
    /// Access token lifetime when the upstream omits `expires_in`
    pub default_expires_in: Duration,
    /// Signed refresh token lifetime
    pub refresh_token_ttl: Duration,
    /// Whether revocation records token ids in the cache
    pub deny_list: bool,
}

impl ProviderSettings {
    /// Settings derived from a loaded [`Config`]
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            callback_url: config.callback_url(),
            state_ttl: config.flow.state_ttl,
            code_ttl: config.flow.code_ttl,
            default_expires_in: config.tokens.default_expires_in,
            refresh_token_ttl: config.tokens.refresh_token_ttl,
            deny_list: config.tokens.deny_list,
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The bridge authorization server, generic over its three collaborators
pub struct BridgeProvider<R, C, U> {
    registry: Arc<R>,
    cache: Arc<C>,
    upstream: Arc<U>,
    codec: TokenCodec,
    settings: ProviderSettings,
}

impl<R, C, U> BridgeProvider<R, C, U>
where
    R: ClientRegistry,
    C: CorrelationCache,
    U: UpstreamIdp,
{
    /// Create a provider from explicit collaborators
    pub fn new(
        registry: Arc<R>,
        cache: Arc<C>,
        upstream: Arc<U>,
        codec: TokenCodec,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            registry,
            cache,
            upstream,
            codec,
            settings,
        }
    }

    /// Create a provider whose codec and settings come from `config`
    pub fn from_config(config: &Config, registry: Arc<R>, cache: Arc<C>, upstream: Arc<U>) -> Self {
        let codec = TokenCodec::new(config.signing.secret.as_bytes(), config.issuer_url.clone());
        Self::new(registry, cache, upstream, codec, ProviderSettings::from_config(config))
    }

    /// The token codec
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// The active settings
    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    // ========================================================================
    // Clients
    // ========================================================================

    /// Persist a client record.
    ///
    /// A registry failure is logged and audited but never returned; the
    /// surrounding protocol layer reports it to the registering client.
    pub async fn register_client(&self, client: ClientRegistration) {
        let client_id = client.client_id.clone();
        match self.registry.save(client).await {
            Ok(()) => {
                info!(client_id = %client_id, "Registered client");
                audit::emit(&AuditEvent::client_registered(&client_id));
            }
            Err(e) => {
                error!(client_id = %client_id, error = %e, "Failed to persist client registration");
                audit::emit(&AuditEvent::client_registration_failed(&client_id, e.to_string()));
            }
        }
    }

    /// Dynamic client registration: validate metadata, mint credentials, persist.
    pub async fn register(&self, request: ClientRegistrationRequest) -> Result<ClientRegistration> {
        let client = ClientRegistration::from_request(request)?;

        if let Err(e) = self.registry.save(client.clone()).await {
            audit::emit(&AuditEvent::client_registration_failed(&client.client_id, e.to_string()));
            return Err(e);
        }

        info!(client_id = %client.client_id, public = client.client_secret.is_none(), "Registered client");
        audit::emit(&AuditEvent::client_registered(&client.client_id));
        Ok(client)
    }

    /// Look up a client
    pub async fn get_client(&self, client_id: &str) -> Result<Option<ClientRegistration>> {
        self.registry.get(client_id).await
    }

    // ========================================================================
    // Authorization code flow
    // ========================================================================

    /// Start a flow and return the upstream URL to send the end user to.
    ///
    /// The redirect URI is checked before the cache or upstream is touched.
    /// A `state` already held by a live flow fails with [`Error::FlowConflict`]
    /// and leaves that flow untouched.
    pub async fn authorize(
        &self,
        client: &ClientRegistration,
        params: AuthorizationParams,
    ) -> Result<String> {
        if !client.has_redirect_uri(&params.redirect_uri) {
            warn!(client_id = %client.client_id, redirect_uri = %params.redirect_uri, "Unregistered redirect URI");
            return Err(Error::InvalidRedirectUri {
                client_id: client.client_id.clone(),
                redirect_uri: params.redirect_uri,
            });
        }

        let state = params
            .state
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(generate_state);

        let url = self
            .upstream
            .build_authorization_url(&self.settings.callback_url, &state)?;

        let pending = PendingAuthorization {
            client_id: client.client_id.clone(),
            params: AuthorizationParams {
                state: Some(state.clone()),
                ..params
            },
        };
        let key = state_key(&state);
        if !set_json_if_absent(&*self.cache, &key, &pending, Some(self.settings.state_ttl)).await? {
            warn!(client_id = %client.client_id, state = %state, "State already held by a live flow");
            return Err(Error::FlowConflict(format!("state {state}")));
        }

        info!(client_id = %client.client_id, state = %state, "Authorization flow started");
        audit::emit(&AuditEvent::flow_started(&client.client_id, &state));
        Ok(url)
    }

    /// Upstream callback: move the flow from `state` to `code` and return the
    /// downstream redirect carrying `state` and `code`.
    pub async fn handle_upstream_redirect(&self, state: &str, code: &str) -> Result<String> {
        if code.is_empty() {
            return Err(Error::FlowNotFound("upstream returned an empty code".to_string()));
        }

        let pending = self.take_pending(state).await?;
        if !set_json_if_absent(&*self.cache, &code_key(code), &pending, Some(self.settings.code_ttl)).await? {
            warn!(client_id = %pending.client_id, state = %state, "Upstream code already held by a live flow");
            return Err(Error::FlowConflict("authorization code".to_string()));
        }

        let url = redirect_with(
            &pending.params.redirect_uri,
            &[("state", pending.state()), ("code", code)],
        )?;

        info!(client_id = %pending.client_id, state = %state, "Upstream redirected back");
        audit::emit(&AuditEvent::flow_redirected(&pending.client_id, state));
        Ok(url)
    }

    /// Upstream callback carrying an error: end the flow and return the
    /// downstream redirect carrying the error.
    pub async fn handle_upstream_denial(
        &self,
        state: &str,
        error: &str,
        description: Option<&str>,
    ) -> Result<String> {
        let pending = self.take_pending(state).await?;

        let mut pairs = vec![("error", error)];
        if let Some(description) = description {
            pairs.push(("error_description", description));
        }
        pairs.push(("state", pending.state()));
        let url = redirect_with(&pending.params.redirect_uri, &pairs)?;

        warn!(client_id = %pending.client_id, state = %state, error = %error, "Upstream denied authorization");
        audit::emit(&AuditEvent::flow_denied(&pending.client_id, state, error));
        Ok(url)
    }

    /// Consume a delivered code and synthesize its [`AuthorizationCode`].
    ///
    /// A second call with the same code fails with [`Error::FlowNotFound`].
    /// A code presented by another client is consumed and rejected.
    pub async fn load_authorization_code(
        &self,
        client: &ClientRegistration,
        code: &str,
    ) -> Result<AuthorizationCode> {
        let pending: PendingAuthorization = take_json(&*self.cache, &code_key(code))
            .await?
            .ok_or_else(|| Error::FlowNotFound("authorization code".to_string()))?;

        if pending.client_id != client.client_id {
            warn!(expected = %pending.client_id, actual = %client.client_id, "Code presented by another client");
            return Err(Error::ClientMismatch {
                expected: pending.client_id,
                actual: client.client_id.clone(),
            });
        }

        let params = pending.params;
        let scopes = if params.scopes.is_empty() {
            client.scopes()
        } else {
            params.scopes
        };

        debug!(client_id = %client.client_id, "Authorization code loaded");
        Ok(AuthorizationCode {
            code: code.to_string(),
            scopes,
            expires_at: unix_now() + self.settings.code_ttl.as_secs(),
            client_id: client.client_id.clone(),
            redirect_uri: params.redirect_uri,
            redirect_uri_provided_explicitly: params.redirect_uri_provided_explicitly,
            code_challenge: params.code_challenge,
        })
    }

    /// Redeem the code upstream and wrap the result into a signed token pair.
    ///
    /// The upstream exchange uses this bridge's callback URL, the one the
    /// upstream code was issued for.
    pub async fn exchange_authorization_code(
        &self,
        client: &ClientRegistration,
        code: &AuthorizationCode,
    ) -> Result<TokenPair> {
        if code.client_id != client.client_id {
            return Err(Error::ClientMismatch {
                expected: code.client_id.clone(),
                actual: client.client_id.clone(),
            });
        }
        if code.is_expired() {
            return Err(Error::FlowNotFound("authorization code expired".to_string()));
        }

        let upstream = self
            .upstream
            .exchange_authorization_code(&code.code, &self.settings.callback_url)
            .await
            .inspect_err(|e| error!(client_id = %client.client_id, error = %e, "Upstream code exchange failed"))?;

        audit::emit(&AuditEvent::code_exchanged(&client.client_id, &code.scopes));

        let (pair, access) = self.issue_pair(&client.client_id, &code.scopes, upstream, None)?;
        info!(client_id = %client.client_id, expires_in = pair.expires_in, "Issued token pair");
        audit::emit(&AuditEvent::token_issued(&access));
        Ok(pair)
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    /// Verify a signed refresh token; `None` means invalid, expired or revoked
    pub async fn load_refresh_token(&self, token: &str) -> Option<RefreshToken> {
        self.load_token(token, TokenKind::Refresh).await
    }

    /// Verify a signed access token; `None` means invalid, expired or revoked
    pub async fn load_access_token(&self, token: &str) -> Option<AccessToken> {
        self.load_token(token, TokenKind::Access).await
    }

    /// Refresh upstream and re-wrap into a new signed pair.
    ///
    /// `scopes` must be a subset of the refresh token's scopes; empty keeps
    /// them unchanged. `Ok(None)` means the upstream refused the refresh and
    /// the user has to authorize again.
    pub async fn exchange_refresh_token(
        &self,
        client: &ClientRegistration,
        refresh: &RefreshToken,
        scopes: &[String],
    ) -> Result<Option<TokenPair>> {
        if refresh.client_id != client.client_id {
            return Err(Error::ClientMismatch {
                expected: refresh.client_id.clone(),
                actual: client.client_id.clone(),
            });
        }
        if refresh.kind != TokenKind::Refresh {
            return Err(Error::InvalidToken("not a refresh token".to_string()));
        }

        let granted = narrow_scopes(&refresh.scopes, scopes)?;

        let Some(upstream) = self
            .upstream
            .exchange_refresh_token(&refresh.token, scopes)
            .await?
        else {
            info!(client_id = %client.client_id, "Upstream rejected refresh, re-authorization required");
            audit::emit(&AuditEvent::token_refresh_rejected(refresh));
            return Ok(None);
        };

        let (pair, access) =
            self.issue_pair(&client.client_id, &granted, upstream, Some(&refresh.token))?;
        info!(client_id = %client.client_id, expires_in = pair.expires_in, "Refreshed token pair");
        audit::emit(&AuditEvent::token_refreshed(&access));
        Ok(Some(pair))
    }

    /// Revoke a token.
    ///
    /// Without the deny-list this only logs: a signed token stays valid until
    /// it expires. With it, the token's id is cached for its remaining lifetime
    /// and the loaders reject it.
    pub async fn revoke_token(&self, token: &IssuedToken) -> Result<()> {
        let deny_listed = self.settings.deny_list && token.remaining_lifetime().is_some();

        if deny_listed {
            let key = revoked_key(&token.jti);
            self.cache
                .set(&key, Some("1".to_string()), token.remaining_lifetime())
                .await?;
            info!(client_id = %token.client_id, jti = %token.jti, kind = %token.kind, "Token deny-listed");
        } else {
            info!(client_id = %token.client_id, jti = %token.jti, "Revocation accepted without effect");
        }

        audit::emit(&AuditEvent::token_revoked(token, deny_listed));
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn take_pending(&self, state: &str) -> Result<PendingAuthorization> {
        take_json(&*self.cache, &state_key(state)).await?.ok_or_else(|| {
            warn!(state = %state, "Unknown, expired or replayed state");
            Error::FlowNotFound(format!("state {state}"))
        })
    }

    async fn load_token(&self, token: &str, expected: TokenKind) -> Option<IssuedToken> {
        let reject = |reason: &str| -> Option<IssuedToken> {
            debug!(kind = %expected, reason = %reason, "Signed token rejected");
            audit::emit(&AuditEvent::token_rejected(expected, reason));
            None
        };

        let claims = match self.codec.decode(token) {
            Ok(decoded) => decoded.claims,
            Err(e) => return reject(&e.to_string()),
        };

        if claims.kind != expected {
            return reject("wrong token kind");
        }
        if claims.is_expired() {
            return reject("expired");
        }

        if self.settings.deny_list {
            match self.cache.get(&revoked_key(&claims.jti)).await {
                Ok(None) => {}
                Ok(Some(_)) => return reject("revoked"),
                Err(e) => {
                    warn!(error = %e, "Deny-list lookup failed");
                    return reject("deny-list unavailable");
                }
            }
        }

        Some(claims)
    }

    /// Wrap an upstream token pair; returns the pair and the access claims
    fn issue_pair(
        &self,
        client_id: &str,
        scopes: &[String],
        upstream: UpstreamToken,
        previous_refresh: Option<&str>,
    ) -> Result<(TokenPair, AccessToken)> {
        let now = unix_now();
        let expires_in = upstream
            .expires_in
            .unwrap_or_else(|| self.settings.default_expires_in.as_secs());

        let access = IssuedToken {
            token: upstream.access_token,
            client_id: client_id.to_string(),
            scopes: scopes.to_vec(),
            expires_at: now + expires_in,
            kind: TokenKind::Access,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let refresh_token = upstream
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))
            .map(|token| {
                self.codec.encode(&IssuedToken {
                    token,
                    client_id: client_id.to_string(),
                    scopes: scopes.to_vec(),
                    expires_at: now + self.settings.refresh_token_ttl.as_secs(),
                    kind: TokenKind::Refresh,
                    jti: uuid::Uuid::new_v4().to_string(),
                })
            })
            .transpose()?;

        let pair = TokenPair {
            access_token: self.codec.encode(&access)?,
            token_type: "Bearer".to_string(),
            expires_in,
            scope: (!scopes.is_empty()).then(|| format_scope(scopes)),
            refresh_token,
        };
        Ok((pair, access))
    }
}

fn state_key(state: &str) -> String {
    format!("{STATE_PREFIX}{state}")
}

fn code_key(code: &str) -> String {
    format!("{CODE_PREFIX}{code}")
}

fn revoked_key(jti: &str) -> String {
    format!("{REVOKED_PREFIX}{jti}")
}

/// Scopes for a refreshed pair: `requested` if it is a subset of `granted`
fn narrow_scopes(granted: &[String], requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(granted.to_vec());
    }
    let extra: Vec<&str> = requested
        .iter()
        .filter(|s| !granted.contains(s))
        .map(String::as_str)
        .collect();
    if extra.is_empty() {
        Ok(requested.to_vec())
    } else {
        Err(Error::InvalidScope(format!("not granted: {}", extra.join(" "))))
    }
}

/// Append query pairs to a registered redirect URI
fn redirect_with(redirect_uri: &str, pairs: &[(&str, &str)]) -> Result<String> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| Error::Internal(format!("Stored redirect URI {redirect_uri} is invalid: {e}")))?;
    url.query_pairs_mut().extend_pairs(pairs);
    Ok(url.to_string())
}
