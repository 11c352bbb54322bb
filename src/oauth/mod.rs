//! OAuth 2.0 bridge authorization server
//!
//! A downstream client runs a standard authorization-code + PKCE flow against
//! this server while the end user authenticates with an upstream provider.
//!
//! Features:
//! - Dynamic client registration (RFC 7591)
//! - Redirect-URI binding and single-use correlation keys
//! - Stateless HS256 signed access and refresh tokens
//! - Upstream code and refresh exchanges with bounded timeouts
//! - Optional revocation deny-list
//! - Structured audit events

pub mod audit;
mod codec;
mod models;
pub mod pkce;
mod provider;
mod upstream;

pub use codec::{DecodedToken, TokenCodec};
pub use models::{
    AUTH_METHOD_CLIENT_SECRET_POST, AUTH_METHOD_NONE, AccessToken, AuthorizationCode,
    AuthorizationParams, ClientRegistration, ClientRegistrationRequest, IssuedToken,
    PendingAuthorization, RefreshToken, TokenKind, TokenPair, format_scope, parse_scope,
};
pub use provider::{BridgeProvider, ProviderSettings};
pub use upstream::{OAuth2Upstream, UpstreamIdp, UpstreamToken};
