//! Error types for the OAuth bridge

use thiserror::Error;

/// Result type alias for the OAuth bridge
pub type Result<T> = std::result::Result<T, Error>;

/// OAuth bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dynamic registration metadata was rejected
    #[error("Invalid client metadata: {0}")]
    InvalidClientMetadata(String),

    /// Redirect URI is not registered for the client
    #[error("Redirect URI {redirect_uri} is not registered for client {client_id}")]
    InvalidRedirectUri {
        /// Client that made the request
        client_id: String,
        /// The rejected redirect URI
        redirect_uri: String,
    },

    /// Correlation key is unknown, expired or already consumed
    #[error("Authorization flow not found: {0}")]
    FlowNotFound(String),

    /// Caller-chosen correlation key is already held by a live flow
    #[error("Authorization flow already in progress: {0}")]
    FlowConflict(String),

    /// A flow record or token belongs to a different client
    #[error("Client mismatch: issued to {expected}, presented by {actual}")]
    ClientMismatch {
        /// Client the record was issued to
        expected: String,
        /// Client presenting the record
        actual: String,
    },

    /// Requested scopes exceed the granted ones
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    /// Upstream identity provider rejected the exchange or was unreachable
    #[error("Upstream exchange failed{}: {body}", status_suffix(.status.as_ref()))]
    UpstreamExchangeFailed {
        /// HTTP status, `None` for network-level failures and timeouts
        status: Option<u16>,
        /// Response body or failure description
        body: String,
    },

    /// Signed token failed verification or is malformed
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Client registry backend failure
    #[error("Client registry error: {0}")]
    Registry(String),

    /// Correlation cache backend failure, raised by external cache implementations
    #[error("Cache error: {0}")]
    Cache(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn status_suffix(status: Option<&u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl Error {
    /// Build an upstream failure that never reached an HTTP response
    pub fn upstream_unreachable(reason: impl Into<String>) -> Self {
        Self::UpstreamExchangeFailed {
            status: None,
            body: reason.into(),
        }
    }

    /// RFC 6749 error code for the surrounding protocol layer
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidRedirectUri { .. } | Self::FlowConflict(_) => oauth_codes::INVALID_REQUEST,
            Self::FlowNotFound(_) | Self::ClientMismatch { .. } => oauth_codes::INVALID_GRANT,
            Self::InvalidScope(_) => oauth_codes::INVALID_SCOPE,
            Self::InvalidToken(_) => oauth_codes::INVALID_TOKEN,
            Self::InvalidClientMetadata(_) => oauth_codes::INVALID_CLIENT_METADATA,
            _ => oauth_codes::SERVER_ERROR,
        }
    }

    /// Whether retrying the same call may succeed
    ///
    /// Only network-level upstream failures qualify; a rejected grant never does.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamExchangeFailed { status: None, .. })
    }
}

/// RFC 6749 / RFC 7591 / RFC 6750 error codes
pub mod oauth_codes {
    /// Malformed or unacceptable request
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// Code or refresh token is invalid, expired, or issued to another client
    pub const INVALID_GRANT: &str = "invalid_grant";
    /// Requested scope exceeds what was granted
    pub const INVALID_SCOPE: &str = "invalid_scope";
    /// Bearer token failed validation
    pub const INVALID_TOKEN: &str = "invalid_token";
    /// Registration metadata rejected
    pub const INVALID_CLIENT_METADATA: &str = "invalid_client_metadata";
    /// Anything the client cannot fix
    pub const SERVER_ERROR: &str = "server_error";
}
