//! Upstream identity provider adapter
//!
//! Every HTTP interaction with the third-party provider lives here. The
//! adapter holds no per-flow state.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{UpstreamAuthMethod, UpstreamConfig};
use crate::{Error, Result};

/// Token pair returned by the upstream token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamToken {
    /// Upstream access token
    pub access_token: String,
    /// Upstream refresh token (absent when the provider does not rotate)
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Token type, normalized to lowercase
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Granted scope string
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Upstream operations the bridge needs
#[async_trait]
pub trait UpstreamIdp: Send + Sync + 'static {
    /// Upstream authorization URL the end user is sent to
    fn build_authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String>;

    /// Exchange an upstream authorization code.
    ///
    /// Any non-2xx answer fails with [`Error::UpstreamExchangeFailed`].
    async fn exchange_authorization_code(&self, code: &str, redirect_uri: &str) -> Result<UpstreamToken>;

    /// Exchange an upstream refresh token.
    ///
    /// Returns `Ok(None)` when the provider rejects the refresh token, meaning
    /// the user has to authenticate again. Transport failures stay errors.
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<Option<UpstreamToken>>;
}

/// Standard OAuth 2.0 authorization-code client for the upstream provider
pub struct OAuth2Upstream {
    http_client: Client,
    config: UpstreamConfig,
}

impl OAuth2Upstream {
    /// Create an adapter with its own HTTP client bounded by `config.timeout`
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(http_client, config))
    }

    /// Create an adapter around an existing HTTP client
    #[must_use]
    pub fn with_client(http_client: Client, config: UpstreamConfig) -> Self {
        Self { http_client, config }
    }

    /// The adapter's configuration
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    async fn post_token_request(&self, params: &mut HashMap<&str, String>) -> Result<reqwest::Response> {
        let mut request = self.http_client.post(&self.config.token_endpoint);

        match self.config.auth_method {
            UpstreamAuthMethod::ClientSecretPost => {
                params.insert("client_id", self.config.client_id.clone());
                params.insert("client_secret", self.config.client_secret.clone());
            }
            UpstreamAuthMethod::ClientSecretBasic => {
                request = request.basic_auth(&self.config.client_id, Some(&self.config.client_secret));
            }
        }

        request
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&*params)
            .send()
            .await
            .map_err(|e| map_transport_error(&e, self.config.timeout))
    }
}

#[async_trait]
impl UpstreamIdp for OAuth2Upstream {
    fn build_authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.authorize_endpoint)
            .map_err(|e| Error::Config(format!("Invalid authorize endpoint: {e}")))?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("response_type", "code");
            params.append_pair("state", state);
            params.append_pair("redirect_uri", redirect_uri);

            if !self.config.scope.is_empty() {
                params.append_pair("scope", &self.config.scope);
            }
            for (key, value) in &self.config.extra_authorize_params {
                params.append_pair(key, value);
            }
        }

        Ok(url.to_string())
    }

    async fn exchange_authorization_code(&self, code: &str, redirect_uri: &str) -> Result<UpstreamToken> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code".to_string());
        params.insert("code", code.to_string());
        params.insert("redirect_uri", redirect_uri.to_string());

        let response = self.post_token_request(&mut params).await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Upstream code exchange rejected");
            return Err(Error::UpstreamExchangeFailed {
                status: Some(status.as_u16()),
                body,
            });
        }

        let token = parse_token_response(response, self.config.timeout).await?;
        info!(expires_in = ?token.expires_in, "Upstream code exchange succeeded");
        Ok(token)
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<Option<UpstreamToken>> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token".to_string());
        params.insert("refresh_token", refresh_token.to_string());
        if !scopes.is_empty() {
            params.insert("scope", scopes.join(" "));
        }

        let response = self.post_token_request(&mut params).await?;
        let status = response.status();

        if is_grant_rejection(status) {
            let body = response.text().await.unwrap_or_default();
            info!(status = %status, "Upstream rejected refresh token");
            debug!(body = %body, "Upstream refresh rejection body");
            return Ok(None);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Upstream refresh failed");
            return Err(Error::UpstreamExchangeFailed {
                status: Some(status.as_u16()),
                body,
            });
        }

        let token = parse_token_response(response, self.config.timeout).await?;
        info!(rotated = token.refresh_token.is_some(), "Upstream refresh succeeded");
        Ok(Some(token))
    }
}

/// 400 / 401 are how RFC 6749 §5.2 providers reject a grant
fn is_grant_rejection(status: StatusCode) -> bool {
    status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED
}

async fn parse_token_response(response: reqwest::Response, timeout: Duration) -> Result<UpstreamToken> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| map_transport_error(&e, timeout))?;

    let mut token: UpstreamToken = serde_json::from_str(&body).map_err(|e| {
        Error::UpstreamExchangeFailed {
            status: Some(status),
            body: format!("Failed to parse token response: {e}"),
        }
    })?;
    token.token_type = token.token_type.to_lowercase();
    Ok(token)
}

fn map_transport_error(error: &reqwest::Error, timeout: Duration) -> Error {
    if error.is_timeout() {
        Error::upstream_unreachable(format!("timed out after {timeout:?}"))
    } else {
        Error::upstream_unreachable(format!("request failed: {error}"))
    }
}
