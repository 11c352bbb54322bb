//! Configuration management

use std::{collections::BTreeMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Public base URL of this server; also the token issuer
    pub issuer_url: String,
    /// Path of the fixed callback the upstream provider redirects to
    pub callback_path: String,
    /// Token signing configuration
    pub signing: SigningConfig,
    /// Upstream identity provider
    pub upstream: UpstreamConfig,
    /// In-flight authorization lifetimes
    pub flow: FlowConfig,
    /// Issued token policy
    pub tokens: TokenConfig,
    /// Client registry storage
    pub registry: RegistryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            issuer_url: "http://localhost:8000/".to_string(),
            callback_path: "/redirect".to_string(),
            signing: SigningConfig::default(),
            upstream: UpstreamConfig::default(),
            flow: FlowConfig::default(),
            tokens: TokenConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

/// Token signing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// HMAC secret (literal or `env:VAR_NAME`).
    /// Tokens stop verifying if this changes, so keep it stable across restarts.
    pub secret: String,
}

/// How the bridge authenticates to the upstream token endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamAuthMethod {
    /// Credentials in the form body
    #[default]
    ClientSecretPost,
    /// HTTP Basic credentials
    ClientSecretBasic,
}

/// Upstream identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Client id registered with the upstream provider
    pub client_id: String,
    /// Client secret (literal or `env:VAR_NAME`)
    pub client_secret: String,
    /// Upstream authorization endpoint
    pub authorize_endpoint: String,
    /// Upstream token endpoint
    pub token_endpoint: String,
    /// Space-delimited scope requested upstream
    pub scope: String,
    /// Token endpoint authentication
    pub auth_method: UpstreamAuthMethod,
    /// Bound on every upstream HTTP call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra query params appended to the authorization URL
    pub extra_authorize_params: BTreeMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            authorize_endpoint: "https://discord.com/api/v10/oauth2/authorize".to_string(),
            token_endpoint: "https://discord.com/api/v10/oauth2/token".to_string(),
            scope: "identify".to_string(),
            auth_method: UpstreamAuthMethod::default(),
            timeout: Duration::from_secs(30),
            extra_authorize_params: BTreeMap::new(),
        }
    }
}

/// Lifetimes of in-flight authorization records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// How long a flow waits for the upstream redirect
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
    /// How long a delivered code waits for the downstream exchange
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(10 * 60),
            code_ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Issued token policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Access token lifetime when the upstream omits `expires_in`
    #[serde(with = "humantime_serde")]
    pub default_expires_in: Duration,
    /// Lifetime of signed refresh tokens
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,
    /// Record revoked token ids in the cache and reject them on load
    pub deny_list: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_expires_in: Duration::from_secs(3600),
            refresh_token_ttl: Duration::from_secs(30 * 24 * 3600),
            deny_list: false,
        }
    }
}

/// Client registry storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON file path; defaults to `~/.oauth-bridge/clients.json`
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (OAUTH_BRIDGE_ prefix)
        figment = figment.merge(Env::prefixed("OAUTH_BRIDGE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before secret resolution)
        config.load_env_files();

        config.resolve_secrets();

        Ok(config)
    }

    /// Load environment files into the process environment.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found, skipping: {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Replace `env:VAR_NAME` secret references with their values
    fn resolve_secrets(&mut self) {
        self.signing.secret = resolve_env_ref(&self.signing.secret);
        self.upstream.client_id = resolve_env_ref(&self.upstream.client_id);
        self.upstream.client_secret = resolve_env_ref(&self.upstream.client_secret);
    }

    /// Check the settings the bridge cannot start without
    pub fn validate(&self) -> Result<()> {
        if self.signing.secret.is_empty() {
            return Err(Error::Config("signing.secret is required".to_string()));
        }
        if self.signing.secret.len() < 32 {
            tracing::warn!(
                len = self.signing.secret.len(),
                "signing.secret is shorter than 32 bytes"
            );
        }
        if self.upstream.client_id.is_empty() {
            return Err(Error::Config("upstream.client_id is required".to_string()));
        }

        for (name, value) in [
            ("issuer_url", &self.issuer_url),
            ("upstream.authorize_endpoint", &self.upstream.authorize_endpoint),
            ("upstream.token_endpoint", &self.upstream.token_endpoint),
        ] {
            Url::parse(value)
                .map_err(|e| Error::Config(format!("{name} must be an absolute URL: {e}")))?;
        }

        if !self.callback_path.starts_with('/') {
            return Err(Error::Config("callback_path must start with '/'".to_string()));
        }
        Ok(())
    }

    /// Absolute URL of the fixed upstream callback
    #[must_use]
    pub fn callback_url(&self) -> String {
        server_url(&self.issuer_url, &self.callback_path)
    }

    /// A copy safe to print: secrets replaced with a marker
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for secret in [&mut copy.signing.secret, &mut copy.upstream.client_secret] {
            if !secret.is_empty() {
                *secret = "<redacted>".to_string();
            }
        }
        copy
    }
}

/// Join `path` onto `base` with exactly one slash
#[must_use]
pub fn server_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Resolve `env:VAR_NAME`; other values pass through
fn resolve_env_ref(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "2h", "30d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            scaled(secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(hours, 3600)
        } else if let Some(days) = s.strip_suffix('d') {
            scaled(days, 86_400)
        } else {
            // Assume seconds
            scaled(s, 1)
        }
    }

    fn number(s: &str) -> Result<u64, String> {
        s.parse::<u64>().map_err(|e| format!("invalid duration {s:?}: {e}"))
    }

    fn scaled(s: &str, unit_secs: u64) -> Result<Duration, String> {
        number(s)?
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {s:?} overflows"))
    }
}
