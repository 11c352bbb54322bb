//! OAuth Bridge - operator tooling for the bridge authorization server

use std::process::ExitCode;

use anyhow::{Context, bail};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use clap::Parser;
use tracing::debug;

use oauth_bridge::{
    cli::{Cli, Command},
    config::Config,
    oauth::{OAuth2Upstream, TokenCodec, UpstreamIdp, pkce::generate_state},
    registry::{ClientRegistry, FileClientRegistry, default_path},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match &cli.command {
        Command::Keygen => run_keygen(),
        Command::Check => run_check(&cli),
        Command::Inspect { token } => run_inspect(&cli, token),
        Command::Clients { format } => run_clients(&cli, format).await,
        Command::AuthorizeUrl { state } => run_authorize_url(&cli, state.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!(issuer = %config.issuer_url, "Configuration loaded");
    Ok(config)
}

/// Print a random signing secret
fn run_keygen() -> anyhow::Result<()> {
    let bytes: [u8; 48] = rand::random();
    println!("{}", URL_SAFE_NO_PAD.encode(bytes));
    Ok(())
}

/// Validate configuration and print it with secrets redacted
fn run_check(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    config.validate().context("Configuration is invalid")?;

    let yaml = serde_yaml::to_string(&config.redacted()).context("Failed to render configuration")?;
    println!("{yaml}");
    println!("✅ Configuration valid");
    println!("   Issuer:       {}", config.issuer_url);
    println!("   Callback URL: {}", config.callback_url());
    println!("   Register the callback URL with the upstream provider.");
    Ok(())
}

/// Verify a token and print its claims
fn run_inspect(cli: &Cli, token: &str) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    if config.signing.secret.is_empty() {
        bail!("signing.secret is not configured");
    }

    let codec = TokenCodec::new(config.signing.secret.as_bytes(), config.issuer_url.clone());
    let decoded = codec.decode(token).context("Token did not verify")?;
    let claims = &decoded.claims;

    let summary = serde_json::json!({
        "kind": claims.kind,
        "client_id": claims.client_id,
        "scopes": claims.scopes,
        "jti": claims.jti,
        "issuer": decoded.issuer,
        "issued_at": decoded.issued_at,
        "expires_at": claims.expires_at,
        "expires": rfc3339(claims.expires_at),
        "expired": claims.is_expired(),
        "upstream_token": mask(&claims.token),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// List registered clients
async fn run_clients(cli: &Cli, format: &str) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let path = match config.registry.path {
        Some(path) => path,
        None => default_path()?,
    };

    let registry = FileClientRegistry::open(&path)
        .with_context(|| format!("Failed to open registry {}", path.display()))?;
    let clients = registry.list().await?;

    if format == "json" {
        let redacted: Vec<_> = clients
            .into_iter()
            .map(|mut c| {
                c.client_secret = c.client_secret.map(|_| "<redacted>".to_string());
                c
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&redacted)?);
        return Ok(());
    }

    if clients.is_empty() {
        println!("No clients registered in {}", path.display());
        return Ok(());
    }

    println!("Found {} client(s) in {}:\n", clients.len(), path.display());
    for client in &clients {
        println!("📦 {}", client.client_id);
        if let Some(ref name) = client.client_name {
            println!("   Name: {name}");
        }
        println!("   Auth: {}", client.token_endpoint_auth_method);
        println!("   Scope: {}", client.scope.as_deref().unwrap_or("-"));
        for uri in &client.redirect_uris {
            println!("   Redirect: {uri}");
        }
        println!();
    }
    Ok(())
}

/// Print the upstream authorization URL
fn run_authorize_url(cli: &Cli, state: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let upstream = OAuth2Upstream::new(config.upstream.clone())?;

    let state = state.map_or_else(generate_state, str::to_string);
    let url = upstream.build_authorization_url(&config.callback_url(), &state)?;
    println!("{url}");
    Ok(())
}

fn rfc3339(unix_secs: u64) -> Option<String> {
    let secs = i64::try_from(unix_secs).ok()?;
    chrono::DateTime::from_timestamp(secs, 0).map(|t| t.to_rfc3339())
}

/// First few characters of a secret value
fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    format!("{prefix}… ({} chars)", value.chars().count())
}
