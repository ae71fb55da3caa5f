//! LangLeague CLI - a terminal client for the LangLeague API.
//!
//! Signs in against the backend, keeps the token in the OS keychain and
//! issues authenticated requests through the same transport the rest of the
//! platform uses.

mod config;

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use langleague_core::api::{ApiRequest, AuthenticatedTransport};
use langleague_core::auth::{AccountClient, KeyringStore};
use langleague_core::models::LoginRequest;
use langleague_core::TransportConfig;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;

const USAGE: &str = "\
Usage: langleague <command>

Commands:
  login [username] [--remember]   Sign in and store the token
  logout                          Forget the stored token
  whoami                          Show the signed-in account
  status                          Check whether the session is still valid
  get <path> [--silent]           GET an API path and print the body";

/// Captcha fields for backends that enforce them on login
const ENV_CAPTCHA_ID: &str = "LANGLEAGUE_CAPTCHA_ID";
const ENV_CAPTCHA_VALUE: &str = "LANGLEAGUE_CAPTCHA_VALUE";

/// Printed when the transport reports the session as invalid
const SESSION_EXPIRED_NOTICE: &str = "Session expired - run `langleague login` to sign in again.";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        return Ok(());
    };

    let mut config = Config::load().unwrap_or_default();

    match command.as_str() {
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            Ok(())
        }
        "login" => {
            let accounts = build_client(&config, command)?;
            login(&accounts, &mut config, &args[1..]).await
        }
        "logout" => {
            build_client(&config, command)?.logout()?;
            println!("Signed out.");
            Ok(())
        }
        "whoami" => whoami(&build_client(&config, command)?).await,
        "status" => {
            let authenticated = build_client(&config, command)?.is_authenticated().await?;
            println!("{}", if authenticated { "Signed in" } else { "Not signed in" });
            Ok(())
        }
        "get" => get(&build_client(&config, command)?, &args[1..]).await,
        other => bail!("Unknown command: {other}\n\n{USAGE}"),
    }
}

fn build_client(config: &Config, command: &str) -> Result<AccountClient> {
    let mut builder = AuthenticatedTransport::builder(transport_config(config)?)
        .credentials(KeyringStore::default());
    if let Some(notice) = session_notice(command) {
        builder = builder.on_unauthenticated(move || eprintln!("{notice}"));
    }

    Ok(AccountClient::new(builder.build()?))
}

/// Base URL from the environment or the config file, with the remaining
/// environment overrides applied either way.
fn transport_config(config: &Config) -> Result<TransportConfig> {
    match TransportConfig::from_env() {
        Ok(transport_config) => Ok(transport_config),
        Err(err) => match config.base_url {
            Some(ref url) => Ok(TransportConfig::new(url.as_str()).with_env_overrides()?),
            None => Err(err).context("Set LANGLEAGUE_API_URL or base_url in the config file"),
        },
    }
}

/// A rejected login is reported by `login` itself, not as an expired session.
fn session_notice(command: &str) -> Option<&'static str> {
    match command {
        "login" => None,
        _ => Some(SESSION_EXPIRED_NOTICE),
    }
}

async fn login(accounts: &AccountClient, config: &mut Config, args: &[String]) -> Result<()> {
    let remember = args.iter().any(|a| a == "--remember");
    let username = match args.iter().find(|a| !a.starts_with("--")) {
        Some(username) => username.clone(),
        None => match config.last_username.clone() {
            Some(username) => username,
            None => prompt("Username: ")?,
        },
    };
    if username.is_empty() {
        bail!("Username is required");
    }

    let password = rpassword::prompt_password(format!("Password for {username}: "))
        .context("Failed to read password")?;

    let mut request = LoginRequest::new(username.as_str(), password).remember_me(remember);
    if let (Ok(id), Ok(value)) = (std::env::var(ENV_CAPTCHA_ID), std::env::var(ENV_CAPTCHA_VALUE)) {
        request = request.captcha(id, value);
    }

    let claims = accounts.login(&request).await.context("Login failed")?;
    info!(user = %claims.sub, "Login complete");

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!(
        "Signed in as {} ({:?}), token valid for {} min",
        claims.sub,
        claims.role(),
        claims.minutes_until_expiry()
    );
    Ok(())
}

async fn whoami(accounts: &AccountClient) -> Result<()> {
    let Some(claims) = accounts.current_claims()? else {
        println!("Not signed in.");
        return Ok(());
    };
    if claims.is_expired() {
        println!("Stored token for {} has expired.", claims.sub);
    }

    let account = accounts.account().await.context("Failed to fetch account")?;
    println!("{} <{}>", account.name(), account.email.as_deref().unwrap_or("no email"));
    println!("  login:       {}", account.login);
    println!("  role:        {:?}", claims.role());
    println!("  authorities: {}", account.authorities.join(", "));
    if let Some(expires) = claims.expires_at() {
        println!(
            "  expires:     {} ({} min)",
            expires.format("%Y-%m-%d %H:%M UTC"),
            claims.minutes_until_expiry()
        );
    }
    Ok(())
}

async fn get(accounts: &AccountClient, args: &[String]) -> Result<()> {
    let Some(path) = args.iter().find(|a| !a.starts_with("--")) else {
        bail!("Usage: langleague get <path> [--silent]");
    };

    let mut request = ApiRequest::get(path.as_str());
    if args.iter().any(|a| a == "--silent") {
        request = request.silent();
    }

    let response = accounts.transport().send(request).await?;
    match response.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
