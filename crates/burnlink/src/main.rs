use std::io::Read;

use anyhow::{Context, Result};
use burnlink_server::handlers::{CreateLinkResponse, RedeemLinkResponse};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burnlink", about = "Burnlink: one-time encrypted secret links", version)]
struct Cli {
    /// Burnlink server URL (default: http://localhost:8080 or $BURNLINK_SERVER)
    #[arg(long, env = "BURNLINK_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Burnlink HTTP server
    Serve {
        /// Port to listen on (default: $BURNLINK_PORT or 8080)
        #[arg(long, env = "BURNLINK_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $BURNLINK_HOST or 0.0.0.0)
        #[arg(long, env = "BURNLINK_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Create a one-time link. Reads the secret from stdin when CONTENT is omitted.
    Create {
        content: Option<String>,
        /// Lifetime of the link e.g. 30m, 2h, 7d
        #[arg(long, default_value = "1h")]
        ttl: String,
    },
    /// Redeem a link and print its content. The link is spent afterwards.
    Open {
        /// Access token or full link URL
        link: String,
    },
    /// Delete all expired links immediately (admin)
    Prune {
        /// Admin bearer token ($BURNLINK_ADMIN_TOKEN)
        #[arg(long, env = "BURNLINK_ADMIN_TOKEN")]
        admin_token: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BURNLINK_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,
        Commands::Create { content, ttl } => {
            cmd_create(&cli.server, content, &ttl).await
        }
        Commands::Open { link } => cmd_open(&cli.server, &link).await,
        Commands::Prune { admin_token } => cmd_prune(&cli.server, &admin_token).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = burnlink_server::ServerConfig {
        host,
        port,
        admin_token: burnlink_server::resolve_admin_token()?,
        ..Default::default()
    };

    burnlink_server::run(cfg).await
}

async fn cmd_create(server: &str, content: Option<String>, ttl: &str) -> Result<()> {
    let minutes = parse_ttl_minutes(ttl)?;
    let content = match content {
        Some(c) => c,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read secret from stdin")?;
            buf.trim_end_matches(['\r', '\n']).to_owned()
        }
    };

    let client = Client::new();
    let body = serde_json::json!({
        "content": content,
        "expiresInMinutes": minutes,
    });

    let resp = client
        .post(format!("{}/links", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    if !resp.status().is_success() {
        return Err(server_error(resp).await);
    }

    let created: CreateLinkResponse = resp.json().await.context("parse response")?;
    println!(
        "{}/links/{}",
        server.trim_end_matches('/'),
        created.access_token
    );
    eprintln!("expires at {}", created.expires_at);
    Ok(())
}

async fn cmd_open(server: &str, link: &str) -> Result<()> {
    let token = token_from_link(link).context("no access token in link")?;

    let client = Client::new();
    let resp = client
        .get(format!("{}/links/{}", server.trim_end_matches('/'), token))
        .send()
        .await
        .context("HTTP request failed")?;

    if !resp.status().is_success() {
        return Err(server_error(resp).await);
    }

    let redeemed: RedeemLinkResponse = resp.json().await.context("parse response")?;
    println!("{}", redeemed.content);
    Ok(())
}

async fn cmd_prune(server: &str, admin_token: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .post(format!("{}/prune", server.trim_end_matches('/')))
        .bearer_auth(admin_token)
        .send()
        .await
        .context("HTTP request failed")?;

    if !resp.status().is_success() {
        return Err(server_error(resp).await);
    }

    let json: Value = resp.json().await?;
    let n = json["pruned"].as_u64().unwrap_or(0);
    println!("pruned {n} expired link(s)");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn server_error(resp: reqwest::Response) -> anyhow::Error {
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    match json["error"].as_str() {
        Some(msg) => anyhow::anyhow!("server returned {status}: {msg}"),
        None => anyhow::anyhow!("server returned {status}"),
    }
}

/// Parse a human duration like "30m" or "2h" into whole minutes.
fn parse_ttl_minutes(s: &str) -> Result<i64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    let secs = d.as_secs();
    if secs == 0 || secs % 60 != 0 {
        anyhow::bail!("ttl must be a whole number of minutes: {s}");
    }
    Ok((secs / 60) as i64)
}

/// Accept a bare token, `…/links/<token>` or `…?token=<token>`.
fn token_from_link(link: &str) -> Option<&str> {
    let link = link.trim();
    if let Some((_, query)) = link.split_once('?') {
        return query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .filter(|t| !t.is_empty());
    }
    link.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|t| !t.is_empty())
}
