use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_admin,
    handlers::{audit_events, create_link, health, prune_links, redeem_link, redeem_link_query},
    issuance::{IssuePolicy, DEFAULT_MAX_TTL_MINUTES},
    store::Store,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Bearer token for `/audit` and `/prune`; those routes answer 403 when unset.
    pub admin_token: Option<String>,
    pub cors_origins: Option<String>,
    pub max_ttl_minutes: i64,
    /// Upper bound on any single store call made while serving a request.
    pub store_timeout: Duration,
    pub sweep_interval: Duration,
    pub audit_retention_days: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("BURNLINK_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("BURNLINK_PORT", 8080),
            data_dir: std::env::var("BURNLINK_DATA_DIR").ok().map(PathBuf::from),
            admin_token: std::env::var("BURNLINK_ADMIN_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            cors_origins: std::env::var("BURNLINK_CORS_ORIGINS").ok(),
            max_ttl_minutes: env_or("BURNLINK_MAX_TTL_MINUTES", DEFAULT_MAX_TTL_MINUTES),
            store_timeout: Duration::from_millis(env_or("BURNLINK_STORE_TIMEOUT_MS", 5000)),
            sweep_interval: Duration::from_secs(env_or("BURNLINK_SWEEP_INTERVAL_SECS", 300)),
            audit_retention_days: env_or("BURNLINK_AUDIT_RETENTION_DAYS", 30),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read a token from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &std::path::Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the admin token from `BURNLINK_ADMIN_TOKEN_FILE` (preferred) or
/// `BURNLINK_ADMIN_TOKEN`. `None` leaves the admin endpoints disabled.
pub fn resolve_admin_token() -> Result<Option<String>> {
    if let Ok(path) = std::env::var("BURNLINK_ADMIN_TOKEN_FILE") {
        let token = read_key_file(std::path::Path::new(&path))?;
        if std::env::var("BURNLINK_ADMIN_TOKEN").is_ok() {
            warn!("both BURNLINK_ADMIN_TOKEN and BURNLINK_ADMIN_TOKEN_FILE are set; using file");
        }
        return Ok(Some(token));
    }
    Ok(std::env::var("BURNLINK_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty()))
}

/// Use `data_dir` if given, else `BURNLINK_DATA_DIR`, else the platform data dir.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Assemble the HTTP API around `state`.
pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/links", post(create_link).get(redeem_link_query))
        .route("/links/{token}", get(redeem_link));

    let admin = Router::new()
        .route("/audit", get(audit_events))
        .route("/prune", post(prune_links))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .merge(public)
        .merge(admin)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    if cfg.max_ttl_minutes <= 0 {
        anyhow::bail!("BURNLINK_MAX_TTL_MINUTES must be positive");
    }

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = Store::open(&data_dir.join("burnlink.db")).context("open store")?;
    info!(links = store.len()?, "opened link store");

    let audit_retention = Duration::from_secs(cfg.audit_retention_days.saturating_mul(86_400));
    store
        .clone()
        .spawn_sweeper(cfg.sweep_interval, audit_retention);

    if cfg.admin_token.is_none() {
        info!("no admin token configured; admin endpoints disabled");
    }

    let policy = IssuePolicy {
        max_ttl_minutes: cfg.max_ttl_minutes,
        ..IssuePolicy::default()
    };
    let state = AppState::new(store, policy, cfg.store_timeout, cfg.admin_token);
    let app = build_router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "burnlink server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ]);

    match origins {
        Some(o) => {
            let origins: Vec<HeaderValue> =
                o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
