//! encore-daemon entry point.
//!
//! Sets up tracing, loads config, picks a store, spawns the heartbeat and
//! scheduler tasks, wires middleware and starts the HTTP server. Route
//! handlers live in `routes.rs`; shared state in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use encore_auction::{AuctionStore, MemoryStore, PaperPayments, SystemClock};
use encore_config::{
    secrets::{resolve_secrets, DatabaseRequirement},
    ConfigSurface, LoadedConfig, UnusedKeyPolicy,
};
use encore_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

const ENV_CONFIG: &str = "ENCORE_CONFIG";
const ENV_DAEMON_ADDR: &str = "ENCORE_DAEMON_ADDR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let loaded = load_config()?;
    let report = encore_config::report_unused_keys(
        ConfigSurface::Daemon,
        &loaded.config_json,
        UnusedKeyPolicy::Warn,
    )?;
    for p in &report.unused_leaf_pointers {
        warn!(pointer = %p, "config key is not read by the daemon");
    }
    let settings = loaded.settings()?;
    let secrets = resolve_secrets(&loaded.config_json, DatabaseRequirement::Optional)?;

    let (store, store_kind): (Arc<dyn AuctionStore>, &'static str) = match &secrets.database_url {
        Some(url) => {
            let pool = encore_db::connect(url).await?;
            encore_db::migrate(&pool).await?;
            info!(env = %secrets.database_url_env, "using postgres store");
            (Arc::new(encore_db::PgStore::new(pool)), "postgres")
        }
        None => {
            warn!(
                env = %secrets.database_url_env,
                "database url not set; using in-memory store (state is lost on restart)"
            );
            (Arc::new(MemoryStore::new()), "memory")
        }
    };

    let sweep_every = Duration::from_secs(settings.scheduler.interval_secs);
    let shared = Arc::new(state::AppState::new(
        state::AppDeps {
            store,
            payments: Arc::new(PaperPayments),
            clock: Arc::new(SystemClock),
            settings,
            config_hash: loaded.config_hash.clone(),
        },
        store_kind,
    ));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_scheduler(Arc::clone(&shared), sweep_every);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = encore_daemon::resolve_bind_addr(
        std::env::var(ENV_DAEMON_ADDR).ok().as_deref(),
        &loaded.config_json,
    )?
    .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8787)));
    info!(config_hash = %loaded.config_hash, "encore-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn load_config() -> anyhow::Result<LoadedConfig> {
    match std::env::var(ENV_CONFIG) {
        Ok(raw) if !raw.trim().is_empty() => {
            let paths = encore_config::split_path_list(&raw);
            let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            encore_config::load_layered_yaml(&refs)
                .with_context(|| format!("loading config from {ENV_CONFIG}={raw}"))
        }
        _ => LoadedConfig::empty(),
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
