//! Command handler modules for encore-cli.
//!
//! Shared wiring (config loading, engine construction) lives here.
//! Command-specific logic lives in the submodules.

pub mod db;
pub mod round;

use std::sync::Arc;

use anyhow::{Context, Result};
use encore_auction::{AuctionEngine, EngineContext, NoopNotifier, PaperPayments, SystemClock};
use encore_config::{
    secrets::{resolve_secrets, DatabaseRequirement},
    ConfigSurface, LoadedConfig, UnusedKeyPolicy,
};
use serde::Serialize;
use encore_db::PgPool;

const ENV_CONFIG: &str = "ENCORE_CONFIG";

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// `--config` paths win; otherwise `ENCORE_CONFIG`; otherwise defaults only.
pub fn load_config(config_paths: &[String]) -> Result<LoadedConfig> {
    let paths = if config_paths.is_empty() {
        match std::env::var(ENV_CONFIG) {
            Ok(raw) if !raw.trim().is_empty() => encore_config::split_path_list(&raw),
            _ => return LoadedConfig::empty(),
        }
    } else {
        config_paths.to_vec()
    };
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    encore_config::load_layered_yaml(&refs)
        .with_context(|| format!("loading config from {}", paths.join(",")))
}

/// Pool for the database named by `database.url_env` (default
/// `ENCORE_DATABASE_URL`). Unset is an error.
pub async fn connect_pool(loaded: &LoadedConfig) -> Result<PgPool> {
    let secrets = resolve_secrets(&loaded.config_json, DatabaseRequirement::Required)?;
    let url = secrets
        .database_url
        .context("database url missing after resolution")?;
    encore_db::connect(&url).await
}

/// Engine over the Postgres store. The CLI never falls back to memory: an
/// operator command against an empty in-process store would be meaningless.
pub async fn connect_engine(config_paths: &[String]) -> Result<AuctionEngine> {
    let loaded = load_config(config_paths)?;

    let report =
        encore_config::report_unused_keys(ConfigSurface::Cli, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        eprintln!(
            "WARN: CONFIG_UNUSED_KEYS surface={} unused_leaf_keys={}",
            report.surface,
            report.unused_leaf_pointers.len()
        );
        for p in report.unused_leaf_pointers.iter().take(50) {
            eprintln!("  unused={}", p);
        }
    }

    let settings = loaded.settings()?;
    let pool = connect_pool(&loaded).await?;
    Ok(AuctionEngine::new(EngineContext {
        store: Arc::new(encore_db::PgStore::new(pool)),
        payments: Arc::new(PaperPayments),
        notifier: Arc::new(NoopNotifier),
        clock: Arc::new(SystemClock),
        settings: Arc::new(settings),
    }))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(value).context("serialize output failed")?;
    println!("{}", s);
    Ok(())
}

pub fn opt_dt(v: &Option<chrono::DateTime<chrono::Utc>>) -> String {
    v.map(|t| t.to_rfc3339()).unwrap_or_else(|| "null".to_string())
}
