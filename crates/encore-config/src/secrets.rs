//! Runtime secret resolution.
//!
//! Config YAML stores only env var NAMES (e.g. `database.url_env:
//! "ENCORE_DATABASE_URL"`); values are read from the environment once at
//! startup and passed into constructors. `Debug` output redacts values and
//! error messages name the variable, never its value.

use anyhow::{bail, Result};
use serde_json::Value;

/// Env var consulted when `database.url_env` is absent.
pub const DEFAULT_DATABASE_URL_ENV: &str = "ENCORE_DATABASE_URL";

#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Name of the env var the URL was read from.
    pub database_url_env: String,
    /// Postgres connection string. `None` if the named env var was absent or empty.
    pub database_url: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("database_url_env", &self.database_url_env)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

/// Whether the caller can run without a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseRequirement {
    /// The daemon falls back to the in-memory store.
    Optional,
    /// The CLI operates on persisted rounds only.
    Required,
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

pub fn resolve_secrets(config_json: &Value, db: DatabaseRequirement) -> Result<ResolvedSecrets> {
    let database_url_env = read_str_at(config_json, "/database/url_env")
        .unwrap_or_else(|| DEFAULT_DATABASE_URL_ENV.to_string());
    let database_url = resolve_env(&database_url_env);

    if db == DatabaseRequirement::Required && database_url.is_none() {
        bail!(
            "SECRETS_MISSING: required env var '{}' (database url) is not set or empty",
            database_url_env
        );
    }

    Ok(ResolvedSecrets {
        database_url_env,
        database_url,
    })
}
