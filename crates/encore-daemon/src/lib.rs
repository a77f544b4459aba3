//! encore-daemon library target.
//!
//! Exposes the router and state for integration tests.
//! The binary `main.rs` depends on this library target.

use std::net::SocketAddr;

use anyhow::Context;

pub mod api_types;
pub mod routes;
pub mod state;

/// `env_addr` (from `ENCORE_DAEMON_ADDR`) wins over `daemon.addr` in config.
/// An address that is set but does not parse is a startup error.
pub fn resolve_bind_addr(
    env_addr: Option<&str>,
    config_json: &serde_json::Value,
) -> anyhow::Result<Option<SocketAddr>> {
    let (raw, source) = match env_addr {
        Some(v) => (v, "ENCORE_DAEMON_ADDR"),
        None => match config_json.pointer("/daemon/addr") {
            Some(v) => (v.as_str().context("daemon.addr must be a string")?, "daemon.addr"),
            None => return Ok(None),
        },
    };
    raw.trim()
        .parse()
        .map(Some)
        .with_context(|| format!("invalid bind address {source}={raw}"))
}
