//! encore-config
//!
//! Layered YAML configuration for the auction services.
//!
//! - Documents merge in order: earlier docs are base, later docs override.
//! - Secret-looking literal values abort loading (`CONFIG_SECRET_DETECTED`);
//!   config stores env var NAMES only, see [`secrets`].
//! - The effective config is hashed (sha256 over canonical JSON) so operators
//!   can tell which configuration a daemon booted with.
//! - [`AuctionSettings`] is the typed view consumed by the auction engine.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;

pub mod secrets;
mod settings;

pub use settings::{
    AuctionSettings, BidRetrySettings, OrganizationOverride, OrganizationPolicy,
    SchedulerSettings, SettlementSettings,
};

/// Known secret-like prefixes. If any leaf string value in the effective
/// config starts with one of these, loading fails.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",        // OpenAI style
    "sk_live",    // Stripe live
    "sk_test",    // Stripe test
    "rk_live",    // Stripe restricted
    "whsec_",     // Stripe webhook signing secret
    "AKIA",       // AWS access key ID
    "-----BEGIN", // PEM private keys
    "postgres://",
    "postgresql://",
    "ghp_",       // GitHub PAT
    "xoxb-",      // Slack bot token
];

// ---------------------------------------------------------------------------
// Consumed-key registry
// ---------------------------------------------------------------------------

/// Which binary is reading the config. Each reads a slightly different subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSurface {
    Daemon,
    Cli,
}

impl ConfigSurface {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSurface::Daemon => "DAEMON",
            ConfigSurface::Cli => "CLI",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    pub surface: String,
    /// Consumed JSON-pointer prefixes used for this analysis (sorted, unique)
    pub consumed_prefixes: Vec<String>,
    /// Minimal set of unused leaf pointers (sorted)
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// JSON-pointer prefixes actually read by each surface.
///
/// Keep this in sync with `AuctionSettings::from_config_json` and
/// `secrets::resolve_secrets`; do not list sections nothing reads.
pub fn consumed_pointers(surface: ConfigSurface) -> &'static [&'static str] {
    match surface {
        ConfigSurface::Daemon => &[
            "/auction",
            "/bid_retry",
            "/scheduler",
            "/settlement",
            "/organizations",
            "/database/url_env",
            "/daemon/addr",
        ],
        ConfigSurface::Cli => &[
            "/auction",
            "/bid_retry",
            "/scheduler",
            "/settlement",
            "/organizations",
            "/database/url_env",
        ],
    }
}

/// Produce an unused-key report for a given surface.
/// If `policy == Fail`, returns an error when unused keys exist.
pub fn report_unused_keys(
    surface: ConfigSurface,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let consumed: BTreeSet<&str> = consumed_pointers(surface).iter().copied().collect();

    let mut unused = BTreeSet::new();
    for_each_leaf(config_json, &mut |pointer, _| {
        if !consumed.iter().any(|prefix| covers(prefix, pointer)) {
            unused.insert(pointer.to_string());
        }
    });

    let report = UnusedKeyReport {
        surface: surface.as_str().to_string(),
        consumed_prefixes: consumed.into_iter().map(str::to_string).collect(),
        unused_leaf_pointers: unused.into_iter().collect(),
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        let first: Vec<&String> = report.unused_leaf_pointers.iter().take(12).collect();
        bail!(
            "CONFIG_UNUSED_KEYS (surface={}): {} unused config leaf key(s) detected. \
            Remove them or update the consumed registry. First few: {:?}",
            report.surface,
            report.unused_leaf_pointers.len(),
            first
        );
    }

    Ok(report)
}

/// Segment-wise prefix test: "/auction" covers "/auction/minimum_bid" but not
/// "/auctioneer".
fn covers(prefix: &str, pointer: &str) -> bool {
    match pointer.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Calls `f(pointer, value)` for every scalar in `v`. Keys are escaped per
/// RFC 6901; the root scalar (rare) is reported as "/".
fn for_each_leaf(v: &Value, f: &mut dyn FnMut(&str, &Value)) {
    fn walk(v: &Value, pointer: &mut String, f: &mut dyn FnMut(&str, &Value)) {
        let children: Vec<(String, &Value)> = match v {
            Value::Object(map) => map
                .iter()
                .map(|(k, c)| (k.replace('~', "~0").replace('/', "~1"), c))
                .collect(),
            Value::Array(items) => items.iter().enumerate().map(|(i, c)| (i.to_string(), c)).collect(),
            scalar => {
                f(if pointer.is_empty() { "/" } else { pointer.as_str() }, scalar);
                return;
            }
        };
        for (token, child) in children {
            let len = pointer.len();
            pointer.push('/');
            pointer.push_str(&token);
            walk(child, pointer, f);
            pointer.truncate(len);
        }
    }
    walk(v, &mut String::new(), f);
}

// ---------------------------------------------------------------------------
// Layered loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    /// Config with every default applied (no documents).
    pub fn empty() -> Result<Self> {
        load_layered_yaml_from_strings(&["{}"])
    }

    pub fn settings(&self) -> Result<AuctionSettings> {
        AuctionSettings::from_config_json(&self.config_json)
    }
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(serde_json::Map::new());
    for (i, raw) in yaml_docs.iter().enumerate() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(raw).with_context(|| format!("invalid yaml in document {i}"))?;
        let doc = serde_json::to_value(doc).context("yaml->json conversion failed")?;
        overlay(&mut merged, doc);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = serde_json::to_string(&merged).context("canonical json serialize failed")?;
    let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

/// Split a comma-separated path list (the `ENCORE_CONFIG` env var format).
pub fn split_path_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Later documents win key by key; a non-object value replaces whatever was
/// there, objects included.
fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base_map), Value::Object(top_map)) => {
            for (k, v) in top_map {
                match base_map.get_mut(&k) {
                    Some(slot) => overlay(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, top) => *slot = top,
    }
}

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let mut hit = None;
    for_each_leaf(v, &mut |pointer, leaf| {
        if hit.is_none() && leaf.as_str().is_some_and(looks_like_secret) {
            hit = Some(pointer.to_string());
        }
    });
    match hit {
        Some(pointer) => bail!("CONFIG_SECRET_DETECTED leaf={} value=REDACTED", pointer),
        None => Ok(()),
    }
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    if t.len() < 8 {
        return false;
    }
    SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_covers_whole_segments_only() {
        assert!(covers("/auction", "/auction/minimum_bid"));
        assert!(covers("/auction", "/auction"));
        assert!(!covers("/auction", "/auctioneer/name"));
    }

    #[test]
    fn leaves_are_escaped_pointers() {
        let v = serde_json::json!({ "a/b": { "c~d": 1 }, "list": [true, "x"] });
        let mut seen = Vec::new();
        for_each_leaf(&v, &mut |p, _| seen.push(p.to_string()));
        seen.sort();
        assert_eq!(seen, vec!["/a~1b/c~0d", "/list/0", "/list/1"]);
        for p in &seen {
            assert!(v.pointer(p).is_some(), "{p}");
        }
    }

    #[test]
    fn overlay_merges_objects_and_replaces_scalars() {
        let mut base = serde_json::json!({ "auction": { "minimum_bid": 500, "round_duration_secs": 60 } });
        overlay(
            &mut base,
            serde_json::json!({ "auction": { "minimum_bid": 700 }, "daemon": { "addr": "x" } }),
        );
        assert_eq!(base["auction"]["minimum_bid"], 700);
        assert_eq!(base["auction"]["round_duration_secs"], 60);
        assert_eq!(base["daemon"]["addr"], "x");

        overlay(&mut base, serde_json::json!({ "auction": null }));
        assert!(base["auction"].is_null());
    }

    #[test]
    fn split_path_list_ignores_blanks() {
        assert_eq!(
            split_path_list(" base.yaml, ,prod.yaml "),
            vec!["base.yaml".to_string(), "prod.yaml".to_string()]
        );
    }
}
