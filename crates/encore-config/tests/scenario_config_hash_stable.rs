//! Config hash stability.
//!
//! GREEN when:
//! - Loading the same documents twice yields the same hash.
//! - Key order inside a document does not change the hash.
//! - Overlays take effect and change the hash.

use encore_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
auction:
  minimum_bid: 500
  minimum_increment: 100
  round_duration_secs: 1800
scheduler:
  interval_secs: 15
database:
  url_env: "ENCORE_DATABASE_URL"
"#;

const BASE_YAML_REORDERED: &str = r#"
database:
  url_env: "ENCORE_DATABASE_URL"
scheduler:
  interval_secs: 15
auction:
  round_duration_secs: 1800
  minimum_increment: 100
  minimum_bid: 500
"#;

const OVERLAY_YAML: &str = r#"
auction:
  minimum_bid: 1000
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.canonical_json, b.canonical_json);
}

#[test]
fn reordered_keys_produce_same_hash() {
    let original = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let reordered = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();
    assert_eq!(
        original.config_hash, reordered.config_hash,
        "reordering keys in YAML must not change the hash"
    );
}

#[test]
fn overlay_overrides_base_and_changes_hash() {
    let base = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let merged = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    assert_ne!(base.config_hash, merged.config_hash);

    let settings = merged.settings().unwrap();
    assert_eq!(settings.defaults.minimum_bid, 1000, "overlay must win");
    assert_eq!(
        settings.defaults.minimum_increment, 100,
        "keys absent from the overlay keep the base value"
    );
}

#[test]
fn hash_is_64_hex_chars() {
    let loaded = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(loaded.config_hash.len(), 64);
    assert!(loaded.config_hash.chars().all(|c| c.is_ascii_hexdigit()));
}
