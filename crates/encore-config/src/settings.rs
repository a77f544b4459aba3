//! Typed auction settings extracted from the effective config JSON.
//!
//! Every key is optional; defaults match production behaviour (500 cent floor,
//! 100 cent increment, 30 minute rounds).

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Bidding rules for one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationPolicy {
    /// Flat floor every bid must reach, in minor units.
    pub minimum_bid: i64,
    /// How far the incumbent leader must raise their own bid.
    pub minimum_increment: i64,
    pub round_duration_secs: i64,
    pub bidding_enabled: bool,
}

impl Default for OrganizationPolicy {
    fn default() -> Self {
        Self {
            minimum_bid: 500,
            minimum_increment: 100,
            round_duration_secs: 30 * 60,
            bidding_enabled: true,
        }
    }
}

/// Per-organization overrides under `organizations.<uuid>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationOverride {
    pub minimum_bid: Option<i64>,
    pub minimum_increment: Option<i64>,
    pub round_duration_secs: Option<i64>,
    pub bidding_enabled: Option<bool>,
}

impl OrganizationOverride {
    fn apply(&self, base: &OrganizationPolicy) -> OrganizationPolicy {
        OrganizationPolicy {
            minimum_bid: self.minimum_bid.unwrap_or(base.minimum_bid),
            minimum_increment: self.minimum_increment.unwrap_or(base.minimum_increment),
            round_duration_secs: self.round_duration_secs.unwrap_or(base.round_duration_secs),
            bidding_enabled: self.bidding_enabled.unwrap_or(base.bidding_enabled),
        }
    }
}

/// Optimistic retry budget for bid placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BidRetrySettings {
    pub max_attempts: u32,
    /// Base backoff between attempts; attempt `n` sleeps `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for BidRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub interval_secs: u64,
    /// Open the next round for an organization as soon as its round closes.
    pub auto_open_next_round: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            auto_open_next_round: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementSettings {
    /// Total claims allowed per hold disposition before it is left for an operator.
    pub max_hold_attempts: i32,
    pub retry_backoff_secs: i64,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            max_hold_attempts: 5,
            retry_backoff_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuctionSettings {
    /// Policy for organizations without an override (the `auction` section).
    pub defaults: OrganizationPolicy,
    pub bid_retry: BidRetrySettings,
    pub scheduler: SchedulerSettings,
    pub settlement: SettlementSettings,
    pub organizations: BTreeMap<Uuid, OrganizationOverride>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    auction: OrganizationPolicy,
    bid_retry: BidRetrySettings,
    scheduler: SchedulerSettings,
    settlement: SettlementSettings,
    organizations: BTreeMap<String, OrganizationOverride>,
}

impl AuctionSettings {
    /// Extract and validate settings. Sections this crate does not know are
    /// ignored here; [`crate::report_unused_keys`] is the place to flag them.
    pub fn from_config_json(config_json: &Value) -> Result<Self> {
        let raw: RawSettings = match config_json {
            Value::Null => RawSettings::default(),
            v => serde_json::from_value(v.clone()).context("invalid auction settings")?,
        };

        let mut organizations = BTreeMap::new();
        for (key, ov) in raw.organizations {
            let org = Uuid::parse_str(&key)
                .with_context(|| format!("organizations key is not a uuid: {key}"))?;
            organizations.insert(org, ov);
        }

        let settings = Self {
            defaults: raw.auction,
            bid_retry: raw.bid_retry,
            scheduler: raw.scheduler,
            settlement: raw.settlement,
            organizations,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn policy_for(&self, organization_id: Uuid) -> OrganizationPolicy {
        match self.organizations.get(&organization_id) {
            Some(ov) => ov.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        validate_policy("auction", &self.defaults)?;
        for (org, ov) in &self.organizations {
            validate_policy(&format!("organizations.{org}"), &ov.apply(&self.defaults))?;
        }
        if self.bid_retry.max_attempts == 0 {
            bail!("CONFIG_INVALID bid_retry.max_attempts must be >= 1");
        }
        if self.scheduler.interval_secs == 0 {
            bail!("CONFIG_INVALID scheduler.interval_secs must be >= 1");
        }
        if self.settlement.max_hold_attempts < 1 {
            bail!("CONFIG_INVALID settlement.max_hold_attempts must be >= 1");
        }
        if self.settlement.retry_backoff_secs < 0 {
            bail!("CONFIG_INVALID settlement.retry_backoff_secs must be >= 0");
        }
        Ok(())
    }
}

fn validate_policy(at: &str, p: &OrganizationPolicy) -> Result<()> {
    if p.minimum_bid < 0 {
        bail!("CONFIG_INVALID {at}.minimum_bid must be >= 0");
    }
    if p.minimum_increment < 0 {
        bail!("CONFIG_INVALID {at}.minimum_increment must be >= 0");
    }
    if p.round_duration_secs <= 0 {
        bail!("CONFIG_INVALID {at}.round_duration_secs must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_config_yields_production_defaults() {
        let s = AuctionSettings::from_config_json(&json!({})).unwrap();
        assert_eq!(s.defaults.minimum_bid, 500);
        assert_eq!(s.defaults.minimum_increment, 100);
        assert_eq!(s.defaults.round_duration_secs, 1800);
        assert!(s.defaults.bidding_enabled);
        assert_eq!(s.bid_retry.max_attempts, 5);
        assert!(s.scheduler.auto_open_next_round);
    }

    #[test]
    fn organization_override_only_replaces_given_fields() {
        let org = Uuid::new_v4();
        let cfg = json!({
            "auction": { "minimum_bid": 700 },
            "organizations": { (org.to_string()): { "minimum_increment": 250 } }
        });
        let s = AuctionSettings::from_config_json(&cfg).unwrap();

        let p = s.policy_for(org);
        assert_eq!(p.minimum_bid, 700);
        assert_eq!(p.minimum_increment, 250);

        let other = s.policy_for(Uuid::new_v4());
        assert_eq!(other.minimum_increment, 100);
    }

    #[test]
    fn non_uuid_organization_key_is_rejected() {
        let cfg = json!({ "organizations": { "acme": { "bidding_enabled": false } } });
        assert!(AuctionSettings::from_config_json(&cfg).is_err());
    }

    #[test]
    fn zero_retry_budget_is_rejected() {
        let cfg = json!({ "bid_retry": { "max_attempts": 0 } });
        let err = AuctionSettings::from_config_json(&cfg).unwrap_err();
        assert!(err.to_string().contains("bid_retry.max_attempts"));
    }
}
