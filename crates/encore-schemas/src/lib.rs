//! encore-schemas
//!
//! Shared data model for the bidding-round auction. Amounts are integer minor
//! currency units (cents). Nothing in this crate performs IO.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minor currency units (e.g. cents).
pub type Amount = i64;

// ---------------------------------------------------------------------------
// RoundStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`BiddingRound`].
///
/// ```text
/// pending ─► active ─► closing ─► settled
///    │          │          └────► cancelled
///    └──────────┴───────────────► cancelled   (administrative override)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Active,
    Closing,
    Settled,
    Cancelled,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Pending => "pending",
            RoundStatus::Active => "active",
            RoundStatus::Closing => "closing",
            RoundStatus::Settled => "settled",
            RoundStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RoundStatus::Pending),
            "active" => Ok(RoundStatus::Active),
            "closing" => Ok(RoundStatus::Closing),
            "settled" => Ok(RoundStatus::Settled),
            "cancelled" => Ok(RoundStatus::Cancelled),
            other => Err(anyhow!("invalid round status: {}", other)),
        }
    }

    /// `pending | active | closing`. At most one open round per organization.
    pub fn is_open(&self) -> bool {
        OPEN_STATUSES.contains(self)
    }

    /// `settled | cancelled`: nothing moves the round again.
    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    /// Legal edges of the round state machine.
    pub fn can_transition_to(&self, to: RoundStatus) -> bool {
        use RoundStatus::*;
        matches!(
            (self, to),
            (Pending, Active)
                | (Active, Closing)
                | (Closing, Settled)
                | (Closing, Cancelled)
                | (Pending, Cancelled)
                | (Active, Cancelled)
        )
    }
}

impl std::fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `RoundStatus` values that count as "open" for the one-open-round rule.
pub const OPEN_STATUSES: [RoundStatus; 3] =
    [RoundStatus::Pending, RoundStatus::Active, RoundStatus::Closing];

// ---------------------------------------------------------------------------
// BiddingRound
// ---------------------------------------------------------------------------

/// A fixed-duration auction window for one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiddingRound {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Monotonically increasing per organization, starting at 1.
    pub round_number: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: RoundStatus,
    pub winning_request_id: Option<Uuid>,
    pub winning_bid_amount: Option<Amount>,
    /// Highest accepted bid amount in this round (0 until the first accepted bid).
    pub watermark: Amount,
    /// Request that currently holds the watermark.
    pub leader_request_id: Option<Uuid>,
    /// Bumped on every accepted bid; the compare-and-set token for bid placement.
    pub version: i64,
    /// Last settlement error recorded against this round, if any.
    pub settlement_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl BiddingRound {
    /// True once wall-clock time has reached `ends_at`, regardless of status.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at
    }

    /// Accepting bids right now: status is `active` and the window has not ended.
    pub fn accepts_bids(&self, now: DateTime<Utc>) -> bool {
        self.status == RoundStatus::Active && !self.is_expired(now)
    }
}

// ---------------------------------------------------------------------------
// ParticipatingRequest
// ---------------------------------------------------------------------------

/// What kind of paid request joined the round. Informational to the auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    SongRequest,
    Shoutout,
    Tip,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::SongRequest => "song_request",
            RequestKind::Shoutout => "shoutout",
            RequestKind::Tip => "tip",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "song_request" => Ok(RequestKind::SongRequest),
            "shoutout" => Ok(RequestKind::Shoutout),
            "tip" => Ok(RequestKind::Tip),
            other => Err(anyhow!("invalid request kind: {}", other)),
        }
    }
}

/// A paid request competing in a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipatingRequest {
    pub id: Uuid,
    pub round_id: Uuid,
    pub organization_id: Uuid,
    pub kind: RequestKind,
    /// Amount the request entered with; `current_bid_amount` starts here.
    pub seed_amount: Amount,
    /// Amount of the most recently accepted bid (or the seed if none).
    pub current_bid_amount: Amount,
    /// Opaque name/contact of the current highest bidder on this request.
    pub highest_bidder_ref: String,
    /// Opaque token from the payment collaborator's `authorize`.
    pub payment_hold_ref: String,
    pub accepted_bids: i64,
    pub created_at: DateTime<Utc>,
}

impl ParticipatingRequest {
    pub fn has_accepted_bid(&self) -> bool {
        self.accepted_bids > 0
    }
}

// ---------------------------------------------------------------------------
// Bid
// ---------------------------------------------------------------------------

/// Why a bid submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    RoundNotActive,
    BidTooLow,
    Contention,
    InvalidAmount,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::RoundNotActive => "round_not_active",
            RejectionReason::BidTooLow => "bid_too_low",
            RejectionReason::Contention => "contention",
            RejectionReason::InvalidAmount => "invalid_amount",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "round_not_active" => Ok(RejectionReason::RoundNotActive),
            "bid_too_low" => Ok(RejectionReason::BidTooLow),
            "contention" => Ok(RejectionReason::Contention),
            "invalid_amount" => Ok(RejectionReason::InvalidAmount),
            other => Err(anyhow!("invalid rejection reason: {}", other)),
        }
    }
}

/// One bid submission. Append-only: every submission, accepted or not, is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub round_id: Uuid,
    pub request_id: Uuid,
    pub amount: Amount,
    pub bidder_ref: String,
    pub created_at: DateTime<Utc>,
    pub accepted: bool,
    pub rejection_reason: Option<RejectionReason>,
}

impl Bid {
    pub fn accepted(
        round_id: Uuid,
        request_id: Uuid,
        amount: Amount,
        bidder_ref: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            round_id,
            request_id,
            amount,
            bidder_ref: bidder_ref.to_string(),
            created_at: at,
            accepted: true,
            rejection_reason: None,
        }
    }

    pub fn rejected(
        round_id: Uuid,
        request_id: Uuid,
        amount: Amount,
        bidder_ref: &str,
        at: DateTime<Utc>,
        reason: RejectionReason,
    ) -> Self {
        Self {
            accepted: false,
            rejection_reason: Some(reason),
            ..Self::accepted(round_id, request_id, amount, bidder_ref, at)
        }
    }
}

// ---------------------------------------------------------------------------
// Hold dispositions
// ---------------------------------------------------------------------------

/// What settlement does with a payment hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldAction {
    Capture,
    Release,
}

impl HoldAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldAction::Capture => "capture",
            HoldAction::Release => "release",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "capture" => Ok(HoldAction::Capture),
            "release" => Ok(HoldAction::Release),
            other => Err(anyhow!("invalid hold action: {}", other)),
        }
    }
}

/// `pending → claimed → done | failed`; `failed` may be re-claimed for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl DispositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispositionStatus::Pending => "pending",
            DispositionStatus::Claimed => "claimed",
            DispositionStatus::Done => "done",
            DispositionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DispositionStatus::Pending),
            "claimed" => Ok(DispositionStatus::Claimed),
            "done" => Ok(DispositionStatus::Done),
            "failed" => Ok(DispositionStatus::Failed),
            other => Err(anyhow!("invalid disposition status: {}", other)),
        }
    }
}

/// A recorded capture/release intent for one hold, written together with the
/// round's terminal status and executed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldDisposition {
    pub id: Uuid,
    pub round_id: Uuid,
    pub request_id: Uuid,
    pub hold_ref: String,
    pub action: HoldAction,
    /// Capture amount; `None` for releases.
    pub amount: Option<Amount>,
    pub status: DispositionStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Earliest time a `failed` row may be retried.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl HoldDisposition {
    pub fn capture(req: &ParticipatingRequest, amount: Amount, at: DateTime<Utc>) -> Self {
        Self::new(req, HoldAction::Capture, Some(amount), at)
    }

    pub fn release(req: &ParticipatingRequest, at: DateTime<Utc>) -> Self {
        Self::new(req, HoldAction::Release, None, at)
    }

    fn new(
        req: &ParticipatingRequest,
        action: HoldAction,
        amount: Option<Amount>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            round_id: req.round_id,
            request_id: req.id,
            hold_ref: req.payment_hold_ref.clone(),
            action,
            amount,
            status: DispositionStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            updated_at: at,
        }
    }
}

// ---------------------------------------------------------------------------
// Read views
// ---------------------------------------------------------------------------

/// A round plus every request participating in it, as served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundView {
    pub round: BiddingRound,
    pub requests: Vec<ParticipatingRequest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_strings() {
        for s in [
            RoundStatus::Pending,
            RoundStatus::Active,
            RoundStatus::Closing,
            RoundStatus::Settled,
            RoundStatus::Cancelled,
        ] {
            assert_eq!(RoundStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(RoundStatus::parse("completed").is_err());
    }

    #[test]
    fn only_documented_edges_are_legal() {
        use RoundStatus::*;
        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Settled));
        assert!(Closing.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Cancelled));

        assert!(!Closing.can_transition_to(Active));
        assert!(!Settled.can_transition_to(Cancelled));
        assert!(!Active.can_transition_to(Settled));
        assert!(!Cancelled.can_transition_to(Active));
    }

    #[test]
    fn open_statuses_are_exactly_pending_active_closing() {
        for s in OPEN_STATUSES {
            assert!(s.is_open());
        }
        assert!(RoundStatus::Settled.is_terminal());
        assert!(RoundStatus::Cancelled.is_terminal());
    }

    #[test]
    fn request_kind_serializes_as_tagged_snake_case() {
        let v = serde_json::to_value(RequestKind::SongRequest).unwrap();
        assert_eq!(v, serde_json::json!("song_request"));
        assert_eq!(RequestKind::parse("shoutout").unwrap(), RequestKind::Shoutout);
    }
}
