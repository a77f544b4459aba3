//! Persistence seam for the auction core.
//!
//! Every mutating method is a single atomic compare-and-set: it either applies
//! completely (returning the new state / `true`) or not at all. Implementations
//! return `anyhow::Result`; the engine maps failures to
//! [`crate::AuctionError::Persistence`].

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_schemas::{
    Amount, Bid, BiddingRound, HoldDisposition, ParticipatingRequest, RoundStatus,
};
use uuid::Uuid;

/// Parameters for a round created by [`AuctionStore::create_round_if_none_open`].
/// The store assigns `round_number` (previous max + 1 for the organization).
#[derive(Debug, Clone)]
pub struct NewRound {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenRoundOutcome {
    Created(BiddingRound),
    /// Another caller (or an earlier call) already holds the open slot.
    Existing(BiddingRound),
}

impl OpenRoundOutcome {
    pub fn into_round(self) -> BiddingRound {
        match self {
            OpenRoundOutcome::Created(r) | OpenRoundOutcome::Existing(r) => r,
        }
    }
}

/// An accepted bid to commit against the version that was validated.
#[derive(Debug, Clone)]
pub struct BidCommit {
    pub expected_version: i64,
    /// Accepted Bid row; its `round_id`, `request_id`, `amount` and
    /// `bidder_ref` drive the round and request updates.
    pub bid: Bid,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Round watermark, leader and version were updated together with the
    /// request and the Bid row.
    Applied(BiddingRound),
    /// The round version moved since it was read; re-read and re-validate.
    Conflict,
    /// The round is no longer active or its window has ended.
    RoundClosed,
}

/// The `closing -> settled` write and its hold dispositions, applied together.
#[derive(Debug, Clone)]
pub struct SettlementRecord {
    pub round_id: Uuid,
    pub winning_request_id: Uuid,
    pub winning_bid_amount: Amount,
    pub dispositions: Vec<HoldDisposition>,
    pub settled_at: DateTime<Utc>,
}

/// A `-> cancelled` write guarded by the allowed source statuses.
#[derive(Debug, Clone)]
pub struct CancellationRecord {
    pub round_id: Uuid,
    pub allowed_from: Vec<RoundStatus>,
    pub releases: Vec<HoldDisposition>,
    pub cancelled_at: DateTime<Utc>,
}

/// Which dispositions [`AuctionStore::claim_dispositions`] may take.
#[derive(Debug, Clone)]
pub struct ClaimFilter {
    /// Restrict to one round; `None` sweeps every round.
    pub round_id: Option<Uuid>,
    /// Also re-claim `failed` rows whose `next_attempt_at` has passed.
    pub include_failed: bool,
    /// Also re-claim `claimed` rows last touched at or before this instant
    /// (the dispatcher died between claim and completion).
    pub stale_claimed_before: Option<DateTime<Utc>>,
    /// Rows that already used this many attempts stay where they are.
    pub max_attempts: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispositionResult {
    Done,
    Failed {
        error: String,
        retry_at: DateTime<Utc>,
    },
}

#[async_trait]
pub trait AuctionStore: Send + Sync {
    // --- rounds -----------------------------------------------------------

    /// The organization's round in `pending | active | closing`, if any.
    async fn open_round_for_org(&self, organization_id: Uuid) -> anyhow::Result<Option<BiddingRound>>;

    /// Create an `active` round unless the organization already has an open one.
    async fn create_round_if_none_open(&self, new: NewRound) -> anyhow::Result<OpenRoundOutcome>;

    async fn fetch_round(&self, round_id: Uuid) -> anyhow::Result<Option<BiddingRound>>;

    /// CAS `active -> closing` when `ends_at <= now`. Returns whether this call flipped it.
    async fn close_round_if_expired(&self, round_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn record_settlement(&self, rec: &SettlementRecord) -> anyhow::Result<bool>;

    async fn record_cancellation(&self, rec: &CancellationRecord) -> anyhow::Result<bool>;

    /// Set (or clear with `None`) the round's `settlement_error`.
    async fn record_round_error(&self, round_id: Uuid, error: Option<&str>) -> anyhow::Result<()>;

    /// Rounds needing scheduler attention: expired `active` ones and every `closing` one.
    async fn rounds_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<BiddingRound>>;

    /// Organizations that have had rounds but currently have none open.
    async fn organizations_without_open_round(&self) -> anyhow::Result<Vec<Uuid>>;

    // --- requests ---------------------------------------------------------

    /// Insert into an `active`, unexpired round. `false` if the round has closed.
    async fn insert_request(&self, req: &ParticipatingRequest, now: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn fetch_request(&self, request_id: Uuid) -> anyhow::Result<Option<ParticipatingRequest>>;

    /// All requests in a round ordered by `(created_at, id)`.
    async fn list_requests(&self, round_id: Uuid) -> anyhow::Result<Vec<ParticipatingRequest>>;

    // --- bids -------------------------------------------------------------

    async fn commit_bid(&self, commit: &BidCommit) -> anyhow::Result<CommitOutcome>;

    /// Append a rejected Bid row.
    async fn append_bid(&self, bid: &Bid) -> anyhow::Result<()>;

    /// Bid rows for a request ordered by `created_at`.
    async fn list_bids(&self, request_id: Uuid) -> anyhow::Result<Vec<Bid>>;

    // --- hold dispositions ------------------------------------------------

    /// Move eligible rows to `claimed`, bump `attempts`, and return them.
    async fn claim_dispositions(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<HoldDisposition>>;

    async fn complete_disposition(
        &self,
        disposition_id: Uuid,
        result: &DispositionResult,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn list_dispositions(&self, round_id: Uuid) -> anyhow::Result<Vec<HoldDisposition>>;
}
