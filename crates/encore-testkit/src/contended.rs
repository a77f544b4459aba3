use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_auction::store::{
    AuctionStore, BidCommit, CancellationRecord, ClaimFilter, CommitOutcome, DispositionResult,
    NewRound, OpenRoundOutcome, SettlementRecord,
};
use encore_auction::MemoryStore;
use encore_schemas::{Bid, BiddingRound, HoldDisposition, ParticipatingRequest};
use uuid::Uuid;

/// [`MemoryStore`] front whose next `conflicts` bid commits lose the
/// compare-and-set without touching state. Everything else passes through.
pub struct ContendedStore {
    inner: Arc<MemoryStore>,
    conflicts_left: AtomicU32,
    commits_seen: AtomicU32,
}

impl ContendedStore {
    pub fn new(inner: Arc<MemoryStore>, conflicts: u32) -> Self {
        Self {
            inner,
            conflicts_left: AtomicU32::new(conflicts),
            commits_seen: AtomicU32::new(0),
        }
    }

    /// Total `commit_bid` calls, including the forced conflicts.
    pub fn commits_seen(&self) -> u32 {
        self.commits_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuctionStore for ContendedStore {
    async fn open_round_for_org(&self, organization_id: Uuid) -> anyhow::Result<Option<BiddingRound>> {
        self.inner.open_round_for_org(organization_id).await
    }

    async fn create_round_if_none_open(&self, new: NewRound) -> anyhow::Result<OpenRoundOutcome> {
        self.inner.create_round_if_none_open(new).await
    }

    async fn fetch_round(&self, round_id: Uuid) -> anyhow::Result<Option<BiddingRound>> {
        self.inner.fetch_round(round_id).await
    }

    async fn close_round_if_expired(&self, round_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        self.inner.close_round_if_expired(round_id, now).await
    }

    async fn record_settlement(&self, rec: &SettlementRecord) -> anyhow::Result<bool> {
        self.inner.record_settlement(rec).await
    }

    async fn record_cancellation(&self, rec: &CancellationRecord) -> anyhow::Result<bool> {
        self.inner.record_cancellation(rec).await
    }

    async fn record_round_error(&self, round_id: Uuid, error: Option<&str>) -> anyhow::Result<()> {
        self.inner.record_round_error(round_id, error).await
    }

    async fn rounds_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<BiddingRound>> {
        self.inner.rounds_due(now).await
    }

    async fn organizations_without_open_round(&self) -> anyhow::Result<Vec<Uuid>> {
        self.inner.organizations_without_open_round().await
    }

    async fn insert_request(&self, req: &ParticipatingRequest, now: DateTime<Utc>) -> anyhow::Result<bool> {
        self.inner.insert_request(req, now).await
    }

    async fn fetch_request(&self, request_id: Uuid) -> anyhow::Result<Option<ParticipatingRequest>> {
        self.inner.fetch_request(request_id).await
    }

    async fn list_requests(&self, round_id: Uuid) -> anyhow::Result<Vec<ParticipatingRequest>> {
        self.inner.list_requests(round_id).await
    }

    async fn commit_bid(&self, commit: &BidCommit) -> anyhow::Result<CommitOutcome> {
        self.commits_seen.fetch_add(1, Ordering::SeqCst);
        let forced = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Ok(CommitOutcome::Conflict);
        }
        self.inner.commit_bid(commit).await
    }

    async fn append_bid(&self, bid: &Bid) -> anyhow::Result<()> {
        self.inner.append_bid(bid).await
    }

    async fn list_bids(&self, request_id: Uuid) -> anyhow::Result<Vec<Bid>> {
        self.inner.list_bids(request_id).await
    }

    async fn claim_dispositions(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<HoldDisposition>> {
        self.inner.claim_dispositions(filter, now).await
    }

    async fn complete_disposition(
        &self,
        disposition_id: Uuid,
        result: &DispositionResult,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.inner.complete_disposition(disposition_id, result, now).await
    }

    async fn list_dispositions(&self, round_id: Uuid) -> anyhow::Result<Vec<HoldDisposition>> {
        self.inner.list_dispositions(round_id).await
    }
}
