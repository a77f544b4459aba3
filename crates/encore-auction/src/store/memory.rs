use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_schemas::{
    Bid, BiddingRound, DispositionStatus, HoldDisposition, ParticipatingRequest, RoundStatus,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AuctionStore, BidCommit, CancellationRecord, ClaimFilter, CommitOutcome, DispositionResult,
    NewRound, OpenRoundOutcome, SettlementRecord,
};

#[derive(Debug, Default)]
struct Inner {
    rounds: HashMap<Uuid, BiddingRound>,
    requests: HashMap<Uuid, ParticipatingRequest>,
    bids: Vec<Bid>,
    dispositions: Vec<HoldDisposition>,
}

impl Inner {
    fn open_round(&self, organization_id: Uuid) -> Option<&BiddingRound> {
        self.rounds
            .values()
            .find(|r| r.organization_id == organization_id && r.status.is_open())
    }
}

/// Single-mutex store with the same compare-and-set semantics as the Postgres
/// store. Every trait call holds the lock for its whole read-check-write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the backing database were down.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory store marked unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl AuctionStore for MemoryStore {
    async fn open_round_for_org(&self, organization_id: Uuid) -> Result<Option<BiddingRound>> {
        self.check_available()?;
        let g = self.inner.lock().await;
        Ok(g.open_round(organization_id).cloned())
    }

    async fn create_round_if_none_open(&self, new: NewRound) -> Result<OpenRoundOutcome> {
        self.check_available()?;
        let mut g = self.inner.lock().await;
        if let Some(existing) = g.open_round(new.organization_id) {
            return Ok(OpenRoundOutcome::Existing(existing.clone()));
        }

        let round_number = g
            .rounds
            .values()
            .filter(|r| r.organization_id == new.organization_id)
            .map(|r| r.round_number)
            .max()
            .unwrap_or(0)
            + 1;

        let round = BiddingRound {
            id: new.id,
            organization_id: new.organization_id,
            round_number,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            status: RoundStatus::Active,
            winning_request_id: None,
            winning_bid_amount: None,
            watermark: 0,
            leader_request_id: None,
            version: 0,
            settlement_error: None,
            created_at: new.starts_at,
            closed_at: None,
            settled_at: None,
        };
        g.rounds.insert(round.id, round.clone());
        Ok(OpenRoundOutcome::Created(round))
    }

    async fn fetch_round(&self, round_id: Uuid) -> Result<Option<BiddingRound>> {
        self.check_available()?;
        Ok(self.inner.lock().await.rounds.get(&round_id).cloned())
    }

    async fn close_round_if_expired(&self, round_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.check_available()?;
        let mut g = self.inner.lock().await;
        let Some(round) = g.rounds.get_mut(&round_id) else {
            return Ok(false);
        };
        if round.status != RoundStatus::Active || !round.is_expired(now) {
            return Ok(false);
        }
        round.status = RoundStatus::Closing;
        round.closed_at = Some(now);
        Ok(true)
    }

    async fn record_settlement(&self, rec: &SettlementRecord) -> Result<bool> {
        self.check_available()?;
        let mut g = self.inner.lock().await;
        let Some(round) = g.rounds.get_mut(&rec.round_id) else {
            return Ok(false);
        };
        if round.status != RoundStatus::Closing {
            return Ok(false);
        }
        round.status = RoundStatus::Settled;
        round.winning_request_id = Some(rec.winning_request_id);
        round.winning_bid_amount = Some(rec.winning_bid_amount);
        round.settled_at = Some(rec.settled_at);
        round.settlement_error = None;
        g.dispositions.extend(rec.dispositions.iter().cloned());
        Ok(true)
    }

    async fn record_cancellation(&self, rec: &CancellationRecord) -> Result<bool> {
        self.check_available()?;
        let mut g = self.inner.lock().await;
        let Some(round) = g.rounds.get_mut(&rec.round_id) else {
            return Ok(false);
        };
        if !rec.allowed_from.contains(&round.status) {
            return Ok(false);
        }
        round.status = RoundStatus::Cancelled;
        round.closed_at.get_or_insert(rec.cancelled_at);
        round.settlement_error = None;
        g.dispositions.extend(rec.releases.iter().cloned());
        Ok(true)
    }

    async fn record_round_error(&self, round_id: Uuid, error: Option<&str>) -> Result<()> {
        self.check_available()?;
        let mut g = self.inner.lock().await;
        if let Some(round) = g.rounds.get_mut(&round_id) {
            round.settlement_error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn rounds_due(&self, now: DateTime<Utc>) -> Result<Vec<BiddingRound>> {
        self.check_available()?;
        let g = self.inner.lock().await;
        let mut due: Vec<BiddingRound> = g
            .rounds
            .values()
            .filter(|r| {
                r.status == RoundStatus::Closing
                    || (r.status == RoundStatus::Active && r.is_expired(now))
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.ends_at, r.id));
        Ok(due)
    }

    async fn organizations_without_open_round(&self) -> Result<Vec<Uuid>> {
        self.check_available()?;
        let g = self.inner.lock().await;
        let mut seen = BTreeSet::new();
        let mut open = BTreeSet::new();
        for r in g.rounds.values() {
            seen.insert(r.organization_id);
            if r.status.is_open() {
                open.insert(r.organization_id);
            }
        }
        Ok(seen.difference(&open).copied().collect())
    }

    async fn insert_request(&self, req: &ParticipatingRequest, now: DateTime<Utc>) -> Result<bool> {
        self.check_available()?;
        let mut g = self.inner.lock().await;
        match g.rounds.get(&req.round_id) {
            Some(round) if round.accepts_bids(now) => {}
            Some(_) => return Ok(false),
            None => bail!("round {} not found", req.round_id),
        }
        if g.requests.contains_key(&req.id) {
            bail!("request {} already exists", req.id);
        }
        g.requests.insert(req.id, req.clone());
        Ok(true)
    }

    async fn fetch_request(&self, request_id: Uuid) -> Result<Option<ParticipatingRequest>> {
        self.check_available()?;
        Ok(self.inner.lock().await.requests.get(&request_id).cloned())
    }

    async fn list_requests(&self, round_id: Uuid) -> Result<Vec<ParticipatingRequest>> {
        self.check_available()?;
        let g = self.inner.lock().await;
        let mut out: Vec<ParticipatingRequest> = g
            .requests
            .values()
            .filter(|r| r.round_id == round_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }

    async fn commit_bid(&self, commit: &BidCommit) -> Result<CommitOutcome> {
        self.check_available()?;
        let bid = &commit.bid;
        let mut g = self.inner.lock().await;

        let Some(round) = g.rounds.get(&bid.round_id) else {
            bail!("round {} not found", bid.round_id);
        };
        if !round.accepts_bids(commit.now) {
            return Ok(CommitOutcome::RoundClosed);
        }
        if round.version != commit.expected_version {
            return Ok(CommitOutcome::Conflict);
        }
        match g.requests.get(&bid.request_id) {
            Some(r) if r.round_id == bid.round_id => {}
            _ => bail!("request {} not in round {}", bid.request_id, bid.round_id),
        }

        let Some(round) = g.rounds.get_mut(&bid.round_id) else {
            bail!("round {} not found", bid.round_id);
        };
        round.watermark = round.watermark.max(bid.amount);
        round.leader_request_id = Some(bid.request_id);
        round.version += 1;
        let updated = round.clone();

        if let Some(req) = g.requests.get_mut(&bid.request_id) {
            req.current_bid_amount = bid.amount;
            req.highest_bidder_ref = bid.bidder_ref.clone();
            req.accepted_bids += 1;
        }
        g.bids.push(bid.clone());
        Ok(CommitOutcome::Applied(updated))
    }

    async fn append_bid(&self, bid: &Bid) -> Result<()> {
        self.check_available()?;
        self.inner.lock().await.bids.push(bid.clone());
        Ok(())
    }

    async fn list_bids(&self, request_id: Uuid) -> Result<Vec<Bid>> {
        self.check_available()?;
        let g = self.inner.lock().await;
        // Vec order is append order, so the sort is stable for equal timestamps.
        let mut out: Vec<Bid> = g
            .bids
            .iter()
            .filter(|b| b.request_id == request_id)
            .cloned()
            .collect();
        out.sort_by_key(|b| b.created_at);
        Ok(out)
    }

    async fn claim_dispositions(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<HoldDisposition>> {
        self.check_available()?;
        let mut g = self.inner.lock().await;
        let mut claimed = Vec::new();
        for d in g.dispositions.iter_mut() {
            if filter.round_id.is_some_and(|id| id != d.round_id) {
                continue;
            }
            if d.attempts >= filter.max_attempts {
                continue;
            }
            let eligible = match d.status {
                DispositionStatus::Pending => true,
                DispositionStatus::Failed => {
                    filter.include_failed && d.next_attempt_at.map_or(true, |t| t <= now)
                }
                DispositionStatus::Claimed => filter
                    .stale_claimed_before
                    .is_some_and(|cutoff| d.updated_at <= cutoff),
                DispositionStatus::Done => false,
            };
            if !eligible {
                continue;
            }
            d.status = DispositionStatus::Claimed;
            d.attempts += 1;
            d.updated_at = now;
            claimed.push(d.clone());
        }
        Ok(claimed)
    }

    async fn complete_disposition(
        &self,
        disposition_id: Uuid,
        result: &DispositionResult,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        let mut g = self.inner.lock().await;
        let Some(d) = g.dispositions.iter_mut().find(|d| d.id == disposition_id) else {
            bail!("hold disposition {disposition_id} not found");
        };
        match result {
            DispositionResult::Done => {
                d.status = DispositionStatus::Done;
                d.last_error = None;
                d.next_attempt_at = None;
            }
            DispositionResult::Failed { error, retry_at } => {
                d.status = DispositionStatus::Failed;
                d.last_error = Some(error.clone());
                d.next_attempt_at = Some(*retry_at);
            }
        }
        d.updated_at = now;
        Ok(())
    }

    async fn list_dispositions(&self, round_id: Uuid) -> Result<Vec<HoldDisposition>> {
        self.check_available()?;
        let g = self.inner.lock().await;
        Ok(g.dispositions
            .iter()
            .filter(|d| d.round_id == round_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use encore_schemas::RequestKind;

    fn new_round(org: Uuid, now: DateTime<Utc>) -> NewRound {
        NewRound {
            id: Uuid::new_v4(),
            organization_id: org,
            starts_at: now,
            ends_at: now + Duration::minutes(30),
        }
    }

    fn request(round: &BiddingRound, at: DateTime<Utc>) -> ParticipatingRequest {
        ParticipatingRequest {
            id: Uuid::new_v4(),
            round_id: round.id,
            organization_id: round.organization_id,
            kind: RequestKind::SongRequest,
            seed_amount: 0,
            current_bid_amount: 0,
            highest_bidder_ref: "guest".to_string(),
            payment_hold_ref: format!("hold-{}", Uuid::new_v4()),
            accepted_bids: 0,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn second_create_returns_existing_round() {
        let s = MemoryStore::new();
        let org = Uuid::new_v4();
        let now = Utc::now();

        let first = s.create_round_if_none_open(new_round(org, now)).await.unwrap();
        let second = s.create_round_if_none_open(new_round(org, now)).await.unwrap();

        let OpenRoundOutcome::Created(a) = first else { panic!("expected Created") };
        let OpenRoundOutcome::Existing(b) = second else { panic!("expected Existing") };
        assert_eq!(a.id, b.id);
        assert_eq!(a.round_number, 1);
    }

    #[tokio::test]
    async fn round_numbers_increase_per_organization() {
        let s = MemoryStore::new();
        let org = Uuid::new_v4();
        let now = Utc::now();

        let r1 = s.create_round_if_none_open(new_round(org, now)).await.unwrap().into_round();
        let cancelled = s
            .record_cancellation(&CancellationRecord {
                round_id: r1.id,
                allowed_from: vec![RoundStatus::Active],
                releases: vec![],
                cancelled_at: now,
            })
            .await
            .unwrap();
        assert!(cancelled);

        let r2 = s.create_round_if_none_open(new_round(org, now)).await.unwrap().into_round();
        assert_eq!(r2.round_number, 2);

        let other = s
            .create_round_if_none_open(new_round(Uuid::new_v4(), now))
            .await
            .unwrap()
            .into_round();
        assert_eq!(other.round_number, 1);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let s = MemoryStore::new();
        let now = Utc::now();
        let round = s
            .create_round_if_none_open(new_round(Uuid::new_v4(), now))
            .await
            .unwrap()
            .into_round();
        let req = request(&round, now);
        assert!(s.insert_request(&req, now).await.unwrap());

        let commit = |amount| BidCommit {
            expected_version: 0,
            bid: Bid::accepted(round.id, req.id, amount, "guest", now),
            now,
        };
        assert!(matches!(s.commit_bid(&commit(500)).await.unwrap(), CommitOutcome::Applied(_)));
        assert_eq!(s.commit_bid(&commit(600)).await.unwrap(), CommitOutcome::Conflict);

        let stored = s.fetch_request(req.id).await.unwrap().unwrap();
        assert_eq!(stored.current_bid_amount, 500);
        assert_eq!(s.list_bids(req.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_after_expiry_reports_closed() {
        let s = MemoryStore::new();
        let now = Utc::now();
        let round = s
            .create_round_if_none_open(new_round(Uuid::new_v4(), now))
            .await
            .unwrap()
            .into_round();
        let req = request(&round, now);
        s.insert_request(&req, now).await.unwrap();

        let late = round.ends_at;
        let out = s
            .commit_bid(&BidCommit {
                expected_version: 0,
                bid: Bid::accepted(round.id, req.id, 900, "guest", late),
                now: late,
            })
            .await
            .unwrap();
        assert_eq!(out, CommitOutcome::RoundClosed);
        assert!(!s.insert_request(&request(&round, late), late).await.unwrap());
    }

    #[tokio::test]
    async fn settlement_flip_happens_once() {
        let s = MemoryStore::new();
        let now = Utc::now();
        let round = s
            .create_round_if_none_open(new_round(Uuid::new_v4(), now))
            .await
            .unwrap()
            .into_round();
        let req = request(&round, now);
        s.insert_request(&req, now).await.unwrap();
        assert!(s.close_round_if_expired(round.id, round.ends_at).await.unwrap());

        let rec = SettlementRecord {
            round_id: round.id,
            winning_request_id: req.id,
            winning_bid_amount: 500,
            dispositions: vec![HoldDisposition::capture(&req, 500, now)],
            settled_at: round.ends_at,
        };
        assert!(s.record_settlement(&rec).await.unwrap());
        assert!(!s.record_settlement(&rec).await.unwrap());
        assert_eq!(s.list_dispositions(round.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claimed_rows_are_not_reclaimed_until_stale() {
        let s = MemoryStore::new();
        let now = Utc::now();
        let round = s
            .create_round_if_none_open(new_round(Uuid::new_v4(), now))
            .await
            .unwrap()
            .into_round();
        let req = request(&round, now);
        s.insert_request(&req, now).await.unwrap();
        s.record_cancellation(&CancellationRecord {
            round_id: round.id,
            allowed_from: vec![RoundStatus::Active],
            releases: vec![HoldDisposition::release(&req, now)],
            cancelled_at: now,
        })
        .await
        .unwrap();

        let mut filter = ClaimFilter {
            round_id: None,
            include_failed: true,
            stale_claimed_before: None,
            max_attempts: 5,
        };
        assert_eq!(s.claim_dispositions(&filter, now).await.unwrap().len(), 1);
        assert!(s.claim_dispositions(&filter, now).await.unwrap().is_empty());

        filter.stale_claimed_before = Some(now);
        let again = s.claim_dispositions(&filter, now).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let s = MemoryStore::new();
        s.set_unavailable(true);
        assert!(s.open_round_for_org(Uuid::new_v4()).await.is_err());
        s.set_unavailable(false);
        assert!(s.open_round_for_org(Uuid::new_v4()).await.unwrap().is_none());
    }
}
