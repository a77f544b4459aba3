//! Bid Ledger: the only writer of `current_bid_amount`, the round watermark
//! and Bid rows.
//!
//! `place_bid` is read, validate, compare-and-set. A lost CAS re-reads and
//! re-validates up to `bid_retry.max_attempts` times. Every call that reaches
//! a verdict appends exactly one Bid row; a storage failure appends nothing.

use std::time::Duration;

use encore_schemas::{Amount, Bid, BiddingRound, ParticipatingRequest, RejectionReason, RoundStatus};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::notify_outbid;
use crate::engine::EngineContext;
use crate::error::{AuctionError, AuctionResult, PersistenceContext};
use crate::lifecycle::close_if_expired;
use crate::store::{BidCommit, CommitOutcome};
use crate::validator::{self, ProposedBid, RoundState, Verdict};

#[derive(Clone)]
pub struct BidLedger {
    ctx: EngineContext,
}

impl BidLedger {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn place_bid(
        &self,
        request_id: Uuid,
        amount: Amount,
        bidder_ref: &str,
    ) -> AuctionResult<Bid> {
        let max_attempts = self.ctx.settings.bid_retry.max_attempts.max(1);
        let backoff_ms = self.ctx.settings.bid_retry.backoff_ms;
        let mut round_id = None;

        for attempt in 1..=max_attempts {
            let now = self.ctx.clock.now();
            let (request, round) = self.load(request_id).await?;
            round_id = Some(round.id);
            let round = close_if_expired(&self.ctx, round, now).await?;
            let state = self.snapshot(&round, &request, now);

            match validator::validate(&state, ProposedBid { amount }) {
                Verdict::Reject {
                    reason,
                    min_acceptable,
                } => {
                    let bid = Bid::rejected(round.id, request_id, amount, bidder_ref, now, reason);
                    self.ctx.store.append_bid(&bid).await.persisted()?;
                    debug!(%request_id, amount, min_acceptable, reason = reason.as_str(), "bid rejected");
                    return Err(rejection_error(reason, &round, &state, amount, min_acceptable));
                }
                Verdict::Accept => {}
            }

            let commit = BidCommit {
                expected_version: round.version,
                bid: Bid::accepted(round.id, request_id, amount, bidder_ref, now),
                now,
            };
            match self.ctx.store.commit_bid(&commit).await.persisted()? {
                CommitOutcome::Applied(updated) => {
                    info!(
                        round_id = %updated.id,
                        %request_id,
                        amount,
                        attempt,
                        version = updated.version,
                        "bid accepted"
                    );
                    if let Some(prev) = round.leader_request_id.filter(|p| *p != request_id) {
                        notify_outbid(self.ctx.notifier.as_ref(), prev, updated.watermark).await;
                    }
                    return Ok(commit.bid);
                }
                CommitOutcome::RoundClosed => {
                    // Closed between our read and our write: treat like a status rejection.
                    let fresh = self.ctx.store.fetch_round(round.id).await.persisted()?;
                    let round = close_if_expired(&self.ctx, fresh.unwrap_or(round), now).await?;
                    let status = if round.status == RoundStatus::Active {
                        RoundStatus::Closing
                    } else {
                        round.status
                    };
                    let bid = Bid::rejected(
                        round.id,
                        request_id,
                        amount,
                        bidder_ref,
                        now,
                        RejectionReason::RoundNotActive,
                    );
                    self.ctx.store.append_bid(&bid).await.persisted()?;
                    return Err(AuctionError::RoundNotActive {
                        round_id: round.id,
                        status,
                    });
                }
                CommitOutcome::Conflict => {
                    warn!(round_id = %round.id, %request_id, amount, attempt, "bid lost compare-and-set");
                    if attempt < max_attempts && backoff_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(backoff_ms * u64::from(attempt)))
                            .await;
                    }
                }
            }
        }

        let now = self.ctx.clock.now();
        let round_id = match round_id {
            Some(id) => id,
            None => self.load(request_id).await?.1.id,
        };
        let bid = Bid::rejected(
            round_id,
            request_id,
            amount,
            bidder_ref,
            now,
            RejectionReason::Contention,
        );
        self.ctx.store.append_bid(&bid).await.persisted()?;
        warn!(%round_id, %request_id, amount, attempts = max_attempts, "bid retries exhausted");
        Err(AuctionError::Contention {
            attempts: max_attempts,
        })
    }

    /// Lowest amount a bid on `request_id` would be accepted at right now.
    pub async fn min_acceptable_bid(&self, request_id: Uuid) -> AuctionResult<Amount> {
        let now = self.ctx.clock.now();
        let (request, round) = self.load(request_id).await?;
        let round = close_if_expired(&self.ctx, round, now).await?;
        if !round.accepts_bids(now) {
            return Err(AuctionError::RoundNotActive {
                round_id: round.id,
                status: round.status,
            });
        }
        validator::min_acceptable(&self.snapshot(&round, &request, now))
            .ok_or(AuctionError::InvalidAmount { amount: Amount::MAX })
    }

    /// Every Bid row for the request, accepted and rejected, oldest first.
    pub async fn bid_history(&self, request_id: Uuid) -> AuctionResult<Vec<Bid>> {
        if self.ctx.store.fetch_request(request_id).await.persisted()?.is_none() {
            return Err(AuctionError::RequestNotFound(request_id));
        }
        self.ctx.store.list_bids(request_id).await.persisted()
    }

    async fn load(&self, request_id: Uuid) -> AuctionResult<(ParticipatingRequest, BiddingRound)> {
        let request = self
            .ctx
            .store
            .fetch_request(request_id)
            .await
            .persisted()?
            .ok_or(AuctionError::RequestNotFound(request_id))?;
        let round = self
            .ctx
            .store
            .fetch_round(request.round_id)
            .await
            .persisted()?
            .ok_or(AuctionError::RoundNotFound(request.round_id))?;
        Ok((request, round))
    }

    fn snapshot(
        &self,
        round: &BiddingRound,
        request: &ParticipatingRequest,
        now: chrono::DateTime<chrono::Utc>,
    ) -> RoundState {
        let policy = self.ctx.settings.policy_for(round.organization_id);
        // An expired round is closed for bidding even if the CAS flip lost to a sweep.
        let status = if round.status == RoundStatus::Active && round.is_expired(now) {
            RoundStatus::Closing
        } else {
            round.status
        };
        validator::with_policy(
            status,
            round.watermark,
            round.leader_request_id,
            request.id,
            request.current_bid_amount,
            &policy,
        )
    }
}

fn rejection_error(
    reason: RejectionReason,
    round: &BiddingRound,
    state: &RoundState,
    amount: Amount,
    min_acceptable: Amount,
) -> AuctionError {
    match reason {
        RejectionReason::RoundNotActive => AuctionError::RoundNotActive {
            round_id: round.id,
            status: state.status,
        },
        RejectionReason::InvalidAmount => AuctionError::InvalidAmount { amount },
        RejectionReason::BidTooLow => AuctionError::BidTooLow { min_acceptable },
        RejectionReason::Contention => AuctionError::Contention { attempts: 0 },
    }
}
