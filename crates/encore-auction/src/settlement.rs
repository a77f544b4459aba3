//! Settlement Coordinator.
//!
//! A `closing` round is resolved in two steps:
//!
//! 1. **Decide.** Pick the winner and write `closing -> settled` (or
//!    `-> cancelled`) together with one hold disposition per request. The
//!    status CAS makes this happen at most once per round.
//! 2. **Dispatch.** Claim pending dispositions and call the payment
//!    collaborator. A claim is taken before each call, so one claim produces
//!    at most one capture/release attempt.
//!
//! A crash between the two steps leaves `pending` dispositions on a settled
//! round; the next dispatch finishes them without re-deciding the winner.

use std::cmp::Reverse;

use chrono::Duration;
use encore_schemas::{
    Amount, BiddingRound, HoldAction, HoldDisposition, ParticipatingRequest, RoundStatus,
};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collaborators::{notify_failure, notify_lost, notify_settled};
use crate::engine::EngineContext;
use crate::error::{AuctionError, AuctionResult, PersistenceContext};
use crate::lifecycle::close_if_expired;
use crate::store::{CancellationRecord, ClaimFilter, DispositionResult, SettlementRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettleOutcome {
    Settled {
        round: BiddingRound,
        winning_request_id: Uuid,
        winning_bid_amount: Amount,
    },
    /// No request had an accepted bid; every hold is released.
    Cancelled { round: BiddingRound, released: usize },
    /// Already settled or cancelled by an earlier call.
    AlreadyFinal { round: BiddingRound },
}

impl SettleOutcome {
    pub fn round(&self) -> &BiddingRound {
        match self {
            SettleOutcome::Settled { round, .. }
            | SettleOutcome::Cancelled { round, .. }
            | SettleOutcome::AlreadyFinal { round } => round,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn merge(&mut self, other: DispatchReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettleReport {
    #[serde(flatten)]
    pub outcome: SettleOutcome,
    pub dispatch: DispatchReport,
}

/// Highest `current_bid_amount` among requests with at least one accepted bid.
/// Ties go to the earliest `created_at`, then the lowest id.
pub fn pick_winner(requests: &[ParticipatingRequest]) -> Option<&ParticipatingRequest> {
    requests
        .iter()
        .filter(|r| r.has_accepted_bid())
        .min_by_key(|r| (Reverse(r.current_bid_amount), r.created_at, r.id))
}

#[derive(Clone)]
pub struct SettlementCoordinator {
    ctx: EngineContext,
}

impl SettlementCoordinator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Idempotent: on a round that is already final this only dispatches
    /// dispositions that were never attempted.
    pub async fn settle(&self, round_id: Uuid) -> AuctionResult<SettleReport> {
        let now = self.ctx.clock.now();
        let round = self
            .ctx
            .store
            .fetch_round(round_id)
            .await
            .persisted()?
            .ok_or(AuctionError::RoundNotFound(round_id))?;
        let round = close_if_expired(&self.ctx, round, now).await?;

        let mut losers = Vec::new();
        let outcome = if round.status.is_terminal() {
            SettleOutcome::AlreadyFinal { round }
        } else if round.status == RoundStatus::Closing {
            match self.decide(&round).await {
                Ok((outcome, lost)) => {
                    losers = lost;
                    outcome
                }
                Err(reason) => return Err(self.fail_before_flip(round_id, reason).await),
            }
        } else {
            return Err(AuctionError::IllegalTransition {
                round_id,
                from: round.status,
                to: RoundStatus::Settled,
            });
        };

        if let SettleOutcome::Settled {
            winning_request_id,
            winning_bid_amount,
            ..
        } = &outcome
        {
            let notifier = self.ctx.notifier.as_ref();
            notify_settled(notifier, round_id, *winning_request_id).await;
            for request_id in losers {
                notify_lost(notifier, round_id, request_id, *winning_bid_amount).await;
            }
        }

        let dispatch = self
            .dispatch(&ClaimFilter {
                round_id: Some(round_id),
                include_failed: false,
                stale_claimed_before: None,
                max_attempts: self.ctx.settings.settlement.max_hold_attempts,
            })
            .await?;
        Ok(SettleReport { outcome, dispatch })
    }

    /// Step 1. Errors are reasons; the round is left `closing`. On a fresh
    /// settlement also returns the non-winning request ids.
    async fn decide(&self, round: &BiddingRound) -> Result<(SettleOutcome, Vec<Uuid>), String> {
        let now = self.ctx.clock.now();
        let requests = self
            .ctx
            .store
            .list_requests(round.id)
            .await
            .map_err(|e| format!("loading requests: {e:#}"))?;

        let Some(winner) = pick_winner(&requests) else {
            let releases: Vec<HoldDisposition> = requests
                .iter()
                .map(|r| HoldDisposition::release(r, now))
                .collect();
            let released = releases.len();
            let rec = CancellationRecord {
                round_id: round.id,
                allowed_from: vec![RoundStatus::Closing],
                releases,
                cancelled_at: now,
            };
            let applied = self
                .ctx
                .store
                .record_cancellation(&rec)
                .await
                .map_err(|e| format!("recording cancellation: {e:#}"))?;
            if !applied {
                let round = self.refetch(round).await?;
                return Ok((SettleOutcome::AlreadyFinal { round }, Vec::new()));
            }
            let round = BiddingRound {
                status: RoundStatus::Cancelled,
                closed_at: Some(round.closed_at.unwrap_or(now)),
                settlement_error: None,
                ..round.clone()
            };
            info!(round_id = %round.id, released, "round cancelled: no accepted bids");
            return Ok((SettleOutcome::Cancelled { round, released }, Vec::new()));
        };

        let winning_request_id = winner.id;
        let winning_bid_amount = winner.current_bid_amount;
        let dispositions = requests
            .iter()
            .map(|r| {
                if r.id == winning_request_id {
                    HoldDisposition::capture(r, winning_bid_amount, now)
                } else {
                    HoldDisposition::release(r, now)
                }
            })
            .collect();
        let rec = SettlementRecord {
            round_id: round.id,
            winning_request_id,
            winning_bid_amount,
            dispositions,
            settled_at: now,
        };
        let applied = self
            .ctx
            .store
            .record_settlement(&rec)
            .await
            .map_err(|e| format!("recording settlement: {e:#}"))?;
        if !applied {
            let round = self.refetch(round).await?;
            return Ok((SettleOutcome::AlreadyFinal { round }, Vec::new()));
        }
        let round = BiddingRound {
            status: RoundStatus::Settled,
            winning_request_id: Some(winning_request_id),
            winning_bid_amount: Some(winning_bid_amount),
            settled_at: Some(now),
            settlement_error: None,
            ..round.clone()
        };
        info!(
            round_id = %round.id,
            %winning_request_id,
            winning_bid_amount,
            participants = requests.len(),
            "round settled"
        );
        let losers = requests
            .iter()
            .map(|r| r.id)
            .filter(|id| *id != winning_request_id)
            .collect();
        Ok((
            SettleOutcome::Settled {
                round,
                winning_request_id,
                winning_bid_amount,
            },
            losers,
        ))
    }

    async fn refetch(&self, round: &BiddingRound) -> Result<BiddingRound, String> {
        self.ctx
            .store
            .fetch_round(round.id)
            .await
            .map_err(|e| format!("reloading round: {e:#}"))?
            .ok_or_else(|| format!("round {} disappeared", round.id))
    }

    async fn fail_before_flip(&self, round_id: Uuid, reason: String) -> AuctionError {
        error!(%round_id, reason = %reason, "settlement failed; round stays closing");
        if let Err(e) = self.ctx.store.record_round_error(round_id, Some(&reason)).await {
            warn!(%round_id, error = %format!("{e:#}"), "could not record settlement error");
        }
        notify_failure(self.ctx.notifier.as_ref(), round_id, &reason).await;
        AuctionError::SettlementFailure { round_id, reason }
    }

    /// Step 2. Claim matching dispositions and execute them one by one.
    pub async fn dispatch(&self, filter: &ClaimFilter) -> AuctionResult<DispatchReport> {
        let now = self.ctx.clock.now();
        let claimed = self
            .ctx
            .store
            .claim_dispositions(filter, now)
            .await
            .persisted()?;

        let mut report = DispatchReport::default();
        for d in claimed {
            report.attempted += 1;
            let result = match (d.action, d.amount) {
                (HoldAction::Capture, Some(amount)) => {
                    self.ctx.payments.capture(&d.hold_ref, amount).await
                }
                (HoldAction::Capture, None) => Err(anyhow::anyhow!("capture without an amount")),
                (HoldAction::Release, _) => self.ctx.payments.release(&d.hold_ref).await,
            };

            let done_at = self.ctx.clock.now();
            match result {
                Ok(()) => {
                    self.ctx
                        .store
                        .complete_disposition(d.id, &DispositionResult::Done, done_at)
                        .await
                        .persisted()?;
                    report.succeeded += 1;
                    info!(
                        round_id = %d.round_id,
                        request_id = %d.request_id,
                        action = d.action.as_str(),
                        attempt = d.attempts,
                        "hold disposition done"
                    );
                }
                Err(e) => {
                    let reason = format!("{} {} failed: {e:#}", d.action.as_str(), d.hold_ref);
                    let retry_at =
                        done_at + Duration::seconds(self.ctx.settings.settlement.retry_backoff_secs);
                    self.ctx
                        .store
                        .complete_disposition(
                            d.id,
                            &DispositionResult::Failed {
                                error: reason.clone(),
                                retry_at,
                            },
                            done_at,
                        )
                        .await
                        .persisted()?;
                    report.failed += 1;
                    error!(
                        round_id = %d.round_id,
                        request_id = %d.request_id,
                        attempt = d.attempts,
                        reason = %reason,
                        "hold disposition failed"
                    );
                    self.ctx
                        .store
                        .record_round_error(d.round_id, Some(&reason))
                        .await
                        .persisted()?;
                    notify_failure(self.ctx.notifier.as_ref(), d.round_id, &reason).await;
                }
            }
        }
        Ok(report)
    }

    /// Scheduler pass: pending rows anywhere, failed rows past their backoff,
    /// and claims abandoned for longer than the backoff.
    pub async fn retry_due(&self) -> AuctionResult<DispatchReport> {
        let settings = &self.ctx.settings.settlement;
        let stale = self.ctx.clock.now() - Duration::seconds(settings.retry_backoff_secs);
        self.dispatch(&ClaimFilter {
            round_id: None,
            include_failed: true,
            stale_claimed_before: Some(stale),
            max_attempts: settings.max_hold_attempts,
        })
        .await
    }

    pub async fn dispositions(&self, round_id: Uuid) -> AuctionResult<Vec<HoldDisposition>> {
        self.ctx.store.list_dispositions(round_id).await.persisted()
    }
}
