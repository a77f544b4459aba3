//! Wiring for the auction core.
//!
//! [`AuctionEngine`] is what binaries and tests hold: it owns one of each
//! component over a shared [`EngineContext`] and forwards the public
//! operations, adding the cross-component steps (cancel then dispatch).

use std::sync::Arc;

use encore_config::AuctionSettings;
use encore_schemas::{Amount, Bid, BiddingRound, HoldDisposition, ParticipatingRequest, RoundView};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::collaborators::{NotificationCollaborator, PaymentCollaborator};
use crate::error::AuctionResult;
use crate::ledger::BidLedger;
use crate::lifecycle::{JoinRound, RoundLifecycle};
use crate::scheduler::{Scheduler, SweepReport};
use crate::settlement::{DispatchReport, SettleReport, SettlementCoordinator};
use crate::store::{AuctionStore, ClaimFilter};

/// Shared handles every component reads from.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn AuctionStore>,
    pub payments: Arc<dyn PaymentCollaborator>,
    pub notifier: Arc<dyn NotificationCollaborator>,
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<AuctionSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    pub round: BiddingRound,
    pub dispatch: DispatchReport,
}

#[derive(Clone)]
pub struct AuctionEngine {
    ctx: EngineContext,
    ledger: BidLedger,
    lifecycle: RoundLifecycle,
    settlement: SettlementCoordinator,
    scheduler: Scheduler,
}

impl AuctionEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let ledger = BidLedger::new(ctx.clone());
        let lifecycle = RoundLifecycle::new(ctx.clone());
        let settlement = SettlementCoordinator::new(ctx.clone());
        let scheduler = Scheduler::new(ctx.clone(), lifecycle.clone(), settlement.clone());
        Self {
            ctx,
            ledger,
            lifecycle,
            settlement,
            scheduler,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn settings(&self) -> &AuctionSettings {
        &self.ctx.settings
    }

    // --- query surface ----------------------------------------------------

    pub async fn active_round(&self, organization_id: Uuid) -> AuctionResult<Option<RoundView>> {
        self.lifecycle.active_round(organization_id).await
    }

    pub async fn round_view(&self, round_id: Uuid) -> AuctionResult<RoundView> {
        self.lifecycle.round_view(round_id).await
    }

    pub async fn min_acceptable_bid(&self, request_id: Uuid) -> AuctionResult<Amount> {
        self.ledger.min_acceptable_bid(request_id).await
    }

    pub async fn bid_history(&self, request_id: Uuid) -> AuctionResult<Vec<Bid>> {
        self.ledger.bid_history(request_id).await
    }

    pub async fn dispositions(&self, round_id: Uuid) -> AuctionResult<Vec<HoldDisposition>> {
        self.settlement.dispositions(round_id).await
    }

    // --- commands ---------------------------------------------------------

    pub async fn ensure_open_round(&self, organization_id: Uuid) -> AuctionResult<BiddingRound> {
        self.lifecycle.ensure_open_round(organization_id).await
    }

    pub async fn join_round(&self, join: JoinRound) -> AuctionResult<ParticipatingRequest> {
        self.lifecycle.join_round(join).await
    }

    pub async fn place_bid(
        &self,
        request_id: Uuid,
        amount: Amount,
        bidder_ref: &str,
    ) -> AuctionResult<Bid> {
        self.ledger.place_bid(request_id, amount, bidder_ref).await
    }

    pub async fn settle(&self, round_id: Uuid) -> AuctionResult<SettleReport> {
        self.settlement.settle(round_id).await
    }

    /// Administrative cancel, then release every participating hold.
    pub async fn cancel_round(&self, round_id: Uuid) -> AuctionResult<CancelReport> {
        let round = self.lifecycle.cancel_round(round_id).await?;
        let dispatch = self
            .settlement
            .dispatch(&ClaimFilter {
                round_id: Some(round_id),
                include_failed: false,
                stale_claimed_before: None,
                max_attempts: self.ctx.settings.settlement.max_hold_attempts,
            })
            .await?;
        Ok(CancelReport { round, dispatch })
    }

    pub async fn sweep(&self) -> AuctionResult<SweepReport> {
        self.scheduler.sweep().await
    }
}
