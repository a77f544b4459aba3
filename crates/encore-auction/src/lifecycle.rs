//! Round Lifecycle Manager.
//!
//! Owns `BiddingRound.status`. Rounds are created `active` by a per-organization
//! create-if-none-open CAS, flip to `closing` once `now >= ends_at` (lazily here
//! or from the scheduler sweep), and only the settlement coordinator or an
//! administrative cancel moves them further.

use chrono::{DateTime, Duration, Utc};
use encore_schemas::{
    Amount, BiddingRound, HoldDisposition, ParticipatingRequest, RequestKind, RoundStatus,
    RoundView,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::EngineContext;
use crate::error::{AuctionError, AuctionResult, PersistenceContext};
use crate::store::{CancellationRecord, NewRound, OpenRoundOutcome};

/// A paid request opting into its organization's open round.
///
/// `payment_hold_ref` comes from `PaymentCollaborator::authorize`, performed
/// by request intake before joining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRound {
    pub organization_id: Uuid,
    pub kind: RequestKind,
    pub bidder_ref: String,
    pub payment_hold_ref: String,
    #[serde(default)]
    pub seed_amount: Amount,
}

#[derive(Clone)]
pub struct RoundLifecycle {
    ctx: EngineContext,
}

impl RoundLifecycle {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// The organization's open round, creating a fresh `active` one if none exists.
    pub async fn ensure_open_round(&self, organization_id: Uuid) -> AuctionResult<BiddingRound> {
        let store = &self.ctx.store;
        if let Some(round) = store.open_round_for_org(organization_id).await.persisted()? {
            return Ok(round);
        }

        let policy = self.ctx.settings.policy_for(organization_id);
        let now = self.ctx.clock.now();
        let new = NewRound {
            id: Uuid::new_v4(),
            organization_id,
            starts_at: now,
            ends_at: now + Duration::seconds(policy.round_duration_secs),
        };
        match store.create_round_if_none_open(new).await.persisted()? {
            OpenRoundOutcome::Created(round) => {
                info!(
                    round_id = %round.id,
                    %organization_id,
                    round_number = round.round_number,
                    ends_at = %round.ends_at,
                    "round opened"
                );
                Ok(round)
            }
            OpenRoundOutcome::Existing(round) => {
                debug!(round_id = %round.id, %organization_id, "round already open");
                Ok(round)
            }
        }
    }

    pub async fn join_round(&self, join: JoinRound) -> AuctionResult<ParticipatingRequest> {
        let org = join.organization_id;
        if !self.ctx.settings.policy_for(org).bidding_enabled {
            return Err(AuctionError::BiddingDisabled {
                organization_id: org,
            });
        }
        if join.seed_amount < 0 {
            return Err(AuctionError::InvalidAmount {
                amount: join.seed_amount,
            });
        }

        let round = self.ensure_open_round(org).await?;
        let now = self.ctx.clock.now();
        let round = close_if_expired(&self.ctx, round, now).await?;
        if !round.accepts_bids(now) {
            return Err(AuctionError::RoundNotActive {
                round_id: round.id,
                status: round.status,
            });
        }

        let request = ParticipatingRequest {
            id: Uuid::new_v4(),
            round_id: round.id,
            organization_id: org,
            kind: join.kind,
            seed_amount: join.seed_amount,
            current_bid_amount: join.seed_amount,
            highest_bidder_ref: join.bidder_ref,
            payment_hold_ref: join.payment_hold_ref,
            accepted_bids: 0,
            created_at: now,
        };
        if !self.ctx.store.insert_request(&request, now).await.persisted()? {
            let status = self
                .ctx
                .store
                .fetch_round(round.id)
                .await
                .persisted()?
                .map_or(RoundStatus::Closing, |r| r.status);
            return Err(AuctionError::RoundNotActive {
                round_id: round.id,
                status,
            });
        }
        info!(
            round_id = %round.id,
            request_id = %request.id,
            kind = request.kind.as_str(),
            seed = request.seed_amount,
            "request joined round"
        );
        Ok(request)
    }

    pub async fn close_if_expired(&self, round: BiddingRound) -> AuctionResult<BiddingRound> {
        close_if_expired(&self.ctx, round, self.ctx.clock.now()).await
    }

    /// The organization's open round with its requests, if there is one.
    pub async fn active_round(&self, organization_id: Uuid) -> AuctionResult<Option<RoundView>> {
        let Some(round) = self
            .ctx
            .store
            .open_round_for_org(organization_id)
            .await
            .persisted()?
        else {
            return Ok(None);
        };
        let round = self.close_if_expired(round).await?;
        let requests = self.ctx.store.list_requests(round.id).await.persisted()?;
        Ok(Some(RoundView { round, requests }))
    }

    pub async fn round_view(&self, round_id: Uuid) -> AuctionResult<RoundView> {
        let round = self.fetch(round_id).await?;
        let requests = self.ctx.store.list_requests(round.id).await.persisted()?;
        Ok(RoundView { round, requests })
    }

    /// Administrative override: `pending | active -> cancelled`, recording a
    /// release for every participating hold. Dispatch is the caller's job.
    pub async fn cancel_round(&self, round_id: Uuid) -> AuctionResult<BiddingRound> {
        // Past ends_at the round belongs to settlement.
        let round = self.close_if_expired(self.fetch(round_id).await?).await?;
        if !round.status.can_transition_to(RoundStatus::Cancelled)
            || round.status == RoundStatus::Closing
        {
            return Err(AuctionError::IllegalTransition {
                round_id,
                from: round.status,
                to: RoundStatus::Cancelled,
            });
        }

        let now = self.ctx.clock.now();
        let requests = self.ctx.store.list_requests(round_id).await.persisted()?;
        let rec = CancellationRecord {
            round_id,
            allowed_from: vec![RoundStatus::Pending, RoundStatus::Active],
            releases: requests
                .iter()
                .map(|r| HoldDisposition::release(r, now))
                .collect(),
            cancelled_at: now,
        };
        if !self.ctx.store.record_cancellation(&rec).await.persisted()? {
            let current = self.fetch(round_id).await?;
            return Err(AuctionError::IllegalTransition {
                round_id,
                from: current.status,
                to: RoundStatus::Cancelled,
            });
        }
        info!(%round_id, releases = rec.releases.len(), "round cancelled by operator");
        self.fetch(round_id).await
    }

    async fn fetch(&self, round_id: Uuid) -> AuctionResult<BiddingRound> {
        self.ctx
            .store
            .fetch_round(round_id)
            .await
            .persisted()?
            .ok_or(AuctionError::RoundNotFound(round_id))
    }
}

/// Flip an expired `active` round to `closing`; returns the round as it now stands.
pub(crate) async fn close_if_expired(
    ctx: &EngineContext,
    round: BiddingRound,
    now: DateTime<Utc>,
) -> AuctionResult<BiddingRound> {
    if round.status != RoundStatus::Active || !round.is_expired(now) {
        return Ok(round);
    }
    if ctx
        .store
        .close_round_if_expired(round.id, now)
        .await
        .persisted()?
    {
        info!(round_id = %round.id, organization_id = %round.organization_id, "round closing");
        return Ok(BiddingRound {
            status: RoundStatus::Closing,
            closed_at: Some(now),
            ..round
        });
    }
    // Lost the flip to another caller; report whatever state it left.
    let id = round.id;
    Ok(ctx
        .store
        .fetch_round(id)
        .await
        .persisted()?
        .unwrap_or(round))
}
