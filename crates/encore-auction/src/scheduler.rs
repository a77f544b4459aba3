//! Periodic scheduler sweep.
//!
//! One pass closes expired rounds, settles every `closing` round, retries
//! due hold dispositions and (optionally) opens the next round for
//! organizations that have none. A failing round never stops the pass.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::EngineContext;
use crate::error::{AuctionResult, PersistenceContext};
use crate::lifecycle::RoundLifecycle;
use crate::settlement::{DispatchReport, SettleOutcome, SettlementCoordinator};
use encore_schemas::RoundStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub closed: usize,
    pub settled: usize,
    pub cancelled: usize,
    pub opened: usize,
    pub dispositions: DispatchReport,
    /// `(round_id or organization_id, error)` for work that failed this pass.
    pub failures: Vec<(Uuid, String)>,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        self.closed == 0
            && self.settled == 0
            && self.cancelled == 0
            && self.opened == 0
            && self.dispositions.attempted == 0
            && self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: EngineContext,
    lifecycle: RoundLifecycle,
    settlement: SettlementCoordinator,
}

impl Scheduler {
    pub fn new(
        ctx: EngineContext,
        lifecycle: RoundLifecycle,
        settlement: SettlementCoordinator,
    ) -> Self {
        Self {
            ctx,
            lifecycle,
            settlement,
        }
    }

    pub async fn sweep(&self) -> AuctionResult<SweepReport> {
        let mut report = SweepReport::default();
        let now = self.ctx.clock.now();

        for round in self.ctx.store.rounds_due(now).await.persisted()? {
            let round_id = round.id;
            if round.status == RoundStatus::Active {
                match self.lifecycle.close_if_expired(round).await {
                    Ok(r) if r.status == RoundStatus::Closing => report.closed += 1,
                    Ok(_) => {}
                    Err(e) => {
                        report.failures.push((round_id, e.to_string()));
                        continue;
                    }
                }
            }

            match self.settlement.settle(round_id).await {
                Ok(r) => {
                    match r.outcome {
                        SettleOutcome::Settled { .. } => report.settled += 1,
                        SettleOutcome::Cancelled { .. } => report.cancelled += 1,
                        SettleOutcome::AlreadyFinal { .. } => {}
                    }
                    report.dispositions.merge(r.dispatch);
                }
                Err(e) => {
                    warn!(%round_id, error = %e, "sweep: settlement failed; will retry");
                    report.failures.push((round_id, e.to_string()));
                }
            }
        }

        match self.settlement.retry_due().await {
            Ok(d) => report.dispositions.merge(d),
            Err(e) => {
                warn!(error = %e, "sweep: disposition retry failed");
                report.failures.push((Uuid::nil(), e.to_string()));
            }
        }

        if self.ctx.settings.scheduler.auto_open_next_round {
            self.open_next_rounds(&mut report).await?;
        }

        if !report.is_idle() {
            info!(
                closed = report.closed,
                settled = report.settled,
                cancelled = report.cancelled,
                opened = report.opened,
                dispositions = report.dispositions.attempted,
                failures = report.failures.len(),
                "scheduler sweep"
            );
        }
        Ok(report)
    }

    async fn open_next_rounds(&self, report: &mut SweepReport) -> AuctionResult<()> {
        let orgs = self
            .ctx
            .store
            .organizations_without_open_round()
            .await
            .persisted()?;
        for org in orgs {
            if !self.ctx.settings.policy_for(org).bidding_enabled {
                continue;
            }
            match self.lifecycle.ensure_open_round(org).await {
                Ok(_) => report.opened += 1,
                Err(e) => {
                    warn!(organization_id = %org, error = %e, "sweep: could not open next round");
                    report.failures.push((org, e.to_string()));
                }
            }
        }
        Ok(())
    }
}
