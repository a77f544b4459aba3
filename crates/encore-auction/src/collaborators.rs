//! External collaborator boundary.
//!
//! The engine never talks to a payment processor or a messaging provider
//! directly. It calls these traits; implementations live outside the core
//! (the daemon wires an SSE bus notifier, tests wire recorders).

use async_trait::async_trait;
use encore_schemas::Amount;
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

/// Hold lifecycle at the payment processor.
///
/// `capture`/`release` may be retried with the same `hold_ref`; implementations
/// are responsible for idempotency on their side.
#[async_trait]
pub trait PaymentCollaborator: Send + Sync {
    /// Reserve `amount` against the bidder's payment method; returns the hold reference.
    /// Called by request intake before a request joins a round.
    async fn authorize(&self, bidder_ref: &str, amount: Amount) -> anyhow::Result<String>;

    async fn capture(&self, hold_ref: &str, amount: Amount) -> anyhow::Result<()>;

    async fn release(&self, hold_ref: &str) -> anyhow::Result<()>;
}

/// Accepts every call and logs it. Used when no processor integration is wired
/// (local daemon runs, operator dry runs).
#[derive(Debug, Clone, Copy, Default)]
pub struct PaperPayments;

#[async_trait]
impl PaymentCollaborator for PaperPayments {
    async fn authorize(&self, bidder_ref: &str, amount: Amount) -> anyhow::Result<String> {
        let hold_ref = format!("paper:hold:{}", Uuid::new_v4());
        info!(bidder_ref, amount, hold_ref = %hold_ref, "paper payments: authorize");
        Ok(hold_ref)
    }

    async fn capture(&self, hold_ref: &str, amount: Amount) -> anyhow::Result<()> {
        info!(hold_ref, amount, "paper payments: capture");
        Ok(())
    }

    async fn release(&self, hold_ref: &str) -> anyhow::Result<()> {
        info!(hold_ref, "paper payments: release");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Auction events for bidders and operators. Delivery failures never affect
/// auction state: the engine logs them and moves on.
#[async_trait]
pub trait NotificationCollaborator: Send + Sync {
    /// `request_id` lost the lead; the round watermark is now `new_highest_amount`.
    async fn on_outbid(&self, request_id: Uuid, new_highest_amount: Amount) -> anyhow::Result<()>;

    async fn on_round_settled(&self, round_id: Uuid, winning_request_id: Uuid)
        -> anyhow::Result<()>;

    /// `request_id` took part in a settled round and did not win.
    async fn on_round_lost(
        &self,
        round_id: Uuid,
        request_id: Uuid,
        winning_amount: Amount,
    ) -> anyhow::Result<()>;

    /// Operator alert: settlement or a hold disposition failed.
    async fn on_settlement_failure(&self, round_id: Uuid, reason: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationCollaborator for NoopNotifier {
    async fn on_outbid(&self, _request_id: Uuid, _amount: Amount) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_round_settled(&self, _round_id: Uuid, _winner: Uuid) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_round_lost(
        &self,
        _round_id: Uuid,
        _request_id: Uuid,
        _amount: Amount,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_settlement_failure(&self, _round_id: Uuid, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Swallow-and-log wrappers so call sites stay one line.
pub(crate) async fn notify_outbid(n: &dyn NotificationCollaborator, request_id: Uuid, amount: Amount) {
    if let Err(e) = n.on_outbid(request_id, amount).await {
        warn!(%request_id, error = %format!("{e:#}"), "outbid notification failed");
    }
}

pub(crate) async fn notify_settled(n: &dyn NotificationCollaborator, round_id: Uuid, winner: Uuid) {
    if let Err(e) = n.on_round_settled(round_id, winner).await {
        warn!(%round_id, error = %format!("{e:#}"), "round-settled notification failed");
    }
}

pub(crate) async fn notify_lost(
    n: &dyn NotificationCollaborator,
    round_id: Uuid,
    request_id: Uuid,
    winning_amount: Amount,
) {
    if let Err(e) = n.on_round_lost(round_id, request_id, winning_amount).await {
        warn!(%round_id, %request_id, error = %format!("{e:#}"), "round-lost notification failed");
    }
}

pub(crate) async fn notify_failure(n: &dyn NotificationCollaborator, round_id: Uuid, reason: &str) {
    if let Err(e) = n.on_settlement_failure(round_id, reason).await {
        warn!(%round_id, error = %format!("{e:#}"), "settlement-failure alert failed");
    }
}
