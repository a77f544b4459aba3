//! Recording collaborators with failure injection.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;
use encore_auction::{NotificationCollaborator, PaymentCollaborator};
use encore_schemas::Amount;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOp {
    Authorize,
    Capture,
    Release,
}

/// One call made to [`RecordingPayments`], successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCall {
    pub op: PaymentOp,
    /// Hold reference (or the bidder ref for `Authorize`).
    pub subject: String,
    pub amount: Option<Amount>,
    pub ok: bool,
}

fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
pub struct RecordingPayments {
    calls: Mutex<Vec<PaymentCall>>,
    fail_captures: AtomicU32,
    fail_releases: AtomicU32,
    decline_authorize: AtomicBool,
}

impl RecordingPayments {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` capture calls fail. `u32::MAX` means every call.
    pub fn fail_next_captures(&self, n: u32) {
        self.fail_captures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_releases(&self, n: u32) {
        self.fail_releases.store(n, Ordering::SeqCst);
    }

    pub fn decline_authorizations(&self, decline: bool) {
        self.decline_authorize.store(decline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PaymentCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Successful captures as `(hold_ref, amount)`.
    pub fn captures(&self) -> Vec<(String, Amount)> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == PaymentOp::Capture && c.ok)
            .map(|c| (c.subject, c.amount.unwrap_or_default()))
            .collect()
    }

    /// Successfully released hold refs.
    pub fn releases(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == PaymentOp::Release && c.ok)
            .map(|c| c.subject)
            .collect()
    }

    pub fn attempts(&self, op: PaymentOp) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    fn record(&self, op: PaymentOp, subject: &str, amount: Option<Amount>, ok: bool) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(PaymentCall {
                op,
                subject: subject.to_string(),
                amount,
                ok,
            });
    }
}

#[async_trait]
impl PaymentCollaborator for RecordingPayments {
    async fn authorize(&self, bidder_ref: &str, amount: Amount) -> anyhow::Result<String> {
        let ok = !self.decline_authorize.load(Ordering::SeqCst);
        self.record(PaymentOp::Authorize, bidder_ref, Some(amount), ok);
        if !ok {
            bail!("card declined for {bidder_ref}");
        }
        Ok(crate::hold_for(bidder_ref))
    }

    async fn capture(&self, hold_ref: &str, amount: Amount) -> anyhow::Result<()> {
        let fail = take_failure(&self.fail_captures);
        self.record(PaymentOp::Capture, hold_ref, Some(amount), !fail);
        if fail {
            bail!("processor timeout capturing {hold_ref}");
        }
        Ok(())
    }

    async fn release(&self, hold_ref: &str) -> anyhow::Result<()> {
        let fail = take_failure(&self.fail_releases);
        self.record(PaymentOp::Release, hold_ref, None, !fail);
        if fail {
            bail!("processor timeout releasing {hold_ref}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Outbid {
        request_id: Uuid,
        new_highest_amount: Amount,
    },
    RoundSettled {
        round_id: Uuid,
        winning_request_id: Uuid,
    },
    RoundLost {
        round_id: Uuid,
        request_id: Uuid,
        winning_amount: Amount,
    },
    SettlementFailure {
        round_id: Uuid,
        reason: String,
    },
}

/// Records every notification. In failing mode each call is still recorded
/// and then returns an error.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn outbid_for(&self, request_id: Uuid) -> Vec<Amount> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Notification::Outbid {
                    request_id: r,
                    new_highest_amount,
                } if r == request_id => Some(new_highest_amount),
                _ => None,
            })
            .collect()
    }

    /// `(request_id, winning_amount)` for every round-lost event on `round_id`.
    pub fn lost_in(&self, round_id: Uuid) -> Vec<(Uuid, Amount)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Notification::RoundLost {
                    round_id: r,
                    request_id,
                    winning_amount,
                } if r == round_id => Some((request_id, winning_amount)),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(Uuid, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Notification::SettlementFailure { round_id, reason } => Some((round_id, reason)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, n: Notification) -> anyhow::Result<()> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).push(n);
        if self.failing.load(Ordering::SeqCst) {
            bail!("notification provider unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationCollaborator for RecordingNotifier {
    async fn on_outbid(&self, request_id: Uuid, new_highest_amount: Amount) -> anyhow::Result<()> {
        self.push(Notification::Outbid {
            request_id,
            new_highest_amount,
        })
    }

    async fn on_round_settled(
        &self,
        round_id: Uuid,
        winning_request_id: Uuid,
    ) -> anyhow::Result<()> {
        self.push(Notification::RoundSettled {
            round_id,
            winning_request_id,
        })
    }

    async fn on_round_lost(
        &self,
        round_id: Uuid,
        request_id: Uuid,
        winning_amount: Amount,
    ) -> anyhow::Result<()> {
        self.push(Notification::RoundLost {
            round_id,
            request_id,
            winning_amount,
        })
    }

    async fn on_settlement_failure(&self, round_id: Uuid, reason: &str) -> anyhow::Result<()> {
        self.push(Notification::SettlementFailure {
            round_id,
            reason: reason.to_string(),
        })
    }
}
