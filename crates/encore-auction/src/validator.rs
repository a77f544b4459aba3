//! Bid Validator.
//!
//! Pure: same snapshot in, same verdict out. The ledger relies on that to
//! re-run validation after losing a compare-and-set.

use encore_config::OrganizationPolicy;
use encore_schemas::{Amount, RejectionReason, RoundStatus};
use uuid::Uuid;

/// Snapshot of one round as seen by a single bid attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundState {
    pub status: RoundStatus,
    /// Round watermark: highest accepted bid across all requests (0 if none).
    pub global_highest: Amount,
    pub leader_request_id: Option<Uuid>,
    pub target_request_id: Uuid,
    /// The target request's own current bid (its seed until first accepted bid).
    pub target_current: Amount,
    pub minimum_bid: Amount,
    pub minimum_increment: Amount,
}

impl RoundState {
    pub fn target_is_leader(&self) -> bool {
        self.leader_request_id == Some(self.target_request_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedBid {
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject {
        reason: RejectionReason,
        min_acceptable: Amount,
    },
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Lowest amount the target request could bid right now.
///
/// * leader self-raise: `floor + minimum_increment`
/// * anyone else: at least `floor`, strictly above the watermark
///
/// Both cases also stay strictly above the target's own current bid, which
/// keeps a request's accepted amounts strictly increasing even when its seed
/// sits above the watermark. `None` when that amount does not fit in
/// [`Amount`]: no bid can beat the current one.
pub fn min_acceptable(state: &RoundState) -> Option<Amount> {
    let floor = state.global_highest.max(state.minimum_bid);
    let above_self = state.target_current.checked_add(1)?;
    let min = if state.target_is_leader() {
        floor.checked_add(state.minimum_increment)?
    } else {
        floor.max(state.global_highest.checked_add(1)?)
    };
    Some(min.max(above_self))
}

pub fn validate(state: &RoundState, proposed: ProposedBid) -> Verdict {
    let min = min_acceptable(state);
    if state.status != RoundStatus::Active {
        return Verdict::Reject {
            reason: RejectionReason::RoundNotActive,
            min_acceptable: min.unwrap_or(Amount::MAX),
        };
    }
    if proposed.amount <= 0 {
        return Verdict::Reject {
            reason: RejectionReason::InvalidAmount,
            min_acceptable: min.unwrap_or(Amount::MAX),
        };
    }
    match min {
        Some(min) if proposed.amount >= min => Verdict::Accept,
        Some(min) => Verdict::Reject {
            reason: RejectionReason::BidTooLow,
            min_acceptable: min,
        },
        None => Verdict::Reject {
            reason: RejectionReason::InvalidAmount,
            min_acceptable: Amount::MAX,
        },
    }
}

/// Convenience for callers that only need the policy numbers.
pub fn with_policy(
    status: RoundStatus,
    global_highest: Amount,
    leader_request_id: Option<Uuid>,
    target_request_id: Uuid,
    target_current: Amount,
    policy: &OrganizationPolicy,
) -> RoundState {
    RoundState {
        status,
        global_highest,
        leader_request_id,
        target_request_id,
        target_current,
        minimum_bid: policy.minimum_bid,
        minimum_increment: policy.minimum_increment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(global: Amount, leader: Option<Uuid>, target: Uuid, current: Amount) -> RoundState {
        RoundState {
            status: RoundStatus::Active,
            global_highest: global,
            leader_request_id: leader,
            target_request_id: target,
            target_current: current,
            minimum_bid: 500,
            minimum_increment: 100,
        }
    }

    fn bid(amount: Amount) -> ProposedBid {
        ProposedBid { amount }
    }

    #[test]
    fn first_bid_must_reach_minimum() {
        let a = Uuid::new_v4();
        let s = state(0, None, a, 0);
        assert_eq!(min_acceptable(&s), Some(500));
        assert!(validate(&s, bid(500)).is_accept());
        assert_eq!(
            validate(&s, bid(499)),
            Verdict::Reject {
                reason: RejectionReason::BidTooLow,
                min_acceptable: 500
            }
        );
    }

    #[test]
    fn challenger_must_strictly_exceed_watermark() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let s = state(500, Some(a), b, 0);
        assert_eq!(min_acceptable(&s), Some(501));
        assert!(!validate(&s, bid(500)).is_accept());
        assert!(validate(&s, bid(600)).is_accept());
    }

    #[test]
    fn leader_self_raise_needs_increment() {
        let a = Uuid::new_v4();
        let s = state(500, Some(a), a, 500);
        assert_eq!(min_acceptable(&s), Some(600));
        assert!(!validate(&s, bid(599)).is_accept());
        assert!(validate(&s, bid(600)).is_accept());
    }

    #[test]
    fn watermark_above_minimum_becomes_floor() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let s = state(2_000, Some(a), b, 700);
        assert_eq!(min_acceptable(&s), Some(2_001));
    }

    #[test]
    fn seed_above_watermark_still_forces_increase() {
        let a = Uuid::new_v4();
        let s = state(0, None, a, 800);
        assert_eq!(min_acceptable(&s), Some(801));
    }

    #[test]
    fn zero_increment_leader_still_strictly_increases() {
        let a = Uuid::new_v4();
        let mut s = state(500, Some(a), a, 500);
        s.minimum_increment = 0;
        assert_eq!(min_acceptable(&s), Some(501));
    }

    #[test]
    fn closed_round_rejects_regardless_of_amount() {
        let a = Uuid::new_v4();
        for status in [
            RoundStatus::Pending,
            RoundStatus::Closing,
            RoundStatus::Settled,
            RoundStatus::Cancelled,
        ] {
            let mut s = state(0, None, a, 0);
            s.status = status;
            let v = validate(&s, bid(1_000_000));
            assert!(matches!(
                v,
                Verdict::Reject {
                    reason: RejectionReason::RoundNotActive,
                    ..
                }
            ));
        }
    }

    #[test]
    fn non_positive_amount_is_invalid() {
        let mut s = state(0, None, Uuid::new_v4(), 0);
        s.minimum_bid = 0;
        assert!(matches!(
            validate(&s, bid(0)),
            Verdict::Reject {
                reason: RejectionReason::InvalidAmount,
                ..
            }
        ));
    }

    #[test]
    fn nothing_beats_amount_max() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let leader = state(Amount::MAX, Some(a), a, Amount::MAX);
        assert_eq!(min_acceptable(&leader), None);
        assert_eq!(
            validate(&leader, bid(Amount::MAX)),
            Verdict::Reject {
                reason: RejectionReason::InvalidAmount,
                min_acceptable: Amount::MAX
            }
        );

        let challenger = state(Amount::MAX, Some(a), b, 0);
        assert_eq!(min_acceptable(&challenger), None);
        assert!(!validate(&challenger, bid(Amount::MAX)).is_accept());
    }

    #[test]
    fn increment_overflow_blocks_leader_raise() {
        let a = Uuid::new_v4();
        let s = state(Amount::MAX - 50, Some(a), a, Amount::MAX - 50);
        assert_eq!(min_acceptable(&s), None);
        assert!(!validate(&s, bid(Amount::MAX)).is_accept());
    }

    #[test]
    fn floor_holds_for_any_submission_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for global in [0, 300, 500, 700, 10_000] {
            for leader in [None, Some(a), Some(b)] {
                let s = state(global, leader, b, 0);
                let floor = global.max(500);
                assert!(!validate(&s, bid(floor - 1)).is_accept());
            }
        }
    }
}
