//! Auction error taxonomy.
//!
//! Every variant carries a stable machine code (see [`AuctionError::code`])
//! that the HTTP layer forwards verbatim, so callers always get an actionable
//! reason rather than a bare failure.

use encore_schemas::{Amount, RejectionReason, RoundStatus};
use uuid::Uuid;

pub type AuctionResult<T> = Result<T, AuctionError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuctionError {
    /// The round has ended (or has not started); the caller should try the next one.
    #[error("ROUND_NOT_ACTIVE: round {round_id} is {status}; try the next round")]
    RoundNotActive { round_id: Uuid, status: RoundStatus },

    /// Deterministic validator rejection; `min_acceptable` is the recomputed floor.
    #[error("BID_TOO_LOW: minimum acceptable bid is {min_acceptable}")]
    BidTooLow { min_acceptable: Amount },

    /// Optimistic retries exhausted. Retryable: the effective minimum may have moved.
    #[error("CONTENTION: lost {attempts} compare-and-set race(s); resubmit the bid")]
    Contention { attempts: u32 },

    #[error("INVALID_AMOUNT: bid amount must be positive and below the current bid ceiling, got {amount}")]
    InvalidAmount { amount: Amount },

    #[error("BIDDING_DISABLED: organization {organization_id} is not accepting bids")]
    BiddingDisabled { organization_id: Uuid },

    #[error("ROUND_NOT_FOUND: {0}")]
    RoundNotFound(Uuid),

    #[error("REQUEST_NOT_FOUND: {0}")]
    RequestNotFound(Uuid),

    #[error("ILLEGAL_TRANSITION: round {round_id} cannot go {from} -> {to}")]
    IllegalTransition {
        round_id: Uuid,
        from: RoundStatus,
        to: RoundStatus,
    },

    /// Storage failure. The write never partially applied.
    #[error("PERSISTENCE: {0}")]
    Persistence(String),

    /// Settlement could not complete; the scheduler retries on its next pass.
    #[error("SETTLEMENT_FAILURE: round {round_id}: {reason}")]
    SettlementFailure { round_id: Uuid, reason: String },
}

impl AuctionError {
    pub fn code(&self) -> &'static str {
        match self {
            AuctionError::RoundNotActive { .. } => "ROUND_NOT_ACTIVE",
            AuctionError::BidTooLow { .. } => "BID_TOO_LOW",
            AuctionError::Contention { .. } => "CONTENTION",
            AuctionError::InvalidAmount { .. } => "INVALID_AMOUNT",
            AuctionError::BiddingDisabled { .. } => "BIDDING_DISABLED",
            AuctionError::RoundNotFound(_) => "ROUND_NOT_FOUND",
            AuctionError::RequestNotFound(_) => "REQUEST_NOT_FOUND",
            AuctionError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            AuctionError::Persistence(_) => "PERSISTENCE",
            AuctionError::SettlementFailure { .. } => "SETTLEMENT_FAILURE",
        }
    }

    /// Whether resubmitting the same call can succeed without user changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuctionError::Contention { .. } | AuctionError::SettlementFailure { .. }
        )
    }

    /// The reason recorded on the Bid row when this error rejects a submission.
    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            AuctionError::RoundNotActive { .. } => Some(RejectionReason::RoundNotActive),
            AuctionError::BidTooLow { .. } => Some(RejectionReason::BidTooLow),
            AuctionError::Contention { .. } => Some(RejectionReason::Contention),
            AuctionError::InvalidAmount { .. } => Some(RejectionReason::InvalidAmount),
            _ => None,
        }
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        AuctionError::Persistence(format!("{err:#}"))
    }
}

/// `?`-friendly conversion for store calls.
pub(crate) trait PersistenceContext<T> {
    fn persisted(self) -> AuctionResult<T>;
}

impl<T> PersistenceContext<T> for anyhow::Result<T> {
    fn persisted(self) -> AuctionResult<T> {
        self.map_err(|e| {
            tracing::error!(error = %format!("{e:#}"), "auction store call failed");
            AuctionError::persistence(e)
        })
    }
}
