//! encore-auction
//!
//! Bidding-round auction core: validator, ledger, round lifecycle,
//! settlement and the scheduler sweep, over an [`AuctionStore`] and the
//! payment / notification collaborator traits. No HTTP or SQL in here.

pub mod clock;
pub mod collaborators;
mod engine;
mod error;
mod ledger;
mod lifecycle;
mod scheduler;
mod settlement;
pub mod store;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{NoopNotifier, NotificationCollaborator, PaperPayments, PaymentCollaborator};
pub use engine::{AuctionEngine, CancelReport, EngineContext};
pub use error::{AuctionError, AuctionResult};
pub use ledger::BidLedger;
pub use lifecycle::{JoinRound, RoundLifecycle};
pub use scheduler::{Scheduler, SweepReport};
pub use settlement::{pick_winner, DispatchReport, SettleOutcome, SettleReport, SettlementCoordinator};
pub use store::{AuctionStore, MemoryStore};
