//! encore-testkit
//!
//! Deterministic doubles for scenario tests: recording payment and
//! notification collaborators, a store wrapper that loses compare-and-set
//! on demand, and a [`Harness`] that wires them into an [`AuctionEngine`]
//! over a [`MemoryStore`] and a [`ManualClock`].

mod contended;
mod recorders;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use encore_auction::{
    AuctionEngine, AuctionResult, AuctionStore, EngineContext, JoinRound, ManualClock, MemoryStore,
};
use encore_config::AuctionSettings;
use encore_schemas::{BiddingRound, ParticipatingRequest, RequestKind};
use uuid::Uuid;

pub use contended::ContendedStore;
pub use recorders::{Notification, PaymentCall, PaymentOp, RecordingNotifier, RecordingPayments};

/// Fixed start instant so timestamps in failures are readable.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 20, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Hold reference the harness attaches to a bidder's request.
pub fn hold_for(bidder_ref: &str) -> String {
    format!("hold-{bidder_ref}")
}

pub struct Harness {
    pub engine: AuctionEngine,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub payments: Arc<RecordingPayments>,
    pub notifier: Arc<RecordingNotifier>,
    /// Set by [`Harness::contended`].
    pub contended: Option<Arc<ContendedStore>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(AuctionSettings::default())
    }

    pub fn with_settings(settings: AuctionSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::build(settings, Arc::clone(&store), store as Arc<dyn AuctionStore>)
    }

    /// The first `conflicts` bid commits report a lost compare-and-set.
    pub fn contended(settings: AuctionSettings, conflicts: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        let front = Arc::new(ContendedStore::new(Arc::clone(&store), conflicts));
        let mut h = Self::build(settings, store, front.clone() as Arc<dyn AuctionStore>);
        h.contended = Some(front);
        h
    }

    fn build(settings: AuctionSettings, store: Arc<MemoryStore>, front: Arc<dyn AuctionStore>) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let payments = Arc::new(RecordingPayments::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = AuctionEngine::new(EngineContext {
            store: front,
            payments: payments.clone(),
            notifier: notifier.clone(),
            clock: clock.clone(),
            settings: Arc::new(settings),
        });
        Self {
            engine,
            store,
            clock,
            payments,
            notifier,
            contended: None,
        }
    }

    /// Join `org`'s open round as a song request with a zero seed.
    pub async fn join(&self, org: Uuid, bidder_ref: &str) -> AuctionResult<ParticipatingRequest> {
        self.join_seeded(org, bidder_ref, 0).await
    }

    pub async fn join_seeded(
        &self,
        org: Uuid,
        bidder_ref: &str,
        seed_amount: i64,
    ) -> AuctionResult<ParticipatingRequest> {
        self.engine
            .join_round(JoinRound {
                organization_id: org,
                kind: RequestKind::SongRequest,
                bidder_ref: bidder_ref.to_string(),
                payment_hold_ref: hold_for(bidder_ref),
                seed_amount,
            })
            .await
    }

    pub async fn round(&self, round_id: Uuid) -> AuctionResult<BiddingRound> {
        Ok(self.engine.round_view(round_id).await?.round)
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Move the clock to `round.ends_at`; the round is expired from here on.
    pub fn expire(&self, round: &BiddingRound) {
        self.clock.set(round.ends_at);
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
