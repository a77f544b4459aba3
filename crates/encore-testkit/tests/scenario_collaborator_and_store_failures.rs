//! Failures outside the bid path must not corrupt auction state.
//!
//! GREEN when:
//! - A failing notifier changes nothing about acceptance or settlement.
//! - A storage failure surfaces as PERSISTENCE and records no Bid row.

use encore_auction::AuctionError;
use encore_schemas::RoundStatus;
use encore_testkit::{hold_for, Harness};
use uuid::Uuid;

#[tokio::test]
async fn notifier_outage_does_not_affect_bids_or_settlement() {
    let h = Harness::new();
    h.notifier.set_failing(true);
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    let b = h.join(org, "ben").await.unwrap();

    h.engine.place_bid(a.id, 500, "ana").await.unwrap();
    h.engine.place_bid(b.id, 700, "ben").await.unwrap();
    assert_eq!(h.notifier.outbid_for(a.id), vec![700], "delivery was attempted");

    let round = h.round(a.round_id).await.unwrap();
    h.expire(&round);
    let report = h.engine.sweep().await.unwrap();
    assert_eq!(report.settled, 1);
    assert!(report.failures.is_empty());

    let round = h.round(round.id).await.unwrap();
    assert_eq!(round.status, RoundStatus::Settled);
    assert_eq!(round.settlement_error, None);
    assert_eq!(h.payments.captures(), vec![(hold_for("ben"), 700)]);
}

#[tokio::test]
async fn store_outage_is_persistence_and_writes_no_bid() {
    let h = Harness::new();
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();

    h.store.set_unavailable(true);
    let err = h.engine.place_bid(a.id, 500, "ana").await.unwrap_err();
    assert!(matches!(err, AuctionError::Persistence(_)));
    assert!(!err.is_retryable());
    h.store.set_unavailable(false);

    assert!(h.engine.bid_history(a.id).await.unwrap().is_empty());
    let round = h.round(a.round_id).await.unwrap();
    assert_eq!(round.watermark, 0);
    assert_eq!(round.version, 0);
}

#[tokio::test]
async fn sweep_during_store_outage_fails_then_recovers() {
    let h = Harness::new();
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    h.engine.place_bid(a.id, 500, "ana").await.unwrap();
    let round = h.round(a.round_id).await.unwrap();
    h.expire(&round);

    h.store.set_unavailable(true);
    assert!(h.engine.sweep().await.is_err());
    h.store.set_unavailable(false);

    let report = h.engine.sweep().await.unwrap();
    assert_eq!(report.settled, 1);
    assert_eq!(h.payments.captures().len(), 1);
}
