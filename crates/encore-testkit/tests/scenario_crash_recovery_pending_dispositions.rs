//! A crash between deciding a settlement and dispatching it.
//!
//! GREEN when:
//! - Dispositions recorded but never dispatched are finished by the sweep,
//!   without re-deciding the winner.
//! - A claim abandoned mid-dispatch is only taken over after the backoff,
//!   and the hold is captured once.

use chrono::Duration;
use encore_auction::store::{AuctionStore, ClaimFilter, SettlementRecord};
use encore_schemas::{DispositionStatus, HoldDisposition, RoundStatus};
use encore_testkit::{hold_for, Harness};
use uuid::Uuid;

/// Record a settlement directly in the store, as if the process died
/// right after the commit.
async fn settle_without_dispatch(h: &Harness) -> Uuid {
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    let b = h.join(org, "ben").await.unwrap();
    h.engine.place_bid(a.id, 800, "ana").await.unwrap();

    let round = h.round(a.round_id).await.unwrap();
    h.expire(&round);
    let now = round.ends_at;
    assert!(h.store.close_round_if_expired(round.id, now).await.unwrap());

    let a = h.store.fetch_request(a.id).await.unwrap().unwrap();
    let b = h.store.fetch_request(b.id).await.unwrap().unwrap();
    let applied = h
        .store
        .record_settlement(&SettlementRecord {
            round_id: round.id,
            winning_request_id: a.id,
            winning_bid_amount: 800,
            dispositions: vec![
                HoldDisposition::capture(&a, 800, now),
                HoldDisposition::release(&b, now),
            ],
            settled_at: now,
        })
        .await
        .unwrap();
    assert!(applied);
    round.id
}

#[tokio::test]
async fn sweep_finishes_pending_dispositions_after_restart() {
    let h = Harness::new();
    let round_id = settle_without_dispatch(&h).await;

    let report = h.engine.sweep().await.unwrap();
    assert_eq!(report.settled, 0, "winner is not re-decided");
    assert_eq!(report.dispositions.succeeded, 2);

    assert_eq!(h.payments.captures(), vec![(hold_for("ana"), 800)]);
    assert_eq!(h.payments.releases(), vec![hold_for("ben")]);
    assert_eq!(h.round(round_id).await.unwrap().status, RoundStatus::Settled);
}

#[tokio::test]
async fn abandoned_claim_is_reclaimed_only_after_backoff() {
    let h = Harness::new();
    let round_id = settle_without_dispatch(&h).await;

    // A dispatcher claims the rows and dies before calling payments.
    let claimed = h
        .store
        .claim_dispositions(
            &ClaimFilter {
                round_id: Some(round_id),
                include_failed: false,
                stale_claimed_before: None,
                max_attempts: 5,
            },
            h.round(round_id).await.unwrap().ends_at,
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    let report = h.engine.sweep().await.unwrap();
    assert_eq!(report.dispositions.attempted, 0);
    assert!(h.payments.calls().is_empty());

    h.advance(Duration::seconds(31));
    let report = h.engine.sweep().await.unwrap();
    assert_eq!(report.dispositions.succeeded, 2);

    // A manual settle afterwards has nothing left to do.
    let again = h.engine.settle(round_id).await.unwrap();
    assert_eq!(again.dispatch.attempted, 0);

    assert_eq!(h.payments.captures().len(), 1);
    let ds = h.engine.dispositions(round_id).await.unwrap();
    assert!(ds.iter().all(|d| d.status == DispositionStatus::Done && d.attempts == 2));
}
