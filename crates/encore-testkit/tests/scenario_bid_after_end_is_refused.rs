//! Expiry is enforced at bid time, not at the next sweep.

use chrono::Duration;
use encore_auction::AuctionError;
use encore_schemas::{RejectionReason, RoundStatus};
use encore_testkit::Harness;
use uuid::Uuid;

#[tokio::test]
async fn bid_at_ends_at_is_round_not_active_before_any_sweep() {
    let h = Harness::new();
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    h.engine.place_bid(a.id, 500, "ana").await.unwrap();

    let round = h.round(a.round_id).await.unwrap();
    h.expire(&round);

    let err = h.engine.place_bid(a.id, 5_000, "ana").await.unwrap_err();
    assert_eq!(
        err,
        AuctionError::RoundNotActive {
            round_id: round.id,
            status: RoundStatus::Closing,
        }
    );

    // The lazy check flipped the round; nothing else moved.
    let round = h.round(round.id).await.unwrap();
    assert_eq!(round.status, RoundStatus::Closing);
    assert_eq!(round.watermark, 500);

    let last = h.engine.bid_history(a.id).await.unwrap().pop().unwrap();
    assert!(!last.accepted);
    assert_eq!(last.rejection_reason, Some(RejectionReason::RoundNotActive));
}

#[tokio::test]
async fn one_second_before_end_still_accepts() {
    let h = Harness::new();
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    let round = h.round(a.round_id).await.unwrap();

    h.expire(&round);
    h.advance(Duration::seconds(-1));
    h.engine.place_bid(a.id, 500, "ana").await.unwrap();
}

#[tokio::test]
async fn joining_after_end_is_refused() {
    let h = Harness::new();
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    let round = h.round(a.round_id).await.unwrap();
    h.expire(&round);

    let err = h.join(org, "late").await.unwrap_err();
    assert_eq!(err.code(), "ROUND_NOT_ACTIVE");
    assert_eq!(h.engine.round_view(round.id).await.unwrap().requests.len(), 1);
}

#[tokio::test]
async fn min_bid_on_a_closed_round_is_round_not_active() {
    let h = Harness::new();
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    let round = h.round(a.round_id).await.unwrap();
    h.expire(&round);

    let err = h.engine.min_acceptable_bid(a.id).await.unwrap_err();
    assert_eq!(err.code(), "ROUND_NOT_ACTIVE");
}
