//! Administrative cancel.

use encore_auction::AuctionError;
use encore_schemas::{DispositionStatus, RoundStatus};
use encore_testkit::{hold_for, Harness, PaymentOp};
use uuid::Uuid;

#[tokio::test]
async fn cancel_active_round_releases_every_hold() {
    let h = Harness::new();
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    let b = h.join(org, "ben").await.unwrap();
    h.engine.place_bid(a.id, 500, "ana").await.unwrap();

    let report = h.engine.cancel_round(a.round_id).await.unwrap();
    assert_eq!(report.round.status, RoundStatus::Cancelled);
    assert_eq!(report.dispatch.succeeded, 2);

    let mut released = h.payments.releases();
    released.sort();
    assert_eq!(released, vec![hold_for("ana"), hold_for("ben")]);
    assert_eq!(h.payments.attempts(PaymentOp::Capture), 0);

    let err = h.engine.place_bid(b.id, 900, "ben").await.unwrap_err();
    assert!(matches!(
        err,
        AuctionError::RoundNotActive {
            status: RoundStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn cancel_is_refused_once_closing_or_final() {
    let h = Harness::new();
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    let round = h.round(a.round_id).await.unwrap();

    h.expire(&round);
    let err = h.engine.cancel_round(round.id).await.unwrap_err();
    assert_eq!(
        err,
        AuctionError::IllegalTransition {
            round_id: round.id,
            from: RoundStatus::Closing,
            to: RoundStatus::Cancelled,
        }
    );

    h.engine.settle(round.id).await.unwrap();
    let err = h.engine.cancel_round(round.id).await.unwrap_err();
    assert_eq!(err.code(), "ILLEGAL_TRANSITION");
}

#[tokio::test]
async fn failed_release_on_cancel_is_left_for_retry() {
    let h = Harness::new();
    let org = Uuid::new_v4();
    let a = h.join(org, "ana").await.unwrap();
    h.payments.fail_next_releases(1);

    let report = h.engine.cancel_round(a.round_id).await.unwrap();
    assert_eq!(report.dispatch.failed, 1);

    let ds = h.engine.dispositions(a.round_id).await.unwrap();
    assert_eq!(ds.len(), 1);
    assert_eq!(ds[0].status, DispositionStatus::Failed);
    assert!(ds[0].next_attempt_at.is_some());
}

#[tokio::test]
async fn cancel_unknown_round_is_not_found() {
    let h = Harness::new();
    let id = Uuid::new_v4();
    assert_eq!(
        h.engine.cancel_round(id).await.unwrap_err(),
        AuctionError::RoundNotFound(id)
    );
}
