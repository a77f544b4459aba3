use chrono::{Duration, Utc};
use encore_auction::store::{
    AuctionStore, BidCommit, ClaimFilter, CommitOutcome, NewRound, OpenRoundOutcome,
    SettlementRecord,
};
use encore_db::PgStore;
use encore_schemas::{Bid, HoldDisposition, ParticipatingRequest, RequestKind, RoundStatus};
use uuid::Uuid;

/// DB-backed test. Skips if ENCORE_DATABASE_URL is not set.
async fn store_or_skip() -> anyhow::Result<Option<PgStore>> {
    let url = match std::env::var(encore_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: ENCORE_DATABASE_URL not set");
            return Ok(None);
        }
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await?;
    encore_db::migrate(&pool).await?;
    Ok(Some(PgStore::new(pool)))
}

fn new_round(org: Uuid) -> NewRound {
    let now = Utc::now();
    NewRound {
        id: Uuid::new_v4(),
        organization_id: org,
        starts_at: now,
        ends_at: now + Duration::minutes(30),
    }
}

fn request(round_id: Uuid, org: Uuid) -> ParticipatingRequest {
    ParticipatingRequest {
        id: Uuid::new_v4(),
        round_id,
        organization_id: org,
        kind: RequestKind::SongRequest,
        seed_amount: 0,
        current_bid_amount: 0,
        highest_bidder_ref: "guest".to_string(),
        payment_hold_ref: format!("hold-{}", Uuid::new_v4()),
        accepted_bids: 0,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn concurrent_round_creation_yields_one_open_round() -> anyhow::Result<()> {
    let Some(store) = store_or_skip().await? else {
        return Ok(());
    };
    // Unique org so leftover rows in a developer DB never collide.
    let org = Uuid::new_v4();

    let (a, b) = tokio::join!(
        store.create_round_if_none_open(new_round(org)),
        store.create_round_if_none_open(new_round(org)),
    );
    let (a, b) = (a?, b?);
    let created = [&a, &b]
        .iter()
        .filter(|o| matches!(o, OpenRoundOutcome::Created(_)))
        .count();
    assert_eq!(created, 1);
    assert_eq!(a.into_round().id, b.into_round().id);
    Ok(())
}

#[tokio::test]
async fn stale_version_bid_is_a_conflict_and_writes_nothing() -> anyhow::Result<()> {
    let Some(store) = store_or_skip().await? else {
        return Ok(());
    };
    let org = Uuid::new_v4();
    let round = store.create_round_if_none_open(new_round(org)).await?.into_round();
    let req = request(round.id, org);
    assert!(store.insert_request(&req, Utc::now()).await?);

    let now = Utc::now();
    let first = BidCommit {
        expected_version: round.version,
        bid: Bid::accepted(round.id, req.id, 500, "a", now),
        now,
    };
    assert!(matches!(store.commit_bid(&first).await?, CommitOutcome::Applied(_)));

    let stale = BidCommit {
        expected_version: round.version,
        bid: Bid::accepted(round.id, req.id, 700, "b", now),
        now,
    };
    assert_eq!(store.commit_bid(&stale).await?, CommitOutcome::Conflict);

    let stored = store.fetch_request(req.id).await?.expect("request");
    assert_eq!(stored.current_bid_amount, 500);
    assert_eq!(stored.accepted_bids, 1);
    assert_eq!(store.list_bids(req.id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn settlement_and_claims_happen_once() -> anyhow::Result<()> {
    let Some(store) = store_or_skip().await? else {
        return Ok(());
    };
    let org = Uuid::new_v4();
    let round = store.create_round_if_none_open(new_round(org)).await?.into_round();
    let req = request(round.id, org);
    store.insert_request(&req, Utc::now()).await?;

    assert!(store.close_round_if_expired(round.id, round.ends_at).await?);
    let now = Utc::now();
    let rec = SettlementRecord {
        round_id: round.id,
        winning_request_id: req.id,
        winning_bid_amount: 500,
        dispositions: vec![HoldDisposition::capture(&req, 500, now)],
        settled_at: now,
    };
    assert!(store.record_settlement(&rec).await?);
    assert!(!store.record_settlement(&rec).await?);
    assert_eq!(
        store.fetch_round(round.id).await?.expect("round").status,
        RoundStatus::Settled
    );

    let filter = ClaimFilter {
        round_id: Some(round.id),
        include_failed: false,
        stale_claimed_before: None,
        max_attempts: 5,
    };
    let (a, b) = tokio::join!(
        store.claim_dispositions(&filter, now),
        store.claim_dispositions(&filter, now),
    );
    assert_eq!(a?.len() + b?.len(), 1);
    Ok(())
}
