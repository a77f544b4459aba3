use chrono::{Duration, Utc};
use encore_auction::store::{AuctionStore, CancellationRecord, NewRound};
use encore_schemas::RoundStatus;
use predicates::prelude::*;
use uuid::Uuid;

/// `encore db migrate` must refuse while a round is CLOSING unless --yes.
///
/// DB-backed test, skipped if ENCORE_DATABASE_URL is not set.
#[tokio::test]
async fn cli_db_migrate_requires_yes_when_closing() -> anyhow::Result<()> {
    let url = match std::env::var(encore_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: ENCORE_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = match encore_db::connect(&url).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("SKIP: cannot connect to DB: {e}");
            return Ok(());
        }
    };
    encore_db::migrate(&pool).await?;
    let store = encore_db::PgStore::new(pool);

    // An already-expired round, flipped to closing and left unsettled.
    let now = Utc::now();
    let round = store
        .create_round_if_none_open(NewRound {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            starts_at: now - Duration::minutes(31),
            ends_at: now - Duration::minutes(1),
        })
        .await?
        .into_round();
    assert!(store.close_round_if_expired(round.id, now).await?);

    let mut cmd = assert_cmd::Command::cargo_bin("encore")?;
    cmd.env(encore_db::ENV_DB_URL, &url).args(["db", "migrate"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("REFUSING MIGRATE"));

    let mut cmd2 = assert_cmd::Command::cargo_bin("encore")?;
    cmd2.env(encore_db::ENV_DB_URL, &url)
        .args(["db", "migrate", "--yes"]);
    cmd2.assert()
        .success()
        .stdout(predicate::str::contains("migrations_applied=true"));

    // Cleanup: don't leave a closing round behind for the scheduler.
    store
        .record_cancellation(&CancellationRecord {
            round_id: round.id,
            allowed_from: vec![RoundStatus::Closing],
            releases: Vec::new(),
            cancelled_at: Utc::now(),
        })
        .await?;

    Ok(())
}
