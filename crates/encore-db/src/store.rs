//! Postgres [`AuctionStore`].
//!
//! Every compare-and-set is a guarded `update ... where <expected state>`;
//! zero affected rows means the guard lost. Multi-row writes run inside one
//! transaction and roll back on drop.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_auction::store::{
    AuctionStore, BidCommit, CancellationRecord, ClaimFilter, CommitOutcome, DispositionResult,
    NewRound, OpenRoundOutcome, SettlementRecord,
};
use encore_schemas::{
    Bid, BiddingRound, DispositionStatus, HoldAction, HoldDisposition, ParticipatingRequest,
    RejectionReason, RequestKind, RoundStatus, OPEN_STATUSES,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

const ROUND_COLS: &str = "id, organization_id, round_number, starts_at, ends_at, status, \
     winning_request_id, winning_bid_amount, watermark, leader_request_id, version, \
     settlement_error, created_at, closed_at, settled_at";

const REQUEST_COLS: &str = "id, round_id, organization_id, kind, seed_amount, \
     current_bid_amount, highest_bidder_ref, payment_hold_ref, accepted_bids, created_at";

const BID_COLS: &str =
    "id, round_id, request_id, amount, bidder_ref, created_at, accepted, rejection_reason";

const DISPOSITION_COLS: &str = "id, round_id, request_id, hold_ref, action, amount, status, \
     attempts, last_error, next_attempt_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn round_from_row(row: &PgRow) -> Result<BiddingRound> {
    Ok(BiddingRound {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        round_number: row.try_get("round_number")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        status: RoundStatus::parse(&row.try_get::<String, _>("status")?)?,
        winning_request_id: row.try_get("winning_request_id")?,
        winning_bid_amount: row.try_get("winning_bid_amount")?,
        watermark: row.try_get("watermark")?,
        leader_request_id: row.try_get("leader_request_id")?,
        version: row.try_get("version")?,
        settlement_error: row.try_get("settlement_error")?,
        created_at: row.try_get("created_at")?,
        closed_at: row.try_get("closed_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<ParticipatingRequest> {
    Ok(ParticipatingRequest {
        id: row.try_get("id")?,
        round_id: row.try_get("round_id")?,
        organization_id: row.try_get("organization_id")?,
        kind: RequestKind::parse(&row.try_get::<String, _>("kind")?)?,
        seed_amount: row.try_get("seed_amount")?,
        current_bid_amount: row.try_get("current_bid_amount")?,
        highest_bidder_ref: row.try_get("highest_bidder_ref")?,
        payment_hold_ref: row.try_get("payment_hold_ref")?,
        accepted_bids: row.try_get("accepted_bids")?,
        created_at: row.try_get("created_at")?,
    })
}

fn bid_from_row(row: &PgRow) -> Result<Bid> {
    let reason: Option<String> = row.try_get("rejection_reason")?;
    Ok(Bid {
        id: row.try_get("id")?,
        round_id: row.try_get("round_id")?,
        request_id: row.try_get("request_id")?,
        amount: row.try_get("amount")?,
        bidder_ref: row.try_get("bidder_ref")?,
        created_at: row.try_get("created_at")?,
        accepted: row.try_get("accepted")?,
        rejection_reason: reason.as_deref().map(RejectionReason::parse).transpose()?,
    })
}

fn disposition_from_row(row: &PgRow) -> Result<HoldDisposition> {
    Ok(HoldDisposition {
        id: row.try_get("id")?,
        round_id: row.try_get("round_id")?,
        request_id: row.try_get("request_id")?,
        hold_ref: row.try_get("hold_ref")?,
        action: HoldAction::parse(&row.try_get::<String, _>("action")?)?,
        amount: row.try_get("amount")?,
        status: DispositionStatus::parse(&row.try_get::<String, _>("status")?)?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Detect a Postgres unique constraint violation by name.
fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

async fn insert_bid(tx: &mut Transaction<'_, Postgres>, bid: &Bid) -> Result<()> {
    sqlx::query(
        r#"
        insert into bids (
          id, round_id, request_id, amount, bidder_ref, created_at, accepted, rejection_reason
        ) values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(bid.id)
    .bind(bid.round_id)
    .bind(bid.request_id)
    .bind(bid.amount)
    .bind(&bid.bidder_ref)
    .bind(bid.created_at)
    .bind(bid.accepted)
    .bind(bid.rejection_reason.map(|r| r.as_str()))
    .execute(&mut **tx)
    .await
    .context("insert bid failed")?;
    Ok(())
}

async fn insert_dispositions(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[HoldDisposition],
) -> Result<()> {
    for d in rows {
        sqlx::query(
            r#"
            insert into hold_dispositions (
              id, round_id, request_id, hold_ref, action, amount, status,
              attempts, last_error, next_attempt_at, updated_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(d.id)
        .bind(d.round_id)
        .bind(d.request_id)
        .bind(&d.hold_ref)
        .bind(d.action.as_str())
        .bind(d.amount)
        .bind(d.status.as_str())
        .bind(d.attempts)
        .bind(&d.last_error)
        .bind(d.next_attempt_at)
        .bind(d.updated_at)
        .execute(&mut **tx)
        .await
        .context("insert hold disposition failed")?;
    }
    Ok(())
}

/// [`OPEN_STATUSES`] as a `text[]` bind for `status = any($n)`.
fn open_statuses() -> Vec<&'static str> {
    OPEN_STATUSES.iter().map(RoundStatus::as_str).collect()
}

async fn fetch_open_round(
    exec: &mut sqlx::PgConnection,
    organization_id: Uuid,
) -> Result<Option<BiddingRound>> {
    let row = sqlx::query(&format!(
        "select {ROUND_COLS} from bidding_rounds \
         where organization_id = $1 and status = any($2)"
    ))
    .bind(organization_id)
    .bind(open_statuses())
    .fetch_optional(exec)
    .await
    .context("fetch open round failed")?;
    row.as_ref().map(round_from_row).transpose()
}

#[async_trait]
impl AuctionStore for PgStore {
    async fn open_round_for_org(&self, organization_id: Uuid) -> Result<Option<BiddingRound>> {
        let mut conn = self.pool.acquire().await.context("acquire connection failed")?;
        fetch_open_round(&mut conn, organization_id).await
    }

    async fn create_round_if_none_open(&self, new: NewRound) -> Result<OpenRoundOutcome> {
        let mut tx = self.pool.begin().await.context("begin create_round failed")?;

        // Serialize creators per organization; the partial unique index is the backstop.
        sqlx::query("select pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(new.organization_id.to_string())
            .execute(&mut *tx)
            .await
            .context("advisory lock failed")?;

        if let Some(existing) = fetch_open_round(&mut tx, new.organization_id).await? {
            return Ok(OpenRoundOutcome::Existing(existing));
        }

        let (next,): (i64,) = sqlx::query_as::<_, (i64,)>(
            "select coalesce(max(round_number), 0)::bigint + 1 from bidding_rounds where organization_id = $1",
        )
        .bind(new.organization_id)
        .fetch_one(&mut *tx)
        .await
        .context("next round_number failed")?;

        let res = sqlx::query(&format!(
            r#"
            insert into bidding_rounds (
              id, organization_id, round_number, starts_at, ends_at, status, created_at
            ) values ($1, $2, $3, $4, $5, 'active', $4)
            returning {ROUND_COLS}
            "#
        ))
        .bind(new.id)
        .bind(new.organization_id)
        .bind(next)
        .bind(new.starts_at)
        .bind(new.ends_at)
        .fetch_one(&mut *tx)
        .await;

        match res {
            Ok(row) => {
                let round = round_from_row(&row)?;
                tx.commit().await.context("commit create_round failed")?;
                Ok(OpenRoundOutcome::Created(round))
            }
            Err(e) if is_unique_violation(&e, "uq_bidding_rounds_one_open") => {
                drop(tx);
                let existing = self
                    .open_round_for_org(new.organization_id)
                    .await?
                    .ok_or_else(|| anyhow!("open round vanished after unique violation"))?;
                Ok(OpenRoundOutcome::Existing(existing))
            }
            Err(e) => Err(anyhow::Error::new(e).context("insert bidding round failed")),
        }
    }

    async fn fetch_round(&self, round_id: Uuid) -> Result<Option<BiddingRound>> {
        let row = sqlx::query(&format!("select {ROUND_COLS} from bidding_rounds where id = $1"))
            .bind(round_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_round failed")?;
        row.as_ref().map(round_from_row).transpose()
    }

    async fn close_round_if_expired(&self, round_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update bidding_rounds
            set status = 'closing',
                closed_at = $2
            where id = $1
              and status = 'active'
              and ends_at <= $2
            "#,
        )
        .bind(round_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("close_round_if_expired failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn record_settlement(&self, rec: &SettlementRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin settlement failed")?;
        let res = sqlx::query(
            r#"
            update bidding_rounds
            set status = 'settled',
                winning_request_id = $2,
                winning_bid_amount = $3,
                settled_at = $4,
                settlement_error = null
            where id = $1
              and status = 'closing'
            "#,
        )
        .bind(rec.round_id)
        .bind(rec.winning_request_id)
        .bind(rec.winning_bid_amount)
        .bind(rec.settled_at)
        .execute(&mut *tx)
        .await
        .context("settle round update failed")?;
        if res.rows_affected() != 1 {
            return Ok(false);
        }
        insert_dispositions(&mut tx, &rec.dispositions).await?;
        tx.commit().await.context("commit settlement failed")?;
        Ok(true)
    }

    async fn record_cancellation(&self, rec: &CancellationRecord) -> Result<bool> {
        let allowed: Vec<String> = rec
            .allowed_from
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let mut tx = self.pool.begin().await.context("begin cancellation failed")?;
        let res = sqlx::query(
            r#"
            update bidding_rounds
            set status = 'cancelled',
                closed_at = coalesce(closed_at, $3),
                settlement_error = null
            where id = $1
              and status = any($2::text[])
            "#,
        )
        .bind(rec.round_id)
        .bind(&allowed)
        .bind(rec.cancelled_at)
        .execute(&mut *tx)
        .await
        .context("cancel round update failed")?;
        if res.rows_affected() != 1 {
            return Ok(false);
        }
        insert_dispositions(&mut tx, &rec.releases).await?;
        tx.commit().await.context("commit cancellation failed")?;
        Ok(true)
    }

    async fn record_round_error(&self, round_id: Uuid, error: Option<&str>) -> Result<()> {
        sqlx::query("update bidding_rounds set settlement_error = $2 where id = $1")
            .bind(round_id)
            .bind(error)
            .execute(&self.pool)
            .await
            .context("record_round_error failed")?;
        Ok(())
    }

    async fn rounds_due(&self, now: DateTime<Utc>) -> Result<Vec<BiddingRound>> {
        let rows = sqlx::query(&format!(
            r#"
            select {ROUND_COLS}
            from bidding_rounds
            where status = 'closing'
               or (status = 'active' and ends_at <= $1)
            order by ends_at asc, id asc
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("rounds_due failed")?;
        rows.iter().map(round_from_row).collect()
    }

    async fn organizations_without_open_round(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            select distinct r.organization_id
            from bidding_rounds r
            where not exists (
              select 1 from bidding_rounds o
              where o.organization_id = r.organization_id
                and o.status = any($1)
            )
            order by r.organization_id
            "#,
        )
        .bind(open_statuses())
        .fetch_all(&self.pool)
        .await
        .context("organizations_without_open_round failed")?;
        rows.iter()
            .map(|r| Ok(r.try_get::<Uuid, _>("organization_id")?))
            .collect()
    }

    async fn insert_request(&self, req: &ParticipatingRequest, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin insert_request failed")?;

        // Share lock: a concurrent close flip waits until this insert commits.
        let row = sqlx::query("select status, ends_at from bidding_rounds where id = $1 for share")
            .bind(req.round_id)
            .fetch_optional(&mut *tx)
            .await
            .context("lock round for insert_request failed")?;
        let Some(row) = row else {
            bail!("round {} not found", req.round_id);
        };
        let status = RoundStatus::parse(&row.try_get::<String, _>("status")?)?;
        let ends_at: DateTime<Utc> = row.try_get("ends_at")?;
        if status != RoundStatus::Active || now >= ends_at {
            return Ok(false);
        }

        sqlx::query(
            r#"
            insert into participating_requests (
              id, round_id, organization_id, kind, seed_amount, current_bid_amount,
              highest_bidder_ref, payment_hold_ref, accepted_bids, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(req.id)
        .bind(req.round_id)
        .bind(req.organization_id)
        .bind(req.kind.as_str())
        .bind(req.seed_amount)
        .bind(req.current_bid_amount)
        .bind(&req.highest_bidder_ref)
        .bind(&req.payment_hold_ref)
        .bind(req.accepted_bids)
        .bind(req.created_at)
        .execute(&mut *tx)
        .await
        .context("insert participating request failed")?;

        tx.commit().await.context("commit insert_request failed")?;
        Ok(true)
    }

    async fn fetch_request(&self, request_id: Uuid) -> Result<Option<ParticipatingRequest>> {
        let row = sqlx::query(&format!(
            "select {REQUEST_COLS} from participating_requests where id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch_request failed")?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_requests(&self, round_id: Uuid) -> Result<Vec<ParticipatingRequest>> {
        let rows = sqlx::query(&format!(
            "select {REQUEST_COLS} from participating_requests \
             where round_id = $1 order by created_at asc, id asc"
        ))
        .bind(round_id)
        .fetch_all(&self.pool)
        .await
        .context("list_requests failed")?;
        rows.iter().map(request_from_row).collect()
    }

    async fn commit_bid(&self, commit: &BidCommit) -> Result<CommitOutcome> {
        let bid = &commit.bid;
        let mut tx = self.pool.begin().await.context("begin commit_bid failed")?;

        let updated = sqlx::query(&format!(
            r#"
            update bidding_rounds
            set watermark = greatest(watermark, $2),
                leader_request_id = $3,
                version = version + 1
            where id = $1
              and status = 'active'
              and ends_at > $4
              and version = $5
            returning {ROUND_COLS}
            "#
        ))
        .bind(bid.round_id)
        .bind(bid.amount)
        .bind(bid.request_id)
        .bind(commit.now)
        .bind(commit.expected_version)
        .fetch_optional(&mut *tx)
        .await
        .context("round compare-and-set failed")?;

        let Some(row) = updated else {
            drop(tx);
            let current = self
                .fetch_round(bid.round_id)
                .await?
                .ok_or_else(|| anyhow!("round {} not found", bid.round_id))?;
            return Ok(if current.accepts_bids(commit.now) {
                CommitOutcome::Conflict
            } else {
                CommitOutcome::RoundClosed
            });
        };
        let round = round_from_row(&row)?;

        let res = sqlx::query(
            r#"
            update participating_requests
            set current_bid_amount = $2,
                highest_bidder_ref = $3,
                accepted_bids = accepted_bids + 1
            where id = $1
              and round_id = $4
              and current_bid_amount < $2
            "#,
        )
        .bind(bid.request_id)
        .bind(bid.amount)
        .bind(&bid.bidder_ref)
        .bind(bid.round_id)
        .execute(&mut *tx)
        .await
        .context("request bid update failed")?;
        if res.rows_affected() != 1 {
            bail!(
                "request {} not updatable in round {} (missing or non-increasing amount)",
                bid.request_id,
                bid.round_id
            );
        }

        insert_bid(&mut tx, bid).await?;
        tx.commit().await.context("commit commit_bid failed")?;
        Ok(CommitOutcome::Applied(round))
    }

    async fn append_bid(&self, bid: &Bid) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin append_bid failed")?;
        insert_bid(&mut tx, bid).await?;
        tx.commit().await.context("commit append_bid failed")?;
        Ok(())
    }

    async fn list_bids(&self, request_id: Uuid) -> Result<Vec<Bid>> {
        let rows = sqlx::query(&format!(
            "select {BID_COLS} from bids where request_id = $1 order by created_at asc, seq asc"
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .context("list_bids failed")?;
        rows.iter().map(bid_from_row).collect()
    }

    async fn claim_dispositions(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<HoldDisposition>> {
        // SKIP LOCKED: concurrent dispatchers never claim the same row.
        let rows = sqlx::query(&format!(
            r#"
            update hold_dispositions
            set status = 'claimed',
                attempts = attempts + 1,
                updated_at = $1
            where id in (
              select id
              from hold_dispositions
              where ($2::uuid is null or round_id = $2)
                and attempts < $3
                and (
                  status = 'pending'
                  or ($4 and status = 'failed'
                      and (next_attempt_at is null or next_attempt_at <= $1))
                  or ($5::timestamptz is not null and status = 'claimed' and updated_at <= $5)
                )
              order by created_at asc, id asc
              for update skip locked
            )
            returning {DISPOSITION_COLS}
            "#
        ))
        .bind(now)
        .bind(filter.round_id)
        .bind(filter.max_attempts)
        .bind(filter.include_failed)
        .bind(filter.stale_claimed_before)
        .fetch_all(&self.pool)
        .await
        .context("claim_dispositions failed")?;
        rows.iter().map(disposition_from_row).collect()
    }

    async fn complete_disposition(
        &self,
        disposition_id: Uuid,
        result: &DispositionResult,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (status, error, retry_at) = match result {
            DispositionResult::Done => (DispositionStatus::Done, None, None),
            DispositionResult::Failed { error, retry_at } => {
                (DispositionStatus::Failed, Some(error.as_str()), Some(*retry_at))
            }
        };
        let res = sqlx::query(
            r#"
            update hold_dispositions
            set status = $2,
                last_error = $3,
                next_attempt_at = $4,
                updated_at = $5
            where id = $1
              and status = 'claimed'
            "#,
        )
        .bind(disposition_id)
        .bind(status.as_str())
        .bind(error)
        .bind(retry_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("complete_disposition failed")?;
        if res.rows_affected() != 1 {
            bail!("hold disposition {disposition_id} is not claimed");
        }
        Ok(())
    }

    async fn list_dispositions(&self, round_id: Uuid) -> Result<Vec<HoldDisposition>> {
        let rows = sqlx::query(&format!(
            "select {DISPOSITION_COLS} from hold_dispositions \
             where round_id = $1 order by created_at asc, id asc"
        ))
        .bind(round_id)
        .fetch_all(&self.pool)
        .await
        .context("list_dispositions failed")?;
        rows.iter().map(disposition_from_row).collect()
    }
}
