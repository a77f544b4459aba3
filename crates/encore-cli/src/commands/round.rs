//! Round and bid command handlers.
//!
//! Covers `encore round {show,active,settle,cancel,holds}`, `encore bids`
//! and `encore sweep`. Output is `key=value` lines for single rows and
//! pretty JSON for reports.

use anyhow::Result;
use encore_auction::{AuctionEngine, SettleOutcome};
use encore_schemas::RoundView;
use tracing::warn;
use uuid::Uuid;

use super::{opt_dt, print_json};

fn print_view(view: &RoundView) {
    let r = &view.round;
    println!("round_id={}", r.id);
    println!("organization_id={}", r.organization_id);
    println!("round_number={}", r.round_number);
    println!("status={}", r.status);
    println!("starts_at={}", r.starts_at.to_rfc3339());
    println!("ends_at={}", r.ends_at.to_rfc3339());
    println!("watermark={}", r.watermark);
    println!(
        "leader_request_id={}",
        r.leader_request_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "null".to_string())
    );
    println!(
        "winning_request_id={}",
        r.winning_request_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "null".to_string())
    );
    println!(
        "winning_bid_amount={}",
        r.winning_bid_amount
            .map(|a| a.to_string())
            .unwrap_or_else(|| "null".to_string())
    );
    println!("closed_at={}", opt_dt(&r.closed_at));
    println!("settled_at={}", opt_dt(&r.settled_at));
    if let Some(err) = &r.settlement_error {
        println!("settlement_error={}", err);
    }
    println!("requests={}", view.requests.len());
    for q in &view.requests {
        println!(
            "  request_id={} kind={} current_bid_amount={} accepted_bids={} bidder={}",
            q.id,
            q.kind.as_str(),
            q.current_bid_amount,
            q.accepted_bids,
            q.highest_bidder_ref
        );
    }
}

pub async fn show(engine: &AuctionEngine, round_id: Uuid) -> Result<()> {
    let view = engine.round_view(round_id).await?;
    print_view(&view);
    Ok(())
}

pub async fn active(engine: &AuctionEngine, org_id: Uuid) -> Result<()> {
    match engine.active_round(org_id).await? {
        Some(view) => print_view(&view),
        None => println!("round=null organization_id={}", org_id),
    }
    Ok(())
}

pub async fn settle(engine: &AuctionEngine, round_id: Uuid) -> Result<()> {
    let report = engine.settle(round_id).await?;
    match &report.outcome {
        SettleOutcome::Settled {
            winning_request_id,
            winning_bid_amount,
            ..
        } => println!(
            "settled=true round_id={} winning_request_id={} winning_bid_amount={}",
            round_id, winning_request_id, winning_bid_amount
        ),
        SettleOutcome::Cancelled { released, .. } => println!(
            "settled=false cancelled=true round_id={} released={}",
            round_id, released
        ),
        SettleOutcome::AlreadyFinal { round } => println!(
            "already_final=true round_id={} status={}",
            round_id, round.status
        ),
    }
    println!(
        "dispatch_attempted={} dispatch_succeeded={} dispatch_failed={}",
        report.dispatch.attempted, report.dispatch.succeeded, report.dispatch.failed
    );
    Ok(())
}

pub async fn cancel(engine: &AuctionEngine, round_id: Uuid, reason: &str) -> Result<()> {
    let report = engine.cancel_round(round_id).await?;
    warn!(%round_id, reason, "round cancelled by operator");
    println!(
        "cancelled=true round_id={} status={} released={} release_failed={}",
        round_id, report.round.status, report.dispatch.succeeded, report.dispatch.failed
    );
    Ok(())
}

pub async fn holds(engine: &AuctionEngine, round_id: Uuid) -> Result<()> {
    print_json(&engine.dispositions(round_id).await?)
}

pub async fn bids(engine: &AuctionEngine, request_id: Uuid) -> Result<()> {
    print_json(&engine.bid_history(request_id).await?)
}

pub async fn sweep(engine: &AuctionEngine) -> Result<()> {
    let report = engine.sweep().await?;
    print_json(&report)?;
    if !report.failures.is_empty() {
        anyhow::bail!("SWEEP_INCOMPLETE: {} failure(s)", report.failures.len());
    }
    Ok(())
}
