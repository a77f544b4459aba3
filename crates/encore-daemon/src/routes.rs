//! Axum router and all HTTP handlers for encore-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are thin: parse, call the engine, map errors
//! through [`ApiError`].

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use encore_auction::{AuctionError, JoinRound};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api_types::{
        ActiveRoundResponse, ApiError, BidHistoryResponse, HealthResponse, JoinRoundBody,
        MinBidResponse, PlaceBidBody,
    },
    state::{AppState, BusMsg},
};

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/v1/orgs/:org_id/round", get(active_round))
        .route("/v1/orgs/:org_id/requests", post(join_round))
        .route("/v1/requests/:request_id/min-bid", get(min_bid))
        .route("/v1/requests/:request_id/bids", post(place_bid).get(bid_history))
        .route("/v1/rounds/:round_id", get(round_view))
        .route("/v1/rounds/:round_id/cancel", post(cancel_round))
        .route("/v1/rounds/:round_id/settle", post(settle_round))
        .route("/v1/scheduler/sweep", post(sweep))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
            store: st.store_kind.to_string(),
            config_hash: st.config_hash.clone(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

pub(crate) async fn active_round(
    State(st): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Response> {
    let round = st.engine.active_round(org_id).await?;
    let status = if round.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(ActiveRoundResponse { round })).into_response())
}

pub(crate) async fn round_view(
    State(st): State<Arc<AppState>>,
    Path(round_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(st.engine.round_view(round_id).await?))
}

/// Joins the org's open round. When the body carries no hold the daemon
/// authorizes one, and releases it again if the join is refused.
pub(crate) async fn join_round(
    State(st): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
    Json(body): Json<JoinRoundBody>,
) -> ApiResult<impl IntoResponse> {
    let ctx = st.engine.context();
    if !ctx.settings.policy_for(org_id).bidding_enabled {
        return Err(AuctionError::BiddingDisabled {
            organization_id: org_id,
        }
        .into());
    }
    if body.seed_amount < 0 {
        return Err(AuctionError::InvalidAmount {
            amount: body.seed_amount,
        }
        .into());
    }

    let (payment_hold_ref, authorized_here) = match body.payment_hold_ref {
        Some(h) if !h.trim().is_empty() => (h, false),
        _ => {
            let hold = ctx
                .payments
                .authorize(&body.bidder_ref, body.seed_amount)
                .await
                .map_err(|e| ApiError::PaymentDeclined(format!("{e:#}")))?;
            (hold, true)
        }
    };
    let joined = st
        .engine
        .join_round(JoinRound {
            organization_id: org_id,
            kind: body.kind,
            bidder_ref: body.bidder_ref,
            payment_hold_ref: payment_hold_ref.clone(),
            seed_amount: body.seed_amount,
        })
        .await;
    match joined {
        Ok(request) => Ok((StatusCode::CREATED, Json(request))),
        Err(e) => {
            if authorized_here {
                if let Err(release_err) = ctx.payments.release(&payment_hold_ref).await {
                    warn!(
                        hold_ref = %payment_hold_ref,
                        error = %format!("{release_err:#}"),
                        "could not release hold after refused join"
                    );
                }
            }
            Err(e.into())
        }
    }
}

/// Administrative override.
pub(crate) async fn cancel_round(
    State(st): State<Arc<AppState>>,
    Path(round_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let report = st.engine.cancel_round(round_id).await?;
    info!(%round_id, "rounds/cancel");
    let _ = st.bus.send(BusMsg::LogLine {
        level: "WARN".to_string(),
        msg: format!("round {round_id} cancelled by operator"),
    });
    Ok(Json(report))
}

/// Manual settlement trigger; same idempotency as the scheduler path.
pub(crate) async fn settle_round(
    State(st): State<Arc<AppState>>,
    Path(round_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let report = st.engine.settle(round_id).await?;
    info!(%round_id, "rounds/settle");
    Ok(Json(report))
}

pub(crate) async fn sweep(State(st): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(st.engine.sweep().await?))
}

// ---------------------------------------------------------------------------
// Bids
// ---------------------------------------------------------------------------

pub(crate) async fn min_bid(
    State(st): State<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let min_acceptable = st.engine.min_acceptable_bid(request_id).await?;
    Ok(Json(MinBidResponse {
        request_id,
        min_acceptable,
    }))
}

pub(crate) async fn place_bid(
    State(st): State<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<PlaceBidBody>,
) -> ApiResult<impl IntoResponse> {
    let bid = st
        .engine
        .place_bid(request_id, body.amount, &body.bidder_ref)
        .await?;
    Ok((StatusCode::CREATED, Json(bid)))
}

pub(crate) async fn bid_history(
    State(st): State<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let bids = st.engine.bid_history(request_id).await?;
    Ok(Json(BidHistoryResponse { request_id, bids }))
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.event_name()).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
