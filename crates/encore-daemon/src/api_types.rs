//! Request and response types for all encore-daemon HTTP endpoints.
//!
//! `ApiError` is the one place an [`AuctionError`] becomes an HTTP status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use encore_auction::AuctionError;
use encore_schemas::{Amount, Bid, RequestKind, RoundView};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    pub store: String,
    pub config_hash: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine code, e.g. "BID_TOO_LOW".
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_acceptable: Option<Amount>,
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug)]
pub enum ApiError {
    Auction(AuctionError),
    /// The payment collaborator refused to authorize a hold for a join.
    PaymentDeclined(String),
}

impl From<AuctionError> for ApiError {
    fn from(e: AuctionError) -> Self {
        ApiError::Auction(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let e = match self {
            ApiError::Auction(e) => e,
            ApiError::PaymentDeclined(reason) => {
                let body = ErrorBody {
                    error: "PAYMENT_DECLINED".to_string(),
                    message: format!("PAYMENT_DECLINED: hold authorization failed: {reason}"),
                    min_acceptable: None,
                    retryable: false,
                };
                return (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response();
            }
        };
        let status = match &e {
            AuctionError::RoundNotActive { .. }
            | AuctionError::Contention { .. }
            | AuctionError::IllegalTransition { .. } => StatusCode::CONFLICT,
            AuctionError::BidTooLow { .. } | AuctionError::InvalidAmount { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AuctionError::BiddingDisabled { .. } => StatusCode::FORBIDDEN,
            AuctionError::RoundNotFound(_) | AuctionError::RequestNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AuctionError::Persistence(_) | AuctionError::SettlementFailure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let min_acceptable = match &e {
            AuctionError::BidTooLow { min_acceptable } => Some(*min_acceptable),
            _ => None,
        };
        // Storage details stay in the logs.
        let message = match &e {
            AuctionError::Persistence(_) => {
                "PERSISTENCE: storage failure; nothing was recorded, try again".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: e.code().to_string(),
            message,
            min_acceptable,
            retryable: e.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRoundResponse {
    /// `None` when the organization has no open round.
    pub round: Option<RoundView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoundBody {
    pub kind: RequestKind,
    pub bidder_ref: String,
    /// Hold obtained by the caller. When absent the daemon authorizes
    /// `seed_amount` itself through the payment collaborator.
    #[serde(default)]
    pub payment_hold_ref: Option<String>,
    #[serde(default)]
    pub seed_amount: Amount,
}

// ---------------------------------------------------------------------------
// Bids
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBidBody {
    pub amount: Amount,
    pub bidder_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinBidResponse {
    pub request_id: Uuid,
    pub min_acceptable: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidHistoryResponse {
    pub request_id: Uuid,
    pub bids: Vec<Bid>,
}
