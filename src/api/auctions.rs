use crate::auction::{announce_auction, Auction, AuctionError, AuctionRepo};
use crate::hub::HubClients;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state for the auction REST routes
pub struct AuctionAppState {
    pub repo: Arc<dyn AuctionRepo>,
    /// Used to announce new auctions to hub clients
    pub clients: HubClients,
}

/// Query parameters for POST /auction/:auctionId/newbid
#[derive(Deserialize)]
pub struct NewBidQuery {
    #[serde(rename = "currentBid")]
    pub current_bid: i32,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create auction REST router
pub fn create_auction_router(state: AuctionAppState) -> Router {
    Router::new()
        .route("/auctions", get(list_auctions))
        .route("/auction", post(add_auction))
        .route("/auction/:auction_id/newbid", post(new_bid))
        .with_state(Arc::new(state))
}

/// GET /auctions - All auctions ordered by id
async fn list_auctions(State(state): State<Arc<AuctionAppState>>) -> Json<Vec<Auction>> {
    Json(state.repo.get_all())
}

/// POST /auction/:auctionId/newbid?currentBid=N - Record a bid
async fn new_bid(
    State(state): State<Arc<AuctionAppState>>,
    Path(auction_id): Path<i32>,
    Query(query): Query<NewBidQuery>,
) -> Result<Json<Auction>, AppError> {
    let auction = state.repo.new_bid(auction_id, query.current_bid)?;
    Ok(Json(auction))
}

/// POST /auction - Add an auction and announce it to hub clients
async fn add_auction(
    State(state): State<Arc<AuctionAppState>>,
    Json(auction): Json<Auction>,
) -> Result<Json<Auction>, AppError> {
    let auction = state.repo.add_auction(auction);

    let delivery = announce_auction(&state.clients, &auction)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to announce auction: {}", e)))?;
    info!(
        auction_id = auction.id,
        delivered = delivery.delivered,
        failed = delivery.failed,
        "New auction announced"
    );

    Ok(Json(auction))
}

/// Auction API error types
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Internal(String),
}

impl From<AuctionError> for AppError {
    fn from(e: AuctionError) -> Self {
        match e {
            AuctionError::NotFound(_) => AppError::NotFound(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                warn!(error = %msg, "Auction API error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}
