// HTTP and WebSocket surface

pub mod auctions;
pub mod websocket;

pub use auctions::{create_auction_router, AppError, AuctionAppState};
pub use websocket::{create_hub_router, NegotiateResponse, WebSocketTransport};

use crate::auction::{AuctionHub, AuctionRepo};
use crate::hub::Hub;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Full application router: auction REST routes plus the hub at `hub_path`
pub fn create_app(hub_path: &str, hub: Arc<Hub<AuctionHub>>, repo: Arc<dyn AuctionRepo>) -> Router {
    let auction_state = AuctionAppState {
        repo,
        clients: hub.clients(),
    };

    Router::new()
        .merge(create_auction_router(auction_state))
        .merge(create_hub_router(hub_path, hub))
        .layer(CorsLayer::permissive())
}
