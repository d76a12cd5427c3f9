// Integration tests for the auction REST routes and the negotiate endpoint

use auction_hub::api::create_app;
use auction_hub::auction::{Auction, AuctionHub, AuctionRepo, MemoryAuctionRepo};
use auction_hub::config::HubConfig;
use auction_hub::hub::Hub;
use auction_hub::protocol::handshake::{self, HandshakeRequest};
use auction_hub::protocol::{HubMessage, MessagePackHubProtocol};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

// ── Helpers ───────────────────────────────────────────────────────────────────

struct TestApp {
    router: Router,
    hub: Arc<Hub<AuctionHub>>,
    repo: Arc<MemoryAuctionRepo>,
}

fn create_test_app() -> TestApp {
    let repo = Arc::new(MemoryAuctionRepo::with_sample_data());
    let hub = Arc::new(Hub::new(AuctionHub::new(), HubConfig::default()));
    let router = create_app(
        "/auctionHub",
        Arc::clone(&hub),
        Arc::clone(&repo) as Arc<dyn AuctionRepo>,
    );
    TestApp { router, hub, repo }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// GET /auctions → sample catalogue with PascalCase fields
#[tokio::test]
async fn test_list_auctions() {
    let app = create_test_app();

    let request = Request::builder()
        .uri("/auctions")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    let auctions = json.as_array().unwrap();
    assert_eq!(auctions.len(), 5);
    assert_eq!(
        auctions[0],
        serde_json::json!({"Id": 1, "ItemName": "Cool refrigerator", "CurrentBid": 23})
    );
}

/// POST /auction/:id/newbid → bid stored
#[tokio::test]
async fn test_new_bid_updates_auction() {
    let app = create_test_app();

    let (status, json) = send(&app.router, post("/auction/2/newbid?currentBid=10")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["CurrentBid"], 10);
    assert_eq!(app.repo.get(2).unwrap().current_bid, 10);
}

/// Unknown auction → 404 with JSON error
#[tokio::test]
async fn test_new_bid_unknown_auction_returns_404() {
    let app = create_test_app();

    let (status, json) = send(&app.router, post("/auction/42/newbid?currentBid=10")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "auction 42 not found");
}

/// Missing or non-numeric currentBid → 400
#[tokio::test]
async fn test_new_bid_requires_numeric_bid() {
    let app = create_test_app();

    let response = app
        .router
        .clone()
        .oneshot(post("/auction/1/newbid"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router
        .clone()
        .oneshot(post("/auction/1/newbid?currentBid=lots"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.repo.get(1).unwrap().current_bid, 23);
}

/// POST /auction → stored and announced to connected hub clients
#[tokio::test]
async fn test_add_auction_is_announced() {
    let app = create_test_app();

    let (mut session, mut outbound) = app.hub.connect();
    let request = handshake::write_request(&HandshakeRequest::messagepack()).unwrap();
    app.hub.on_receive(&mut session, &request).await.unwrap();
    assert_eq!(outbound.recv().await.unwrap().as_ref(), b"{}\x1e");

    // Browser form values arrive as camelCase strings
    let request = Request::builder()
        .method("POST")
        .uri("/auction")
        .header("Content-Type", "application/json")
        .body(Body::from(r#"{"itemName":"Lava lamp","currentBid":"30"}"#))
        .unwrap();
    let (status, json) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["Id"], 6);
    assert_eq!(app.repo.get(6).unwrap().item_name, "Lava lamp");

    let frame = outbound.recv().await.unwrap();
    let messages = MessagePackHubProtocol::parse_messages(&frame).unwrap();
    match messages.as_slice() {
        [HubMessage::Invocation(invocation)] => {
            assert_eq!(invocation.target, "ReceiveNewAuction");
            assert!(invocation.invocation_id.is_none());
            let announced = Auction::try_from(&invocation.arguments[0]).unwrap();
            assert_eq!(announced, Auction::new(6, "Lava lamp", 30));
        }
        other => panic!("expected a single invocation, got {:?}", other),
    }
}

/// POST /auction with an unparsable body → client error, nothing stored
#[tokio::test]
async fn test_add_auction_rejects_bad_body() {
    let app = create_test_app();

    let request = Request::builder()
        .method("POST")
        .uri("/auction")
        .header("Content-Type", "application/json")
        .body(Body::from("not json"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert!(response.status().is_client_error());
    assert_eq!(app.repo.get_all().len(), 5);
}

/// POST /auctionHub/negotiate → WebSockets/Binary transport advertised
#[tokio::test]
async fn test_negotiate() {
    let app = create_test_app();

    let (status, json) = send(&app.router, post("/auctionHub/negotiate")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["negotiateVersion"], 1);
    assert!(json["connectionId"].as_str().is_some_and(|id| !id.is_empty()));
    assert_eq!(json["connectionToken"], json["connectionId"]);
    assert_eq!(
        json["availableTransports"],
        serde_json::json!([{"transport": "WebSockets", "transferFormats": ["Binary"]}])
    );
}
