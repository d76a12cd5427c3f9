mod client;

use anyhow::Result;
use auction_hub::auction::{Auction, AuctionNotify};
use auction_hub::protocol::HubMessage;
use client::{AuctionClient, HubConnection};
use rmpv::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Where the console is in the id/bid prompt cycle
enum Prompt {
    AuctionId,
    Bid { auction_id: i32 },
}

impl Prompt {
    fn show(&self) {
        match self {
            Prompt::AuctionId => println!("Auction id?"),
            Prompt::Bid { auction_id } => println!("New bid for auction {}?", auction_id),
        }
    }
}

fn print_auction(auction: &Auction) {
    println!(
        "{:<3} {:<20} {:>10}",
        auction.id, auction.item_name, auction.current_bid
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "console_client=warn".into()),
        )
        .init();

    let base_url = std::env::var("AUCTION_HUB_URL")
        .unwrap_or_else(|_| "http://localhost:5000".to_string());
    let hub_path = std::env::var("AUCTION_HUB_PATH").unwrap_or_else(|_| "/auctionHub".to_string());
    info!(base_url = %base_url, hub_path = %hub_path, "Configuration loaded");

    let api = AuctionClient::new(base_url);
    let mut auctions = api.list_auctions().await?;
    for auction in &auctions {
        print_auction(auction);
    }

    let mut hub = match HubConnection::connect(&api.hub_url(&hub_path)).await {
        Ok(hub) => hub,
        Err(e) => {
            println!("{:#}", e);
            return Ok(());
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut keep_alive = tokio::time::interval(Duration::from_secs(15));
    let mut prompt = Prompt::AuctionId;
    prompt.show();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let Ok(number) = line.trim().parse::<i32>() else {
                    println!("Please enter a number.");
                    prompt.show();
                    continue;
                };

                prompt = match prompt {
                    Prompt::AuctionId => Prompt::Bid { auction_id: number },
                    Prompt::Bid { auction_id } => {
                        let notify = AuctionNotify { auction_id, new_bid: number };
                        if let Err(e) = api.place_bid(auction_id, number).await {
                            println!("{:#}", e);
                        } else {
                            hub.invoke("NotifyNewBid", vec![Value::from(&notify)]).await?;
                        }
                        Prompt::AuctionId
                    }
                };
                prompt.show();
            }

            message = hub.next_message() => {
                match message? {
                    Some(HubMessage::Invocation(invocation)) if invocation.target == "ReceiveNewBid" => {
                        let Some(notify) = invocation
                            .arguments
                            .first()
                            .and_then(|arg| AuctionNotify::try_from(arg).ok())
                        else {
                            warn!("Malformed ReceiveNewBid arguments");
                            continue;
                        };
                        if let Some(auction) = auctions.iter_mut().find(|a| a.id == notify.auction_id) {
                            auction.current_bid = notify.new_bid;
                            println!("New bid:");
                            print_auction(auction);
                        }
                    }
                    Some(HubMessage::Invocation(invocation)) if invocation.target == "ReceiveNewAuction" => {
                        if let Some(auction) = invocation
                            .arguments
                            .first()
                            .and_then(|arg| Auction::try_from(arg).ok())
                        {
                            println!("New auction:");
                            print_auction(&auction);
                            auctions.push(auction);
                        }
                    }
                    Some(HubMessage::Completion(completion)) => match completion.error {
                        Some(error) => println!("Bid failed: {}", error),
                        None => println!("Bid placed"),
                    },
                    Some(HubMessage::Close(close)) => {
                        if let Some(error) = close.error {
                            println!("Server closed the connection: {}", error);
                        }
                        break;
                    }
                    Some(_) => {}
                    None => {
                        println!("Server closed the connection");
                        break;
                    }
                }
            }

            _ = keep_alive.tick() => {
                hub.ping().await?;
            }
        }
    }

    hub.close().await;
    Ok(())
}
