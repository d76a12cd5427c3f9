use crate::auction::model::Auction;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuctionError {
    #[error("auction {0} not found")]
    NotFound(i32),
}

/// Storage for auctions.
pub trait AuctionRepo: Send + Sync {
    /// All auctions ordered by id.
    fn get_all(&self) -> Vec<Auction>;

    fn get(&self, auction_id: i32) -> Option<Auction>;

    /// Set the current bid of an existing auction.
    fn new_bid(&self, auction_id: i32, new_bid: i32) -> Result<Auction, AuctionError>;

    /// Store a new auction under a freshly assigned id and return it.
    fn add_auction(&self, auction: Auction) -> Auction;
}

/// In-memory auction store
pub struct MemoryAuctionRepo {
    /// Lock-free concurrent map keyed by auction id
    auctions: DashMap<i32, Auction>,

    /// Next id handed out by `add_auction`
    next_id: AtomicI32,
}

impl MemoryAuctionRepo {
    pub fn new() -> Self {
        Self {
            auctions: DashMap::new(),
            next_id: AtomicI32::new(1),
        }
    }

    /// Store pre-seeded with the demo catalogue.
    pub fn with_sample_data() -> Self {
        let repo = Self::new();
        for (item_name, current_bid) in [
            ("Cool refrigerator", 23),
            ("Noisy headphones", 4),
            ("Blinding television", 143),
            ("Sturdy kitchen table", 12),
            ("Creative pencil set", 3),
        ] {
            repo.add_auction(Auction::new(0, item_name, current_bid));
        }
        repo
    }
}

impl Default for MemoryAuctionRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl AuctionRepo for MemoryAuctionRepo {
    fn get_all(&self) -> Vec<Auction> {
        let mut auctions: Vec<Auction> = self.auctions.iter().map(|a| a.value().clone()).collect();
        auctions.sort_by_key(|a| a.id);
        auctions
    }

    fn get(&self, auction_id: i32) -> Option<Auction> {
        self.auctions.get(&auction_id).map(|a| a.clone())
    }

    fn new_bid(&self, auction_id: i32, new_bid: i32) -> Result<Auction, AuctionError> {
        let mut auction = self
            .auctions
            .get_mut(&auction_id)
            .ok_or(AuctionError::NotFound(auction_id))?;
        auction.current_bid = new_bid;

        info!(auction_id = auction_id, new_bid = new_bid, "Bid recorded");
        Ok(auction.clone())
    }

    fn add_auction(&self, mut auction: Auction) -> Auction {
        auction.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.auctions.insert(auction.id, auction.clone());

        info!(auction_id = auction.id, item_name = %auction.item_name, "Auction added");
        auction
    }
}
