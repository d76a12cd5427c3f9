// Auction domain: model, in-memory store and the bid hub
pub mod hub;
pub mod model;
pub mod repo;

pub use hub::{announce_auction, group_name, AuctionHub};
pub use model::{Auction, AuctionNotify, ModelError};
pub use repo::{AuctionError, AuctionRepo, MemoryAuctionRepo};
