// Hub wire protocol: framing, handshake and MessagePack messages
pub mod protocol;

// Connection registry, group broadcast and per-connection driver
pub mod hub;

// Auction model, store and bid hub
pub mod auction;

// HTTP and WebSocket APIs
pub mod api;

// Configuration
pub mod config;
