//! The auction hub: bid notifications fanned out per auction group.

use crate::auction::model::{Auction, AuctionNotify};
use crate::hub::{Delivery, HubClients, HubContext, HubHandler, InvocationError};
use crate::protocol::ProtocolError;
use async_trait::async_trait;
use rmpv::Value;
use tracing::{debug, info};

/// Invoked by clients after placing a bid.
pub const NOTIFY_NEW_BID: &str = "NotifyNewBid";
/// Sent to the other bidders on an auction when someone bids higher.
pub const NOTIFY_OUTBID: &str = "NotifyOutbid";
/// Sent to every client for every bid.
pub const RECEIVE_NEW_BID: &str = "ReceiveNewBid";
/// Sent to every client when an auction is added.
pub const RECEIVE_NEW_AUCTION: &str = "ReceiveNewAuction";

/// Group holding everyone who has bid on `auction_id`.
pub fn group_name(auction_id: i32) -> String {
    format!("auction-{}", auction_id)
}

#[derive(Debug, Default)]
pub struct AuctionHub;

impl AuctionHub {
    pub fn new() -> Self {
        Self
    }

    /// Join the bidder to the auction's group, tell the other bidders they
    /// were outbid, then announce the bid to everyone.
    ///
    /// The bidder joins before the outbid broadcast, so it never receives
    /// its own `NotifyOutbid`.
    pub async fn notify_new_bid(
        &self,
        ctx: &HubContext,
        notify: AuctionNotify,
    ) -> Result<(), InvocationError> {
        let group = group_name(notify.auction_id);
        ctx.groups().add_to_group(ctx.connection_id(), &group);

        let payload = Value::from(&notify);
        let outbid = ctx
            .clients()
            .others_in_group(group.as_str(), ctx.connection_id())
            .send(NOTIFY_OUTBID, vec![payload.clone()])
            .await?;
        let announced = ctx
            .clients()
            .all()
            .send(RECEIVE_NEW_BID, vec![payload])
            .await?;

        info!(
            connection_id = %ctx.connection_id(),
            auction_id = notify.auction_id,
            new_bid = notify.new_bid,
            outbid = outbid.delivered,
            announced = announced.delivered,
            "New bid"
        );
        Ok(())
    }
}

#[async_trait]
impl HubHandler for AuctionHub {
    async fn on_connected(&self, ctx: &HubContext) {
        debug!(connection_id = %ctx.connection_id(), "Bidder connected");
    }

    async fn on_disconnected(&self, ctx: &HubContext) {
        debug!(connection_id = %ctx.connection_id(), "Bidder disconnected");
    }

    async fn on_invocation(
        &self,
        ctx: &HubContext,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>, InvocationError> {
        if !target.eq_ignore_ascii_case(NOTIFY_NEW_BID) {
            return Err(InvocationError::UnknownMethod(target.to_string()));
        }

        let [argument] = arguments.as_slice() else {
            return Err(InvocationError::InvalidArguments {
                method: NOTIFY_NEW_BID.to_string(),
                reason: format!("expected 1 argument, got {}", arguments.len()),
            });
        };
        let notify =
            AuctionNotify::try_from(argument).map_err(|e| InvocationError::InvalidArguments {
                method: NOTIFY_NEW_BID.to_string(),
                reason: e.to_string(),
            })?;

        self.notify_new_bid(ctx, notify).await?;
        Ok(None)
    }
}

/// Tell every connected client about a newly added auction.
pub async fn announce_auction(
    clients: &HubClients,
    auction: &Auction,
) -> Result<Delivery, ProtocolError> {
    clients
        .all()
        .send(RECEIVE_NEW_AUCTION, vec![Value::from(auction)])
        .await
}
