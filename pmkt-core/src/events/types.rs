//! Event type definitions.

use crate::entities::auction::Auction;
use crate::entities::bid::Bid;

/// Invoice state as reported by the payment network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvoiceState {
    Open,
    Settled,
    Canceled,
    Accepted,
}

/// One update from the payment network's invoice stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementEvent {
    pub payment_request: String,
    pub state: InvoiceState,
    /// Position in the network's settlement stream. Only meaningful for
    /// settled invoices; used for ordering and resuming, not as an identity.
    pub settle_index: u64,
}

impl SettlementEvent {
    pub fn settled(payment_request: impl Into<String>, settle_index: u64) -> Self {
        Self {
            payment_request: payment_request.into(),
            state: InvoiceState::Settled,
            settle_index,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state == InvoiceState::Settled
    }
}

/// Something that changed since the last fanout iteration.
#[derive(Debug, Clone)]
pub enum ChangedEntity {
    /// A bid was settled.
    Bid(Bid),
    /// An auction is about to end or has just ended.
    Auction(Auction),
}

impl ChangedEntity {
    /// Id of the auction this change belongs to.
    pub fn auction_id(&self) -> i64 {
        match self {
            ChangedEntity::Bid(bid) => bid.auction_id,
            ChangedEntity::Auction(auction) => auction.id,
        }
    }
}
