//! Fixtures shared by the unit tests.

use crate::entities::auction::Auction;
use crate::entities::bid::Bid;
use crate::entities::message::NewMessage;
use crate::entities::user::User;
use time::PrimitiveDateTime;

/// A 24 hour auction ending at `end_date`, with no contribution paid yet.
pub fn auction(id: i64, end_date: PrimitiveDateTime) -> Auction {
    let start_date = end_date - time::Duration::hours(24);
    Auction {
        id,
        seller_id: 1,
        key: format!("auction-{id}"),
        title: format!("Auction {id}"),
        start_date,
        duration_hours: 24,
        end_date,
        starting_bid: 1_000,
        reserve_bid: 0,
        contribution_amount: 0,
        contribution_payment_request: Some(format!("lnbc-contribution-{id}")),
        contribution_settled_at: None,
        winning_bid_id: None,
        created_at: start_date,
    }
}

/// An unsettled bid.
pub fn bid(id: i64, auction_id: i64, buyer_id: i64, amount: i64, payment_request: &str) -> Bid {
    Bid {
        id,
        auction_id,
        buyer_id,
        amount,
        payment_request: payment_request.to_string(),
        requested_at: time::macros::datetime!(2024-01-01 00:00),
        settled_at: None,
    }
}

pub fn user(id: i64) -> User {
    User {
        id,
        nym: Some(format!("pleb{id}")),
        twitter_username: Some(format!("pleb{id}")),
        twitter_user_id: Some(format!("{}", 1_000_000 + id)),
    }
}

pub fn new_message(user_id: i64, key: &str) -> NewMessage {
    NewMessage {
        user_id,
        key: key.to_string(),
        body: format!("message {key}"),
    }
}
