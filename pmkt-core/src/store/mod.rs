//! Durable state shared by the two processors.
//!
//! The processors never talk to each other directly; everything they share
//! goes through a [`StateStore`]. Work that must be atomic (a cursor advance
//! together with the entity change it guards, a message insert guarded by
//! the `(user_id, key)` uniqueness constraint) runs inside a
//! [`StoreTransaction`]. Dropping a transaction without committing rolls it
//! back.
//!
//! - [`PgStateStore`]: PostgreSQL through sqlx, used in production.
//! - [`MemoryStateStore`]: in-process, same transactional semantics, used in
//!   tests and for local development.

mod memory;
mod pg;

pub use memory::MemoryStateStore;
pub use pg::PgStateStore;

use crate::entities::auction::Auction;
use crate::entities::bid::Bid;
use crate::entities::message::{Message, NewMessage};
use crate::entities::user::{User, UserNotification};
use crate::entities::{CursorKey, NotificationAction};
use async_trait::async_trait;
use thiserror::Error;
use time::PrimitiveDateTime;

/// Errors returned by a [`StateStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    ///
    /// For messages this is the dedup barrier firing, not a failure.
    #[error("unique constraint violated: {constraint}")]
    Conflict { constraint: String },

    /// A cursor row holds something that is not an integer.
    #[error("cursor {key} holds a non-numeric value: {value:?}")]
    CorruptCursor { key: CursorKey, value: String },

    /// A stored timestamp cannot be represented.
    #[error("timestamp out of range: {0}")]
    Timestamp(#[from] time::error::ComponentRange),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Map a failed write, turning unique violations into [`StoreError::Conflict`].
    pub(crate) fn from_write(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Conflict {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                }
            }
            _ => StoreError::Database(err),
        }
    }
}

/// Parse a string-encoded cursor value.
pub(crate) fn parse_cursor(key: CursorKey, value: &str) -> Result<i64, StoreError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| StoreError::CorruptCursor {
            key,
            value: value.to_string(),
        })
}

/// Read access and transaction factory for the marketplace state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Bids settled strictly after `since`, oldest settlement first.
    async fn settled_bids_since(&self, since: PrimitiveDateTime) -> Result<Vec<Bid>, StoreError>;

    /// Auctions with `after < end_date <= until`.
    async fn auctions_ending_between(
        &self,
        after: PrimitiveDateTime,
        until: PrimitiveDateTime,
    ) -> Result<Vec<Auction>, StoreError>;

    async fn auction(&self, id: i64) -> Result<Option<Auction>, StoreError>;

    async fn bid(&self, id: i64) -> Result<Option<Bid>, StoreError>;

    /// Users whose follow flag for the auction is set.
    async fn followers(&self, auction_id: i64) -> Result<Vec<User>, StoreError>;

    async fn notification_preferences(
        &self,
        user_ids: &[i64],
    ) -> Result<Vec<UserNotification>, StoreError>;

    async fn unsettled_bid_payment_requests(&self) -> Result<Vec<String>, StoreError>;

    async fn unsettled_contribution_payment_requests(&self) -> Result<Vec<String>, StoreError>;

    async fn message(&self, user_id: i64, key: &str) -> Result<Option<Message>, StoreError>;
}

/// An open unit of work against the store.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Current value of a cursor, `None` if it was never written.
    async fn cursor(&mut self, key: CursorKey) -> Result<Option<i64>, StoreError>;

    /// Write a cursor. The stored value never decreases.
    async fn set_cursor(&mut self, key: CursorKey, value: i64) -> Result<(), StoreError>;

    /// Settle the unsettled bid with this payment request.
    async fn settle_bid(
        &mut self,
        payment_request: &str,
        at: PrimitiveDateTime,
    ) -> Result<Option<Bid>, StoreError>;

    /// Set `end_date = max(end_date, not_before)` and return the result.
    async fn extend_auction_end(
        &mut self,
        auction_id: i64,
        not_before: PrimitiveDateTime,
    ) -> Result<Option<PrimitiveDateTime>, StoreError>;

    /// Settle the unsettled auction contribution with this payment request.
    async fn settle_contribution(
        &mut self,
        payment_request: &str,
        at: PrimitiveDateTime,
    ) -> Result<Option<Auction>, StoreError>;

    /// Highest settled bid of the auction.
    async fn top_bid(&mut self, auction_id: i64) -> Result<Option<Bid>, StoreError>;

    async fn set_winning_bid(
        &mut self,
        auction_id: i64,
        bid_id: Option<i64>,
    ) -> Result<(), StoreError>;

    /// Insert a pending message; a duplicate `(user_id, key)` is
    /// [`StoreError::Conflict`].
    async fn insert_message(
        &mut self,
        new: &NewMessage,
        at: PrimitiveDateTime,
    ) -> Result<Message, StoreError>;

    async fn mark_message_delivered(
        &mut self,
        message_id: i64,
        action: NotificationAction,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
