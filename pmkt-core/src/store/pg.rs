use super::{StateStore, StoreError, StoreTransaction, parse_cursor};
use crate::entities::auction::{
    Auction, GetAuction, GetAuctionsEndingBetween, GetUnsettledContributionRequests,
};
use crate::entities::bid::{Bid, GetBid, GetBidsSettledSince, GetUnsettledBidRequests};
use crate::entities::message::{GetMessage, Message, NewMessage};
use crate::entities::state::StateRow;
use crate::entities::user::{
    GetAuctionFollowers, GetNotificationPreferences, User, UserNotification,
};
use crate::entities::{CursorKey, NotificationAction};
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::PgPool;
use time::PrimitiveDateTime;

/// [`StateStore`] backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgStateStore {
    db: DatabaseProcessor,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            db: DatabaseProcessor::new(pool),
        }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.db.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn settled_bids_since(&self, since: PrimitiveDateTime) -> Result<Vec<Bid>, StoreError> {
        Ok(self.db.process(GetBidsSettledSince { since }).await?)
    }

    async fn auctions_ending_between(
        &self,
        after: PrimitiveDateTime,
        until: PrimitiveDateTime,
    ) -> Result<Vec<Auction>, StoreError> {
        Ok(self
            .db
            .process(GetAuctionsEndingBetween { after, until })
            .await?)
    }

    async fn auction(&self, id: i64) -> Result<Option<Auction>, StoreError> {
        Ok(self.db.process(GetAuction { id }).await?)
    }

    async fn bid(&self, id: i64) -> Result<Option<Bid>, StoreError> {
        Ok(self.db.process(GetBid { id }).await?)
    }

    async fn followers(&self, auction_id: i64) -> Result<Vec<User>, StoreError> {
        Ok(self.db.process(GetAuctionFollowers { auction_id }).await?)
    }

    async fn notification_preferences(
        &self,
        user_ids: &[i64],
    ) -> Result<Vec<UserNotification>, StoreError> {
        Ok(self
            .db
            .process(GetNotificationPreferences {
                user_ids: user_ids.to_vec(),
            })
            .await?)
    }

    async fn unsettled_bid_payment_requests(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.db.process(GetUnsettledBidRequests).await?)
    }

    async fn unsettled_contribution_payment_requests(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.db.process(GetUnsettledContributionRequests).await?)
    }

    async fn message(&self, user_id: i64, key: &str) -> Result<Option<Message>, StoreError> {
        Ok(self
            .db
            .process(GetMessage {
                user_id,
                key: key.to_string(),
            })
            .await?)
    }
}

/// An open postgres transaction. Dropped without commit, sqlx rolls it back.
struct PgTransaction {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn cursor(&mut self, key: CursorKey) -> Result<Option<i64>, StoreError> {
        match StateRow::get_for_update_tx(&mut self.tx, key).await? {
            Some(row) => Ok(Some(parse_cursor(key, &row.value)?)),
            None => Ok(None),
        }
    }

    async fn set_cursor(&mut self, key: CursorKey, value: i64) -> Result<(), StoreError> {
        StateRow::advance_tx(&mut self.tx, key, value).await?;
        Ok(())
    }

    async fn settle_bid(
        &mut self,
        payment_request: &str,
        at: PrimitiveDateTime,
    ) -> Result<Option<Bid>, StoreError> {
        Ok(Bid::settle_unsettled_tx(&mut self.tx, payment_request, at).await?)
    }

    async fn extend_auction_end(
        &mut self,
        auction_id: i64,
        not_before: PrimitiveDateTime,
    ) -> Result<Option<PrimitiveDateTime>, StoreError> {
        Ok(Auction::extend_end_date_tx(&mut self.tx, auction_id, not_before).await?)
    }

    async fn settle_contribution(
        &mut self,
        payment_request: &str,
        at: PrimitiveDateTime,
    ) -> Result<Option<Auction>, StoreError> {
        Ok(Auction::settle_contribution_tx(&mut self.tx, payment_request, at).await?)
    }

    async fn top_bid(&mut self, auction_id: i64) -> Result<Option<Bid>, StoreError> {
        Ok(Bid::top_settled_tx(&mut self.tx, auction_id).await?)
    }

    async fn set_winning_bid(
        &mut self,
        auction_id: i64,
        bid_id: Option<i64>,
    ) -> Result<(), StoreError> {
        Auction::set_winning_bid_tx(&mut self.tx, auction_id, bid_id).await?;
        Ok(())
    }

    async fn insert_message(
        &mut self,
        new: &NewMessage,
        at: PrimitiveDateTime,
    ) -> Result<Message, StoreError> {
        Message::insert_tx(&mut self.tx, new, at)
            .await
            .map_err(StoreError::from_write)
    }

    async fn mark_message_delivered(
        &mut self,
        message_id: i64,
        action: NotificationAction,
    ) -> Result<(), StoreError> {
        Message::mark_notified_tx(&mut self.tx, message_id, action).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(StoreError::from_write)
    }
}
