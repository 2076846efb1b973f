use super::{StateStore, StoreError, StoreTransaction, parse_cursor};
use crate::entities::auction::Auction;
use crate::entities::bid::Bid;
use crate::entities::message::{Message, NewMessage};
use crate::entities::user::{User, UserAuction, UserNotification};
use crate::entities::{CursorKey, NotificationAction, NotificationType};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::PrimitiveDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Name reported for a duplicate message, matching the postgres constraint.
const MESSAGE_UNIQUE_CONSTRAINT: &str = "messages_user_key_unique";

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: BTreeMap<i64, User>,
    auctions: BTreeMap<i64, Auction>,
    bids: BTreeMap<i64, Bid>,
    follows: BTreeMap<(i64, i64), UserAuction>,
    preferences: BTreeMap<(i64, NotificationType), UserNotification>,
    messages: BTreeMap<i64, Message>,
    cursors: BTreeMap<CursorKey, String>,
    next_message_id: i64,
}

/// In-process [`StateStore`].
///
/// The whole state sits behind one async mutex. A transaction holds the
/// lock for its lifetime and works on a copy that replaces the shared state
/// only on commit, so an uncommitted transaction leaves no trace. Callers must
/// not use the store's read methods while holding a transaction on the same
/// task.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.inner.lock().await.users.insert(user.id, user);
    }

    pub async fn insert_auction(&self, auction: Auction) {
        self.inner.lock().await.auctions.insert(auction.id, auction);
    }

    pub async fn insert_bid(&self, bid: Bid) {
        self.inner.lock().await.bids.insert(bid.id, bid);
    }

    pub async fn set_following(&self, user_id: i64, auction_id: i64, following: bool) {
        self.inner.lock().await.follows.insert(
            (user_id, auction_id),
            UserAuction {
                user_id,
                auction_id,
                following,
            },
        );
    }

    pub async fn set_preference(
        &self,
        user_id: i64,
        notification_type: NotificationType,
        action: NotificationAction,
    ) {
        self.inner.lock().await.preferences.insert(
            (user_id, notification_type),
            UserNotification {
                user_id,
                notification_type,
                action,
            },
        );
    }

    /// Write a raw cursor value, bypassing the monotonic guard.
    pub async fn put_cursor_raw(&self, key: CursorKey, value: impl Into<String>) {
        self.inner.lock().await.cursors.insert(key, value.into());
    }

    pub async fn cursor_value(&self, key: CursorKey) -> Option<String> {
        self.inner.lock().await.cursors.get(&key).cloned()
    }

    /// All messages in insertion order.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.values().cloned().collect()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.inner.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    async fn settled_bids_since(&self, since: PrimitiveDateTime) -> Result<Vec<Bid>, StoreError> {
        let state = self.inner.lock().await;
        let mut bids: Vec<Bid> = state
            .bids
            .values()
            .filter(|b| b.settled_at.is_some_and(|at| at > since))
            .cloned()
            .collect();
        bids.sort_by_key(|b| (b.settled_at, b.id));
        Ok(bids)
    }

    async fn auctions_ending_between(
        &self,
        after: PrimitiveDateTime,
        until: PrimitiveDateTime,
    ) -> Result<Vec<Auction>, StoreError> {
        let state = self.inner.lock().await;
        let mut auctions: Vec<Auction> = state
            .auctions
            .values()
            .filter(|a| a.end_date > after && a.end_date <= until)
            .cloned()
            .collect();
        auctions.sort_by_key(|a| (a.end_date, a.id));
        Ok(auctions)
    }

    async fn auction(&self, id: i64) -> Result<Option<Auction>, StoreError> {
        Ok(self.inner.lock().await.auctions.get(&id).cloned())
    }

    async fn bid(&self, id: i64) -> Result<Option<Bid>, StoreError> {
        Ok(self.inner.lock().await.bids.get(&id).cloned())
    }

    async fn followers(&self, auction_id: i64) -> Result<Vec<User>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .follows
            .values()
            .filter(|f| f.auction_id == auction_id && f.following)
            .filter_map(|f| state.users.get(&f.user_id).cloned())
            .collect())
    }

    async fn notification_preferences(
        &self,
        user_ids: &[i64],
    ) -> Result<Vec<UserNotification>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .preferences
            .values()
            .filter(|p| user_ids.contains(&p.user_id))
            .cloned()
            .collect())
    }

    async fn unsettled_bid_payment_requests(&self) -> Result<Vec<String>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .bids
            .values()
            .filter(|b| b.settled_at.is_none())
            .map(|b| b.payment_request.clone())
            .collect())
    }

    async fn unsettled_contribution_payment_requests(&self) -> Result<Vec<String>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .auctions
            .values()
            .filter(|a| a.contribution_settled_at.is_none())
            .filter_map(|a| a.contribution_payment_request.clone())
            .collect())
    }

    async fn message(&self, user_id: i64, key: &str) -> Result<Option<Message>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .messages
            .values()
            .find(|m| m.user_id == user_id && m.key == key)
            .cloned())
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn cursor(&mut self, key: CursorKey) -> Result<Option<i64>, StoreError> {
        match self.working.cursors.get(&key) {
            Some(value) => Ok(Some(parse_cursor(key, value)?)),
            None => Ok(None),
        }
    }

    async fn set_cursor(&mut self, key: CursorKey, value: i64) -> Result<(), StoreError> {
        let current = match self.working.cursors.get(&key) {
            Some(stored) => Some(parse_cursor(key, stored)?),
            None => None,
        };
        if current.is_none_or(|current| current < value) {
            self.working.cursors.insert(key, value.to_string());
        }
        Ok(())
    }

    async fn settle_bid(
        &mut self,
        payment_request: &str,
        at: PrimitiveDateTime,
    ) -> Result<Option<Bid>, StoreError> {
        let bid = self
            .working
            .bids
            .values_mut()
            .find(|b| b.payment_request == payment_request && b.settled_at.is_none());
        Ok(bid.map(|bid| {
            bid.settled_at = Some(at);
            bid.clone()
        }))
    }

    async fn extend_auction_end(
        &mut self,
        auction_id: i64,
        not_before: PrimitiveDateTime,
    ) -> Result<Option<PrimitiveDateTime>, StoreError> {
        Ok(self.working.auctions.get_mut(&auction_id).map(|auction| {
            auction.end_date = auction.end_date.max(not_before);
            auction.end_date
        }))
    }

    async fn settle_contribution(
        &mut self,
        payment_request: &str,
        at: PrimitiveDateTime,
    ) -> Result<Option<Auction>, StoreError> {
        let auction = self.working.auctions.values_mut().find(|a| {
            a.contribution_payment_request.as_deref() == Some(payment_request)
                && a.contribution_settled_at.is_none()
        });
        Ok(auction.map(|auction| {
            auction.contribution_settled_at = Some(at);
            auction.clone()
        }))
    }

    async fn top_bid(&mut self, auction_id: i64) -> Result<Option<Bid>, StoreError> {
        Ok(self
            .working
            .bids
            .values()
            .filter(|b| b.auction_id == auction_id && b.settled_at.is_some())
            .min_by(|a, b| {
                b.amount
                    .cmp(&a.amount)
                    .then(a.settled_at.cmp(&b.settled_at))
                    .then(a.id.cmp(&b.id))
            })
            .cloned())
    }

    async fn set_winning_bid(
        &mut self,
        auction_id: i64,
        bid_id: Option<i64>,
    ) -> Result<(), StoreError> {
        if let Some(auction) = self.working.auctions.get_mut(&auction_id) {
            auction.winning_bid_id = bid_id;
        }
        Ok(())
    }

    async fn insert_message(
        &mut self,
        new: &NewMessage,
        at: PrimitiveDateTime,
    ) -> Result<Message, StoreError> {
        let duplicate = self
            .working
            .messages
            .values()
            .any(|m| m.user_id == new.user_id && m.key == new.key);
        if duplicate {
            return Err(StoreError::Conflict {
                constraint: MESSAGE_UNIQUE_CONSTRAINT.to_string(),
            });
        }

        self.working.next_message_id += 1;
        let message = Message {
            id: self.working.next_message_id,
            user_id: new.user_id,
            key: new.key.clone(),
            body: new.body.clone(),
            created_at: at,
            notified_via: None,
        };
        self.working.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn mark_message_delivered(
        &mut self,
        message_id: i64,
        action: NotificationAction,
    ) -> Result<(), StoreError> {
        if let Some(message) = self.working.messages.get_mut(&message_id) {
            message.notified_via = Some(action);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}
