//! NotificationFanout processor.
//!
//! Each iteration:
//! - Reads `LAST_PROCESSED_NOTIFICATIONS`; on first run seeds it with the
//!   iteration start and does nothing else
//! - Selects bids settled after the cursor and auctions whose end date lies
//!   between `cursor - window` and `now + window`
//! - Expands every change into `(notification type, follower)` obligations
//!   using each follower's preferences and the notification catalog
//! - Records each obligation through the dedup barrier and delivers the
//!   ones that were newly recorded
//! - Moves the cursor to the iteration start
//!
//! The cursor goes to the start, not the end, of the iteration so a row
//! committed while the iteration ran is picked up next time. The overlap is
//! rescanned every time and absorbed by the dedup barrier.

use crate::config::FanoutConfig;
use crate::delivery::DeliveryExecutor;
use crate::entities::message::NewMessage;
use crate::entities::user::User;
use crate::entities::{CursorKey, NotificationAction, NotificationType};
use crate::events::ChangedEntity;
use crate::notifications::{NotificationCatalog, ResolveContext};
use crate::processors::dedup::{DedupBarrier, DedupOutcome};
use crate::store::{StateStore, StoreError};
use crate::utils::clock::{from_unix, to_unix, utc_now};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use time::PrimitiveDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Errors that abort an iteration.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The cursor holds a timestamp that cannot be represented.
    #[error("invalid cursor timestamp: {0}")]
    Timestamp(#[from] time::error::ComponentRange),
}

/// Counters for one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// The cursor did not exist and was seeded; nothing was processed.
    pub seeded: bool,
    pub bids: usize,
    pub auctions: usize,
    pub messages_created: usize,
    pub duplicates_skipped: usize,
    pub deliveries_failed: usize,
    /// Obligations abandoned because of a store error.
    pub obligations_failed: usize,
    pub cursor_advanced: bool,
}

pub struct NotificationFanout {
    store: Arc<dyn StateStore>,
    catalog: NotificationCatalog,
    executor: DeliveryExecutor,
    dedup: DedupBarrier,
    config: FanoutConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl NotificationFanout {
    /// Create a new NotificationFanout.
    ///
    /// # Arguments
    ///
    /// * `store` - Shared state store
    /// * `catalog` - Supported notification types
    /// * `executor` - Delivery of newly recorded messages
    /// * `config` - Interval, window and cache size
    /// * `shutdown_rx` - Receiver for shutdown signal
    pub fn new(
        store: Arc<dyn StateStore>,
        catalog: NotificationCatalog,
        executor: DeliveryExecutor,
        config: FanoutConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let dedup = DedupBarrier::new(store.clone(), config.recently_sent_capacity);
        Self {
            store,
            catalog,
            executor,
            dedup,
            config,
            shutdown_rx,
        }
    }

    /// Run iterations until shutdown.
    ///
    /// An error that aborts an iteration (the store is unreachable, the
    /// cursor is unreadable) ends the loop.
    pub async fn run(mut self) -> Result<(), FanoutError> {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            notification_types = self.catalog.len(),
            "NotificationFanout started"
        );

        loop {
            if *self.shutdown_rx.borrow() {
                info!("NotificationFanout received shutdown signal");
                break;
            }

            let report = match self.run_iteration(utc_now()).await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Notification iteration failed");
                    return Err(e);
                }
            };
            if report.seeded {
                info!("Seeded notification cursor, history before now is skipped");
            } else if report.messages_created > 0 || report.obligations_failed > 0 {
                info!(
                    bids = report.bids,
                    auctions = report.auctions,
                    created = report.messages_created,
                    duplicates = report.duplicates_skipped,
                    delivery_failures = report.deliveries_failed,
                    obligation_failures = report.obligations_failed,
                    "Processed notifications"
                );
            } else {
                debug!(
                    bids = report.bids,
                    auctions = report.auctions,
                    duplicates = report.duplicates_skipped,
                    "Processed notifications"
                );
            }

            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("NotificationFanout received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("NotificationFanout shutdown complete");
        Ok(())
    }

    /// Process everything that changed since the cursor, as of `now`.
    pub async fn run_iteration(
        &mut self,
        now: PrimitiveDateTime,
    ) -> Result<IterationReport, FanoutError> {
        let mut report = IterationReport::default();

        let cursor = {
            let mut tx = self.store.begin().await?;
            match tx.cursor(CursorKey::LastProcessedNotifications).await? {
                Some(cursor) => cursor,
                None => {
                    tx.set_cursor(CursorKey::LastProcessedNotifications, to_unix(now))
                        .await?;
                    tx.commit().await?;
                    report.seeded = true;
                    report.cursor_advanced = true;
                    return Ok(report);
                }
            }
        };
        let last = from_unix(cursor)?;
        let window = self.config.ending_soon_window;

        let bids = self.store.settled_bids_since(last).await?;
        let auctions = self
            .store
            .auctions_ending_between(last - window, now + window)
            .await?;
        report.bids = bids.len();
        report.auctions = auctions.len();

        let changes = bids
            .into_iter()
            .map(ChangedEntity::Bid)
            .chain(auctions.into_iter().map(ChangedEntity::Auction));

        for change in changes {
            if let Err(e) = self.process_change(&change, now, &mut report).await {
                error!(
                    auction_id = change.auction_id(),
                    error = %e,
                    "Failed to load notification targets"
                );
                report.obligations_failed += 1;
            }
        }

        if report.obligations_failed == 0 {
            let mut tx = self.store.begin().await?;
            tx.set_cursor(CursorKey::LastProcessedNotifications, to_unix(now))
                .await?;
            tx.commit().await?;
            report.cursor_advanced = true;
        } else {
            warn!(
                failed = report.obligations_failed,
                "Keeping notification cursor, failed obligations will be retried"
            );
        }

        Ok(report)
    }

    /// Expand one change into obligations and handle each of them.
    async fn process_change(
        &mut self,
        change: &ChangedEntity,
        now: PrimitiveDateTime,
        report: &mut IterationReport,
    ) -> Result<(), StoreError> {
        let (auction, bid) = match change {
            ChangedEntity::Bid(bid) => match self.store.auction(bid.auction_id).await? {
                Some(auction) => (auction, Some(bid)),
                None => {
                    warn!(
                        bid_id = bid.id,
                        auction_id = bid.auction_id,
                        "Settled bid references a missing auction"
                    );
                    return Ok(());
                }
            },
            ChangedEntity::Auction(auction) => (auction.clone(), None),
        };

        let followers = self.store.followers(auction.id).await?;
        if followers.is_empty() {
            return Ok(());
        }
        let preferences = self.preference_map(&followers).await?;
        let winning_bid = match auction.winning_bid_id {
            Some(id) => self.store.bid(id).await?,
            None => None,
        };

        let mut obligations: Vec<(NotificationAction, &User, NewMessage)> = Vec::new();
        for resolver in self.catalog.iter() {
            let notification_type = resolver.notification_type();
            for user in &followers {
                let Some(action) = preferences.get(&(user.id, notification_type)) else {
                    continue;
                };
                let ctx = ResolveContext {
                    user,
                    auction: &auction,
                    bid,
                    winning_bid: winning_bid.as_ref(),
                    now,
                };
                if let Some(content) = resolver.resolve(&ctx) {
                    obligations.push((*action, user, content.into()));
                }
            }
        }

        for (action, user, new) in obligations {
            self.handle_obligation(user, new, action, now, report).await;
        }
        Ok(())
    }

    async fn preference_map(
        &self,
        users: &[User],
    ) -> Result<HashMap<(i64, NotificationType), NotificationAction>, StoreError> {
        let ids: Vec<i64> = users.iter().map(|u| u.id).collect();
        Ok(self
            .store
            .notification_preferences(&ids)
            .await?
            .into_iter()
            .map(|p| ((p.user_id, p.notification_type), p.action))
            .collect())
    }

    /// Record and deliver one obligation. Failures stay inside this call.
    async fn handle_obligation(
        &mut self,
        user: &User,
        new: NewMessage,
        action: NotificationAction,
        now: PrimitiveDateTime,
        report: &mut IterationReport,
    ) {
        let message = match self.dedup.record(&new, now).await {
            Ok(DedupOutcome::Inserted(message)) => message,
            Ok(DedupOutcome::AlreadySent) => {
                report.duplicates_skipped += 1;
                return;
            }
            Err(e) => {
                error!(
                    user_id = user.id,
                    key = %new.key,
                    error = %e,
                    "Failed to record notification"
                );
                report.obligations_failed += 1;
                return;
            }
        };
        report.messages_created += 1;

        if !self.executor.execute(user, &message, action).await {
            report.deliveries_failed += 1;
        }
        self.dedup.remember(message.user_id, &message.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{ActionDispatch, DeliveryError, NotificationChannel};
    use crate::entities::auction::Auction;
    use crate::entities::bid::Bid;
    use crate::entities::message::Message;
    use crate::entities::user::UserNotification;
    use crate::store::{MemoryStateStore, StoreTransaction};
    use crate::test_support::{auction, bid, user};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::datetime;

    /// Records every delivery attempt; fails them all when `fail` is set.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(i64, String)>>,
        fail: bool,
    }

    impl RecordingChannel {
        fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        async fn deliver(&self, user: &User, message: &Message) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((user.id, message.key.clone()));
            if self.fail {
                Err(DeliveryError::Rejected {
                    status: 503,
                    body: "unavailable".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn build_fanout(store: Arc<dyn StateStore>, channel: Arc<RecordingChannel>) -> NotificationFanout {
        let (_tx, rx) = watch::channel(false);
        let config = FanoutConfig::default();
        let dispatch = ActionDispatch::new().with_channel(NotificationAction::TwitterDm, channel);
        NotificationFanout::new(
            store.clone(),
            NotificationCatalog::standard(config.ending_soon_window),
            DeliveryExecutor::new(store, dispatch),
            config,
            rx,
        )
    }

    /// Auction 1 ends at noon; users 7 and 8 follow it, user 9 stopped
    /// following. Nobody has preferences yet.
    async fn marketplace(cursor: PrimitiveDateTime) -> MemoryStateStore {
        let store = MemoryStateStore::new();
        store.insert_auction(auction(1, datetime!(2024-05-01 12:00))).await;
        for id in [7, 8, 9] {
            store.insert_user(user(id)).await;
        }
        store.set_following(7, 1, true).await;
        store.set_following(8, 1, true).await;
        store.set_following(9, 1, false).await;
        store
            .put_cursor_raw(
                CursorKey::LastProcessedNotifications,
                to_unix(cursor).to_string(),
            )
            .await;
        store
    }

    async fn prefer(store: &MemoryStateStore, user_ids: &[i64], notification_type: NotificationType) {
        for &user_id in user_ids {
            store
                .set_preference(user_id, notification_type, NotificationAction::TwitterDm)
                .await;
        }
    }

    fn keys(messages: &[Message]) -> Vec<(i64, &str)> {
        messages.iter().map(|m| (m.user_id, m.key.as_str())).collect()
    }

    #[tokio::test]
    async fn test_first_run_seeds_cursor_without_notifying() {
        let store = MemoryStateStore::new();
        store.insert_auction(auction(1, datetime!(2024-05-01 12:00))).await;
        store.insert_user(user(8)).await;
        store.set_following(8, 1, true).await;
        prefer(&store, &[8], NotificationType::AuctionEndingSoon).await;
        let channel = Arc::new(RecordingChannel::default());
        let mut fanout = build_fanout(Arc::new(store.clone()), channel.clone());
        let now = datetime!(2024-05-01 11:55);

        let report = fanout.run_iteration(now).await.unwrap();

        assert!(report.seeded);
        assert_eq!(report.messages_created, 0);
        assert!(store.messages().await.is_empty());
        assert!(channel.sent().is_empty());
        assert_eq!(
            store
                .cursor_value(CursorKey::LastProcessedNotifications)
                .await,
            Some(to_unix(now).to_string())
        );
    }

    #[tokio::test]
    async fn test_ending_soon_creates_exactly_one_message() {
        let store = marketplace(datetime!(2024-05-01 11:40)).await;
        prefer(&store, &[8, 9], NotificationType::AuctionEndingSoon).await;
        let channel = Arc::new(RecordingChannel::default());
        let mut fanout = build_fanout(Arc::new(store.clone()), channel.clone());

        let first = fanout.run_iteration(datetime!(2024-05-01 11:52)).await.unwrap();
        assert_eq!(first.auctions, 1);
        assert_eq!(first.messages_created, 1);
        assert!(first.cursor_advanced);

        let second = fanout.run_iteration(datetime!(2024-05-01 11:53)).await.unwrap();
        assert_eq!(second.messages_created, 0);
        assert_eq!(second.duplicates_skipped, 1);

        // A restarted process has an empty cache and hits the constraint.
        let mut restarted = build_fanout(Arc::new(store.clone()), channel.clone());
        let third = restarted
            .run_iteration(datetime!(2024-05-01 11:54))
            .await
            .unwrap();
        assert_eq!(third.messages_created, 0);
        assert_eq!(third.duplicates_skipped, 1);

        let messages = store.messages().await;
        assert_eq!(keys(&messages), vec![(8, "ending-soon:1")]);
        assert_eq!(messages[0].notified_via, Some(NotificationAction::TwitterDm));
        assert_eq!(channel.sent(), vec![(8, "ending-soon:1".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_kept_and_not_resent() {
        let store = marketplace(datetime!(2024-05-01 11:40)).await;
        prefer(&store, &[8], NotificationType::AuctionEndingSoon).await;
        let channel = Arc::new(RecordingChannel::failing());
        let mut fanout = build_fanout(Arc::new(store.clone()), channel.clone());

        let report = fanout.run_iteration(datetime!(2024-05-01 11:52)).await.unwrap();
        assert_eq!(report.messages_created, 1);
        assert_eq!(report.deliveries_failed, 1);
        assert!(report.cursor_advanced);

        let mut restarted = build_fanout(Arc::new(store.clone()), channel.clone());
        let report = restarted
            .run_iteration(datetime!(2024-05-01 11:53))
            .await
            .unwrap();
        assert_eq!(report.messages_created, 0);

        let messages = store.messages().await;
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].is_delivered());
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_new_bid_notifies_followers_except_bidder() {
        let store = marketplace(datetime!(2024-05-01 11:40)).await;
        prefer(&store, &[7, 8, 9], NotificationType::NewBid).await;
        let mut settled = bid(10, 1, 7, 21_000, "lnbc-bid-10");
        settled.settled_at = Some(datetime!(2024-05-01 11:44));
        store.insert_bid(settled).await;
        let channel = Arc::new(RecordingChannel::default());
        let mut fanout = build_fanout(Arc::new(store.clone()), channel.clone());

        let report = fanout.run_iteration(datetime!(2024-05-01 11:45)).await.unwrap();

        assert_eq!(report.bids, 1);
        assert_eq!(report.auctions, 0);
        assert_eq!(keys(&store.messages().await), vec![(8, "new-bid:10")]);
        assert_eq!(channel.sent(), vec![(8, "new-bid:10".to_string())]);
    }

    #[tokio::test]
    async fn test_follower_without_preference_gets_nothing() {
        let store = marketplace(datetime!(2024-05-01 11:40)).await;
        prefer(&store, &[7], NotificationType::NewBid).await;
        let channel = Arc::new(RecordingChannel::default());
        let mut fanout = build_fanout(Arc::new(store.clone()), channel.clone());

        let report = fanout.run_iteration(datetime!(2024-05-01 11:52)).await.unwrap();

        assert_eq!(report.auctions, 1);
        assert_eq!(report.messages_created, 0);
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_ended_auction_notifies_winner_and_followers() {
        let store = marketplace(datetime!(2024-05-01 12:01)).await;
        let mut winning = bid(10, 1, 7, 90_000, "lnbc-bid-10");
        winning.settled_at = Some(datetime!(2024-05-01 11:30));
        store.insert_bid(winning).await;
        let mut ended: Auction = store.auction(1).await.unwrap().unwrap();
        ended.winning_bid_id = Some(10);
        store.insert_auction(ended).await;
        prefer(&store, &[7, 8], NotificationType::AuctionEnded).await;
        prefer(&store, &[7, 8], NotificationType::AuctionWon).await;
        let channel = Arc::new(RecordingChannel::default());
        let mut fanout = build_fanout(Arc::new(store.clone()), channel.clone());

        let report = fanout.run_iteration(datetime!(2024-05-01 12:02)).await.unwrap();

        assert_eq!(report.messages_created, 3);
        let mut sent = channel.sent();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                (7, "auction-ended:1".to_string()),
                (7, "auction-won:1".to_string()),
                (8, "auction-ended:1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_cursor_moves_to_iteration_start() {
        let store = marketplace(datetime!(2024-05-01 09:00)).await;
        let channel = Arc::new(RecordingChannel::default());
        let mut fanout = build_fanout(Arc::new(store.clone()), channel);
        let now = datetime!(2024-05-01 09:30);

        let report = fanout.run_iteration(now).await.unwrap();

        assert!(report.cursor_advanced);
        assert_eq!(
            store
                .cursor_value(CursorKey::LastProcessedNotifications)
                .await,
            Some(to_unix(now).to_string())
        );
    }

    /// Delegates to a memory store but refuses every message insert.
    struct BrokenInsertStore(MemoryStateStore);

    struct BrokenInsertTransaction(Box<dyn StoreTransaction>);

    fn broken() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl StateStore for BrokenInsertStore {
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
            Ok(Box::new(BrokenInsertTransaction(self.0.begin().await?)))
        }
        async fn settled_bids_since(&self, since: PrimitiveDateTime) -> Result<Vec<Bid>, StoreError> {
            self.0.settled_bids_since(since).await
        }
        async fn auctions_ending_between(
            &self,
            after: PrimitiveDateTime,
            until: PrimitiveDateTime,
        ) -> Result<Vec<Auction>, StoreError> {
            self.0.auctions_ending_between(after, until).await
        }
        async fn auction(&self, id: i64) -> Result<Option<Auction>, StoreError> {
            self.0.auction(id).await
        }
        async fn bid(&self, id: i64) -> Result<Option<Bid>, StoreError> {
            self.0.bid(id).await
        }
        async fn followers(&self, auction_id: i64) -> Result<Vec<User>, StoreError> {
            self.0.followers(auction_id).await
        }
        async fn notification_preferences(
            &self,
            user_ids: &[i64],
        ) -> Result<Vec<UserNotification>, StoreError> {
            self.0.notification_preferences(user_ids).await
        }
        async fn unsettled_bid_payment_requests(&self) -> Result<Vec<String>, StoreError> {
            self.0.unsettled_bid_payment_requests().await
        }
        async fn unsettled_contribution_payment_requests(&self) -> Result<Vec<String>, StoreError> {
            self.0.unsettled_contribution_payment_requests().await
        }
        async fn message(&self, user_id: i64, key: &str) -> Result<Option<Message>, StoreError> {
            self.0.message(user_id, key).await
        }
    }

    #[async_trait]
    impl StoreTransaction for BrokenInsertTransaction {
        async fn cursor(&mut self, key: CursorKey) -> Result<Option<i64>, StoreError> {
            self.0.cursor(key).await
        }
        async fn set_cursor(&mut self, key: CursorKey, value: i64) -> Result<(), StoreError> {
            self.0.set_cursor(key, value).await
        }
        async fn settle_bid(&mut self, pr: &str, at: PrimitiveDateTime) -> Result<Option<Bid>, StoreError> {
            self.0.settle_bid(pr, at).await
        }
        async fn extend_auction_end(
            &mut self,
            auction_id: i64,
            not_before: PrimitiveDateTime,
        ) -> Result<Option<PrimitiveDateTime>, StoreError> {
            self.0.extend_auction_end(auction_id, not_before).await
        }
        async fn settle_contribution(
            &mut self,
            pr: &str,
            at: PrimitiveDateTime,
        ) -> Result<Option<Auction>, StoreError> {
            self.0.settle_contribution(pr, at).await
        }
        async fn top_bid(&mut self, auction_id: i64) -> Result<Option<Bid>, StoreError> {
            self.0.top_bid(auction_id).await
        }
        async fn set_winning_bid(&mut self, auction_id: i64, bid_id: Option<i64>) -> Result<(), StoreError> {
            self.0.set_winning_bid(auction_id, bid_id).await
        }
        async fn insert_message(&mut self, _: &NewMessage, _: PrimitiveDateTime) -> Result<Message, StoreError> {
            Err(broken())
        }
        async fn mark_message_delivered(
            &mut self,
            message_id: i64,
            action: NotificationAction,
        ) -> Result<(), StoreError> {
            self.0.mark_message_delivered(message_id, action).await
        }
        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.0.commit().await
        }
    }

    #[tokio::test]
    async fn test_store_failure_keeps_cursor() {
        let cursor = datetime!(2024-05-01 11:40);
        let store = marketplace(cursor).await;
        prefer(&store, &[8], NotificationType::AuctionEndingSoon).await;
        let channel = Arc::new(RecordingChannel::default());
        let mut fanout = build_fanout(Arc::new(BrokenInsertStore(store.clone())), channel.clone());

        let report = fanout.run_iteration(datetime!(2024-05-01 11:52)).await.unwrap();

        assert_eq!(report.obligations_failed, 1);
        assert!(!report.cursor_advanced);
        assert!(channel.sent().is_empty());
        assert_eq!(
            store
                .cursor_value(CursorKey::LastProcessedNotifications)
                .await,
            Some(to_unix(cursor).to_string())
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = MemoryStateStore::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared: Arc<dyn StateStore> = Arc::new(store.clone());
        let fanout = NotificationFanout::new(
            shared.clone(),
            NotificationCatalog::standard(time::Duration::minutes(10)),
            DeliveryExecutor::new(shared, ActionDispatch::new()),
            FanoutConfig::default(),
            shutdown_rx,
        );
        let handle = tokio::spawn(fanout.run());

        while store
            .cursor_value(CursorKey::LastProcessedNotifications)
            .await
            .is_none()
        {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
    }
}
