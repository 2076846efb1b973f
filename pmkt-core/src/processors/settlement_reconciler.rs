//! SettlementReconciler processor.
//!
//! The SettlementReconciler is responsible for:
//! - Subscribing to the payment source from the persisted `LAST_SETTLE_INDEX`
//! - Matching each settled payment request to an unsettled bid, else to an
//!   unsettled auction contribution
//! - Extending the auction on a settled bid, picking the winning bid on a
//!   settled contribution
//! - Advancing the cursor in the same transaction as the change it guards
//!
//! Matching uses the unsettled predicate, so replaying an event after a
//! crash finds nothing to settle and changes nothing.

use crate::config::ReconcilerConfig;
use crate::entities::CursorKey;
use crate::events::SettlementEvent;
use crate::payment_source::{PaymentEventSource, SourceError};
use crate::store::{StateStore, StoreError};
use crate::utils::clock::utc_now;
use std::sync::Arc;
use thiserror::Error;
use time::PrimitiveDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Errors that stop the reconciler.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Source error
    #[error("payment source error: {0}")]
    Source(#[from] SourceError),

    /// The source closed its channel.
    #[error("payment source closed the event stream")]
    SourceClosed,

    /// A settle index that does not fit the cursor column.
    #[error("settle index {0} out of range")]
    IndexOutOfRange(u64),
}

/// What applying one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// A bid was settled and its auction's end date is now `end_date`.
    BidSettled {
        bid_id: i64,
        auction_id: i64,
        end_date: Option<PrimitiveDateTime>,
    },
    /// An auction contribution was settled and the winner decided.
    ContributionSettled {
        auction_id: i64,
        winning_bid_id: Option<i64>,
    },
    /// Nothing in the marketplace owns this payment request.
    Unmatched,
    /// The event is at or below the cursor.
    Stale { cursor: i64 },
    /// Not a settlement.
    NotSettled,
}

pub struct SettlementReconciler {
    store: Arc<dyn StateStore>,
    source: Arc<dyn PaymentEventSource>,
    config: ReconcilerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl SettlementReconciler {
    /// Create a new SettlementReconciler.
    ///
    /// # Arguments
    ///
    /// * `store` - Shared state store
    /// * `source` - Settlement event source
    /// * `config` - Grace window for late bids
    /// * `shutdown_rx` - Receiver for shutdown signal
    pub fn new(
        store: Arc<dyn StateStore>,
        source: Arc<dyn PaymentEventSource>,
        config: ReconcilerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            source,
            config,
            shutdown_rx,
        }
    }

    /// Run until shutdown.
    ///
    /// Returns an error when the source fails or ends; the caller is
    /// expected to exit and be restarted, resuming from the cursor.
    pub async fn run(mut self) -> Result<(), ReconcileError> {
        let cursor = self.current_cursor().await?;
        let resume_from = u64::try_from(cursor).map_err(|_| StoreError::CorruptCursor {
            key: CursorKey::LastSettleIndex,
            value: cursor.to_string(),
        })?;
        let mut events = self.source.subscribe(resume_from).await?;
        info!(
            source = self.source.name(),
            settle_index = resume_from,
            "SettlementReconciler started"
        );

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("SettlementReconciler received shutdown signal");
                        break;
                    }
                }

                received = events.recv() => {
                    match received {
                        Some(Ok(event)) => {
                            if let Err(e) = self.apply(&event, utc_now()).await {
                                error!(
                                    payment_request = %event.payment_request,
                                    settle_index = event.settle_index,
                                    error = %e,
                                    "Failed to apply settlement"
                                );
                                return Err(e);
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Payment source failed");
                            return Err(e.into());
                        }
                        None => {
                            error!("Payment source closed the event stream");
                            return Err(ReconcileError::SourceClosed);
                        }
                    }
                }
            }
        }

        info!("SettlementReconciler shutdown complete");
        Ok(())
    }

    async fn current_cursor(&self) -> Result<i64, StoreError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.cursor(CursorKey::LastSettleIndex).await?.unwrap_or(0))
    }

    /// Apply one event in a single transaction.
    pub async fn apply(
        &self,
        event: &SettlementEvent,
        now: PrimitiveDateTime,
    ) -> Result<SettlementOutcome, ReconcileError> {
        if !event.is_settled() {
            debug!(
                payment_request = %event.payment_request,
                state = ?event.state,
                "Ignoring non-settled invoice update"
            );
            return Ok(SettlementOutcome::NotSettled);
        }
        let settle_index = i64::try_from(event.settle_index)
            .map_err(|_| ReconcileError::IndexOutOfRange(event.settle_index))?;

        let mut tx = self.store.begin().await?;

        let cursor = tx.cursor(CursorKey::LastSettleIndex).await?.unwrap_or(0);
        if settle_index <= cursor {
            debug!(settle_index, cursor, "Skipping already applied settlement");
            return Ok(SettlementOutcome::Stale { cursor });
        }

        let outcome = if let Some(bid) = tx.settle_bid(&event.payment_request, now).await? {
            let end_date = tx
                .extend_auction_end(bid.auction_id, now + self.config.bid_extension)
                .await?;
            SettlementOutcome::BidSettled {
                bid_id: bid.id,
                auction_id: bid.auction_id,
                end_date,
            }
        } else if let Some(auction) = tx
            .settle_contribution(&event.payment_request, now)
            .await?
        {
            let winning_bid_id = tx.top_bid(auction.id).await?.map(|bid| bid.id);
            tx.set_winning_bid(auction.id, winning_bid_id).await?;
            SettlementOutcome::ContributionSettled {
                auction_id: auction.id,
                winning_bid_id,
            }
        } else {
            SettlementOutcome::Unmatched
        };

        tx.set_cursor(CursorKey::LastSettleIndex, settle_index)
            .await?;
        tx.commit().await?;

        match &outcome {
            SettlementOutcome::BidSettled {
                bid_id,
                auction_id,
                end_date,
            } => info!(
                bid_id,
                auction_id,
                end_date = ?end_date,
                settle_index,
                "Settled bid"
            ),
            SettlementOutcome::ContributionSettled {
                auction_id,
                winning_bid_id,
            } => info!(
                auction_id,
                winning_bid_id = ?winning_bid_id,
                settle_index,
                "Settled auction contribution"
            ),
            _ => info!(
                payment_request = %event.payment_request,
                settle_index,
                "Settlement matches no bid or contribution"
            ),
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InvoiceState, SettlementEventReceiver, settlement_event_channel};
    use crate::store::MemoryStateStore;
    use crate::test_support::{auction, bid};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::datetime;

    /// Emits a fixed list of items, then closes.
    struct ScriptedSource {
        items: Mutex<Vec<Result<SettlementEvent, SourceError>>>,
        subscribed_from: Mutex<Option<u64>>,
    }

    impl ScriptedSource {
        fn new(events: Vec<SettlementEvent>) -> Self {
            Self::with_items(events.into_iter().map(Ok).collect())
        }

        fn with_items(items: Vec<Result<SettlementEvent, SourceError>>) -> Self {
            Self {
                items: Mutex::new(items),
                subscribed_from: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl PaymentEventSource for ScriptedSource {
        async fn subscribe(&self, settle_index: u64) -> Result<SettlementEventReceiver, SourceError> {
            *self.subscribed_from.lock().unwrap() = Some(settle_index);
            let items = std::mem::take(&mut *self.items.lock().unwrap());
            let (tx, rx) = settlement_event_channel();
            for item in items {
                tx.send(item).await.unwrap();
            }
            Ok(rx)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn reconciler(store: &MemoryStateStore, events: Vec<SettlementEvent>) -> SettlementReconciler {
        let (_tx, rx) = watch::channel(false);
        SettlementReconciler::new(
            Arc::new(store.clone()),
            Arc::new(ScriptedSource::new(events)),
            ReconcilerConfig::default(),
            rx,
        )
    }

    async fn seeded_store() -> MemoryStateStore {
        let store = MemoryStateStore::new();
        store.insert_auction(auction(1, datetime!(2024-05-01 12:00))).await;
        store.insert_bid(bid(10, 1, 7, 5_000, "lnbc-bid-10")).await;
        store
    }

    #[tokio::test]
    async fn test_late_bid_extends_auction_by_grace_window() {
        let store = seeded_store().await;
        let reconciler = reconciler(&store, vec![]);
        let now = datetime!(2024-05-01 11:58);

        let outcome = reconciler
            .apply(&SettlementEvent::settled("lnbc-bid-10", 1), now)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SettlementOutcome::BidSettled {
                bid_id: 10,
                auction_id: 1,
                end_date: Some(datetime!(2024-05-01 12:03)),
            }
        );
        let a = store.auction(1).await.unwrap().unwrap();
        assert_eq!(a.end_date, datetime!(2024-05-01 12:03));
        assert_eq!(a.duration_hours, 24);
        assert!(a.was_extended());
        assert_eq!(store.bid(10).await.unwrap().unwrap().settled_at, Some(now));
        assert_eq!(
            store.cursor_value(CursorKey::LastSettleIndex).await.as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_early_bid_never_shortens_auction() {
        let store = seeded_store().await;
        let reconciler = reconciler(&store, vec![]);

        reconciler
            .apply(
                &SettlementEvent::settled("lnbc-bid-10", 1),
                datetime!(2024-05-01 09:00),
            )
            .await
            .unwrap();

        let a = store.auction(1).await.unwrap().unwrap();
        assert_eq!(a.end_date, datetime!(2024-05-01 12:00));
        assert!(!a.was_extended());
    }

    #[tokio::test]
    async fn test_replay_after_crash_is_idempotent() {
        let store = seeded_store().await;
        let reconciler = reconciler(&store, vec![]);
        let event = SettlementEvent::settled("lnbc-bid-10", 5);

        reconciler
            .apply(&event, datetime!(2024-05-01 11:58))
            .await
            .unwrap();
        let auction_after_first = store.auction(1).await.unwrap();
        let bid_after_first = store.bid(10).await.unwrap();

        // Same index again is stale.
        let outcome = reconciler
            .apply(&event, datetime!(2024-05-01 11:59))
            .await
            .unwrap();
        assert_eq!(outcome, SettlementOutcome::Stale { cursor: 5 });

        // A restarted source may renumber; the settled bid no longer matches.
        let outcome = reconciler
            .apply(
                &SettlementEvent::settled("lnbc-bid-10", 6),
                datetime!(2024-05-01 11:59),
            )
            .await
            .unwrap();
        assert_eq!(outcome, SettlementOutcome::Unmatched);

        assert_eq!(store.auction(1).await.unwrap(), auction_after_first);
        assert_eq!(store.bid(10).await.unwrap(), bid_after_first);
    }

    #[tokio::test]
    async fn test_unmatched_event_still_advances_cursor() {
        let store = seeded_store().await;
        let reconciler = reconciler(&store, vec![]);

        let outcome = reconciler
            .apply(
                &SettlementEvent::settled("lnbc-someone-else", 3),
                datetime!(2024-05-01 11:00),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SettlementOutcome::Unmatched);
        assert_eq!(
            store.cursor_value(CursorKey::LastSettleIndex).await.as_deref(),
            Some("3")
        );
        assert_eq!(store.bid(10).await.unwrap().unwrap().settled_at, None);
        assert_eq!(
            store.auction(1).await.unwrap().unwrap().end_date,
            datetime!(2024-05-01 12:00)
        );
    }

    #[tokio::test]
    async fn test_event_below_cursor_is_skipped() {
        let store = seeded_store().await;
        store.put_cursor_raw(CursorKey::LastSettleIndex, "20").await;
        let reconciler = reconciler(&store, vec![]);

        let outcome = reconciler
            .apply(
                &SettlementEvent::settled("lnbc-bid-10", 12),
                datetime!(2024-05-01 11:00),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SettlementOutcome::Stale { cursor: 20 });
        assert_eq!(store.bid(10).await.unwrap().unwrap().settled_at, None);
    }

    #[tokio::test]
    async fn test_open_invoice_is_ignored() {
        let store = seeded_store().await;
        let reconciler = reconciler(&store, vec![]);
        let event = SettlementEvent {
            payment_request: "lnbc-bid-10".to_string(),
            state: InvoiceState::Open,
            settle_index: 0,
        };

        let outcome = reconciler
            .apply(&event, datetime!(2024-05-01 11:00))
            .await
            .unwrap();

        assert_eq!(outcome, SettlementOutcome::NotSettled);
        assert_eq!(store.cursor_value(CursorKey::LastSettleIndex).await, None);
    }

    #[tokio::test]
    async fn test_contribution_picks_top_bid_as_winner() {
        let store = seeded_store().await;
        store.insert_bid(bid(11, 1, 8, 9_000, "lnbc-bid-11")).await;
        store.insert_bid(bid(12, 1, 9, 50_000, "lnbc-bid-12")).await;
        let reconciler = reconciler(&store, vec![]);

        reconciler
            .apply(
                &SettlementEvent::settled("lnbc-bid-10", 1),
                datetime!(2024-05-01 10:00),
            )
            .await
            .unwrap();
        reconciler
            .apply(
                &SettlementEvent::settled("lnbc-bid-11", 2),
                datetime!(2024-05-01 10:01),
            )
            .await
            .unwrap();

        // Bid 12 is the largest but never settled.
        let outcome = reconciler
            .apply(
                &SettlementEvent::settled("lnbc-contribution-1", 3),
                datetime!(2024-05-01 12:30),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SettlementOutcome::ContributionSettled {
                auction_id: 1,
                winning_bid_id: Some(11),
            }
        );
        let a = store.auction(1).await.unwrap().unwrap();
        assert_eq!(a.winning_bid_id, Some(11));
        assert_eq!(a.contribution_settled_at, Some(datetime!(2024-05-01 12:30)));
    }

    #[tokio::test]
    async fn test_run_resumes_from_cursor_and_fails_when_source_ends() {
        let store = seeded_store().await;
        store.put_cursor_raw(CursorKey::LastSettleIndex, "4").await;
        let source = Arc::new(ScriptedSource::new(vec![
            SettlementEvent::settled("lnbc-bid-10", 4),
            SettlementEvent::settled("lnbc-bid-10", 5),
        ]));
        let (_tx, rx) = watch::channel(false);
        let reconciler = SettlementReconciler::new(
            Arc::new(store.clone()),
            source.clone(),
            ReconcilerConfig::default(),
            rx,
        );

        let result = reconciler.run().await;

        assert!(matches!(result, Err(ReconcileError::SourceClosed)));
        assert_eq!(*source.subscribed_from.lock().unwrap(), Some(4));
        assert!(store.bid(10).await.unwrap().unwrap().is_settled());
        assert_eq!(
            store.cursor_value(CursorKey::LastSettleIndex).await.as_deref(),
            Some("5")
        );
    }

    #[tokio::test]
    async fn test_run_fails_on_source_error_after_applying_earlier_events() {
        let store = seeded_store().await;
        let source = Arc::new(ScriptedSource::with_items(vec![
            Ok(SettlementEvent::settled("lnbc-bid-10", 1)),
            Err(SourceError::StreamEnded),
        ]));
        let (_tx, rx) = watch::channel(false);
        let reconciler = SettlementReconciler::new(
            Arc::new(store.clone()),
            source.clone(),
            ReconcilerConfig::default(),
            rx,
        );

        let result = reconciler.run().await;

        assert!(matches!(
            result,
            Err(ReconcileError::Source(SourceError::StreamEnded))
        ));
        assert_eq!(*source.subscribed_from.lock().unwrap(), Some(0));
        assert!(store.bid(10).await.unwrap().unwrap().is_settled());
        assert_eq!(
            store.cursor_value(CursorKey::LastSettleIndex).await.as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_run_rejects_negative_cursor() {
        let store = seeded_store().await;
        store.put_cursor_raw(CursorKey::LastSettleIndex, "-3").await;
        let source = Arc::new(ScriptedSource::new(vec![SettlementEvent::settled(
            "lnbc-bid-10",
            1,
        )]));
        let (_tx, rx) = watch::channel(false);
        let reconciler = SettlementReconciler::new(
            Arc::new(store.clone()),
            source.clone(),
            ReconcilerConfig::default(),
            rx,
        );

        let result = reconciler.run().await;

        match result {
            Err(ReconcileError::Store(StoreError::CorruptCursor { key, value })) => {
                assert_eq!(key, CursorKey::LastSettleIndex);
                assert_eq!(value, "-3");
            }
            other => panic!("expected corrupt cursor, got {other:?}"),
        }
        assert_eq!(*source.subscribed_from.lock().unwrap(), None);
        assert!(!store.bid(10).await.unwrap().unwrap().is_settled());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = seeded_store().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, event_rx) = settlement_event_channel();

        struct HeldSource(Mutex<Option<SettlementEventReceiver>>);

        #[async_trait]
        impl PaymentEventSource for HeldSource {
            async fn subscribe(&self, _: u64) -> Result<SettlementEventReceiver, SourceError> {
                Ok(self.0.lock().unwrap().take().unwrap())
            }

            fn name(&self) -> &'static str {
                "held"
            }
        }

        let reconciler = SettlementReconciler::new(
            Arc::new(store.clone()),
            Arc::new(HeldSource(Mutex::new(Some(event_rx)))),
            ReconcilerConfig::default(),
            shutdown_rx,
        );
        let handle = tokio::spawn(reconciler.run());

        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
        drop(event_tx);
    }
}
