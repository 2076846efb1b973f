//! Exactly-once recording of notification obligations.
//!
//! The `(user_id, key)` uniqueness constraint on messages is the only
//! authority. [`RecentlySent`] is a bounded cache in front of it that saves a
//! round trip for obligations seen earlier in this process; it starts empty
//! on every start and losing it costs nothing but extra conflicts.

use crate::entities::message::{Message, NewMessage};
use crate::store::{StateStore, StoreError};
use moka::sync::Cache;
use std::sync::Arc;
use time::PrimitiveDateTime;
use tracing::{debug, info};

/// Size-bounded cache of `(user_id, key)` pairs.
#[derive(Debug, Clone)]
pub struct RecentlySent {
    entries: Cache<(i64, String), ()>,
}

impl RecentlySent {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity as u64).build(),
        }
    }

    pub fn contains(&self, user_id: i64, key: &str) -> bool {
        self.entries.contains_key(&(user_id, key.to_string()))
    }

    /// Insert a pair. Eviction keeps the cache within its capacity.
    pub fn insert(&self, user_id: i64, key: &str) {
        self.entries.insert((user_id, key.to_string()), ());
    }

    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        usize::try_from(self.entries.entry_count()).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of trying to record an obligation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// The message row was created and committed; deliver it.
    Inserted(Message),
    /// A message for this `(user_id, key)` already exists.
    AlreadySent,
}

/// Gate in front of message delivery.
pub struct DedupBarrier {
    store: Arc<dyn StateStore>,
    recently_sent: RecentlySent,
}

impl DedupBarrier {
    pub fn new(store: Arc<dyn StateStore>, capacity: usize) -> Self {
        Self {
            store,
            recently_sent: RecentlySent::new(capacity),
        }
    }

    /// Record `new` as a pending message in its own transaction.
    ///
    /// A conflict on the uniqueness constraint is not an error: the
    /// obligation was recorded by an earlier iteration or process.
    pub async fn record(
        &mut self,
        new: &NewMessage,
        at: PrimitiveDateTime,
    ) -> Result<DedupOutcome, StoreError> {
        if self.recently_sent.contains(new.user_id, &new.key) {
            debug!(user_id = new.user_id, key = %new.key, "Skipping recently sent message");
            return Ok(DedupOutcome::AlreadySent);
        }

        let mut tx = self.store.begin().await?;
        match tx.insert_message(new, at).await {
            Ok(message) => {
                tx.commit().await?;
                Ok(DedupOutcome::Inserted(message))
            }
            Err(e) if e.is_conflict() => {
                drop(tx);
                info!(
                    user_id = new.user_id,
                    key = %new.key,
                    "Message already recorded, skipping"
                );
                self.recently_sent.insert(new.user_id, &new.key);
                Ok(DedupOutcome::AlreadySent)
            }
            Err(e) => Err(e),
        }
    }

    /// Note that a delivery attempt was made for this pair.
    pub fn remember(&mut self, user_id: i64, key: &str) {
        self.recently_sent.insert(user_id, key);
    }

    pub fn recently_sent(&self) -> &RecentlySent {
        &self.recently_sent
    }
}
