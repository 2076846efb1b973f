//! Processor tuning.

use std::time::Duration;

/// Settlement reconciler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// A settled bid keeps the auction open for at least this long after
    /// the settlement.
    pub bid_extension: time::Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            bid_extension: time::Duration::minutes(5),
        }
    }
}

/// Notification fanout settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Minimum sleep between two iterations.
    pub interval: Duration,
    /// How far ahead an auction counts as ending soon, and how far behind
    /// the cursor ended auctions are still picked up.
    pub ending_soon_window: time::Duration,
    /// Capacity of the in-memory recently-sent cache.
    pub recently_sent_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            ending_soon_window: time::Duration::minutes(10),
            recently_sent_capacity: 10_000,
        }
    }
}
