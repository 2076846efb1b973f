//! Long-running processors.
//!
//! - `SettlementReconciler`: consumes a `PaymentEventSource`, applies each
//!   settlement to bids and auctions, advances `LAST_SETTLE_INDEX`
//! - `NotificationFanout`: polls the store for settled bids and auctions
//!   near their end, records one message per obligation through the
//!   `DedupBarrier`, hands it to the `DeliveryExecutor`
//!
//! The two never share memory; they only meet in the `StateStore`.

pub mod dedup;
pub mod notification_fanout;
pub mod settlement_reconciler;

pub use dedup::{DedupBarrier, DedupOutcome, RecentlySent};
pub use notification_fanout::{FanoutError, IterationReport, NotificationFanout};
pub use settlement_reconciler::{ReconcileError, SettlementOutcome, SettlementReconciler};
