//! Settlement event channel.

use super::types::SettlementEvent;
use crate::payment_source::SourceError;
use tokio::sync::mpsc;

/// Default buffer size for event channels.
///
/// This provides enough buffer to handle bursts while keeping memory bounded.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Sender handle for settlement events. An `Err` item ends the stream.
pub type SettlementEventSender = mpsc::Sender<Result<SettlementEvent, SourceError>>;
/// Receiver handle for settlement events.
pub type SettlementEventReceiver = mpsc::Receiver<Result<SettlementEvent, SourceError>>;

/// Create a new settlement event channel.
pub fn settlement_event_channel() -> (SettlementEventSender, SettlementEventReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}
