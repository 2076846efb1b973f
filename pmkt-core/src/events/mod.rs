//! Event types flowing through the two processors.
//!
//! Settlement events come from the payment network through a bounded
//! channel fed by a [`PaymentEventSource`](crate::payment_source::PaymentEventSource).
//! Changed entities are what the fanout selects from the store on each
//! iteration; they never travel over a channel.

pub mod channels;
pub mod types;

pub use channels::{
    DEFAULT_CHANNEL_BUFFER, SettlementEventReceiver, SettlementEventSender,
    settlement_event_channel,
};
pub use types::{ChangedEntity, InvoiceState, SettlementEvent};
