//! Sources of settlement events.
//!
//! A source is subscribed with a resume position (the last applied settle
//! index) and feeds events into a bounded channel from a background task.
//! A source never retries on its own: on a transport failure it sends one
//! `Err` and stops, and the reconciler exits so the process can be
//! restarted from the durable cursor.
//!
//! - [`LndRestSource`]: the node's REST invoice subscription.
//! - [`MockPaymentSource`]: settles every open invoice in the store, for
//!   local development.

mod lnd;
mod mock;

pub use lnd::{LndRestSource, LndStreamDecoder};
pub use mock::MockPaymentSource;

use crate::config::LndConfig;
use crate::events::SettlementEventReceiver;
use crate::store::{StateStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by a settlement event source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The node answered the subscription with an error status.
    #[error("API error: status {status}, body: {body}")]
    Api { status: u16, body: String },

    /// A stream line could not be decoded.
    #[error("stream parsing error: {0}")]
    Parse(String),

    /// The node reported an error inside the stream.
    #[error("stream error {code}: {message}")]
    Stream { code: i64, message: String },

    /// The stream ended. Subscriptions are infinite, so this is a failure.
    #[error("event stream ended")]
    StreamEnded,

    /// Credentials or certificate could not be read.
    #[error("failed to read {what}: {source}")]
    Credentials {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Store error (mock source)
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A resumable, ordered stream of settlement events.
#[async_trait]
pub trait PaymentEventSource: Send + Sync {
    /// Start streaming events that come after `settle_index`.
    async fn subscribe(&self, settle_index: u64) -> Result<SettlementEventReceiver, SourceError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Build the source selected by the configuration.
pub fn build_payment_source(
    config: &LndConfig,
    store: Arc<dyn StateStore>,
) -> Result<Arc<dyn PaymentEventSource>, SourceError> {
    match config {
        LndConfig::Mock { poll_interval } => {
            Ok(Arc::new(MockPaymentSource::new(store, *poll_interval)))
        }
        LndConfig::Rest {
            rest_url,
            macaroon_path,
            tls_cert_path,
        } => {
            let source =
                LndRestSource::from_files(rest_url.clone(), macaroon_path, tls_cert_path.as_deref())?;
            Ok(Arc::new(source))
        }
    }
}
