use super::{PaymentEventSource, SourceError};
use crate::events::{
    SettlementEvent, SettlementEventReceiver, SettlementEventSender, settlement_event_channel,
};
use crate::store::StateStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Development source that pretends every invoice gets paid.
///
/// Every `poll_interval` it reads the open bid and contribution payment
/// requests from the store and emits a settled event for each, numbering
/// them from the resume position. An invoice that is still open on the next
/// poll (because the reconciler has not caught up) is emitted again; the
/// reconciler treats that as a no-op.
pub struct MockPaymentSource {
    store: Arc<dyn StateStore>,
    poll_interval: Duration,
}

impl MockPaymentSource {
    pub fn new(store: Arc<dyn StateStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    async fn produce(
        store: Arc<dyn StateStore>,
        poll_interval: Duration,
        mut settle_index: u64,
        tx: SettlementEventSender,
    ) {
        loop {
            tokio::time::sleep(poll_interval).await;

            let requests = match Self::open_requests(store.as_ref()).await {
                Ok(requests) => requests,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            for payment_request in requests {
                settle_index += 1;
                debug!(%payment_request, settle_index, "Mock settling invoice");
                if tx
                    .send(Ok(SettlementEvent::settled(payment_request, settle_index)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    async fn open_requests(store: &dyn StateStore) -> Result<Vec<String>, SourceError> {
        let mut requests = store.unsettled_bid_payment_requests().await?;
        requests.extend(store.unsettled_contribution_payment_requests().await?);
        Ok(requests)
    }
}

#[async_trait]
impl PaymentEventSource for MockPaymentSource {
    async fn subscribe(&self, settle_index: u64) -> Result<SettlementEventReceiver, SourceError> {
        info!(settle_index, "Subscribing to mock invoices");
        let (tx, rx) = settlement_event_channel();
        tokio::spawn(Self::produce(
            self.store.clone(),
            self.poll_interval,
            settle_index,
            tx,
        ));
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
