use super::ActionDispatch;
use crate::entities::NotificationAction;
use crate::entities::message::Message;
use crate::entities::user::User;
use crate::store::{StateStore, StoreError};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Makes a single delivery attempt for a recorded message.
///
/// On success the message's `notified_via` is set in its own transaction.
/// On failure the row is left exactly as inserted. There is no retry: a late
/// notification about a live auction is worth little, and the row still
/// blocks the obligation from being recorded again.
pub struct DeliveryExecutor {
    store: Arc<dyn StateStore>,
    dispatch: ActionDispatch,
}

impl DeliveryExecutor {
    pub fn new(store: Arc<dyn StateStore>, dispatch: ActionDispatch) -> Self {
        Self { store, dispatch }
    }

    /// Deliver `message` to `user` through `action`.
    ///
    /// Returns whether the channel accepted the message.
    pub async fn execute(&self, user: &User, message: &Message, action: NotificationAction) -> bool {
        let Some(channel) = self.dispatch.channel(action) else {
            warn!(
                user_id = user.id,
                %action,
                "No channel configured for notification action"
            );
            return false;
        };

        info!(user_id = user.id, %action, key = %message.key, "Executing notification action");

        if let Err(e) = channel.deliver(user, message).await {
            warn!(
                user_id = user.id,
                message_id = message.id,
                %action,
                error = %e,
                "Notification delivery failed"
            );
            return false;
        }

        if let Err(e) = self.record_delivery(message.id, action).await {
            error!(
                user_id = user.id,
                message_id = message.id,
                error = %e,
                "Delivered notification but failed to record it"
            );
        }
        true
    }

    async fn record_delivery(
        &self,
        message_id: i64,
        action: NotificationAction,
    ) -> Result<(), StoreError> {
        let mut tx = self.store.begin().await?;
        tx.mark_message_delivered(message_id, action).await?;
        tx.commit().await
    }
}
