//! Delivery of recorded messages to external channels.
//!
//! [`ActionDispatch`] is the configured mapping from a user's chosen
//! [`NotificationAction`] to the channel that carries it.
//! [`DeliveryExecutor`] makes one delivery attempt per message and records
//! the outcome on the message row.

mod executor;
mod twitter;

pub use executor::DeliveryExecutor;
pub use twitter::{MockDmChannel, TwitterCredentials, TwitterDmChannel};

use crate::config::TwitterConfig;
use crate::entities::NotificationAction;
use crate::entities::message::Message;
use crate::entities::user::User;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The channel rejected the message.
    #[error("delivery failed with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The user has no address on this channel.
    #[error("user {user_id} has no recipient id for this channel")]
    MissingRecipient { user_id: i64 },

    /// Secrets could not be loaded.
    #[error("invalid credentials: {0}")]
    Credentials(String),

    /// The endpoint URL could not be built.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// An external channel that can carry a message to a user.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn deliver(&self, user: &User, message: &Message) -> Result<(), DeliveryError>;
}

/// Mapping from notification action to the channel that carries it.
#[derive(Clone, Default)]
pub struct ActionDispatch {
    channels: HashMap<NotificationAction, Arc<dyn NotificationChannel>>,
}

impl ActionDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(
        mut self,
        action: NotificationAction,
        channel: Arc<dyn NotificationChannel>,
    ) -> Self {
        self.channels.insert(action, channel);
        self
    }

    pub fn channel(&self, action: NotificationAction) -> Option<&Arc<dyn NotificationChannel>> {
        self.channels.get(&action)
    }

    /// Build the dispatch table selected by the configuration.
    pub fn from_config(twitter: &TwitterConfig) -> Result<Self, DeliveryError> {
        let dm: Arc<dyn NotificationChannel> = match twitter {
            TwitterConfig::Mock => Arc::new(MockDmChannel),
            TwitterConfig::Api {
                api_base_url,
                secrets_path,
            } => Arc::new(TwitterDmChannel::from_secrets_file(
                api_base_url.clone(),
                secrets_path,
            )?),
        };
        Ok(Self::new().with_channel(NotificationAction::TwitterDm, dm))
    }
}

impl std::fmt::Debug for ActionDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.channels.keys()).finish()
    }
}
