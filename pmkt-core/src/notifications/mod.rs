//! Notification content resolution.
//!
//! Each supported [`NotificationType`] has a [`NotificationResolver`]: a
//! pure function from the user, the auction and the optional bid that
//! triggered processing to the message that user should receive, or `None`
//! when the type does not apply to this change. The fanout only walks the
//! [`NotificationCatalog`]; adding a type means adding a resolver to it.
//!
//! Message keys are deterministic so the same obligation always produces
//! the same `(user_id, key)` pair, which the dedup barrier relies on.

mod resolvers;

pub use resolvers::{AuctionEndedResolver, AuctionWonResolver, EndingSoonResolver, NewBidResolver};

use crate::entities::NotificationType;
use crate::entities::auction::Auction;
use crate::entities::bid::Bid;
use crate::entities::message::NewMessage;
use crate::entities::user::User;
use std::sync::Arc;
use time::PrimitiveDateTime;

/// Everything a resolver may look at.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub user: &'a User,
    pub auction: &'a Auction,
    /// Set when processing was triggered by a settled bid.
    pub bid: Option<&'a Bid>,
    /// The auction's winning bid, once it has been decided.
    pub winning_bid: Option<&'a Bid>,
    /// Start time of the fanout iteration.
    pub now: PrimitiveDateTime,
}

/// Resolved message for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub key: String,
    pub user_id: i64,
    pub body: String,
}

impl From<MessageContent> for NewMessage {
    fn from(content: MessageContent) -> Self {
        NewMessage {
            user_id: content.user_id,
            key: content.key,
            body: content.body,
        }
    }
}

/// Computes the message for one notification type.
pub trait NotificationResolver: Send + Sync {
    fn notification_type(&self) -> NotificationType;

    /// `None` means this type does not apply to the change.
    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<MessageContent>;
}

/// The set of notification types the fanout processes, in order.
#[derive(Clone)]
pub struct NotificationCatalog {
    resolvers: Vec<Arc<dyn NotificationResolver>>,
}

impl NotificationCatalog {
    pub fn new(resolvers: Vec<Arc<dyn NotificationResolver>>) -> Self {
        Self { resolvers }
    }

    /// All built-in notification types.
    ///
    /// `ending_soon_window` must match the fanout's lookahead, otherwise
    /// auctions get selected that the resolver then ignores.
    pub fn standard(ending_soon_window: time::Duration) -> Self {
        Self::new(vec![
            Arc::new(NewBidResolver),
            Arc::new(EndingSoonResolver::new(ending_soon_window)),
            Arc::new(AuctionEndedResolver),
            Arc::new(AuctionWonResolver),
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn NotificationResolver> {
        self.resolvers.iter().map(|r| r.as_ref())
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl std::fmt::Debug for NotificationCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.resolvers.iter().map(|r| r.notification_type()))
            .finish()
    }
}
