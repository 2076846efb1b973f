pub mod auction;
pub mod bid;
pub mod message;
pub mod state;
pub mod user;

use serde::{Deserialize, Serialize};

/// Kinds of notification a user can subscribe to.
///
/// The `sqlx::Type` mapping backs the `notification_type` postgres enum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case", type_name = "notification_type")]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    NewBid,
    AuctionEndingSoon,
    AuctionEnded,
    AuctionWon,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::NewBid => write!(f, "new_bid"),
            NotificationType::AuctionEndingSoon => write!(f, "auction_ending_soon"),
            NotificationType::AuctionEnded => write!(f, "auction_ended"),
            NotificationType::AuctionWon => write!(f, "auction_won"),
        }
    }
}

/// How a notification is delivered to the user.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case", type_name = "notification_action")]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    TwitterDm,
}

impl std::fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationAction::TwitterDm => write!(f, "twitter_dm"),
        }
    }
}

/// Named cursor rows in the `state` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CursorKey {
    /// Settle index of the last settlement event applied by the reconciler.
    LastSettleIndex,
    /// Unix timestamp at which the last completed fanout iteration started.
    LastProcessedNotifications,
}

impl CursorKey {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CursorKey::LastSettleIndex => "LAST_SETTLE_INDEX",
            CursorKey::LastProcessedNotifications => "LAST_PROCESSED_NOTIFICATIONS",
        }
    }
}

impl std::fmt::Display for CursorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
