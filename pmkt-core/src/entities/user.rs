use crate::entities::{NotificationAction, NotificationType};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub nym: Option<String>,
    pub twitter_username: Option<String>,
    /// Recipient id for direct messages.
    pub twitter_user_id: Option<String>,
}

impl User {
    /// Name to greet the user with.
    pub fn display_name(&self) -> &str {
        self.nym
            .as_deref()
            .or(self.twitter_username.as_deref())
            .unwrap_or("there")
    }
}

/// Follow relationship between a user and an auction.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserAuction {
    pub user_id: i64,
    pub auction_id: i64,
    pub following: bool,
}

/// A user's opt-in for one notification type, with the way to deliver it.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserNotification {
    pub user_id: i64,
    pub notification_type: NotificationType,
    pub action: NotificationAction,
}

#[derive(Debug, Clone)]
/// Users currently following an auction.
pub struct GetAuctionFollowers {
    pub auction_id: i64,
}

impl Processor<GetAuctionFollowers> for DatabaseProcessor {
    type Output = Vec<User>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetAuctionFollowers")]
    async fn process(&self, query: GetAuctionFollowers) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT u.id, u.nym, u.twitter_username, u.twitter_user_id
            FROM users u
            JOIN user_auctions ua ON ua.user_id = u.id
            WHERE ua.auction_id = $1 AND ua.following = true
            ORDER BY u.id ASC
            "#,
        )
        .bind(query.auction_id)
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
/// Notification preferences of a set of users.
pub struct GetNotificationPreferences {
    pub user_ids: Vec<i64>,
}

impl Processor<GetNotificationPreferences> for DatabaseProcessor {
    type Output = Vec<UserNotification>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetNotificationPreferences")]
    async fn process(
        &self,
        query: GetNotificationPreferences,
    ) -> Result<Vec<UserNotification>, sqlx::Error> {
        if query.user_ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_as::<_, UserNotification>(
            r#"
            SELECT user_id, notification_type, action
            FROM user_notifications
            WHERE user_id = ANY($1)
            "#,
        )
        .bind(&query.user_ids)
        .fetch_all(&self.pool)
        .await
    }
}
