use crate::entities::NotificationAction;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use time::PrimitiveDateTime;

/// Durable record of a notification obligation.
///
/// `(user_id, key)` is unique; the row is the dedup record and stays even
/// when delivery fails.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub body: String,
    pub created_at: PrimitiveDateTime,
    /// Set only once delivery through this action was confirmed.
    pub notified_via: Option<NotificationAction>,
}

impl Message {
    pub fn is_delivered(&self) -> bool {
        self.notified_via.is_some()
    }
}

/// Data for inserting a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub user_id: i64,
    pub key: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct GetMessage {
    pub user_id: i64,
    pub key: String,
}

impl Processor<GetMessage> for DatabaseProcessor {
    type Output = Option<Message>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetMessage")]
    async fn process(&self, query: GetMessage) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT id, user_id, key, body, created_at, notified_via
            FROM messages
            WHERE user_id = $1 AND key = $2
            "#,
        )
        .bind(query.user_id)
        .bind(&query.key)
        .fetch_optional(&self.pool)
        .await
    }
}

impl Message {
    /// Insert a pending message.
    ///
    /// A duplicate `(user_id, key)` fails with a unique violation, which
    /// aborts the transaction.
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        new: &NewMessage,
        created_at: PrimitiveDateTime,
    ) -> Result<Message, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (user_id, key, body, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, key, body, created_at, notified_via
            "#,
        )
        .bind(new.user_id)
        .bind(&new.key)
        .bind(&new.body)
        .bind(created_at)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn mark_notified_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        message_id: i64,
        action: NotificationAction,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE messages SET notified_via = $2 WHERE id = $1")
            .bind(message_id)
            .bind(action)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}
