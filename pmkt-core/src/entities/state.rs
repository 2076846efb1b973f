//! Named key/value rows holding the processors' resume cursors.
//!
//! Values are string-encoded integers: the settle index for
//! `LAST_SETTLE_INDEX` and a unix timestamp for
//! `LAST_PROCESSED_NOTIFICATIONS`.

use crate::entities::CursorKey;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StateRow {
    pub key: String,
    pub value: String,
}

impl StateRow {
    /// Read a cursor row and lock it until the transaction ends.
    pub async fn get_for_update_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        key: CursorKey,
    ) -> Result<Option<StateRow>, sqlx::Error> {
        sqlx::query_as::<_, StateRow>("SELECT key, value FROM state WHERE key = $1 FOR UPDATE")
            .bind(key.as_str())
            .fetch_optional(&mut **tx)
            .await
    }

    /// Write a cursor value, creating the row if needed.
    ///
    /// An existing row is only updated when the new value is larger.
    pub async fn advance_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        key: CursorKey,
        value: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO state (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value
            WHERE state.value::bigint < EXCLUDED.value::bigint
            "#,
        )
        .bind(key.as_str())
        .bind(value.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}
