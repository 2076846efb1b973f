use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use time::PrimitiveDateTime;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Auction {
    pub id: i64,
    pub seller_id: i64,
    pub key: String,
    pub title: String,
    pub start_date: PrimitiveDateTime,
    /// Duration the seller asked for. Late bids move `end_date` but never
    /// this field, so the two can be compared to tell if the auction was
    /// extended.
    pub duration_hours: i32,
    pub end_date: PrimitiveDateTime,
    pub starting_bid: i64,
    pub reserve_bid: i64,
    pub contribution_amount: i64,
    pub contribution_payment_request: Option<String>,
    pub contribution_settled_at: Option<PrimitiveDateTime>,
    pub winning_bid_id: Option<i64>,
    pub created_at: PrimitiveDateTime,
}

impl Auction {
    /// End date as scheduled when the auction started.
    pub fn scheduled_end(&self) -> PrimitiveDateTime {
        self.start_date + time::Duration::hours(i64::from(self.duration_hours))
    }

    /// Whether late bids pushed the end date past the scheduled end.
    pub fn was_extended(&self) -> bool {
        self.end_date > self.scheduled_end()
    }

    pub fn has_ended(&self, now: PrimitiveDateTime) -> bool {
        self.end_date <= now
    }
}

const AUCTION_COLUMNS: &str = "id, seller_id, key, title, start_date, duration_hours, end_date, \
    starting_bid, reserve_bid, contribution_amount, contribution_payment_request, \
    contribution_settled_at, winning_bid_id, created_at";

#[derive(Debug, Clone)]
/// Get a single auction by id.
pub struct GetAuction {
    pub id: i64,
}

impl Processor<GetAuction> for DatabaseProcessor {
    type Output = Option<Auction>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetAuction")]
    async fn process(&self, query: GetAuction) -> Result<Option<Auction>, sqlx::Error> {
        let sql = format!("SELECT {AUCTION_COLUMNS} FROM auctions WHERE id = $1");
        sqlx::query_as::<_, Auction>(&sql)
            .bind(query.id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Auctions whose end date lies in `(after, until]`.
pub struct GetAuctionsEndingBetween {
    pub after: PrimitiveDateTime,
    pub until: PrimitiveDateTime,
}

impl Processor<GetAuctionsEndingBetween> for DatabaseProcessor {
    type Output = Vec<Auction>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetAuctionsEndingBetween")]
    async fn process(&self, query: GetAuctionsEndingBetween) -> Result<Vec<Auction>, sqlx::Error> {
        let sql = format!(
            "SELECT {AUCTION_COLUMNS} FROM auctions \
             WHERE end_date > $1 AND end_date <= $2 \
             ORDER BY end_date ASC"
        );
        sqlx::query_as::<_, Auction>(&sql)
            .bind(query.after)
            .bind(query.until)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Contribution payment requests that have not been paid yet.
pub struct GetUnsettledContributionRequests;

impl Processor<GetUnsettledContributionRequests> for DatabaseProcessor {
    type Output = Vec<String>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetUnsettledContributionRequests")]
    async fn process(
        &self,
        _query: GetUnsettledContributionRequests,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT contribution_payment_request
            FROM auctions
            WHERE contribution_settled_at IS NULL
              AND contribution_payment_request IS NOT NULL
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }
}

impl Auction {
    /// Mark the contribution identified by `payment_request` as settled.
    ///
    /// Only matches a contribution that is still unsettled, so replaying the
    /// same settlement returns `None`.
    pub async fn settle_contribution_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        payment_request: &str,
        settled_at: PrimitiveDateTime,
    ) -> Result<Option<Auction>, sqlx::Error> {
        let sql = format!(
            "UPDATE auctions SET contribution_settled_at = $2 \
             WHERE contribution_payment_request = $1 AND contribution_settled_at IS NULL \
             RETURNING {AUCTION_COLUMNS}"
        );
        sqlx::query_as::<_, Auction>(&sql)
            .bind(payment_request)
            .bind(settled_at)
            .fetch_optional(&mut **tx)
            .await
    }

    /// Move the end date to `not_before` unless it is already later.
    ///
    /// Returns the resulting end date, or `None` if the auction does not exist.
    pub async fn extend_end_date_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        auction_id: i64,
        not_before: PrimitiveDateTime,
    ) -> Result<Option<PrimitiveDateTime>, sqlx::Error> {
        sqlx::query_scalar::<_, PrimitiveDateTime>(
            r#"
            UPDATE auctions
            SET end_date = GREATEST(end_date, $2)
            WHERE id = $1
            RETURNING end_date
            "#,
        )
        .bind(auction_id)
        .bind(not_before)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn set_winning_bid_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        auction_id: i64,
        winning_bid_id: Option<i64>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE auctions SET winning_bid_id = $2 WHERE id = $1")
            .bind(auction_id)
            .bind(winning_bid_id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}
