use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use time::PrimitiveDateTime;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Bid {
    pub id: i64,
    pub auction_id: i64,
    pub buyer_id: i64,
    /// Amount in satoshis.
    pub amount: i64,
    pub payment_request: String,
    pub requested_at: PrimitiveDateTime,
    /// Set exactly once, by the settlement reconciler.
    pub settled_at: Option<PrimitiveDateTime>,
}

impl Bid {
    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }
}

const BID_COLUMNS: &str =
    "id, auction_id, buyer_id, amount, payment_request, requested_at, settled_at";

#[derive(Debug, Clone)]
pub struct GetBid {
    pub id: i64,
}

impl Processor<GetBid> for DatabaseProcessor {
    type Output = Option<Bid>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetBid")]
    async fn process(&self, query: GetBid) -> Result<Option<Bid>, sqlx::Error> {
        let sql = format!("SELECT {BID_COLUMNS} FROM bids WHERE id = $1");
        sqlx::query_as::<_, Bid>(&sql)
            .bind(query.id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Bids settled strictly after `since`.
pub struct GetBidsSettledSince {
    pub since: PrimitiveDateTime,
}

impl Processor<GetBidsSettledSince> for DatabaseProcessor {
    type Output = Vec<Bid>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetBidsSettledSince")]
    async fn process(&self, query: GetBidsSettledSince) -> Result<Vec<Bid>, sqlx::Error> {
        let sql = format!(
            "SELECT {BID_COLUMNS} FROM bids WHERE settled_at > $1 ORDER BY settled_at ASC"
        );
        sqlx::query_as::<_, Bid>(&sql)
            .bind(query.since)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Payment requests of bids that have not been paid yet.
pub struct GetUnsettledBidRequests;

impl Processor<GetUnsettledBidRequests> for DatabaseProcessor {
    type Output = Vec<String>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetUnsettledBidRequests")]
    async fn process(&self, _query: GetUnsettledBidRequests) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT payment_request FROM bids WHERE settled_at IS NULL ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
    }
}

impl Bid {
    /// Mark the bid identified by `payment_request` as settled.
    ///
    /// Only matches an unsettled bid, so replaying the same settlement
    /// returns `None` and changes nothing.
    pub async fn settle_unsettled_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        payment_request: &str,
        settled_at: PrimitiveDateTime,
    ) -> Result<Option<Bid>, sqlx::Error> {
        let sql = format!(
            "UPDATE bids SET settled_at = $2 \
             WHERE payment_request = $1 AND settled_at IS NULL \
             RETURNING {BID_COLUMNS}"
        );
        sqlx::query_as::<_, Bid>(&sql)
            .bind(payment_request)
            .bind(settled_at)
            .fetch_optional(&mut **tx)
            .await
    }

    /// Highest settled bid of an auction; the earlier settlement wins a tie.
    pub async fn top_settled_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        auction_id: i64,
    ) -> Result<Option<Bid>, sqlx::Error> {
        let sql = format!(
            "SELECT {BID_COLUMNS} FROM bids \
             WHERE auction_id = $1 AND settled_at IS NOT NULL \
             ORDER BY amount DESC, settled_at ASC, id ASC \
             LIMIT 1"
        );
        sqlx::query_as::<_, Bid>(&sql)
            .bind(auction_id)
            .fetch_optional(&mut **tx)
            .await
    }
}
