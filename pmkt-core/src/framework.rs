use sqlx::PgPool;

/// Runs read-only query objects against the connection pool.
///
/// Writes that have to be atomic with other writes do not go through here;
/// they are `*_tx` associated functions on the entities and take the open
/// transaction explicitly.
#[derive(Debug, Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}

impl DatabaseProcessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}
