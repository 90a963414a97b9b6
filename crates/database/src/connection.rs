use crate::error::DbError;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Creates the shared Postgres connection pool for the process.
pub async fn connect(database_url: &str) -> Result<PgPool, DbError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    tracing::info!("database connection pool established");
    Ok(pool)
}
