use sqlx::postgres::{PgPoolOptions, PgConnectOptions};
use sqlx::{Pool, Postgres, ConnectOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use tracing::log::LevelFilter;

pub type DbPool = Pool<Postgres>;

/// Pool for the lesson record store. Queries are short single-row updates,
/// so a handful of connections covers the API and every encode worker.
pub async fn connect_to_db(connection_string: &str, workers: usize) -> Result<DbPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(connection_string)?
        .log_statements(LevelFilter::Debug);

    let max_connections = u32::try_from(workers).unwrap_or(u32::MAX).saturating_add(4);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect_with(options)
        .await?;

    info!("✅ Connected to PostgreSQL ({} max connections)", max_connections);
    Ok(pool)
}
