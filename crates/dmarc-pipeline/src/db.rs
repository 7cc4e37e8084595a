//! Database pool setup and migrations

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Database operation errors with contextual information
#[derive(Error, Debug)]
pub enum DbError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Migration failure
    #[error("Database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Database configuration is invalid or missing
    #[error("Database configuration error: {0}. Check DMARC_DATABASE_URL.")]
    Config(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Create a connection pool for the given SQLite URL
///
/// Creates the database file if missing and enables WAL so concurrent
/// workers serialize on writes instead of failing fast.
pub async fn create_pool(url: &str, max_connections: u32) -> DbResult<SqlitePool> {
    if url.is_empty() {
        return Err(DbError::Config("database URL is empty".to_string()));
    }

    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| DbError::Config(format!("invalid database URL '{}': {}", url, e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    info!(url = %url, max_connections, "Database pool created");

    Ok(pool)
}

/// Apply embedded schema migrations
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}
