//! Database connection management using sqlx

use crate::error::{AgentError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub type DbPool = SqlitePool;

/// Open a read-only connection pool. Every connection is opened with
/// `SQLITE_OPEN_READONLY`, so writes fail at the engine even if they slip
/// past static validation.
pub async fn init_read_only_pool(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| AgentError::Config(format!("Invalid database URL: {}", e)))?
        .read_only(true)
        .create_if_missing(false);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("Opened read-only database pool ({} connections max)", max_connections);

    Ok(pool)
}
