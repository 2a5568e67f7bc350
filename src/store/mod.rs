//! Read-only access to the post/comment/link corpus and pre-computed drift
//! records (spec §4.2). Grounded on `tuitbot-core::storage`'s pool
//! bootstrap (WAL mode, embedded `sqlx::migrate!`); the teacher's own
//! storage layer (LanceDB/Tantivy) models vector similarity, not the
//! relational CRUD this spec needs, so it isn't reused here.

pub mod comments;
pub mod drift;
pub mod experts;
pub mod links;
pub mod posts;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

use crate::error::StorageError;

/// Type alias for the SQLite connection pool backing the Store.
pub type DbPool = sqlx::SqlitePool;

/// Initialize the SQLite database: create the file and parent directories
/// if needed, configure WAL mode, run embedded migrations, and return a pool.
pub async fn init_db(database_url: &str) -> Result<DbPool, StorageError> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                source: sqlx::Error::Configuration(
                    format!("failed to create directory {}: {e}", parent.display()).into(),
                ),
            })?;
        }
    }

    let connect_options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| StorageError::Connection { source: e })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .idle_timeout(Duration::from_secs(300))
        .connect_with(connect_options)
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StorageError::Migration { source: e })?;

    Ok(pool)
}

/// Initialize an in-memory database for tests, using a shared cache so
/// multiple connections see the same data.
#[cfg(any(test, feature = "test-helpers"))]
pub async fn init_test_db() -> Result<DbPool, StorageError> {
    let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| StorageError::Connection { source: e })?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options)
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StorageError::Migration { source: e })?;

    Ok(pool)
}
