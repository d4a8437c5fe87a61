//! Database connection pool
//!
//! Wrapper around SQLx's `SqlitePool` with automatic directory creation,
//! WAL journal mode for concurrent reads, schema migration on first
//! connection, and an in-memory mode for tests.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use graphfs_core::CoreError;

/// Pool of SQLite connections backing the metadata store.
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Open (or create) the metadata database at `db_path`.
    ///
    /// Enables WAL journal mode, sets a 5-second busy timeout, and runs the
    /// schema migration.
    pub async fn new(db_path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Storage(format!("create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                CoreError::Storage(format!("connect {}: {e}", db_path.display()))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::info!(path = %db_path.display(), "metadata store opened");
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps the data
    /// alive across queries.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::Storage(format!("in-memory connect: {e}")))?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), CoreError> {
        let migration_sql = include_str!("migrations/20260301_initial.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .map_err(|e| CoreError::Storage(format!("migration failed: {e}")))?;
        tracing::debug!("schema migration completed");
        Ok(())
    }
}
