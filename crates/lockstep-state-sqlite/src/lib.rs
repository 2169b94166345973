//! SQLite commit store for the Lockstep workflow engine
//!
//! This crate provides a durable implementation of the
//! [`CommitStore`](lockstep_core::CommitStore) interface defined in
//! lockstep-core.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use lockstep_core::CoreError;

pub mod migrations;
pub mod repositories;

pub use repositories::SqliteCommitStore;

/// Configuration for the SQLite connection pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Database connection string
    pub connection_string: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Timeout for acquiring a connection from the pool (in seconds)
    pub acquire_timeout_secs: u64,

    /// How long a writer waits for the database lock (in milliseconds)
    pub busy_timeout_ms: u64,

    /// Whether to run migrations on startup
    pub run_migrations: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            connection_string: "sqlite://lockstep.db?mode=rwc".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 30,
            busy_timeout_ms: 5_000,
            run_migrations: true,
        }
    }
}

impl SqliteConfig {
    /// In-memory database on a single connection, for tests
    pub fn in_memory() -> Self {
        Self {
            connection_string: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Default::default()
        }
    }

    fn is_in_memory(&self) -> bool {
        self.connection_string.contains(":memory:")
    }
}

/// SQLite connection pool wrapper
#[derive(Clone)]
pub struct SqliteConnection {
    pool: SqlitePool,
}

impl SqliteConnection {
    /// Connect and, if configured, run migrations
    pub async fn new(config: &SqliteConfig) -> Result<Self, CoreError> {
        let mut connect_options = SqliteConnectOptions::from_str(&config.connection_string)
            .map_err(|e| CoreError::ConfigurationError(format!("Invalid SQLite URL: {}", e)))?
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let mut options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));

        // An in-memory database lives only as long as its connection
        if config.is_in_memory() {
            options = options.idle_timeout(None).max_lifetime(None);
        } else {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = options
            .connect_with(connect_options)
            .await
            .map_err(|e| CoreError::StateStoreError(format!("Failed to connect to SQLite: {}", e)))?;

        debug!(connection = %config.connection_string, "Connected to SQLite database");

        let conn = Self { pool };
        if config.run_migrations {
            conn.run_migrations().await?;
        }

        Ok(conn)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        debug!("Running SQLite migrations...");

        for (migration_name, migration_sql) in migrations::generate_migrations() {
            debug!("Applying migration: {}", migration_name);

            sqlx::query(migration_sql)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    CoreError::StateStoreError(format!(
                        "Migration '{}' failed: {}",
                        migration_name, e
                    ))
                })?;
        }

        info!("SQLite migrations completed successfully");
        Ok(())
    }

    /// Get the database connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
