//! Local database for the history sync companion
//!
//! SQLite behind an r2d2 pool. Holds the pending-entry buffer and a small
//! JSON key/value settings table (sync configuration, last sync time, last
//! error), so a killed process resumes where it stopped.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Bumped whenever `schema.sql` changes; each bump adds an `UPGRADES` step
const SCHEMA_VERSION: i64 = 2;

/// Upgrade steps indexed by the version they start from (1 → 2, ...)
const UPGRADES: &[&str] = &["ALTER TABLE pending_entries ADD COLUMN content TEXT;"];

const FILE_POOL_SIZE: u32 = 4;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
}

pub type DbResult<T> = Result<T, DbError>;

/// Shared handle to the sync database; cheap to clone
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the database file at `db_path`
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA busy_timeout = 5000;
                 PRAGMA synchronous = NORMAL;",
            )
        });
        let pool = Pool::builder()
            .max_size(FILE_POOL_SIZE)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        let db = Self::from_pool(pool)?;
        log::info!("Opened sync database at {}", db_path.display());
        Ok(db)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn in_memory() -> DbResult<Self> {
        // Each `:memory:` connection is a separate database
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;

        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> DbResult<Self> {
        let conn = pool.get()?;
        migrate(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` with a pooled connection
    pub fn with_conn<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        Ok(f(&conn)?)
    }

    /// Run `f` inside a transaction; commits only when `f` succeeds
    pub fn with_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Read a JSON-encoded setting
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let raw: Option<String> = self.with_conn(|conn| {
            conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
                .optional()
        })?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Store a setting as JSON, replacing any previous value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let json = serde_json::to_string(value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, json],
            )
        })?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> DbResult<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM settings WHERE key = ?1", [key]))?;
        Ok(())
    }
}

/// Create or upgrade the schema; refuse databases from a newer build
///
/// A fresh database gets the full `schema.sql`. An older one replays the
/// upgrade steps from its version onwards.
fn migrate(conn: &Connection) -> DbResult<()> {
    // Not allowed inside a transaction, so it runs on its own
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found > SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    if found == SCHEMA_VERSION {
        return Ok(());
    }

    if found == 0 {
        conn.execute_batch(include_str!("schema.sql"))?;
    } else {
        for (from, step) in UPGRADES.iter().enumerate().skip(found as usize - 1) {
            log::debug!("Applying schema upgrade {} -> {}", from + 1, from + 2);
            conn.execute_batch(step)?;
        }
    }

    conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
    log::info!("Database schema upgraded from version {} to {}", found, SCHEMA_VERSION);

    Ok(())
}
