//! Event Buffer - Pending history entries awaiting sync
//!
//! Captured entries are appended here and survive restarts (SQLite-backed).
//! A sync takes a point-in-time snapshot; entries are only removed once the
//! upload that contains them has been confirmed.
//!
//! Features:
//! - Insertion-ordered snapshots
//! - Idempotent appends (entries are keyed by their deterministic id)
//! - Bounded capacity with oldest-first eviction

use super::models::{EntryId, HistoryEntry, ValidationError};
use crate::db::{Database, DbError};
use rusqlite::params;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Local store of entries not yet synced
pub struct EventBuffer {
    db: Arc<Database>,
    capacity: AtomicUsize,
}

impl EventBuffer {
    pub fn new(db: Arc<Database>, capacity: usize) -> Self {
        Self {
            db,
            capacity: AtomicUsize::new(capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Change the bound; takes effect on the next append
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::SeqCst);
    }

    /// Append one entry
    ///
    /// Returns `Ok(false)` when an entry with the same id was already buffered.
    pub fn append(&self, entry: &HistoryEntry) -> Result<bool, BufferError> {
        if entry.url().trim().is_empty() {
            return Err(ValidationError::EmptyUrl.into());
        }

        let capacity = self.capacity();
        let (inserted, evicted) = self.db.with_transaction(|tx| {
            let inserted = tx.execute(
                r#"
                INSERT OR IGNORE INTO pending_entries (
                    entry_id, url, title, timestamp, device_id,
                    duration_ms, is_article, reading_time_minutes, content
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    entry.id().as_str(),
                    entry.url(),
                    entry.title(),
                    entry.timestamp(),
                    entry.device_id(),
                    entry.duration_ms(),
                    entry.is_article(),
                    entry.reading_time_minutes(),
                    entry.content(),
                ],
            )?;

            let count: i64 = tx.query_row("SELECT COUNT(*) FROM pending_entries", [], |row| row.get(0))?;
            let overflow = count - capacity as i64;
            let evicted = if overflow > 0 {
                tx.execute(
                    r#"
                    DELETE FROM pending_entries WHERE seq IN (
                        SELECT seq FROM pending_entries ORDER BY seq ASC LIMIT ?1
                    )
                    "#,
                    params![overflow],
                )?
            } else {
                0
            };

            Ok((inserted > 0, evicted))
        })?;

        if evicted > 0 {
            log::warn!(
                "Event buffer over capacity ({}), evicted {} oldest entries",
                capacity,
                evicted
            );
        }
        if !inserted {
            log::debug!("Entry {} already buffered", entry.id());
        }
        Ok(inserted)
    }

    /// Point-in-time copy of all buffered entries, in capture order
    pub fn snapshot(&self) -> Result<Vec<HistoryEntry>, BufferError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT url, title, timestamp, device_id,
                       duration_ms, is_article, reading_time_minutes, content
                FROM pending_entries
                ORDER BY seq ASC
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, Option<i32>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut entries = Vec::with_capacity(rows.len());
        for (url, title, timestamp, device_id, duration_ms, is_article, reading_time, content) in rows {
            match HistoryEntry::new(url, title, timestamp, device_id) {
                Ok(entry) => entries.push(
                    entry
                        .with_metadata(duration_ms, is_article, reading_time)
                        .with_content(content),
                ),
                Err(e) => log::warn!("Skipping invalid buffered entry: {}", e),
            }
        }

        Ok(entries)
    }

    /// Delete entries whose id is in `ids`; returns how many were removed
    pub fn remove_synced(&self, ids: &HashSet<EntryId>) -> Result<usize, BufferError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = self.db.with_transaction(|tx| {
            let mut stmt = tx.prepare("DELETE FROM pending_entries WHERE entry_id = ?1")?;
            let mut removed = 0;
            for id in ids {
                removed += stmt.execute([id.as_str()])?;
            }
            Ok(removed)
        })?;

        log::info!("Pruned {} synced entries from event buffer", removed);
        Ok(removed)
    }

    /// Number of buffered entries
    pub fn size(&self) -> Result<usize, BufferError> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM pending_entries", [], |row| row.get(0))
        })?;
        Ok(count as usize)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Invalid entry: {0}")]
    Validation(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

// ============================================================================
// Tests
// ============================================================================
