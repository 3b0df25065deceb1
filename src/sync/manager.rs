//! Sync Manager - Orchestrates synchronization operations
//!
//! Coordinates between the event buffer, codec, merge engine and remote store.
//! Handles:
//! - Capture ingestion (attaches the device id, notifies on threshold)
//! - One sync round: fetch → decode → merge → encode → conditional put
//! - Immediate re-fetch on conflicting writes (bounded)
//! - Pruning the buffer only after a confirmed upload
//! - Status reporting for the UI

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use super::api::{FreshnessToken, RemoteError, RemoteStore};
use super::buffer::{BufferError, EventBuffer};
use super::crypto::{self, CodecError, EncryptionKey};
use super::merge::merge;
use super::models::{
    validate_interval_hours, CaptureEvent, ConfigError, EntryId, HistoryEntry, SchedulerState,
    SyncConfig, SyncStatus,
};
use super::scheduler::{SyncStateMachine, Trigger};
use crate::db::{Database, DbError};

const LAST_SYNC_TIME_KEY: &str = "last_sync_time";
const LAST_SYNC_ERROR_KEY: &str = "last_sync_error";

/// Sync manager - main orchestrator
pub struct SyncManager {
    config: RwLock<SyncConfig>,
    db: Arc<Database>,
    buffer: EventBuffer,
    store: Arc<dyn RemoteStore>,
    device_id: String,
    sync_threshold: AtomicUsize,
    machine: StdMutex<SyncStateMachine>,
    /// Serializes rounds started outside the state machine
    round_lock: Mutex<()>,
    trigger_tx: StdMutex<Option<mpsc::Sender<Trigger>>>,
    /// Current timer interval; the scheduler loop retimes on change
    interval_tx: watch::Sender<Duration>,
}

impl SyncManager {
    /// Create a manager for the given config, database and remote store
    pub fn new(
        config: SyncConfig,
        db: Arc<Database>,
        store: Arc<dyn RemoteStore>,
    ) -> Result<Self, SyncManagerError> {
        if config.device_id.trim().is_empty() {
            return Err(SyncManagerError::Config(ConfigError::InvalidValue(
                "device_id must not be empty".to_string(),
            )));
        }

        let buffer = EventBuffer::new(db.clone(), config.max_pending_entries);
        let (interval_tx, _) = watch::channel(config.sync_interval());

        Ok(Self {
            device_id: config.device_id.clone(),
            sync_threshold: AtomicUsize::new(config.sync_threshold.max(1)),
            config: RwLock::new(config),
            db,
            buffer,
            store,
            machine: StdMutex::new(SyncStateMachine::new()),
            round_lock: Mutex::new(()),
            trigger_tx: StdMutex::new(None),
            interval_tx,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Accept one capture event from the browser
    ///
    /// Never waits on a sync round. Returns `Ok(false)` for a duplicate.
    pub fn capture(&self, event: CaptureEvent) -> Result<bool, BufferError> {
        let entry = match HistoryEntry::from_capture(event, &self.device_id) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Dropping capture event: {}", e);
                return Err(e.into());
            }
        };

        let inserted = self.buffer.append(&entry)?;

        if inserted {
            let size = self.buffer.size()?;
            if size >= self.sync_threshold.load(Ordering::Relaxed) {
                log::debug!("Buffer reached sync threshold ({} entries)", size);
                self.notify(Trigger::Threshold);
            }
        }

        Ok(inserted)
    }

    pub(crate) fn attach_trigger_sender(&self, tx: mpsc::Sender<Trigger>) {
        *lock(&self.trigger_tx) = Some(tx);
    }

    pub(crate) fn detach_trigger_sender(&self) {
        lock(&self.trigger_tx).take();
    }

    pub(crate) fn subscribe_interval(&self) -> watch::Receiver<Duration> {
        self.interval_tx.subscribe()
    }

    fn notify(&self, trigger: Trigger) {
        if let Some(tx) = lock(&self.trigger_tx).as_ref() {
            // A full channel means a sync is already pending
            let _ = tx.try_send(trigger);
        }
    }

    // ========================================================================
    // Scheduling Boundary
    // ========================================================================

    /// Run a sync now, overriding any backoff
    pub async fn sync_now(&self) -> Option<Result<SyncResult, SyncManagerError>> {
        self.handle_trigger(Trigger::Manual).await
    }

    /// Feed a trigger into the state machine and run a round if it allows one
    ///
    /// Returns `None` when the trigger was coalesced. Every error is caught
    /// here and turned into scheduler state plus `last_error`.
    pub async fn handle_trigger(&self, trigger: Trigger) -> Option<Result<SyncResult, SyncManagerError>> {
        self.handle_trigger_at(trigger, Utc::now()).await
    }

    pub(crate) async fn handle_trigger_at(
        &self,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Option<Result<SyncResult, SyncManagerError>> {
        if !lock(&self.machine).on_trigger(trigger, now) {
            return None;
        }

        log::info!("Sync round started ({:?})", trigger);
        let result = self.sync_round().await;

        match &result {
            Ok(_) => {
                lock(&self.machine).on_success();
            }
            Err(e) if e.is_retryable() => {
                let until = lock(&self.machine).on_retryable_failure(Utc::now());
                log::warn!("Sync failed ({}), backing off until {}", e, until);
            }
            Err(e) => {
                lock(&self.machine).on_fatal();
                let message = e.user_message();
                log::error!("Sync failed: {} ({})", message, e);
                if let Err(db_err) = self.db.set_setting(LAST_SYNC_ERROR_KEY, &message) {
                    log::error!("Failed to persist sync error: {}", db_err);
                }
            }
        }

        Some(result)
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        lock(&self.machine).state()
    }

    // ========================================================================
    // Sync Round
    // ========================================================================

    /// One full sync round with bounded conflict retries
    ///
    /// The buffer is pruned only after the upload is confirmed, so any
    /// failure leaves pending entries untouched for the next round.
    pub async fn sync_round(&self) -> Result<SyncResult, SyncManagerError> {
        let _round = self.round_lock.lock().await;

        let config = self.config.read().await.clone();
        if config.encryption_secret.is_empty() {
            return Err(SyncManagerError::MissingSecret);
        }
        let basket = config.basket_key()?;
        let retention_ms = config.retention_ms();
        let max_attempts = config.max_conflict_retries.max(1);

        let key = EncryptionKey::derive(&config.encryption_secret)?;
        drop(config);

        let snapshot = self.buffer.snapshot()?;
        log::debug!("Sync snapshot holds {} pending entries", snapshot.len());

        for attempt in 1..=max_attempts {
            // The token used for put always comes from this attempt's fetch
            let (remote_entries, token) = match self.store.fetch(&basket).await? {
                Some(blob) => (crypto::decode(&blob.ciphertext, &key)?, blob.token),
                None => (Vec::new(), FreshnessToken::absent()),
            };

            let now_ms = Utc::now().timestamp_millis();
            let merged = merge(&snapshot, &remote_entries, now_ms, retention_ms);
            let blob = crypto::encode(&merged, &key)?;

            match self.store.put(&basket, &blob, Some(&token)).await {
                Ok(new_token) => {
                    let pruned = self.prune_synced(&snapshot, &merged, now_ms - retention_ms);
                    let synced_at = Utc::now();
                    self.record_success(synced_at);

                    log::info!(
                        "Synced basket '{}': {} remote + {} local → {} entries (attempt {})",
                        basket,
                        remote_entries.len(),
                        snapshot.len(),
                        merged.len(),
                        attempt
                    );

                    return Ok(SyncResult {
                        pulled_entries: remote_entries.len(),
                        uploaded_entries: merged.len(),
                        pruned_entries: pruned,
                        conflicts_resolved: attempt - 1,
                        synced_at,
                        token: new_token,
                    });
                }
                Err(RemoteError::Conflict) => {
                    log::warn!(
                        "Conflicting write on basket '{}' (attempt {}/{}), re-fetching",
                        basket,
                        attempt,
                        max_attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SyncManagerError::ConflictRetriesExhausted(max_attempts))
    }

    /// Remove snapshot entries that were uploaded or have expired
    fn prune_synced(&self, snapshot: &[HistoryEntry], merged: &[HistoryEntry], cutoff_ms: i64) -> usize {
        let uploaded: HashSet<EntryId> = merged.iter().map(HistoryEntry::id).collect();
        let done: HashSet<EntryId> = snapshot
            .iter()
            .filter(|entry| entry.timestamp() < cutoff_ms || uploaded.contains(&entry.id()))
            .map(HistoryEntry::id)
            .collect();

        match self.buffer.remove_synced(&done) {
            Ok(count) => count,
            Err(e) => {
                // Upload already succeeded; leftovers are deduplicated next round
                log::error!("Failed to prune synced entries: {}", e);
                0
            }
        }
    }

    fn record_success(&self, synced_at: DateTime<Utc>) {
        if let Err(e) = self.db.set_setting(LAST_SYNC_TIME_KEY, &synced_at) {
            log::error!("Failed to persist last sync time: {}", e);
        }
        if let Err(e) = self.db.delete_setting(LAST_SYNC_ERROR_KEY) {
            log::error!("Failed to clear last sync error: {}", e);
        }
    }

    // ========================================================================
    // Status & Configuration
    // ========================================================================

    /// Status snapshot for the UI
    pub fn status(&self) -> Result<SyncStatus, SyncManagerError> {
        Ok(SyncStatus {
            last_sync_time: self.db.get_setting::<DateTime<Utc>>(LAST_SYNC_TIME_KEY)?,
            pending_entries: self.buffer.size()?,
            state: self.scheduler_state(),
            last_error: self.db.get_setting::<String>(LAST_SYNC_ERROR_KEY)?,
        })
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    /// Replace the configuration and persist it
    ///
    /// Takes effect without a restart: the buffer bound and threshold apply
    /// to the next capture and a running scheduler retimes its timer. The
    /// device id is fixed for the lifetime of an installation; a different
    /// id in `new_config` is ignored.
    pub async fn update_config(&self, mut new_config: SyncConfig) -> Result<(), SyncManagerError> {
        validate_interval_hours(new_config.sync_interval_hours)?;

        if new_config.device_id != self.device_id {
            log::warn!("Ignoring device id change; device ids are stable per installation");
            new_config.device_id = self.device_id.clone();
        }

        new_config.save(&self.db)?;
        self.sync_threshold
            .store(new_config.sync_threshold.max(1), Ordering::Relaxed);
        self.buffer.set_capacity(new_config.max_pending_entries);
        self.publish_interval(new_config.sync_interval());
        *self.config.write().await = new_config;

        log::info!("Sync config updated");
        Ok(())
    }

    pub(crate) async fn set_sync_interval_hours(&self, hours: f64) {
        let updated = {
            let mut config = self.config.write().await;
            config.sync_interval_hours = hours;
            config.clone()
        };
        if let Err(e) = updated.save(&self.db) {
            log::error!("Failed to persist sync interval: {}", e);
        }
        self.publish_interval(updated.sync_interval());
    }

    fn publish_interval(&self, interval: Duration) {
        let previous = self.interval_tx.send_replace(interval);
        if previous != interval {
            log::debug!("Sync interval changed from {:?} to {:?}", previous, interval);
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("Sync manager mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncResult {
    /// Entries decoded from the remote basket
    pub pulled_entries: usize,
    /// Entries in the uploaded merged set
    pub uploaded_entries: usize,
    /// Entries removed from the local buffer
    pub pruned_entries: usize,
    /// Conflicting writes resolved by re-fetching
    pub conflicts_resolved: u32,
    pub synced_at: DateTime<Utc>,
    pub token: FreshnessToken,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Encryption secret is not configured")]
    MissingSecret,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Remote basket kept changing after {0} attempts")]
    ConflictRetriesExhausted(u32),
}

impl SyncManagerError {
    /// Whether backing off and retrying later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncManagerError::Remote(e) => e.is_transport(),
            SyncManagerError::Codec(CodecError::Encryption(_)) => true,
            SyncManagerError::Buffer(BufferError::Database(_)) => true,
            SyncManagerError::Database(_) => true,
            SyncManagerError::ConflictRetriesExhausted(_) => true,
            SyncManagerError::MissingSecret
            | SyncManagerError::Config(_)
            | SyncManagerError::Codec(_)
            | SyncManagerError::Remote(_)
            | SyncManagerError::Buffer(_) => false,
        }
    }

    /// Status string shown to the user
    pub fn user_message(&self) -> String {
        match self {
            SyncManagerError::Codec(CodecError::Decryption) => {
                "Decryption failed: check encryption secret".to_string()
            }
            SyncManagerError::Codec(CodecError::Format(_))
            | SyncManagerError::Remote(RemoteError::InvalidResponse(_)) => {
                "Remote history is unreadable: check encryption secret".to_string()
            }
            SyncManagerError::MissingSecret
            | SyncManagerError::Codec(CodecError::KeyDerivation(_)) => {
                "Sync not configured: set an encryption secret".to_string()
            }
            SyncManagerError::Config(e) => format!("Sync not configured: {}", e),
            other => format!("Sync failed: {}", other),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
