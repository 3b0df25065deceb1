//! Sync Data Models - Client-Side Structures
//!
//! Defines the data structures shared by the sync engine:
//! - HistoryEntry / CaptureEvent: captured browsing history
//! - SyncConfig: settings handed to the engine by the application shell
//! - SchedulerState / SyncStatus: what the UI collaborator displays

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

use crate::db::{Database, DbError};

// ============================================================================
// Constants
// ============================================================================

/// Default Pantry API root; the pantry id and basket are appended per request
pub const PANTRY_API_BASE: &str = "https://getpantry.cloud/apiv1/pantry";

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_SYNC_THRESHOLD: usize = 100;
pub const DEFAULT_MAX_PENDING_ENTRIES: usize = 10_000;
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

const MIN_SYNC_INTERVAL_HOURS: f64 = 0.5;
const MAX_SYNC_INTERVAL_HOURS: f64 = 24.0;
const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

const SYNC_CONFIG_KEY: &str = "sync_config";

// ============================================================================
// History Entries
// ============================================================================

/// Deterministic identity of a history entry, used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Hex SHA-256 over `url \0 timestamp \0 device_id`
    pub fn derive(url: &str, timestamp: i64, device_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update([0u8]);
        hasher.update(timestamp.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(device_id.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntryId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A captured history entry
///
/// Entries are immutable once constructed: fields are only readable, and
/// merge selects survivors without rewriting them. Deserialization goes
/// through `WireEntry`, so decoded entries are validated like new ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEntry")]
pub struct HistoryEntry {
    url: String,
    title: String,
    /// Milliseconds since the Unix epoch
    timestamp: i64,
    device_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_article: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reading_time_minutes: Option<i32>,
    /// Extracted article text, when the extension captured it
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

/// Unvalidated entry as it appears in a decoded blob
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireEntry {
    url: String,
    #[serde(default)]
    title: String,
    timestamp: i64,
    device_id: String,
    #[serde(default)]
    duration_ms: Option<i64>,
    #[serde(default)]
    is_article: bool,
    #[serde(default)]
    reading_time_minutes: Option<i32>,
    #[serde(default)]
    content: Option<String>,
}

impl TryFrom<WireEntry> for HistoryEntry {
    type Error = ValidationError;

    fn try_from(wire: WireEntry) -> Result<Self, Self::Error> {
        Ok(HistoryEntry::new(wire.url, wire.title, wire.timestamp, wire.device_id)?
            .with_metadata(wire.duration_ms, wire.is_article, wire.reading_time_minutes)
            .with_content(wire.content))
    }
}

impl HistoryEntry {
    /// Create a new entry; the url must be non-empty
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        timestamp: i64,
        device_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ValidationError::EmptyUrl);
        }

        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(ValidationError::EmptyDeviceId);
        }

        Ok(Self {
            url,
            title: title.into(),
            timestamp,
            device_id,
            duration_ms: None,
            is_article: false,
            reading_time_minutes: None,
            content: None,
        })
    }

    /// Build an entry from a capture event, attaching this device's id
    pub fn from_capture(event: CaptureEvent, device_id: &str) -> Result<Self, ValidationError> {
        let mut entry = Self::new(event.url, event.title, event.timestamp, device_id)?;
        entry.duration_ms = event.duration_ms;
        entry.is_article = event.is_article;
        entry.reading_time_minutes = event.reading_time_minutes;
        entry.content = event.content.filter(|c| !c.is_empty());
        Ok(entry)
    }

    /// Attach optional reading metadata
    pub fn with_metadata(
        mut self,
        duration_ms: Option<i64>,
        is_article: bool,
        reading_time_minutes: Option<i32>,
    ) -> Self {
        self.duration_ms = duration_ms;
        self.is_article = is_article;
        self.reading_time_minutes = reading_time_minutes;
        self
    }

    pub fn with_content(mut self, content: Option<String>) -> Self {
        self.content = content;
        self
    }

    pub fn id(&self) -> EntryId {
        EntryId::derive(&self.url, self.timestamp, &self.device_id)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.duration_ms
    }

    pub fn is_article(&self) -> bool {
        self.is_article
    }

    pub fn reading_time_minutes(&self) -> Option<i32> {
        self.reading_time_minutes
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }
}

/// Raw capture event delivered by the browser extension
///
/// Accepts the field names used by older extension builds
/// (`visit_time`, `duration`, `reading_time`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEvent {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(alias = "visit_time")]
    pub timestamp: i64,
    #[serde(default, alias = "duration")]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub is_article: bool,
    #[serde(default, alias = "reading_time")]
    pub reading_time_minutes: Option<i32>,
    #[serde(default)]
    pub content: Option<String>,
}

impl CaptureEvent {
    pub fn new(url: impl Into<String>, title: impl Into<String>, timestamp: i64) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            timestamp,
            duration_ms: None,
            is_article: false,
            reading_time_minutes: None,
            content: None,
        }
    }
}

/// Rejected capture input
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("History entry url must not be empty")]
    EmptyUrl,

    #[error("History entry device id must not be empty")]
    EmptyDeviceId,
}

// ============================================================================
// Sync Configuration
// ============================================================================

/// Sync configuration
///
/// Owned by the application shell and passed into the engine at
/// construction. Persisted as JSON in the settings table.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// User secret the encryption key is derived from
    pub encryption_secret: String,

    /// Root of the Pantry API
    pub remote_base_url: String,

    /// Pantry identifier (path segment under `remote_base_url`)
    pub pantry_id: String,

    /// Basket holding this device group's encrypted history
    pub remote_basket_key: String,

    /// Room name; used to derive the basket when `remote_basket_key` is empty
    pub room_id: Option<String>,

    /// Unique device identifier (UUID v4), stable per installation
    pub device_id: String,

    /// Human readable device label
    pub device_name: String,

    /// Timer-driven sync interval (0.5 - 24 hours)
    pub sync_interval_hours: f64,

    /// Retention window; fixed at 30 days
    pub retention_days: u32,

    /// Buffer size that triggers an immediate sync
    pub sync_threshold: usize,

    /// Buffer capacity; the oldest entries are evicted beyond it
    pub max_pending_entries: usize,

    /// Fetch/merge/put attempts per round; a conflicting write re-fetches
    /// immediately until these run out
    pub max_conflict_retries: u32,

    /// HTTP request timeout
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            encryption_secret: String::new(),
            remote_base_url: PANTRY_API_BASE.to_string(),
            pantry_id: String::new(),
            remote_basket_key: String::new(),
            room_id: None,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: get_default_device_name(),
            sync_interval_hours: 1.0,
            retention_days: DEFAULT_RETENTION_DAYS,
            sync_threshold: DEFAULT_SYNC_THRESHOLD,
            max_pending_entries: DEFAULT_MAX_PENDING_ENTRIES,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            request_timeout_secs: 30,
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("encryption_secret", &"<redacted>")
            .field("remote_base_url", &self.remote_base_url)
            .field("pantry_id", &self.pantry_id)
            .field("remote_basket_key", &self.remote_basket_key)
            .field("room_id", &self.room_id)
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("sync_interval_hours", &self.sync_interval_hours)
            .field("retention_days", &self.retention_days)
            .field("sync_threshold", &self.sync_threshold)
            .field("max_pending_entries", &self.max_pending_entries)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl SyncConfig {
    /// Load the persisted config, creating and saving a default one on first run
    ///
    /// The default carries a freshly generated device id, so it must be
    /// persisted immediately to stay stable across restarts.
    pub fn load_or_create(db: &Database) -> Result<Self, ConfigError> {
        if let Some(config) = db.get_setting::<SyncConfig>(SYNC_CONFIG_KEY)? {
            return Ok(config);
        }

        let config = SyncConfig::default();
        config.save(db)?;
        log::info!("Created sync config for new device {}", config.device_id);
        Ok(config)
    }

    pub fn save(&self, db: &Database) -> Result<(), ConfigError> {
        db.set_setting(SYNC_CONFIG_KEY, self)?;
        Ok(())
    }

    /// Apply `BAR123_*` environment overrides
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(secret) = std::env::var("BAR123_ENCRYPTION_SECRET") {
            self.encryption_secret = secret;
        }
        if let Ok(url) = std::env::var("BAR123_REMOTE_BASE_URL") {
            self.remote_base_url = url;
        }
        if let Ok(pantry_id) = std::env::var("BAR123_PANTRY_ID") {
            self.pantry_id = pantry_id;
        }
        if let Ok(basket) = std::env::var("BAR123_BASKET_KEY") {
            self.remote_basket_key = basket;
        }
        if let Ok(room) = std::env::var("BAR123_ROOM_ID") {
            self.room_id = Some(room).filter(|r| !r.trim().is_empty());
        }
        if let Ok(hours) = std::env::var("BAR123_SYNC_INTERVAL_HOURS") {
            self.sync_interval_hours = hours
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("BAR123_SYNC_INTERVAL_HOURS={}", hours)))?;
        }
        if let Ok(threshold) = std::env::var("BAR123_SYNC_THRESHOLD") {
            self.sync_threshold = threshold
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("BAR123_SYNC_THRESHOLD={}", threshold)))?;
        }
        Ok(self)
    }

    /// Check everything a sync round needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption_secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.pantry_id.trim().is_empty() {
            return Err(ConfigError::MissingPantryId);
        }
        self.basket_key()?;
        validate_interval_hours(self.sync_interval_hours)?;
        url::Url::parse(&self.remote_base_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.remote_base_url, e)))?;
        Ok(())
    }

    /// Effective basket key: explicit key, otherwise derived from the room
    pub fn basket_key(&self) -> Result<String, ConfigError> {
        let explicit = self.remote_basket_key.trim();
        if !explicit.is_empty() {
            return Ok(explicit.to_string());
        }

        match self.room_id.as_deref().map(str::trim) {
            Some(room) if !room.is_empty() => Ok(format!("history-room-{}", room)),
            _ => Err(ConfigError::MissingBasketKey),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sync_interval_hours * 3600.0)
    }

    pub fn retention_ms(&self) -> i64 {
        i64::from(self.retention_days) * MS_PER_DAY
    }
}

/// Validate a sync interval in hours
pub fn validate_interval_hours(hours: f64) -> Result<(), ConfigError> {
    if !hours.is_finite() || !(MIN_SYNC_INTERVAL_HOURS..=MAX_SYNC_INTERVAL_HOURS).contains(&hours) {
        return Err(ConfigError::InvalidInterval(hours));
    }
    Ok(())
}

/// Get default device name from hostname
fn get_default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Unknown Device".to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Encryption secret is not configured")]
    MissingSecret,

    #[error("Pantry id is not configured")]
    MissingPantryId,

    #[error("Neither a basket key nor a room id is configured")]
    MissingBasketKey,

    #[error("Sync interval must be 0.5-24 hours, got {0}")]
    InvalidInterval(f64),

    #[error("Invalid remote url: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

// ============================================================================
// Sync Status
// ============================================================================

/// Scheduler state, as shown to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Syncing,
    Backoff {
        attempt: u32,
        until: DateTime<Utc>,
    },
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Syncing => "syncing",
            SchedulerState::Backoff { .. } => "backoff",
        }
    }
}

/// Read-only snapshot for the status API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_entries: usize,
    pub state: SchedulerState,
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// One-line status string for display
    pub fn describe(&self) -> String {
        if let Some(error) = &self.last_error {
            if self.state == SchedulerState::Idle {
                return error.clone();
            }
        }

        match self.state {
            SchedulerState::Syncing => "Syncing…".to_string(),
            SchedulerState::Backoff { attempt, until } => format!(
                "Backoff until {} (attempt {})",
                until.format("%Y-%m-%d %H:%M:%S UTC"),
                attempt
            ),
            SchedulerState::Idle => match self.last_sync_time {
                Some(at) => format!(
                    "Idle, last synced {} ({} pending)",
                    at.format("%Y-%m-%d %H:%M:%S UTC"),
                    self.pending_entries
                ),
                None => format!("Idle, never synced ({} pending)", self.pending_entries),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
