//! Sync Module - Encrypted cross-device browsing history
//!
//! Captured page visits are buffered locally, then periodically merged with
//! the shared remote basket and written back.
//!
//! Architecture:
//! - Zero-Knowledge: the remote store only ever sees ciphertext
//! - Codec: JSON → gzip → AES-256-GCM, key derived from a shared secret
//! - Merge: union by entry id with a rolling retention window
//! - Concurrency: optimistic, one conditional put per fetch

pub mod api;
pub mod buffer;
pub mod crypto;
pub mod manager;
pub mod merge;
pub mod models;
pub mod scheduler;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use crypto::{decode, encode, CodecError, EncryptionKey};

pub use models::{
    CaptureEvent, ConfigError, EntryId, HistoryEntry, SchedulerState, SyncConfig, SyncStatus,
    ValidationError,
};

pub use api::{FreshnessToken, MemoryRemoteStore, PantryClient, RemoteBlob, RemoteError, RemoteStore};
pub use buffer::{BufferError, EventBuffer};
pub use manager::{SyncManager, SyncManagerError, SyncResult};
pub use merge::merge;
pub use scheduler::{BackgroundScheduler, SchedulerError, SyncStateMachine, Trigger};
