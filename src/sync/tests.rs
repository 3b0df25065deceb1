//! Integration Tests for Sync Module
//!
//! End-to-end sync rounds against the in-memory store:
//! - First sync, multi-device convergence
//! - Wrong secret, transport failures, conflicting writes
//! - Captures arriving while a round is in flight

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::db::Database;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    const BASKET: &str = "history-room-family";
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn device_config(secret: &str) -> SyncConfig {
        SyncConfig {
            encryption_secret: secret.to_string(),
            pantry_id: "pantry".to_string(),
            room_id: Some("family".to_string()),
            ..SyncConfig::default()
        }
    }

    fn device(store: Arc<dyn RemoteStore>, secret: &str) -> Arc<SyncManager> {
        let db = Arc::new(Database::in_memory().expect("Failed to create test database"));
        Arc::new(SyncManager::new(device_config(secret), db, store).unwrap())
    }

    fn remote_entries(store: &MemoryRemoteStore, secret: &str) -> Vec<HistoryEntry> {
        let blob = store.raw(BASKET).expect("basket should exist");
        decode(&blob, &EncryptionKey::derive(secret).unwrap()).unwrap()
    }

    fn urls(entries: &[HistoryEntry]) -> HashSet<String> {
        entries.iter().map(|e| e.url().to_string()).collect()
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ========================================================================
    // Happy Paths
    // ========================================================================

    #[tokio::test]
    async fn test_first_sync_uploads_buffer_and_drains_it() {
        let store = Arc::new(MemoryRemoteStore::new());
        let manager = device(store.clone(), "shared secret");
        let now = now_ms();

        for (i, url) in ["https://a.example", "https://b.example", "https://c.example"].iter().enumerate() {
            manager.capture(CaptureEvent::new(*url, "page", now - i as i64)).unwrap();
        }

        let result = manager.sync_now().await.unwrap().unwrap();

        assert_eq!(result.pulled_entries, 0);
        assert_eq!(result.uploaded_entries, 3);
        assert_eq!(result.pruned_entries, 3);

        let remote = remote_entries(&store, "shared secret");
        let expected: HashSet<String> = ["https://a.example", "https://b.example", "https://c.example"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(urls(&remote), expected);
        assert!(remote.iter().all(|e| e.device_id() == manager.device_id()));

        let status = manager.status().unwrap();
        assert_eq!(status.pending_entries, 0);
        assert!(status.last_sync_time.is_some());
        assert!(status.last_error.is_none());
        assert_eq!(status.state, SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_two_devices_converge() {
        let store = Arc::new(MemoryRemoteStore::new());
        let laptop = device(store.clone(), "family secret");
        let phone = device(store.clone(), "family secret");
        let now = now_ms();

        laptop.capture(CaptureEvent::new("https://laptop-1.example", "", now - 4)).unwrap();
        laptop.capture(CaptureEvent::new("https://laptop-2.example", "", now - 3)).unwrap();
        phone.capture(CaptureEvent::new("https://phone-1.example", "", now - 2)).unwrap();
        phone.capture(CaptureEvent::new("https://phone-2.example", "", now - 1)).unwrap();

        laptop.sync_now().await.unwrap().unwrap();
        let result = phone.sync_now().await.unwrap().unwrap();
        assert_eq!(result.pulled_entries, 2);
        assert_eq!(result.uploaded_entries, 4);

        // A second laptop round just pulls the phone's entries
        let result = laptop.sync_now().await.unwrap().unwrap();
        assert_eq!(result.pulled_entries, 4);
        assert_eq!(result.uploaded_entries, 4);

        let remote = remote_entries(&store, "family secret");
        assert_eq!(remote.len(), 4);
        let timestamps: Vec<i64> = remote.iter().map(HistoryEntry::timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[tokio::test]
    async fn test_remote_expired_entries_dropped() {
        let store = Arc::new(MemoryRemoteStore::new());
        let manager = device(store.clone(), "s");

        let key = EncryptionKey::derive("s").unwrap();
        let stale = HistoryEntry::new("https://stale.example", "", now_ms() - 45 * DAY_MS, "old-device").unwrap();
        let recent = HistoryEntry::new("https://recent.example", "", now_ms() - DAY_MS, "old-device").unwrap();
        store
            .put(BASKET, &encode(&[stale, recent], &key).unwrap(), None)
            .await
            .unwrap();

        let result = manager.sync_now().await.unwrap().unwrap();

        assert_eq!(result.pulled_entries, 2);
        assert_eq!(result.uploaded_entries, 1);
        assert_eq!(urls(&remote_entries(&store, "s")), HashSet::from(["https://recent.example".to_string()]));
    }

    // ========================================================================
    // Failure Paths
    // ========================================================================

    #[tokio::test]
    async fn test_wrong_secret_keeps_buffer_and_reports() {
        let store = Arc::new(MemoryRemoteStore::new());
        let owner = device(store.clone(), "right secret");
        owner.capture(CaptureEvent::new("https://mine.example", "", now_ms())).unwrap();
        owner.sync_now().await.unwrap().unwrap();
        let before = store.raw(BASKET).unwrap();

        let intruder = device(store.clone(), "wrong secret");
        intruder.capture(CaptureEvent::new("https://theirs.example", "", now_ms())).unwrap();

        let err = intruder.sync_now().await.unwrap().unwrap_err();

        assert!(matches!(err, SyncManagerError::Codec(CodecError::Decryption)));
        assert!(!err.is_retryable());

        let status = intruder.status().unwrap();
        assert_eq!(status.pending_entries, 1);
        assert_eq!(status.state, SchedulerState::Idle);
        assert_eq!(status.last_error.as_deref(), Some("Decryption failed: check encryption secret"));
        assert_eq!(status.describe(), "Decryption failed: check encryption secret");

        // Remote untouched
        assert_eq!(store.raw(BASKET).unwrap(), before);
    }

    #[tokio::test]
    async fn test_error_cleared_after_success() {
        let store = Arc::new(MemoryRemoteStore::new());
        let manager = device(store.clone(), "");

        assert!(manager.sync_now().await.unwrap().is_err());
        assert!(manager.status().unwrap().last_error.is_some());

        let mut config = manager.get_config().await;
        config.encryption_secret = "now set".to_string();
        manager.update_config(config).await.unwrap();

        manager.sync_now().await.unwrap().unwrap();
        assert!(manager.status().unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_put_failure_keeps_buffer_then_recovers() {
        let store = Arc::new(MemoryRemoteStore::new());
        let manager = device(store.clone(), "s");
        manager.capture(CaptureEvent::new("https://a.example", "", now_ms())).unwrap();

        store.fail_next_puts(1);
        assert!(manager.sync_now().await.unwrap().is_err());
        assert!(matches!(manager.scheduler_state(), SchedulerState::Backoff { attempt: 1, .. }));
        assert_eq!(manager.status().unwrap().pending_entries, 1);
        assert!(store.raw(BASKET).is_none());

        manager.sync_now().await.unwrap().unwrap();
        assert_eq!(manager.status().unwrap().pending_entries, 0);
        assert_eq!(remote_entries(&store, "s").len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_merges_foreign_write() {
        let store = Arc::new(MemoryRemoteStore::new());
        let laptop = device(store.clone(), "s");
        let phone = device(store.clone(), "s");

        phone.capture(CaptureEvent::new("https://phone.example", "", now_ms() - 10)).unwrap();
        phone.sync_now().await.unwrap().unwrap();

        // Another device bumps the revision right before the laptop writes
        laptop.capture(CaptureEvent::new("https://laptop.example", "", now_ms())).unwrap();
        store.interfere_next_puts(1);
        let result = laptop.sync_now().await.unwrap().unwrap();

        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(laptop.status().unwrap().pending_entries, 0);
    }

    // ========================================================================
    // Concurrency
    // ========================================================================

    /// Wraps the memory store and runs a callback right before the next put
    struct HookedStore {
        inner: MemoryRemoteStore,
        before_put: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    #[async_trait]
    impl RemoteStore for HookedStore {
        async fn fetch(&self, key: &str) -> Result<Option<RemoteBlob>, RemoteError> {
            self.inner.fetch(key).await
        }

        async fn put(
            &self,
            key: &str,
            ciphertext: &[u8],
            expected: Option<&FreshnessToken>,
        ) -> Result<FreshnessToken, RemoteError> {
            let hook = self.before_put.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.put(key, ciphertext, expected).await
        }
    }

    #[tokio::test]
    async fn test_capture_during_round_is_kept() {
        let store = Arc::new(HookedStore {
            inner: MemoryRemoteStore::new(),
            before_put: Mutex::new(None),
        });
        let manager = device(store.clone(), "s");
        manager.capture(CaptureEvent::new("https://before.example", "", now_ms() - 5)).unwrap();

        let during = manager.clone();
        *store.before_put.lock().unwrap() = Some(Box::new(move || {
            during
                .capture(CaptureEvent::new("https://during.example", "", now_ms()))
                .unwrap();
        }));

        let result = manager.sync_now().await.unwrap().unwrap();
        assert_eq!(result.uploaded_entries, 1);
        assert_eq!(result.pruned_entries, 1);

        let pending = manager.buffer().snapshot().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].url(), "https://during.example");

        // Picked up by the next round
        let result = manager.sync_now().await.unwrap().unwrap();
        assert_eq!(result.uploaded_entries, 2);
        assert_eq!(manager.status().unwrap().pending_entries, 0);
    }

    #[tokio::test]
    async fn test_parallel_rounds_lose_no_entries() {
        let store = Arc::new(MemoryRemoteStore::new());
        let devices: Vec<_> = (0..4).map(|_| device(store.clone(), "s")).collect();
        let now = now_ms();

        for (i, manager) in devices.iter().enumerate() {
            manager
                .capture(CaptureEvent::new(format!("https://device-{}.example", i), "", now - i as i64))
                .unwrap();
        }

        let handles: Vec<_> = devices
            .iter()
            .cloned()
            .map(|manager| tokio::spawn(async move { manager.sync_round().await }))
            .collect();
        for handle in handles {
            // Exhausted retries are fine; the entry stays buffered
            let _ = handle.await.unwrap();
        }

        // Let every device finish whatever it still holds
        for manager in &devices {
            if manager.status().unwrap().pending_entries > 0 {
                manager.sync_round().await.unwrap();
            }
        }

        assert_eq!(remote_entries(&store, "s").len(), 4);
    }
}
