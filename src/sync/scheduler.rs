//! Background Sync Scheduler
//!
//! Decides when a sync round runs. Timer ticks, buffer-threshold
//! notifications and manual requests are all funnelled into one `Trigger`
//! stream and fed to `SyncStateMachine`, which owns the Idle / Syncing /
//! Backoff transitions. The async driver runs in a Tokio task.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::manager::SyncManager;
use super::models::{validate_interval_hours, SchedulerState};

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: i64 = 30;        // First backoff: 30 seconds
const MAX_DELAY_SECS: i64 = 30 * 60;    // Backoff cap: 30 minutes
const TRIGGER_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// State Machine
// ============================================================================

/// Reason a sync was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    Threshold,
    Manual,
    BackoffElapsed,
}

/// Backoff delay before attempt `attempt` (1-based), exponential with a cap
pub fn backoff_delay(attempt: u32) -> ChronoDuration {
    let exponent = attempt.saturating_sub(1).min(20);
    let secs = BASE_DELAY_SECS
        .saturating_mul(1_i64 << exponent)
        .min(MAX_DELAY_SECS);
    ChronoDuration::seconds(secs)
}

/// Idle / Syncing / Backoff transitions
#[derive(Debug, Clone)]
pub struct SyncStateMachine {
    state: SchedulerState,
    failed_attempts: u32,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateMachine {
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Idle,
            failed_attempts: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Feed a trigger; returns true when a sync round should start now
    ///
    /// Triggers arriving while a round is in flight are coalesced. While
    /// backing off, only a manual trigger or the backoff deadline starts a round.
    pub fn on_trigger(&mut self, trigger: Trigger, now: DateTime<Utc>) -> bool {
        let start = match self.state {
            SchedulerState::Syncing => false,
            SchedulerState::Idle => true,
            SchedulerState::Backoff { until, .. } => trigger == Trigger::Manual || now >= until,
        };

        if start {
            self.state = SchedulerState::Syncing;
        } else {
            log::debug!("Coalesced {:?} trigger while {}", trigger, self.state.as_str());
        }
        start
    }

    /// Round finished and the upload was confirmed
    pub fn on_success(&mut self) {
        self.failed_attempts = 0;
        self.state = SchedulerState::Idle;
    }

    /// Round failed in a way retrying cannot fix (e.g. wrong secret)
    pub fn on_fatal(&mut self) {
        self.failed_attempts = 0;
        self.state = SchedulerState::Idle;
    }

    /// Round failed transiently; schedule the next attempt
    pub fn on_retryable_failure(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        let until = now + backoff_delay(self.failed_attempts);
        self.state = SchedulerState::Backoff {
            attempt: self.failed_attempts,
            until,
        };
        until
    }
}

// ============================================================================
// Background Driver
// ============================================================================

/// Background scheduler for automatic sync operations
#[derive(Clone)]
pub struct BackgroundScheduler {
    manager: Arc<SyncManager>,
    running: Arc<AtomicBool>,
    trigger_tx: Arc<StdMutex<Option<mpsc::Sender<Trigger>>>>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

impl BackgroundScheduler {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self {
            manager,
            running: Arc::new(AtomicBool::new(false)),
            trigger_tx: Arc::new(StdMutex::new(None)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Start background scheduler task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        // Claim the flag before the first await so concurrent starts see it
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval_hours = self.manager.get_config().await.sync_interval_hours;
        if let Err(e) = validate_interval_hours(interval_hours) {
            self.running.store(false, Ordering::SeqCst);
            return Err(SchedulerError::InvalidInterval(e.to_string()));
        }

        let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        self.manager.attach_trigger_sender(tx.clone());
        *lock(&self.trigger_tx) = Some(tx);

        let handle = tokio::spawn(Self::scheduler_loop(
            self.running.clone(),
            self.manager.clone(),
            self.manager.subscribe_interval(),
            rx,
        ));
        *lock(&self.task_handle) = Some(handle);

        log::info!("Background scheduler started (interval: {:.2} hours)", interval_hours);
        Ok(())
    }

    /// Stop background scheduler task
    ///
    /// A round already in flight is not interrupted; the loop exits after it.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        self.manager.detach_trigger_sender();
        // Dropping the last sender closes the channel and ends the loop
        lock(&self.trigger_tx).take();

        let handle = lock(&self.task_handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Scheduler task ended abnormally: {}", e);
            }
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request a sync now, overriding any backoff
    pub fn trigger_now(&self) -> Result<(), SchedulerError> {
        let guard = lock(&self.trigger_tx);
        let tx = guard.as_ref().ok_or(SchedulerError::NotRunning)?;
        if tx.try_send(Trigger::Manual).is_err() {
            log::debug!("Manual trigger coalesced with pending triggers");
        }
        Ok(())
    }

    /// Change the timer interval; a running loop picks it up immediately
    pub async fn update_interval(&self, interval_hours: f64) -> Result<(), SchedulerError> {
        validate_interval_hours(interval_hours)
            .map_err(|e| SchedulerError::InvalidInterval(e.to_string()))?;

        self.manager.set_sync_interval_hours(interval_hours).await;

        log::info!("Scheduler interval updated to {:.2} hours", interval_hours);
        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        manager: Arc<SyncManager>,
        mut interval_rx: watch::Receiver<Duration>,
        mut triggers: mpsc::Receiver<Trigger>,
    ) {
        let interval = *interval_rx.borrow_and_update();
        let mut ticker = new_ticker(interval);

        log::info!("Scheduler loop started (interval: {:?})", interval);

        loop {
            let backoff_wait = match manager.scheduler_state() {
                SchedulerState::Backoff { until, .. } => {
                    Some((until - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                }
                _ => None,
            };

            let trigger = tokio::select! {
                _ = ticker.tick() => Some(Trigger::Timer),
                received = triggers.recv() => match received {
                    Some(trigger) => Some(trigger),
                    None => break,
                },
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let interval = *interval_rx.borrow_and_update();
                    ticker = new_ticker(interval);
                    log::info!("Scheduler interval now {:?}", interval);
                    None
                }
                _ = tokio::time::sleep(backoff_wait.unwrap_or(Duration::ZERO)), if backoff_wait.is_some() => {
                    Some(Trigger::BackoffElapsed)
                }
            };

            if !running.load(Ordering::SeqCst) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            let Some(trigger) = trigger else {
                continue;
            };

            log::debug!("Sync trigger: {:?}", trigger);

            match manager.handle_trigger(trigger).await {
                Some(Ok(result)) => {
                    log::info!(
                        "Background sync completed: pulled={}, uploaded={}, pruned={}, conflicts={}",
                        result.pulled_entries,
                        result.uploaded_entries,
                        result.pruned_entries,
                        result.conflicts_resolved
                    );
                }
                Some(Err(e)) => {
                    log::warn!("Background sync failed: {}", e);
                }
                None => {}
            }
        }

        log::info!("Scheduler loop exited");
    }
}

/// Timer whose first tick is one full interval from now
fn new_ticker(interval: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("Scheduler mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::api::MemoryRemoteStore;
    use crate::sync::models::SyncConfig;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_800_000_000 + secs, 0).unwrap()
    }

    fn test_manager() -> Arc<SyncManager> {
        let db = Arc::new(Database::in_memory().unwrap());
        let config = SyncConfig {
            encryption_secret: "secret".to_string(),
            pantry_id: "pantry".to_string(),
            remote_basket_key: "history".to_string(),
            ..SyncConfig::default()
        };
        Arc::new(SyncManager::new(config, db, Arc::new(MemoryRemoteStore::new())).unwrap())
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        assert_eq!(backoff_delay(1), ChronoDuration::seconds(30));
        assert_eq!(backoff_delay(2), ChronoDuration::seconds(60));
        assert_eq!(backoff_delay(3), ChronoDuration::seconds(120));
        assert_eq!(backoff_delay(7), ChronoDuration::seconds(1800));
        assert_eq!(backoff_delay(60), ChronoDuration::seconds(1800));
    }

    #[test]
    fn test_idle_starts_on_any_trigger() {
        for trigger in [Trigger::Timer, Trigger::Threshold, Trigger::Manual] {
            let mut machine = SyncStateMachine::new();
            assert!(machine.on_trigger(trigger, at(0)));
            assert_eq!(machine.state(), SchedulerState::Syncing);
        }
    }

    #[test]
    fn test_triggers_coalesce_while_syncing() {
        let mut machine = SyncStateMachine::new();
        assert!(machine.on_trigger(Trigger::Timer, at(0)));

        assert!(!machine.on_trigger(Trigger::Threshold, at(1)));
        assert!(!machine.on_trigger(Trigger::Manual, at(2)));
        assert_eq!(machine.state(), SchedulerState::Syncing);
    }

    #[test]
    fn test_backoff_transitions() {
        let mut machine = SyncStateMachine::new();
        machine.on_trigger(Trigger::Timer, at(0));

        let until = machine.on_retryable_failure(at(0));
        assert_eq!(until, at(30));
        assert_eq!(machine.state(), SchedulerState::Backoff { attempt: 1, until: at(30) });

        // Non-manual triggers are ignored until the deadline
        assert!(!machine.on_trigger(Trigger::Threshold, at(10)));
        assert!(!machine.on_trigger(Trigger::Timer, at(29)));

        assert!(machine.on_trigger(Trigger::BackoffElapsed, at(30)));
        let until = machine.on_retryable_failure(at(30));
        assert_eq!(until, at(90));
        assert_eq!(machine.state(), SchedulerState::Backoff { attempt: 2, until: at(90) });

        // Manual trigger overrides backoff
        assert!(machine.on_trigger(Trigger::Manual, at(31)));
        machine.on_success();
        assert_eq!(machine.state(), SchedulerState::Idle);

        // Success resets the attempt counter
        machine.on_trigger(Trigger::Timer, at(100));
        assert_eq!(machine.on_retryable_failure(at(100)), at(130));
    }

    #[test]
    fn test_fatal_returns_to_idle() {
        let mut machine = SyncStateMachine::new();
        machine.on_trigger(Trigger::Manual, at(0));
        machine.on_fatal();
        assert_eq!(machine.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_scheduler_new() {
        let scheduler = BackgroundScheduler::new(test_manager());
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let scheduler = BackgroundScheduler::new(test_manager());

        let result = scheduler.stop().await;
        assert!(matches!(result, Err(SchedulerError::NotRunning)));
        assert!(matches!(scheduler.trigger_now(), Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let scheduler = BackgroundScheduler::new(test_manager());

        scheduler.start().await.unwrap();
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_one_loop() {
        let scheduler = BackgroundScheduler::new(test_manager());

        let (first, second) = tokio::join!(scheduler.start(), scheduler.start());
        let started = [first.is_ok(), second.is_ok()];
        assert_eq!(started.iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            if first.is_err() { first } else { second },
            Err(SchedulerError::AlreadyRunning)
        ));

        scheduler.stop().await.unwrap();
        assert!(lock(&scheduler.task_handle).is_none());
        assert!(scheduler.start().await.is_ok());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_interval() {
        let scheduler = BackgroundScheduler::new(test_manager());

        assert!(matches!(
            scheduler.update_interval(0.1).await,
            Err(SchedulerError::InvalidInterval(_))
        ));
        assert!(matches!(
            scheduler.update_interval(48.0).await,
            Err(SchedulerError::InvalidInterval(_))
        ));
        assert!(scheduler.update_interval(2.0).await.is_ok());
        assert_eq!(scheduler.manager.get_config().await.sync_interval_hours, 2.0);
    }

    #[tokio::test]
    async fn test_manual_trigger_runs_sync() {
        let manager = test_manager();
        let scheduler = BackgroundScheduler::new(manager.clone());
        scheduler.start().await.unwrap();

        manager
            .capture(crate::sync::models::CaptureEvent::new(
                "https://manual.example",
                "Manual",
                Utc::now().timestamp_millis(),
            ))
            .unwrap();
        scheduler.trigger_now().unwrap();

        let mut synced = false;
        for _ in 0..100 {
            let status = manager.status().unwrap();
            if status.last_sync_time.is_some() && status.state == SchedulerState::Idle {
                assert_eq!(status.pending_entries, 0);
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced, "manual trigger did not complete a sync");

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_retimes_running_loop() {
        let manager = test_manager();
        let scheduler = BackgroundScheduler::new(manager.clone());
        scheduler.start().await.unwrap();

        manager
            .capture(crate::sync::models::CaptureEvent::new(
                "https://timer.example",
                "",
                Utc::now().timestamp_millis(),
            ))
            .unwrap();
        scheduler.update_interval(0.5).await.unwrap();
        assert!(scheduler.is_running());

        // Well before the original one-hour tick
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;

        let mut synced = false;
        for _ in 0..100 {
            if manager.status().unwrap().last_sync_time.is_some() {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced, "timer did not fire on the new interval");

        scheduler.stop().await.unwrap();
    }
}
