//! # Bar123 History Sync
//!
//! Native companion that encrypts captured browsing history and syncs it
//! across devices through a shared Pantry basket.

pub mod db;
pub mod sync;

use db::{Database, DbError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use sync::{
    BackgroundScheduler, CaptureEvent, ConfigError, PantryClient, RemoteError, SchedulerError,
    SyncConfig, SyncManager, SyncManagerError,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;

/// How long shutdown waits for blocking tasks (the stdin reader) to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncManagerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Stdin Protocol
// ============================================================================

/// One line read from the browser side
#[derive(Debug, PartialEq)]
enum Command {
    Capture(CaptureEvent),
    Sync,
    Status,
}

/// Parse one input line; blank lines yield `None`
fn parse_line(line: &str) -> Result<Option<Command>, serde_json::Error> {
    match line.trim() {
        "" => Ok(None),
        "sync" => Ok(Some(Command::Sync)),
        "status" => Ok(Some(Command::Status)),
        json => serde_json::from_str(json).map(|event| Some(Command::Capture(event))),
    }
}

fn handle_line(manager: &SyncManager, scheduler: &BackgroundScheduler, line: &str) {
    match parse_line(line) {
        Ok(Some(Command::Capture(event))) => match manager.capture(event) {
            Ok(true) => log::debug!("Captured history entry"),
            Ok(false) => log::debug!("Duplicate capture ignored"),
            Err(e) => log::warn!("Capture rejected: {}", e),
        },
        Ok(Some(Command::Sync)) => {
            if let Err(e) = scheduler.trigger_now() {
                log::warn!("Manual sync not scheduled: {}", e);
            }
        }
        Ok(Some(Command::Status)) => match manager.status() {
            Ok(status) => println!("{}", status.describe()),
            Err(e) => log::error!("Failed to read sync status: {}", e),
        },
        Ok(None) => {}
        Err(e) => log::warn!("Ignoring malformed input line: {}", e),
    }
}

// ============================================================================
// Companion Loop
// ============================================================================

/// Load the persisted config and apply environment overrides
///
/// Overrides are not written back, so a secret supplied through the
/// environment never lands in the database.
pub fn load_config(db: &Database) -> Result<SyncConfig, ConfigError> {
    let config = SyncConfig::load_or_create(db)?.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Run the scheduler and feed stdin captures into it until stdin closes
/// or Ctrl-C
pub async fn serve(db: Arc<Database>, config: SyncConfig) -> Result<(), AppError> {
    let store = PantryClient::new(
        config.remote_base_url.clone(),
        config.pantry_id.clone(),
        config.device_id.clone(),
        Duration::from_secs(config.request_timeout_secs),
    )?;

    log::info!(
        "Syncing device {} ({}) to basket '{}'",
        config.device_name,
        config.device_id,
        config.basket_key()?
    );

    let manager = Arc::new(SyncManager::new(config, db, Arc::new(store))?);
    let scheduler = BackgroundScheduler::new(manager.clone());
    scheduler.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&manager, &scheduler, &line),
                None => {
                    log::info!("Input closed, shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    scheduler.stop().await?;
    Ok(())
}

/// Drive `fut` to completion, then shut the runtime down without waiting
/// on blocking tasks that cannot finish, such as a pending stdin read
fn block_on_then_shutdown<F: Future>(runtime: Runtime, fut: F) -> F::Output {
    let output = runtime.block_on(fut);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    output
}

// ============================================================================
// Application Entry Point
// ============================================================================

pub fn run() {
    // Load .env file for sync settings
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app_dir = match directories::ProjectDirs::from("com", "bar123", "bar123-sync") {
        Some(dirs) => dirs,
        None => {
            log::error!("Failed to get app directories - cannot determine data location");
            eprintln!("FATAL: Failed to get app directories. Please ensure HOME environment variable is set.");
            std::process::exit(1);
        }
    };

    let data_dir = app_dir.data_dir();

    if let Err(e) = std::fs::create_dir_all(data_dir) {
        log::error!("Failed to create data directory: {}", e);
        eprintln!("FATAL: Failed to create data directory at {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    let db_path = data_dir.join("history-sync.db");
    log::info!("Database path: {:?}", db_path);

    let db = match Database::new(db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            log::error!("Failed to initialize database: {}", e);
            eprintln!("FATAL: Database initialization failed: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Database initialized successfully");

    let config = match load_config(&db) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid sync configuration: {}", e);
            eprintln!("FATAL: {}. Set BAR123_* variables or a .env file.", e);
            std::process::exit(1);
        }
    };

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = block_on_then_shutdown(runtime, serve(db, config)) {
        log::error!("History sync stopped with error: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("sync\n").unwrap(), Some(Command::Sync));
        assert_eq!(parse_line("status").unwrap(), Some(Command::Status));
    }

    #[test]
    fn test_parse_capture_event() {
        let line = r#"{"url":"https://example.com","title":"Example","timestamp":1700000000000}"#;

        assert_eq!(
            parse_line(line).unwrap(),
            Some(Command::Capture(CaptureEvent::new("https://example.com", "Example", 1_700_000_000_000)))
        );
    }

    #[test]
    fn test_parse_malformed_line() {
        assert!(parse_line("{not json").is_err());
        assert!(parse_line("resync").is_err());
    }

    #[test]
    fn test_shutdown_does_not_wait_for_blocked_reader() {
        let runtime = Runtime::new().unwrap();
        let started = std::time::Instant::now();

        let value = block_on_then_shutdown(runtime, async {
            // Stands in for a stdin read that never returns
            let _ = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(30)));
            7
        });

        assert_eq!(value, 7);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_load_config_requires_secret() {
        let db = Database::in_memory().unwrap();
        let mut config = SyncConfig::load_or_create(&db).unwrap();
        config.pantry_id = "pantry".to_string();
        config.remote_basket_key = "history".to_string();
        config.save(&db).unwrap();

        // Only meaningful without an ambient override
        if std::env::var("BAR123_ENCRYPTION_SECRET").is_err() {
            assert!(matches!(load_config(&db), Err(ConfigError::MissingSecret)));
        }
    }
}
