//! Remote Store Client - HTTP communication with the Pantry key-value store
//!
//! The remote holds one JSON envelope per basket wrapping the encrypted blob.
//! Pantry has no transactions or ETags, so concurrent writers are detected
//! application-side: every envelope carries a monotonically increasing
//! revision, and a conditional put re-reads the basket and refuses to write
//! when the revision moved since the caller's fetch.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use super::crypto::{compute_sha256, decode_base64, encode_base64};

/// Opaque freshness marker returned by `fetch`, required by a conditional `put`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FreshnessToken(String);

impl FreshnessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Token for a basket that has never been written
    ///
    /// A put with this token only succeeds while the basket is still absent.
    pub fn absent() -> Self {
        Self::from_revision(0)
    }

    fn from_revision(revision: u64) -> Self {
        Self(revision.to_string())
    }

    fn revision(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for FreshnessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ciphertext currently stored remotely plus its freshness token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBlob {
    pub ciphertext: Vec<u8>,
    pub token: FreshnessToken,
}

/// Key-value object store holding encrypted history baskets
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current blob at `key`, or `None` when the basket was never written
    async fn fetch(&self, key: &str) -> Result<Option<RemoteBlob>, RemoteError>;

    /// Replace the blob at `key`
    ///
    /// With `expected`, fails with `RemoteError::Conflict` if the basket
    /// changed since that token was issued (`FreshnessToken::absent()` means
    /// it must not exist yet). Without it, always writes.
    async fn put(
        &self,
        key: &str,
        ciphertext: &[u8],
        expected: Option<&FreshnessToken>,
    ) -> Result<FreshnessToken, RemoteError>;
}

// ============================================================================
// Pantry HTTP Client
// ============================================================================

/// Envelope stored in a Pantry basket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketEnvelope {
    pub revision: u64,
    pub device_id: String,
    pub updated_at: String,
    /// Base64 encrypted history blob
    pub payload: String,
    /// SHA-256 hex of the decoded payload
    pub checksum: String,
}

/// API client for the Pantry object store
pub struct PantryClient {
    client: Client,
    base_url: String,
    pantry_id: String,
    device_id: String,
}

impl PantryClient {
    /// Create new API client
    pub fn new(
        base_url: impl Into<String>,
        pantry_id: impl Into<String>,
        device_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bar123-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            pantry_id: pantry_id.into(),
            device_id: device_id.into(),
        })
    }

    fn basket_url(&self, key: &str) -> Result<url::Url, RemoteError> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|e| RemoteError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;

        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push(&self.pantry_id)
            .push("basket")
            .push(key);

        Ok(url)
    }

    /// Download the envelope stored at `key`
    async fn get_envelope(&self, key: &str) -> Result<Option<BasketEnvelope>, RemoteError> {
        let response = self.client
            .get(self.basket_url(key)?)
            .send()
            .await?;

        let status = response.status();

        // Handle missing basket as empty data (first sync)
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            // Pantry answers 400 rather than 404 for unknown baskets
            if body.to_lowercase().contains("does not exist") {
                return Ok(None);
            }
            return Err(RemoteError::UnexpectedStatus {
                status: status.as_u16(),
                message: body,
            });
        }

        if !status.is_success() {
            return Err(handle_error(response).await);
        }

        let envelope = response
            .json::<BasketEnvelope>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("Malformed basket envelope: {}", e)))?;

        Ok(Some(envelope))
    }
}

#[async_trait]
impl RemoteStore for PantryClient {
    async fn fetch(&self, key: &str) -> Result<Option<RemoteBlob>, RemoteError> {
        let envelope = match self.get_envelope(key).await? {
            Some(envelope) => envelope,
            None => {
                log::info!("Basket '{}' does not exist yet", key);
                return Ok(None);
            }
        };

        let ciphertext = decode_base64(&envelope.payload)
            .map_err(|e| RemoteError::InvalidResponse(format!("Invalid payload encoding: {}", e)))?;

        if compute_sha256(&ciphertext) != envelope.checksum {
            return Err(RemoteError::InvalidResponse(
                "Checksum mismatch - data may be corrupted or tampered".to_string(),
            ));
        }

        log::debug!(
            "Fetched basket '{}' (revision {}, {} bytes, written by {})",
            key,
            envelope.revision,
            ciphertext.len(),
            envelope.device_id
        );

        Ok(Some(RemoteBlob {
            ciphertext,
            token: FreshnessToken::from_revision(envelope.revision),
        }))
    }

    async fn put(
        &self,
        key: &str,
        ciphertext: &[u8],
        expected: Option<&FreshnessToken>,
    ) -> Result<FreshnessToken, RemoteError> {
        // Application-side compare-and-swap: re-read the current revision
        let current = self.get_envelope(key).await?.map(|e| e.revision);

        if let Some(expected) = expected {
            if Some(current.unwrap_or(0)) != expected.revision() {
                log::warn!(
                    "Basket '{}' changed remotely (expected revision {}, found {:?})",
                    key,
                    expected,
                    current
                );
                return Err(RemoteError::Conflict);
            }
        }

        let revision = current.unwrap_or(0) + 1;
        let envelope = BasketEnvelope {
            revision,
            device_id: self.device_id.clone(),
            updated_at: Utc::now().to_rfc3339(),
            payload: encode_base64(ciphertext),
            checksum: compute_sha256(ciphertext),
        };

        // POST creates or fully replaces the basket
        let response = self.client
            .post(self.basket_url(key)?)
            .json(&envelope)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(handle_error(response).await);
        }

        log::info!("Uploaded basket '{}' (revision {}, {} bytes)", key, revision, ciphertext.len());
        Ok(FreshnessToken::from_revision(revision))
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// In-process store with atomic compare-and-swap
///
/// Used for tests and local multi-device simulations. Supports injecting
/// transport failures and foreign writes.
#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    baskets: HashMap<String, (Vec<u8>, u64)>,
    failing_fetches: usize,
    failing_puts: usize,
    interfering_puts: usize,
    put_count: usize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            log::warn!("Memory store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Make the next `n` fetches fail with a transport error
    pub fn fail_next_fetches(&self, n: usize) {
        self.state().failing_fetches = n;
    }

    /// Make the next `n` puts fail with a transport error
    pub fn fail_next_puts(&self, n: usize) {
        self.state().failing_puts = n;
    }

    /// Simulate another device writing just before each of the next `n` puts
    pub fn interfere_next_puts(&self, n: usize) {
        self.state().interfering_puts = n;
    }

    /// Successful writes so far
    pub fn put_count(&self) -> usize {
        self.state().put_count
    }

    /// Raw ciphertext currently stored at `key`
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.state().baskets.get(key).map(|(data, _)| data.clone())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch(&self, key: &str) -> Result<Option<RemoteBlob>, RemoteError> {
        let mut state = self.state();

        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(RemoteError::ServerError("injected fetch failure".to_string()));
        }

        Ok(state.baskets.get(key).map(|(data, revision)| RemoteBlob {
            ciphertext: data.clone(),
            token: FreshnessToken::from_revision(*revision),
        }))
    }

    async fn put(
        &self,
        key: &str,
        ciphertext: &[u8],
        expected: Option<&FreshnessToken>,
    ) -> Result<FreshnessToken, RemoteError> {
        let mut state = self.state();

        if state.failing_puts > 0 {
            state.failing_puts -= 1;
            return Err(RemoteError::ServerError("injected put failure".to_string()));
        }

        if state.interfering_puts > 0 {
            state.interfering_puts -= 1;
            let entry = state.baskets.entry(key.to_string()).or_insert((Vec::new(), 0));
            entry.1 += 1;
        }

        let current = state.baskets.get(key).map(|(_, revision)| *revision);

        if let Some(expected) = expected {
            if Some(current.unwrap_or(0)) != expected.revision() {
                return Err(RemoteError::Conflict);
            }
        }

        let revision = current.unwrap_or(0) + 1;
        state.baskets.insert(key.to_string(), (ciphertext.to_vec(), revision));
        state.put_count += 1;

        Ok(FreshnessToken::from_revision(revision))
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote basket was modified by another device")]
    Conflict,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Unexpected response {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Invalid remote url: {0}")]
    InvalidUrl(String),
}

impl RemoteError {
    /// Network or backend failure worth retrying later
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RemoteError::Request(_)
                | RemoteError::ServerError(_)
                | RemoteError::RateLimitExceeded
                | RemoteError::UnexpectedStatus { .. }
        )
    }
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();

    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => RemoteError::Conflict,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimitExceeded,
        s if s.is_server_error() => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            RemoteError::ServerError(format!("{}: {}", status, msg))
        }
        _ => {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            RemoteError::UnexpectedStatus {
                status: status.as_u16(),
                message,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
