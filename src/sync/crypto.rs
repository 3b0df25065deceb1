//! Sync Crypto Module - History codec
//!
//! Turns a batch of history entries into an opaque, self-describing blob and back.
//! - Secret → HKDF-SHA256 → 256-bit history key (recomputed per sync, never stored)
//! - JSON serialization, then gzip, then AES-256-GCM with a random nonce
//! - Zeroize for key material cleanup
//!
//! Blob layout: `MAGIC (4) | nonce (12) | ciphertext + tag (16)`.
//! Compression happens before encryption; ciphertext does not compress.

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use std::io::{Read, Write};
use zeroize::Zeroize;

use super::models::{HistoryEntry, WireEntry};

const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const MAGIC: &[u8; 4] = b"HSY1";
const HEADER_LEN: usize = MAGIC.len() + NONCE_LEN;

/// Upper bound for decompressed payloads
const MAX_DECOMPRESSED_BYTES: u64 = 64 * 1024 * 1024;

const KEY_SALT: &[u8] = b"bar123-history-sync-salt-v1";
const KEY_INFO: &[u8] = b"bar123-history-sync-key-v1";

// ============================================================================
// Key Derivation
// ============================================================================

/// History encryption key; zeroized on drop
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Derive the history key from the user's secret using HKDF-SHA256
    ///
    /// Every device sharing the secret derives the same key, so the salt is
    /// a fixed application constant rather than per-device random bytes.
    pub fn derive(secret: &str) -> Result<Self, CodecError> {
        if secret.is_empty() {
            return Err(CodecError::KeyDerivation("Secret cannot be empty".to_string()));
        }

        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, KEY_SALT);
        let prk = salt.extract(secret.as_bytes());

        let info: &[&[u8]] = &[KEY_INFO];
        let okm = prk
            .expand(info, KeyType(KEY_LEN))
            .map_err(|_| CodecError::KeyDerivation("HKDF expansion failed".to_string()))?;

        let mut key = [0u8; KEY_LEN];
        okm.fill(&mut key)
            .map_err(|_| CodecError::KeyDerivation("Failed to fill key bytes".to_string()))?;

        Ok(Self(key))
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn aead_key(&self) -> Result<LessSafeKey, CodecError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.0)
            .map_err(|e| CodecError::Encryption(format!("Key error: {:?}", e)))?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Custom key type for HKDF output
struct KeyType(usize);

impl hkdf::KeyType for KeyType {
    fn len(&self) -> usize {
        self.0
    }
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Serialize, compress and encrypt a batch of entries
pub fn encode(entries: &[HistoryEntry], key: &EncryptionKey) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(entries)
        .map_err(|e| CodecError::Format(format!("Serialization error: {}", e)))?;

    let compressed = gzip_compress(&json)
        .map_err(|e| CodecError::Format(format!("Compression failed: {}", e)))?;

    log::debug!(
        "Compression: {} bytes → {} bytes ({} entries)",
        json.len(),
        compressed.len(),
        entries.len()
    );

    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|e| CodecError::Encryption(format!("RNG error: {:?}", e)))?;

    let aead = key.aead_key()?;
    let mut sealed = compressed;
    aead.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(MAGIC),
        &mut sealed,
    )
    .map_err(|e| CodecError::Encryption(format!("Encryption error: {:?}", e)))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + sealed.len());
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Decrypt, decompress and deserialize a blob
///
/// An empty blob is the never-synced case and yields no entries. Entries
/// that fail validation (empty url or device id) are dropped with a warning.
pub fn decode(blob: &[u8], key: &EncryptionKey) -> Result<Vec<HistoryEntry>, CodecError> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }

    if blob.len() < HEADER_LEN + TAG_LEN || &blob[..MAGIC.len()] != MAGIC {
        return Err(CodecError::Decryption);
    }

    let nonce = Nonce::try_assume_unique_for_key(&blob[MAGIC.len()..HEADER_LEN])
        .map_err(|_| CodecError::Decryption)?;

    let aead = key.aead_key()?;
    let mut ciphertext = blob[HEADER_LEN..].to_vec();
    let compressed = aead
        .open_in_place(nonce, Aad::from(MAGIC), &mut ciphertext)
        .map_err(|_| CodecError::Decryption)?;

    let json = gzip_decompress(compressed)
        .map_err(|e| CodecError::Format(format!("Decompression failed: {}", e)))?;

    let wire: Vec<WireEntry> = serde_json::from_slice(&json)
        .map_err(|e| CodecError::Format(format!("Deserialization error: {}", e)))?;

    let total = wire.len();
    let entries: Vec<HistoryEntry> = wire
        .into_iter()
        .filter_map(|raw| match HistoryEntry::try_from(raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Dropping invalid remote history entry: {}", e);
                None
            }
        })
        .collect();

    if entries.len() < total {
        log::warn!("Dropped {} of {} remote entries", total - entries.len(), total);
    }
    Ok(entries)
}

// ============================================================================
// Helpers
// ============================================================================

/// Gzip-compress bytes
pub fn gzip_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Gzip-decompress bytes, refusing output beyond `MAX_DECOMPRESSED_BYTES`
pub fn gzip_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_DECOMPRESSED_BYTES + 1)
        .read_to_end(&mut out)?;

    if out.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "decompressed payload too large",
        ));
    }
    Ok(out)
}

/// Compute SHA-256 checksum of data (returns hex string)
pub fn compute_sha256(data: &[u8]) -> String {
    let digest_value = digest(&SHA256, data);
    hex::encode(digest_value.as_ref())
}

/// Encode bytes to base64 string (for transmission)
pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode base64 string to bytes
pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data)
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed - invalid key or corrupted data")]
    Decryption,

    #[error("Invalid payload format: {0}")]
    Format(String),
}

// ============================================================================
// Tests
// ============================================================================
