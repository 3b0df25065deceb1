//! Merge Engine - reconciles local and remote history
//!
//! Pure function: union by entry id, drop entries older than the retention
//! window, sort deterministically. No I/O.

use std::collections::HashMap;

use super::models::{EntryId, HistoryEntry};

/// Merge local and remote entries into the set to upload
///
/// An entry survives when `timestamp >= now_ms - retention_ms`; an entry
/// exactly on the boundary is kept. The result is sorted by timestamp, then
/// by id, so identical inputs always produce identical output.
pub fn merge(
    local: &[HistoryEntry],
    remote: &[HistoryEntry],
    now_ms: i64,
    retention_ms: i64,
) -> Vec<HistoryEntry> {
    let cutoff = now_ms.saturating_sub(retention_ms);

    let mut by_id: HashMap<EntryId, &HistoryEntry> = HashMap::with_capacity(local.len() + remote.len());
    for entry in remote.iter().chain(local) {
        if entry.timestamp() < cutoff {
            continue;
        }
        // Same id means same content, so whichever copy lands first is kept
        by_id.entry(entry.id()).or_insert(entry);
    }

    let mut merged: Vec<(EntryId, HistoryEntry)> = by_id
        .into_iter()
        .map(|(id, entry)| (id, entry.clone()))
        .collect();
    merged.sort_by(|(a_id, a), (b_id, b)| {
        a.timestamp().cmp(&b.timestamp()).then_with(|| a_id.cmp(b_id))
    });

    merged.into_iter().map(|(_, entry)| entry).collect()
}
