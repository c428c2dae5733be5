//! Synced-record index
//!
//! Remembers every raw record that has contributed to a persisted ledger
//! entry, keyed by (device, device user, raw timestamp) and the record's
//! status code, since an entry and an exit can land on the same second.
//! Lookups are synchronous so reconciliation never suspends.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::types::DedupKey;

#[derive(Debug, Default)]
pub struct DedupIndex {
    synced: RwLock<HashSet<SyncedKey>>,
}

/// One persisted record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedKey {
    #[serde(flatten)]
    pub key: DedupKey,
    pub status: u8,
}

impl SyncedKey {
    pub fn new(key: DedupKey, status: u8) -> Self {
        Self { key, status }
    }
}

/// Serializable copy of the index, for hosts that persist it between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupSnapshot {
    pub keys: Vec<SyncedKey>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: DedupSnapshot) -> Self {
        Self {
            synced: RwLock::new(snapshot.keys.into_iter().collect()),
        }
    }

    pub fn is_synced(&self, key: &DedupKey, status: u8) -> bool {
        self.synced.read().contains(&SyncedKey::new(key.clone(), status))
    }

    pub fn mark_synced<'a>(
        &self,
        records: impl IntoIterator<Item = (&'a DedupKey, u8)>,
    ) -> usize {
        let mut synced = self.synced.write();
        let mut added = 0;
        for (key, status) in records {
            if synced.insert(SyncedKey::new(key.clone(), status)) {
                added += 1;
            }
        }
        if added > 0 {
            log::debug!("[dedup] Marked {} records as synced ({} total)", added, synced.len());
        }
        added
    }

    pub fn len(&self) -> usize {
        self.synced.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.synced.read().is_empty()
    }

    /// Forget keys older than `cutoff` (epoch seconds) for one device.
    /// Only safe once those records can no longer be on the device.
    pub fn prune_device_before(&self, device_id: &str, cutoff: i64) -> usize {
        let mut synced = self.synced.write();
        let before = synced.len();
        synced.retain(|s| s.key.device_id != device_id || s.key.timestamp >= cutoff);
        let removed = before - synced.len();
        if removed > 0 {
            log::info!(
                "[dedup] Pruned {} synced keys for {} before {}",
                removed,
                device_id,
                cutoff
            );
        }
        removed
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        let mut keys: Vec<SyncedKey> = self.synced.read().iter().cloned().collect();
        keys.sort();
        DedupSnapshot { keys }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        Ok(Self::from_snapshot(serde_json::from_str(json)?))
    }
}
