//! Durable cache of resolved base addresses.
//!
//! One JSON file per compiled-pattern identity, stored under a cache
//! directory (the OS temp dir unless overridden). An entry records which
//! process instance it was resolved against; any identity mismatch on load
//! deletes the entry, so results from a previous run of the target are
//! discarded automatically.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::memory::ProcessIdentity;
use crate::pattern::PatternIdentity;

const CACHE_FILE_PREFIX: &str = "telemon-scan-";

/// A persisted scan result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResultEntry {
    pub pattern_identity: String,
    pub process: ProcessIdentity,
    pub base_address: u64,
    pub created_at: DateTime<Utc>,
}

/// File-backed store of scan results, keyed by pattern identity.
pub struct AddressCache {
    dir: PathBuf,
}

impl AddressCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache in the OS temp directory (survives restarts of this tool but
    /// not of the machine, which is the useful lifetime of a base address).
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir())
    }

    fn entry_path(&self, identity: &PatternIdentity) -> PathBuf {
        self.dir
            .join(format!("{CACHE_FILE_PREFIX}{identity}.json"))
    }

    /// Look up the cached base address for a pattern, valid only while the
    /// process identity still matches. A stale entry is deleted before
    /// returning `None`.
    pub fn get(&self, identity: &PatternIdentity, current: &ProcessIdentity) -> Option<u64> {
        let path = self.entry_path(identity);
        let content = fs::read_to_string(&path).ok()?;

        let entry: ScanResultEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Discarding unparseable cache entry {}: {e}", path.display());
                let _ = fs::remove_file(&path);
                return None;
            }
        };

        if entry.process != *current {
            debug!(
                "Cache entry is for {} but target is {}; discarding",
                entry.process, current
            );
            let _ = fs::remove_file(&path);
            return None;
        }

        debug!(
            "Cache hit for {identity}: base {:#x} (created {})",
            entry.base_address, entry.created_at
        );
        Some(entry.base_address)
    }

    /// Persist a resolved base address, replacing any prior entry for the
    /// same pattern identity. The write goes through a temp file and a
    /// rename so a concurrent reader never sees a torn entry.
    pub fn put(
        &self,
        identity: &PatternIdentity,
        process: &ProcessIdentity,
        base_address: u64,
    ) -> Result<()> {
        let entry = ScanResultEntry {
            pattern_identity: identity.as_str().to_string(),
            process: process.clone(),
            base_address,
            created_at: Utc::now(),
        };

        let path = self.entry_path(identity);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_string_pretty(&entry)?)?;
        fs::rename(&staging, &path)?;
        info!("Cached base {base_address:#x} at {}", path.display());
        Ok(())
    }

    /// Delete the entry for a pattern identity, if any. Called whenever a
    /// cached address fails its liveness check.
    pub fn invalidate(&self, identity: &PatternIdentity) {
        let path = self.entry_path(identity);
        if fs::remove_file(&path).is_ok() {
            debug!("Invalidated cache entry {}", path.display());
        }
    }

    /// All parseable entries currently on disk.
    pub fn entries(&self) -> Vec<ScanResultEntry> {
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for file in dir.flatten() {
            let name = file.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(CACHE_FILE_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(file.path()) {
                if let Ok(entry) = serde_json::from_str(&content) {
                    entries.push(entry);
                }
            }
        }
        entries
    }

    /// Remove every cache entry; returns the number removed.
    pub fn clear(&self) -> usize {
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for file in dir.flatten() {
            let name = file.file_name();
            let name = name.to_string_lossy().to_string();
            if name.starts_with(CACHE_FILE_PREFIX)
                && name.ends_with(".json")
                && fs::remove_file(file.path()).is_ok()
            {
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Bindings, PatternTemplate};
    use crate::scan::RuleSet;
    use tempfile::TempDir;

    fn identity() -> PatternIdentity {
        PatternTemplate::parse("AA BB CC DD")
            .unwrap()
            .compile(&Bindings::new())
            .unwrap()
            .identity(&RuleSet::default())
    }

    #[test]
    fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let cache = AddressCache::new(dir.path());
        let id = identity();
        let process = ProcessIdentity::new(100, 1, "Target.exe");

        cache.put(&id, &process, 0xDEAD_0000).unwrap();
        assert_eq!(cache.get(&id, &process), Some(0xDEAD_0000));
        assert_eq!(cache.entries().len(), 1);
    }

    #[test]
    fn test_get_with_changed_pid_deletes_entry() {
        let dir = TempDir::new().unwrap();
        let cache = AddressCache::new(dir.path());
        let id = identity();

        let old = ProcessIdentity::new(100, 1, "X");
        let new = ProcessIdentity::new(200, 1, "X");
        cache.put(&id, &old, 0x1000).unwrap();

        assert_eq!(cache.get(&id, &new), None);
        // The stale entry is gone even for the original identity.
        assert_eq!(cache.get(&id, &old), None);
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_put_overwrites_previous_entry() {
        let dir = TempDir::new().unwrap();
        let cache = AddressCache::new(dir.path());
        let id = identity();
        let process = ProcessIdentity::new(100, 1, "X");

        cache.put(&id, &process, 0x1000).unwrap();
        cache.put(&id, &process, 0x2000).unwrap();
        assert_eq!(cache.get(&id, &process), Some(0x2000));
        assert_eq!(cache.entries().len(), 1);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = AddressCache::new(dir.path());
        let id = identity();
        let process = ProcessIdentity::new(100, 1, "X");

        cache.put(&id, &process, 0x1000).unwrap();
        cache.invalidate(&id);
        cache.invalidate(&id);
        assert_eq!(cache.get(&id, &process), None);
    }

    #[test]
    fn test_corrupt_entry_is_discarded() {
        let dir = TempDir::new().unwrap();
        let cache = AddressCache::new(dir.path());
        let id = identity();
        let process = ProcessIdentity::new(100, 1, "X");

        let path = dir
            .path()
            .join(format!("{CACHE_FILE_PREFIX}{id}.json"));
        fs::write(&path, "not json").unwrap();
        assert_eq!(cache.get(&id, &process), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let cache = AddressCache::new(dir.path());
        let process = ProcessIdentity::new(100, 1, "X");

        cache.put(&identity(), &process, 0x1000).unwrap();
        assert_eq!(cache.clear(), 1);
        assert!(cache.entries().is_empty());
    }
}
