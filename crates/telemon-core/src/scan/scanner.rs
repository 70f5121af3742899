//! Chunked pattern search over the target's readable memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::Result;
use crate::memory::{MemoryAccessor, MemoryRegion};
use crate::pattern::ConcretePattern;

/// Regions are read in fixed chunks to bound peak memory (4 MiB).
pub const SCAN_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Finds every live occurrence of a concrete pattern in the target process.
pub struct RegionScanner<'a, A: MemoryAccessor + ?Sized> {
    accessor: &'a A,
}

impl<'a, A: MemoryAccessor + ?Sized> RegionScanner<'a, A> {
    pub fn new(accessor: &'a A) -> Self {
        Self { accessor }
    }

    /// Scan all readable private regions for the pattern.
    ///
    /// Every hit is re-read live and kept only while it still matches; the
    /// scan and the target's own execution are not atomic, so a match can
    /// vanish between the chunk read and the verification read. The result
    /// is deduplicated and address-ascending so downstream tie-breaks are
    /// deterministic. Unreadable chunks are skipped, not fatal.
    pub fn scan(&self, pattern: &ConcretePattern) -> Result<Vec<u64>> {
        let regions = self.accessor.regions()?;
        let mut found = Vec::new();

        for region in regions.iter().filter(|r| r.is_scannable()) {
            self.scan_region(region, pattern, &mut found);
        }

        found.sort_unstable();
        found.dedup();
        debug!(
            "Pattern {} matched at {} address(es)",
            pattern.display(),
            found.len()
        );
        Ok(found)
    }

    fn scan_region(&self, region: &MemoryRegion, pattern: &ConcretePattern, out: &mut Vec<u64>) {
        let pattern_len = pattern.len() as u64;
        if region.size < pattern_len {
            return;
        }

        // Chunks overlap by len-1 bytes so a match straddling a chunk
        // boundary is still seen by exactly one of the two chunks.
        let step = (SCAN_CHUNK_SIZE - (pattern.len() - 1)) as u64;
        let mut chunk_base = region.base;

        while chunk_base < region.end() {
            let read_len = (region.end() - chunk_base).min(SCAN_CHUNK_SIZE as u64);
            if read_len < pattern_len {
                break;
            }
            match self.accessor.read_bytes(chunk_base, read_len as usize) {
                Ok(buffer) => self.find_in_chunk(chunk_base, &buffer, pattern, out),
                Err(e) => debug!("Skipping unreadable chunk at {chunk_base:#x}: {e}"),
            }
            chunk_base += step;
        }
    }

    /// Non-overlapping occurrences within one chunk, first byte accelerated
    /// with memchr.
    fn find_in_chunk(
        &self,
        base: u64,
        buffer: &[u8],
        pattern: &ConcretePattern,
        out: &mut Vec<u64>,
    ) {
        let len = pattern.len();
        let first = pattern.first_byte();
        let mut pos = 0;

        while pos + len <= buffer.len() {
            let Some(skip) = memchr::memchr(first, &buffer[pos..]) else {
                break;
            };
            let at = pos + skip;
            if at + len > buffer.len() {
                break;
            }
            if pattern.matches(&buffer[at..at + len]) {
                let address = base + at as u64;
                if self.verify(address, pattern) {
                    out.push(address);
                } else {
                    debug!("Discarded stale match at {address:#x}");
                }
                pos = at + len;
            } else {
                pos = at + 1;
            }
        }
    }

    fn verify(&self, address: u64, pattern: &ConcretePattern) -> bool {
        match self.accessor.read_bytes(address, pattern.len()) {
            Ok(live) => pattern.matches(&live),
            Err(_) => false,
        }
    }
}

/// Session-scoped memo of scan results, keyed by the concrete pattern.
///
/// Readers resolving the same pattern share one region walk: the per-pattern
/// slot is held locked for the duration of the scan, so a second reader
/// blocks until the first finishes and then reuses its candidate list.
/// Cleared when the target process cycles.
#[derive(Default)]
pub struct ScanMemo {
    slots: Mutex<HashMap<String, Arc<Mutex<Option<Vec<u64>>>>>>,
}

impl ScanMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn candidates<A: MemoryAccessor + ?Sized>(
        &self,
        accessor: &A,
        pattern: &ConcretePattern,
    ) -> Result<Vec<u64>> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(pattern.display()).or_default().clone()
        };

        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = guard.as_ref() {
            debug!("Reusing {} memoized candidate(s)", found.len());
            return Ok(found.clone());
        }

        let found = RegionScanner::new(accessor).scan(pattern)?;
        *guard = Some(found.clone());
        Ok(found)
    }

    /// Drop all memoized results (target process restarted).
    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fields::ScalarType;
    use crate::memory::{MockMemoryBuilder, ProcessIdentity};
    use crate::pattern::{Bindings, PatternTemplate};
    use crate::scan::rules::{BoundRule, RuleSet, SpacingRule, select};

    const SENTINEL: [u8; 8] = [0xDE, 0xC0, 0x17, 0x5A, 0x01, 0x00, 0x00, 0x00];

    fn sentinel_pattern() -> ConcretePattern {
        PatternTemplate::parse("DE C0 17 5A 01 00 00 00")
            .unwrap()
            .compile(&Bindings::new())
            .unwrap()
    }

    fn region_with_sentinels(offsets: &[usize], size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        for &offset in offsets {
            data[offset..offset + SENTINEL.len()].copy_from_slice(&SENTINEL);
        }
        data
    }

    #[test]
    fn test_scan_finds_ascending_deduplicated() {
        let mock = MockMemoryBuilder::new()
            .region(0x20000, region_with_sentinels(&[0x100], 0x400))
            .region(0x10000, region_with_sentinels(&[0x00, 0x80], 0x400))
            .build();

        let found = RegionScanner::new(&mock).scan(&sentinel_pattern()).unwrap();
        assert_eq!(found, vec![0x10000, 0x10080, 0x20100]);
    }

    #[test]
    fn test_scan_skips_failing_and_excluded_regions() {
        let mock = MockMemoryBuilder::new()
            .region(0x10000, region_with_sentinels(&[0x40], 0x200))
            .failing_region(0x30000, 0x1000)
            .excluded_region(0x50000, region_with_sentinels(&[0x00], 0x100), true)
            .build();

        let found = RegionScanner::new(&mock).scan(&sentinel_pattern()).unwrap();
        assert_eq!(found, vec![0x10040]);
    }

    #[test]
    fn test_scan_across_chunk_boundary() {
        // A match straddling the first chunk boundary is caught by the
        // overlapping read of the second chunk.
        let straddle = SCAN_CHUNK_SIZE - 3;
        let data = region_with_sentinels(&[0x10, straddle], SCAN_CHUNK_SIZE + 0x100);
        let mock = MockMemoryBuilder::new().region(0x40000, data).build();

        let found = RegionScanner::new(&mock).scan(&sentinel_pattern()).unwrap();
        assert_eq!(found, vec![0x40010, 0x40000 + straddle as u64]);
    }

    #[test]
    fn test_scan_with_wildcards() {
        let pattern = PatternTemplate::parse("DE C0 ?? 5A")
            .unwrap()
            .compile(&Bindings::new())
            .unwrap();
        let mut data = vec![0u8; 0x100];
        data[0x10..0x14].copy_from_slice(&[0xDE, 0xC0, 0xAA, 0x5A]);
        data[0x20..0x24].copy_from_slice(&[0xDE, 0xC0, 0xBB, 0x5A]);
        data[0x30..0x34].copy_from_slice(&[0xDE, 0xC0, 0xCC, 0x5B]); // tail differs
        let mock = MockMemoryBuilder::new().region(0x10000, data).build();

        let found = RegionScanner::new(&mock).scan(&pattern).unwrap();
        assert_eq!(found, vec![0x10010, 0x10020]);
    }

    /// Accessor whose verification-sized reads fail: every chunk-level match
    /// must be discarded by the re-read.
    struct NoVerify {
        inner: crate::memory::MockAccessor,
        pattern_len: usize,
    }

    impl MemoryAccessor for NoVerify {
        fn identity(&self) -> &ProcessIdentity {
            self.inner.identity()
        }

        fn regions(&self) -> Result<Vec<MemoryRegion>> {
            self.inner.regions()
        }

        fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>> {
            if len == self.pattern_len {
                return Err(Error::read_failed(address, "vanished"));
            }
            self.inner.read_bytes(address, len)
        }
    }

    #[test]
    fn test_stale_matches_are_discarded() {
        let pattern = sentinel_pattern();
        let accessor = NoVerify {
            inner: MockMemoryBuilder::new()
                .region(0x10000, region_with_sentinels(&[0x40], 0x200))
                .build(),
            pattern_len: pattern.len(),
        };

        let found = RegionScanner::new(&accessor).scan(&pattern).unwrap();
        assert!(found.is_empty());
    }

    /// Accessor counting region walks, to observe memo reuse.
    struct Counting {
        inner: crate::memory::MockAccessor,
        walks: std::sync::atomic::AtomicUsize,
    }

    impl MemoryAccessor for Counting {
        fn identity(&self) -> &ProcessIdentity {
            self.inner.identity()
        }

        fn regions(&self) -> Result<Vec<MemoryRegion>> {
            self.walks
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.regions()
        }

        fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>> {
            self.inner.read_bytes(address, len)
        }
    }

    #[test]
    fn test_memo_reuses_scan_within_session() {
        let accessor = Counting {
            inner: MockMemoryBuilder::new()
                .region(0x10000, region_with_sentinels(&[0x40], 0x200))
                .build(),
            walks: std::sync::atomic::AtomicUsize::new(0),
        };
        let memo = ScanMemo::new();
        let pattern = sentinel_pattern();

        let first = memo.candidates(&accessor, &pattern).unwrap();
        let second = memo.candidates(&accessor, &pattern).unwrap();
        assert_eq!(first, second);
        assert_eq!(accessor.walks.load(std::sync::atomic::Ordering::SeqCst), 1);

        memo.clear();
        let _ = memo.candidates(&accessor, &pattern).unwrap();
        assert_eq!(accessor.walks.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sentinel_disambiguation() {
        // Sentinel at +0, +84 and +176; spacing [80, 100] step 4 plus a
        // non-negative field bound selects exactly the +84 occurrence.
        let data = region_with_sentinels(&[0, 84, 176], 0x200);
        let mock = MockMemoryBuilder::new().region(0x10000, data).build();
        let pattern = sentinel_pattern();

        let candidates = RegionScanner::new(&mock).scan(&pattern).unwrap();
        assert_eq!(candidates, vec![0x10000, 0x10000 + 84, 0x10000 + 176]);

        let mut rules = RuleSet {
            spacing: Some(SpacingRule {
                min: 80,
                max: 100,
                stride: 4,
            }),
            ..Default::default()
        };
        rules
            .must_be_greater_than_equal
            .insert("power".to_string(), BoundRule(0x34, ScalarType::Uint32, 0.0));

        let selected = select(&mock, &candidates, &rules).unwrap();
        assert_eq!(selected, Some(0x10000 + 84));
    }
}
