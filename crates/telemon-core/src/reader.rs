//! Polling reader for one telemetry kind.
//!
//! A [`FieldReader`] owns a resolved base address and the field-offset table
//! for its kind. `start()` resolves the base (cache first, then a full scan
//! per signature variant in priority order), `tick()` turns the offset table
//! into one record, and any liveness failure stops the reader and surfaces
//! the error; re-resolution across attempts is the caller's policy, never
//! the reader's.
//!
//! Liveness is verified by reading the pattern's leading concrete bytes back
//! from the match address. This is deliberately cheap; if the target exits
//! and another allocation reuses the same address range with the same
//! leading bytes, a stale read can pass. Known limitation, accepted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use chrono::Utc;
use strum::Display;
use tracing::{debug, info, warn};

use crate::cache::AddressCache;
use crate::config::LookupEntry;
use crate::error::{Error, Result};
use crate::events::{MonitorEvent, TelemetryRecord};
use crate::fields::FieldValue;
use crate::memory::MemoryAccessor;
use crate::pattern::{Bindings, PatternIdentity, PatternTemplate};
use crate::scan::{ScanMemo, select};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ReaderState {
    Idle,
    Resolving,
    Active,
    Stopped,
}

/// A successfully resolved base plus what liveness checks need.
struct ResolvedBase {
    /// Base address the offset table is measured from.
    base: u64,
    /// Address the pattern matched at (`base - address_offset`).
    anchor: u64,
    /// Leading concrete bytes of the winning pattern.
    prefix: Vec<u8>,
    identity: PatternIdentity,
}

pub struct FieldReader<A: MemoryAccessor> {
    kind: String,
    accessor: Arc<A>,
    entry: LookupEntry,
    bindings: Bindings,
    cache: Arc<AddressCache>,
    memo: Arc<ScanMemo>,
    events: Sender<MonitorEvent>,
    force_rescan: bool,
    state: ReaderState,
    resolved: Option<ResolvedBase>,
}

impl<A: MemoryAccessor> FieldReader<A> {
    #[allow(clippy::too_many_arguments)] // One collaborator per concern; the monitor wires them.
    pub fn new(
        kind: impl Into<String>,
        accessor: Arc<A>,
        entry: LookupEntry,
        bindings: Bindings,
        cache: Arc<AddressCache>,
        memo: Arc<ScanMemo>,
        events: Sender<MonitorEvent>,
        force_rescan: bool,
    ) -> Self {
        Self {
            kind: kind.into(),
            accessor,
            entry,
            bindings,
            cache,
            memo,
            events,
            force_rescan,
            state: ReaderState::Idle,
            resolved: None,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn base_address(&self) -> Option<u64> {
        self.resolved.as_ref().map(|r| r.base)
    }

    /// Resolve a base address and become active.
    ///
    /// On failure the reader returns to idle and emits `not-found`; it never
    /// enters the active state with an unverified address.
    pub fn start(&mut self) -> Result<()> {
        if self.state == ReaderState::Active {
            return Ok(());
        }
        self.state = ReaderState::Resolving;
        info!("Resolving base address for '{}'", self.kind);

        match self.resolve() {
            Ok(resolved) => {
                info!("'{}' active at base {:#x}", self.kind, resolved.base);
                let _ = self.events.send(MonitorEvent::Resolved {
                    kind: self.kind.clone(),
                    base_address: resolved.base,
                });
                self.resolved = Some(resolved);
                self.state = ReaderState::Active;
                Ok(())
            }
            Err(e) => {
                self.state = ReaderState::Idle;
                let _ = self.events.send(MonitorEvent::NotFound {
                    kind: self.kind.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn resolve(&mut self) -> Result<ResolvedBase> {
        let mut last_error: Option<Error> = None;

        for signature in &self.entry.signatures {
            let template = PatternTemplate::parse(&signature.pattern)?;
            let pattern = template.compile(&self.bindings)?;
            let rules = signature.rules.bind(&self.bindings)?;
            let identity = pattern.identity(&rules);
            let prefix = pattern.leading_concrete().to_vec();

            if self.force_rescan {
                self.cache.invalidate(&identity);
            } else if let Some(base) = self.cache.get(&identity, self.accessor.identity()) {
                let anchor = base.wrapping_add_signed(-signature.address_offset);
                if check_liveness(self.accessor.as_ref(), anchor, &prefix) {
                    debug!("'{}' reusing cached base {base:#x}", self.kind);
                    return Ok(ResolvedBase {
                        base,
                        anchor,
                        prefix,
                        identity,
                    });
                }
                debug!("Cached base {base:#x} failed liveness; rescanning");
                self.cache.invalidate(&identity);
            }

            let candidates = match self.memo.candidates(self.accessor.as_ref(), &pattern) {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("Scan for '{}' failed: {e}", self.kind);
                    last_error = Some(e);
                    continue;
                }
            };

            match select(self.accessor.as_ref(), &candidates, &rules)? {
                Some(address) => {
                    if !check_liveness(self.accessor.as_ref(), address, &prefix) {
                        self.memo.clear();
                        last_error = Some(Error::Verification(format!(
                            "candidate {address:#x} vanished before activation"
                        )));
                        continue;
                    }
                    let base = address.wrapping_add_signed(signature.address_offset);
                    if let Err(e) = self.cache.put(&identity, self.accessor.identity(), base) {
                        warn!("Failed to persist scan result: {e}");
                    }
                    return Ok(ResolvedBase {
                        base,
                        anchor: address,
                        prefix,
                        identity,
                    });
                }
                None => {
                    last_error = Some(Error::NotFound(format!(
                        "none of {} candidate(s) satisfied the rules for '{}'",
                        candidates.len(),
                        self.kind
                    )));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::NotFound(format!("no signature variants declared for '{}'", self.kind))
        }))
    }

    /// Read one record while active.
    ///
    /// Returns `Ok(None)` outside the active state. A read or liveness
    /// failure invalidates the cache entry, stops the reader and emits
    /// exactly one `liveness-failed` event; no further ticks produce
    /// anything until `start()` is called again.
    pub fn tick(&mut self) -> Result<Option<TelemetryRecord>> {
        if self.state != ReaderState::Active {
            return Ok(None);
        }
        let Some(resolved) = self.resolved.as_ref() else {
            return Ok(None);
        };

        match self.read_record(resolved) {
            Ok(record) => {
                let _ = self.events.send(MonitorEvent::Record {
                    record: record.clone(),
                });
                Ok(Some(record))
            }
            Err(e) => {
                warn!("'{}' lost its base address: {e}", self.kind);
                self.cache.invalidate(&resolved.identity);
                // The target most likely cycled; memoized candidate lists
                // describe the old instance.
                self.memo.clear();
                let _ = self.events.send(MonitorEvent::LivenessFailed {
                    kind: self.kind.clone(),
                    reason: e.to_string(),
                });
                self.resolved = None;
                self.stop();
                Err(e)
            }
        }
    }

    fn read_record(&self, resolved: &ResolvedBase) -> Result<TelemetryRecord> {
        let mut raw = BTreeMap::new();
        for (name, def) in self.entry.offsets.iter() {
            let value = self
                .accessor
                .read_scalar(resolved.base + def.offset(), def.scalar_type())?;
            raw.insert(name.clone(), value);
        }

        // Fields first, liveness second: if the check fails, the record just
        // read came from a dead or recycled process and must not be emitted.
        if !check_liveness(self.accessor.as_ref(), resolved.anchor, &resolved.prefix) {
            return Err(Error::Verification(
                "base address no longer matches the pattern".to_string(),
            ));
        }

        let mut fields: BTreeMap<String, FieldValue> = raw
            .iter()
            .map(|(name, value)| (name.clone(), FieldValue::from(*value)))
            .collect();
        for derived in &self.entry.derived {
            if let Some(value) = derived.apply(&raw) {
                fields.insert(derived.name.clone(), value);
            }
        }

        Ok(TelemetryRecord {
            kind: self.kind.clone(),
            captured_at: Utc::now(),
            fields,
        })
    }

    /// Stop the reader. Idempotent, callable from any state.
    pub fn stop(&mut self) {
        if self.state == ReaderState::Stopped {
            return;
        }
        self.state = ReaderState::Stopped;
        self.resolved = None;
        let _ = self.events.send(MonitorEvent::Stopped {
            kind: self.kind.clone(),
        });
    }
}

fn check_liveness<A: MemoryAccessor + ?Sized>(accessor: &A, anchor: u64, prefix: &[u8]) -> bool {
    match accessor.read_bytes(anchor, prefix.len()) {
        Ok(live) => live == prefix,
        Err(_) => false,
    }
}
