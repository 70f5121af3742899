//! # telemon-core
//!
//! Extracts periodic structured telemetry from the live memory image of an
//! external, uninstrumented process whose internal layout is undocumented
//! and changes across releases.
//!
//! This crate provides:
//! - Pattern templates with runtime-bound placeholder fields
//! - Chunked scanning of the target's readable memory regions
//! - Declarative rules disambiguating structurally similar matches
//! - A durable cache of resolved base addresses keyed to pattern and
//!   process identity
//! - Polling readers that turn a base address plus a field-offset table
//!   into records, stopping cleanly when the target process cycles
//!
//! The tool only ever reads target memory; it never writes, disassembles or
//! injects. Liveness of a resolved address is re-verified from the
//! pattern's leading bytes only, so a target that exits and has its address
//! range reused by identical leading bytes can briefly read as alive.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod fields;
pub mod memory;
pub mod monitor;
pub mod pattern;
pub mod reader;
pub mod scan;
pub mod shutdown;

pub use cache::{AddressCache, ScanResultEntry};
pub use config::{LookupEntry, LookupTable, SignatureSpec, builtin_lookup};
pub use context::{ContextResolver, LogContext, StaticContext};
pub use error::{Error, Result};
pub use events::{MonitorEvent, TelemetryRecord};
pub use fields::{
    DerivedField, FieldDef, FieldOffsetTable, FieldOp, FieldValue, ScalarType, ScalarValue,
};
pub use memory::{MemoryAccessor, MemoryRegion, ProcessIdentity};
pub use monitor::{Monitor, MonitorConfig, MonitorConfigBuilder};
pub use pattern::{Bindings, ConcretePattern, PatternIdentity, PatternTemplate};
pub use reader::{FieldReader, ReaderState};
pub use scan::{RegionScanner, RuleSet, ScanMemo, SpacingRule};
pub use shutdown::ShutdownSignal;

#[cfg(target_os = "windows")]
pub use memory::ProcessAccessor;
