//! Events surfaced by readers and the monitor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::fields::FieldValue;

/// One polled snapshot of a telemetry kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub kind: String,
    pub captured_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MonitorEvent {
    /// A base address was resolved (from cache or a fresh scan).
    Resolved { kind: String, base_address: u64 },
    /// One polled record.
    Record { record: TelemetryRecord },
    /// The resolved address stopped verifying; the reader has stopped.
    LivenessFailed { kind: String, reason: String },
    /// No pattern variant produced a rule-satisfying address.
    NotFound { kind: String, reason: String },
    /// The reader left the active state.
    Stopped { kind: String },
}

impl MonitorEvent {
    pub fn kind(&self) -> &str {
        match self {
            MonitorEvent::Resolved { kind, .. }
            | MonitorEvent::LivenessFailed { kind, .. }
            | MonitorEvent::NotFound { kind, .. }
            | MonitorEvent::Stopped { kind } => kind,
            MonitorEvent::Record { record } => &record.kind,
        }
    }
}
