//! Bootstrap context: schema version and placeholder bindings.
//!
//! Patterns and rules reference runtime scalars (a rider id, a sport id)
//! that the target process never exposes through an API but does write to
//! its own log file during startup. The resolver recovers them there,
//! independent of any memory scan.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, Result};

/// Source of the schema version and runtime-bound scalars.
pub trait ContextResolver {
    /// Version string of the target's internal data layout, used to select
    /// a lookup entry.
    fn schema_version(&self) -> Result<String>;

    /// Resolve one named placeholder to its runtime value, `Ok(None)` when
    /// the source has no value for it.
    fn resolve_binding(&self, name: &str) -> Result<Option<u32>>;
}

/// Fixed values, for tests and caller-side overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    version: String,
    bindings: BTreeMap<String, u32>,
}

impl StaticContext {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            bindings: BTreeMap::new(),
        }
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: u32) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }
}

impl ContextResolver for StaticContext {
    fn schema_version(&self) -> Result<String> {
        if self.version.is_empty() {
            return Err(Error::Configuration("no schema version set".to_string()));
        }
        Ok(self.version.clone())
    }

    fn resolve_binding(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.bindings.get(name).copied())
    }
}

/// Resolver backed by the target application's own log file.
///
/// The log is line-oriented; the value follows a per-key marker, e.g.
/// `[12:00:01] Game Version: 1.42.0`. The last occurrence wins, since the
/// target appends to the log as it restarts sessions.
#[derive(Debug, Clone)]
pub struct LogContext {
    path: PathBuf,
    version_marker: String,
    binding_markers: BTreeMap<String, String>,
}

impl LogContext {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version_marker: "Game Version:".to_string(),
            binding_markers: BTreeMap::new(),
        }
    }

    pub fn with_version_marker(mut self, marker: impl Into<String>) -> Self {
        self.version_marker = marker.into();
        self
    }

    /// Map a placeholder name to the log line marker its value follows.
    pub fn with_binding_marker(
        mut self,
        name: impl Into<String>,
        marker: impl Into<String>,
    ) -> Self {
        self.binding_markers.insert(name.into(), marker.into());
        self
    }

    fn last_value_after(&self, marker: &str) -> Result<Option<String>> {
        let content = fs::read_to_string(&self.path)?;
        let mut found = None;
        for line in content.lines() {
            if let Some(at) = line.find(marker) {
                let value = line[at + marker.len()..]
                    .split_whitespace()
                    .next()
                    .map(str::to_string);
                if value.is_some() {
                    found = value;
                }
            }
        }
        Ok(found)
    }
}

impl ContextResolver for LogContext {
    fn schema_version(&self) -> Result<String> {
        match self.last_value_after(&self.version_marker)? {
            Some(version) => {
                debug!("Resolved schema version {version} from {}", self.path.display());
                Ok(version)
            }
            None => Err(Error::Configuration(format!(
                "no '{}' line in {}",
                self.version_marker,
                self.path.display()
            ))),
        }
    }

    fn resolve_binding(&self, name: &str) -> Result<Option<u32>> {
        let Some(marker) = self.binding_markers.get(name) else {
            return Ok(None);
        };
        let Some(raw) = self.last_value_after(marker)? else {
            return Ok(None);
        };
        let value = raw.parse::<u32>().map_err(|e| {
            Error::Configuration(format!("binding <{name}> value '{raw}' is not numeric: {e}"))
        })?;
        debug!("Resolved binding <{name}> = {value}");
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn log_file(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn test_static_context() {
        let context = StaticContext::new("1.42.0").with_binding("rider", 12345);
        assert_eq!(context.schema_version().unwrap(), "1.42.0");
        assert_eq!(context.resolve_binding("rider").unwrap(), Some(12345));
        assert_eq!(context.resolve_binding("sport").unwrap(), None);
    }

    #[test]
    fn test_log_context_version_last_wins() {
        let file = log_file(&[
            "[08:00:01] Game Version: 1.41.0",
            "[08:00:02] NETCLIENT connected",
            "[09:12:44] Game Version: 1.42.0",
        ]);
        let context = LogContext::new(file.path());
        assert_eq!(context.schema_version().unwrap(), "1.42.0");
    }

    #[test]
    fn test_log_context_bindings() {
        let file = log_file(&[
            "[08:00:05] Rider ID: 990122",
            "[08:00:05] Sport: 0",
        ]);
        let context = LogContext::new(file.path())
            .with_binding_marker("rider", "Rider ID:")
            .with_binding_marker("sport", "Sport:");

        assert_eq!(context.resolve_binding("rider").unwrap(), Some(990122));
        assert_eq!(context.resolve_binding("sport").unwrap(), Some(0));
        assert_eq!(context.resolve_binding("world").unwrap(), None);
    }

    #[test]
    fn test_log_context_missing_version() {
        let file = log_file(&["nothing useful here"]);
        let context = LogContext::new(file.path());
        assert!(context.schema_version().is_err());
    }

    #[test]
    fn test_log_context_non_numeric_binding() {
        let file = log_file(&["Rider ID: abc"]);
        let context = LogContext::new(file.path()).with_binding_marker("rider", "Rider ID:");
        assert!(context.resolve_binding("rider").is_err());
    }
}
