//! Shared argument plumbing for the subcommands.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use telemon_core::{ContextResolver, LogContext, LookupTable, builtin_lookup};

/// How to find the target process and its bootstrap context.
#[derive(Debug, clap::Args)]
pub struct TargetArgs {
    /// Target process executable name.
    #[arg(long, default_value = "RideApp.exe")]
    pub exe: String,

    /// Lookup table JSON; the built-in table is used when absent.
    #[arg(long)]
    pub lookup: Option<PathBuf>,

    /// Target application's log file, parsed for the schema version and
    /// runtime identifiers.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Schema version override (skips log parsing for the version).
    #[arg(long)]
    pub schema_version: Option<String>,

    /// Placeholder binding override, e.g. `--binding rider=12345`.
    /// Repeatable.
    #[arg(long = "binding", value_parser = parse_binding)]
    pub bindings: Vec<(String, u32)>,
}

pub fn parse_binding(raw: &str) -> Result<(String, u32), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let value = value
        .parse::<u32>()
        .map_err(|e| format!("binding '{name}' value is not numeric: {e}"))?;
    Ok((name.to_string(), value))
}

pub fn load_table(path: &Option<PathBuf>) -> Result<LookupTable> {
    match path {
        Some(path) => LookupTable::load(path)
            .with_context(|| format!("failed to load lookup table {}", path.display())),
        None => Ok(builtin_lookup()),
    }
}

/// Resolver combining command-line overrides with the target's log file.
/// Overrides win; the log is the fallback.
pub struct CliContext {
    version_override: Option<String>,
    bindings: Vec<(String, u32)>,
    log: Option<LogContext>,
}

impl CliContext {
    pub fn from_args(args: &TargetArgs) -> Self {
        let log = args.log_file.as_ref().map(|path| {
            LogContext::new(path)
                .with_binding_marker("rider", "Rider ID:")
                .with_binding_marker("sport", "Sport:")
                .with_binding_marker("world", "World:")
        });
        Self {
            version_override: args.schema_version.clone(),
            bindings: args.bindings.clone(),
            log,
        }
    }
}

impl ContextResolver for CliContext {
    fn schema_version(&self) -> telemon_core::Result<String> {
        if let Some(version) = &self.version_override {
            return Ok(version.clone());
        }
        match &self.log {
            Some(log) => log.schema_version(),
            None => Err(telemon_core::Error::Configuration(
                "no --schema-version and no --log-file to read it from".to_string(),
            )),
        }
    }

    fn resolve_binding(&self, name: &str) -> telemon_core::Result<Option<u32>> {
        if let Some((_, value)) = self.bindings.iter().find(|(n, _)| n == name) {
            return Ok(Some(*value));
        }
        match &self.log {
            Some(log) => log.resolve_binding(name),
            None => Ok(None),
        }
    }
}

#[cfg(target_os = "windows")]
pub fn open_accessor(exe: &str) -> Result<telemon_core::ProcessAccessor> {
    telemon_core::ProcessAccessor::open(exe)
        .with_context(|| format!("could not attach to '{exe}'"))
}
