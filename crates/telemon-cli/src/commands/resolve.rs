//! One-shot resolution: scan, print the base address per kind, exit.

use anyhow::Result;

use crate::commands::common::TargetArgs;

#[derive(Debug, clap::Args)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Telemetry kinds to resolve; all configured kinds when omitted.
    #[arg(long = "kind")]
    pub kinds: Vec<String>,

    /// Ignore cached scan results and walk memory afresh.
    #[arg(long)]
    pub force_rescan: bool,
}

#[cfg(target_os = "windows")]
pub fn execute(args: ResolveArgs) -> Result<()> {
    use std::sync::Arc;
    use std::sync::mpsc::channel;

    use telemon_core::{AddressCache, Bindings, ContextResolver, FieldReader, ScanMemo};
    use tracing::warn;

    use crate::commands::common::{CliContext, load_table, open_accessor};

    let table = load_table(&args.target.lookup)?;
    let context = CliContext::from_args(&args.target);
    let accessor = Arc::new(open_accessor(&args.target.exe)?);
    let version = context.schema_version()?;

    let kinds: Vec<String> = if args.kinds.is_empty() {
        table.kind_names().iter().map(|s| s.to_string()).collect()
    } else {
        args.kinds.clone()
    };

    let cache = Arc::new(AddressCache::in_temp_dir());
    let memo = Arc::new(ScanMemo::new());
    let mut failures = 0usize;

    for kind in &kinds {
        let entry = table.select(kind, &version)?.clone();
        let mut bindings = Bindings::new();
        for name in entry.placeholders() {
            match context.resolve_binding(&name)? {
                Some(value) => {
                    bindings.insert(name, value);
                }
                None => {
                    warn!("No runtime value for placeholder <{name}>");
                }
            }
        }

        let (events, _receiver) = channel();
        let mut reader = FieldReader::new(
            kind.clone(),
            Arc::clone(&accessor),
            entry,
            bindings,
            Arc::clone(&cache),
            Arc::clone(&memo),
            events,
            args.force_rescan,
        );

        match reader.start() {
            Ok(()) => {
                let base = reader.base_address().unwrap_or_default();
                println!("{kind}: {base:#x}");
            }
            Err(e) => {
                println!("{kind}: unresolved ({e})");
                failures += 1;
            }
        }
        reader.stop();
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} kind(s) did not resolve", kinds.len());
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn execute(args: ResolveArgs) -> Result<()> {
    use crate::commands::common::{CliContext, load_table};

    let _ = load_table(&args.target.lookup)?;
    let _ = CliContext::from_args(&args.target);
    anyhow::bail!("attaching to a process is only supported on Windows");
}
