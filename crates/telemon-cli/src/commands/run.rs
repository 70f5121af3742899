//! Attach to the target and stream telemetry records until every reader
//! stops (or forever with keepalive).

use std::path::PathBuf;

use anyhow::Result;

use crate::commands::common::TargetArgs;

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Telemetry kinds to monitor; all configured kinds when omitted.
    #[arg(long = "kind")]
    pub kinds: Vec<String>,

    /// Poll interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,

    /// Ignore cached scan results and walk memory afresh.
    #[arg(long)]
    pub force_rescan: bool,

    /// Keep retrying after the target exits or nothing resolves.
    #[arg(long)]
    pub keepalive: bool,

    /// Directory for persisted scan results (OS temp dir by default).
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Emit events as JSON lines instead of human-readable text.
    #[arg(long)]
    pub json: bool,
}

#[cfg(target_os = "windows")]
pub fn execute(args: RunArgs) -> Result<()> {
    use std::time::Duration;

    use telemon_core::{Monitor, MonitorConfig, MonitorEvent};
    use tracing::info;

    use crate::commands::common::{CliContext, load_table, open_accessor};

    let table = load_table(&args.target.lookup)?;
    let context = CliContext::from_args(&args.target);
    let accessor = open_accessor(&args.target.exe)?;

    let mut builder = MonitorConfig::builder()
        .poll_interval(Duration::from_millis(args.interval_ms))
        .force_rescan(args.force_rescan)
        .keepalive(args.keepalive);
    if let Some(dir) = &args.cache_dir {
        builder = builder.cache_dir(dir);
    }
    let config = builder.build()?;

    let kinds: Vec<String> = if args.kinds.is_empty() {
        table.kind_names().iter().map(|s| s.to_string()).collect()
    } else {
        args.kinds.clone()
    };
    if kinds.is_empty() {
        anyhow::bail!("the lookup table declares no telemetry kinds");
    }

    let (mut monitor, events) = Monitor::new(accessor, table, config)?;
    let refs: Vec<&str> = kinds.iter().map(String::as_str).collect();
    monitor.start(&context, &refs)?;
    let kind_count = kinds.len();
    info!("Monitoring {kind_count} telemetry kind(s)");

    let mut stopped = 0usize;
    for event in events.iter() {
        print_event(&event, args.json)?;
        if matches!(event, MonitorEvent::Stopped { .. }) {
            stopped += 1;
            if !args.keepalive && stopped >= kind_count {
                break;
            }
        }
    }

    monitor.stop();
    Ok(())
}

#[cfg(target_os = "windows")]
fn print_event(event: &telemon_core::MonitorEvent, json: bool) -> Result<()> {
    use telemon_core::MonitorEvent;

    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        MonitorEvent::Resolved { kind, base_address } => {
            println!("{kind}: resolved base {base_address:#x}");
        }
        MonitorEvent::Record { record } => {
            println!("{}: {}", record.kind, serde_json::to_string(&record.fields)?);
        }
        MonitorEvent::LivenessFailed { kind, reason } => {
            println!("{kind}: liveness failed ({reason})");
        }
        MonitorEvent::NotFound { kind, reason } => {
            println!("{kind}: not found ({reason})");
        }
        MonitorEvent::Stopped { kind } => {
            println!("{kind}: stopped");
        }
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn execute(args: RunArgs) -> Result<()> {
    use crate::commands::common::{CliContext, load_table};

    // Validate the configuration before refusing, so argument mistakes
    // still surface on development machines.
    let _ = load_table(&args.target.lookup)?;
    let _ = CliContext::from_args(&args.target);
    anyhow::bail!("attaching to a process is only supported on Windows");
}
