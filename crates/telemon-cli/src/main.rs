mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "telemon")]
#[command(about = "Live-memory telemetry monitor for an external process")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach to the target and stream telemetry records.
    Run(commands::run::RunArgs),
    /// Resolve base addresses once and exit.
    Resolve(commands::resolve::ResolveArgs),
    /// Inspect or clear persisted scan results.
    Cache(commands::cache::CacheArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("telemon=info".parse()?))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run(run) => commands::run::execute(run),
        Command::Resolve(resolve) => commands::resolve::execute(resolve),
        Command::Cache(cache) => commands::cache::execute(cache),
    }
}
