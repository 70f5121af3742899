//! Inspect or clear persisted scan results.

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;
use telemon_core::AddressCache;

#[derive(Debug, clap::Args)]
pub struct CacheArgs {
    /// Cache directory (OS temp dir by default).
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// List cached scan results.
    Show,
    /// Delete every cached scan result.
    Clear,
}

pub fn execute(args: CacheArgs) -> Result<()> {
    let cache = match &args.cache_dir {
        Some(dir) => AddressCache::new(dir),
        None => AddressCache::in_temp_dir(),
    };

    match args.command {
        CacheCommand::Show => {
            let entries = cache.entries();
            if entries.is_empty() {
                println!("no cached scan results");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{}  base {:#x}  {}  cached {}",
                    &entry.pattern_identity[..16.min(entry.pattern_identity.len())],
                    entry.base_address,
                    entry.process,
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        CacheCommand::Clear => {
            let removed = cache.clear();
            println!("removed {removed} cached scan result(s)");
        }
    }
    Ok(())
}
