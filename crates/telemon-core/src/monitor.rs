//! Orchestration: one polling reader per telemetry kind.
//!
//! Each reader runs its own timer loop on a dedicated thread, so a region
//! scan for one kind never delays polling of another kind that is already
//! active. All readers share one accessor, one address cache and one scan
//! memo. Restarting a stopped reader is policy that lives here (keepalive),
//! never inside the reader itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use crate::cache::AddressCache;
use crate::config::{LookupEntry, LookupTable};
use crate::context::ContextResolver;
use crate::error::{Error, Result};
use crate::events::MonitorEvent;
use crate::memory::MemoryAccessor;
use crate::pattern::Bindings;
use crate::reader::FieldReader;
use crate::scan::ScanMemo;
use crate::shutdown::ShutdownSignal;

/// Immutable monitor options, validated at construction.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    poll_interval: Duration,
    cache_dir: Option<PathBuf>,
    force_rescan: bool,
    keepalive: bool,
    retry_delay: Duration,
}

impl MonitorConfig {
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::default()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            cache_dir: None,
            force_rescan: false,
            keepalive: false,
            retry_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitorConfigBuilder {
    poll_interval: Option<Duration>,
    cache_dir: Option<PathBuf>,
    force_rescan: Option<bool>,
    keepalive: Option<bool>,
    retry_delay: Option<Duration>,
}

impl MonitorConfigBuilder {
    /// Interval between record reads while a reader is active.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Directory for persisted scan results (OS temp dir by default).
    pub fn cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Discard cached scan results and always walk memory afresh.
    pub fn force_rescan(mut self, enabled: bool) -> Self {
        self.force_rescan = Some(enabled);
        self
    }

    /// Restart a reader after it stops (target exited, nothing found yet).
    pub fn keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = Some(enabled);
        self
    }

    /// Delay between keepalive restart attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn build(self) -> Result<MonitorConfig> {
        let defaults = MonitorConfig::default();
        let config = MonitorConfig {
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            cache_dir: self.cache_dir,
            force_rescan: self.force_rescan.unwrap_or(defaults.force_rescan),
            keepalive: self.keepalive.unwrap_or(defaults.keepalive),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
        };
        if config.poll_interval.is_zero() {
            return Err(Error::Configuration(
                "poll interval must be non-zero".to_string(),
            ));
        }
        if config.retry_delay.is_zero() {
            return Err(Error::Configuration(
                "retry delay must be non-zero".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Runs the readers and fans their events into one channel.
pub struct Monitor<A: MemoryAccessor + 'static> {
    accessor: Arc<A>,
    table: LookupTable,
    config: MonitorConfig,
    cache: Arc<AddressCache>,
    memo: Arc<ScanMemo>,
    shutdown: Arc<ShutdownSignal>,
    workers: Vec<JoinHandle<()>>,
    events: Sender<MonitorEvent>,
}

struct WorkerContext {
    shutdown: Arc<ShutdownSignal>,
    memo: Arc<ScanMemo>,
    interval: Duration,
    keepalive: bool,
    retry_delay: Duration,
}

impl<A: MemoryAccessor + 'static> Monitor<A> {
    /// Validates the lookup table up front; a bad table never gets as far
    /// as spawning readers.
    pub fn new(
        accessor: A,
        table: LookupTable,
        config: MonitorConfig,
    ) -> Result<(Self, Receiver<MonitorEvent>)> {
        table.validate()?;
        let cache = match &config.cache_dir {
            Some(dir) => AddressCache::new(dir),
            None => AddressCache::in_temp_dir(),
        };
        let (events, receiver) = channel();
        Ok((
            Self {
                accessor: Arc::new(accessor),
                table,
                config,
                cache: Arc::new(cache),
                memo: Arc::new(ScanMemo::new()),
                shutdown: Arc::new(ShutdownSignal::new()),
                workers: Vec::new(),
                events,
            },
            receiver,
        ))
    }

    /// Spawn one reader per requested kind.
    pub fn start(&mut self, context: &dyn ContextResolver, kinds: &[&str]) -> Result<()> {
        let version = context.schema_version()?;
        info!("Target schema version {version}");

        for kind in kinds {
            let entry = self.table.select(kind, &version)?.clone();
            let bindings = resolve_bindings(context, &entry)?;
            self.spawn_reader(kind, entry, bindings)?;
        }
        Ok(())
    }

    /// Spawn readers for every kind the lookup table declares.
    pub fn start_all(&mut self, context: &dyn ContextResolver) -> Result<()> {
        let kinds: Vec<String> = self
            .table
            .kind_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let refs: Vec<&str> = kinds.iter().map(String::as_str).collect();
        self.start(context, &refs)
    }

    fn spawn_reader(&mut self, kind: &str, entry: LookupEntry, bindings: Bindings) -> Result<()> {
        let reader = FieldReader::new(
            kind,
            Arc::clone(&self.accessor),
            entry,
            bindings,
            Arc::clone(&self.cache),
            Arc::clone(&self.memo),
            self.events.clone(),
            self.config.force_rescan,
        );
        let context = WorkerContext {
            shutdown: Arc::clone(&self.shutdown),
            memo: Arc::clone(&self.memo),
            interval: self.config.poll_interval,
            keepalive: self.config.keepalive,
            retry_delay: self.config.retry_delay,
        };

        let handle = std::thread::Builder::new()
            .name(format!("telemon-{kind}"))
            .spawn(move || run_reader(reader, context))?;
        self.workers.push(handle);
        Ok(())
    }

    /// Stop every reader and wait for its thread. After this returns, no
    /// further tick runs and no further event is sent.
    pub fn stop(&mut self) {
        self.shutdown.trigger();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<A: MemoryAccessor + 'static> Drop for Monitor<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_reader<A: MemoryAccessor>(mut reader: FieldReader<A>, context: WorkerContext) {
    loop {
        if context.shutdown.is_triggered() {
            reader.stop();
            return;
        }

        match reader.start() {
            Ok(()) => loop {
                if context.shutdown.wait(context.interval) {
                    reader.stop();
                    return;
                }
                if reader.tick().is_err() {
                    // The reader already stopped itself and surfaced the
                    // failure; whether to try again is decided below.
                    break;
                }
            },
            Err(e) => debug!("'{}' did not resolve: {e}", reader.kind()),
        }

        if !context.keepalive {
            reader.stop();
            return;
        }
        debug!("'{}' restarting in {:?}", reader.kind(), context.retry_delay);
        if context.shutdown.wait(context.retry_delay) {
            reader.stop();
            return;
        }
        // A restart usually means the target cycled; memoized candidates
        // from the previous instance must not satisfy the next scan.
        context.memo.clear();
    }
}

fn resolve_bindings(context: &dyn ContextResolver, entry: &LookupEntry) -> Result<Bindings> {
    let mut bindings = Bindings::new();
    for name in entry.placeholders() {
        match context.resolve_binding(&name)? {
            Some(value) => {
                bindings.insert(name, value);
            }
            None => {
                return Err(Error::Configuration(format!(
                    "no runtime value for placeholder <{name}>"
                )));
            }
        }
    }
    Ok(bindings)
}
