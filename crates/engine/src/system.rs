//! The facility instance shared by all emulated CPUs
//!
//! A `TxfSystem` owns guest main storage, the shared access log, the
//! configuration, the trace filter and the statistics. CPUs obtain their
//! per-thread facade through [`TxfSystem::cpu`].
//!
//! The system also tracks the log sequence at which each CPU's running
//! transaction began, so that stale access-log stamps can be pruned.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};
use txf_core::{AccessKind, CpuId, TxfError, TxfResult};
use txf_storage::GuestMemory;

use crate::config::{TxfConfig, CONFIG_FILE_NAME};
use crate::cpu::TxCpu;
use crate::stats::TxfStats;
use crate::trace_filter::TraceFilter;

/// Shared state of one transactional-execution facility
#[derive(Debug)]
pub struct TxfSystem {
    config: Arc<TxfConfig>,
    filter: TraceFilter,
    memory: Arc<GuestMemory>,
    stats: TxfStats,
    attached: DashMap<CpuId, ()>,
    active: DashMap<CpuId, u64>,
}

impl TxfSystem {
    /// Build a system from an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `TxfError::Config` if the configuration does not validate.
    pub fn new(config: TxfConfig) -> TxfResult<Arc<Self>> {
        config.validate()?;
        let memory = Arc::new(GuestMemory::new(config.storage.pages));
        let filter = TraceFilter::from_config(&config.trace);

        info!(
            target: "txf::system",
            cpus = config.cpus,
            pages = config.storage.pages,
            random_abort_percent = config.abort.random_abort_percent,
            trace = %filter,
            "Transactional-execution facility ready"
        );

        Ok(Arc::new(TxfSystem {
            config: Arc::new(config),
            filter,
            memory,
            stats: TxfStats::new(),
            attached: DashMap::new(),
            active: DashMap::new(),
        }))
    }

    /// Open the configuration in `dir`, creating a default `txf.toml` first
    /// if none exists.
    pub fn open(dir: &Path) -> TxfResult<Arc<Self>> {
        let path = dir.join(CONFIG_FILE_NAME);
        TxfConfig::write_default_if_missing(&path)?;
        let config = TxfConfig::from_file(&path)?;
        Self::new(config)
    }

    /// Facade for CPU `id`.
    ///
    /// # Errors
    ///
    /// Returns `TxfError::Config` if `id` is not below the configured CPU
    /// count, and `TxfError::CpuAttached` while another facade for `id` is
    /// alive. Dropping the facade releases the id.
    pub fn cpu(self: &Arc<Self>, id: CpuId) -> TxfResult<TxCpu> {
        if id.as_u16() >= self.config.cpus {
            return Err(TxfError::Config(format!(
                "{} is outside the configured {} CPUs",
                id, self.config.cpus
            )));
        }
        if self.attached.insert(id, ()).is_some() {
            return Err(TxfError::CpuAttached(id));
        }
        Ok(TxCpu::new(id, Arc::clone(self)))
    }

    /// Number of CPU facades currently handed out
    pub fn attached_cpus(&self) -> usize {
        self.attached.len()
    }

    /// Configuration in effect
    pub fn config(&self) -> &Arc<TxfConfig> {
        &self.config
    }

    /// Trace filter built from `[trace]`
    pub fn filter(&self) -> &TraceFilter {
        &self.filter
    }

    /// Guest storage and access log
    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    /// Statistics counters
    pub fn stats(&self) -> &TxfStats {
        &self.stats
    }

    /// Stamp an access made outside any transaction by `cpu`
    ///
    /// Storage paths that bypass [`TxCpu`] (channel I/O, other CPUs' plain
    /// instructions) call this after completing the access.
    pub fn on_nontransactional_access(
        &self,
        cpu: CpuId,
        address: u64,
        len: usize,
        kind: AccessKind,
    ) -> u64 {
        self.memory.note_access(cpu, address, len, kind)
    }

    /// Oldest begin sequence among running transactions
    pub fn oldest_active_sequence(&self) -> Option<u64> {
        self.active.iter().map(|entry| *entry.value()).min()
    }

    /// Number of CPUs with a running transaction
    pub fn active_transactions(&self) -> usize {
        self.active.len()
    }

    /// Drop access-log stamps no running transaction can conflict with
    ///
    /// Returns the number of pages whose log became empty.
    pub fn prune_access_log(&self) -> usize {
        let log = self.memory.log();
        let horizon = self
            .oldest_active_sequence()
            .unwrap_or_else(|| log.current_sequence())
            + 1;
        let pruned = log.prune_before(horizon);
        debug!(target: "txf::system", horizon, pruned, "Access log pruned");
        pruned
    }

    pub(crate) fn register_active(&self, cpu: CpuId) {
        self.active.insert(cpu, self.memory.log().current_sequence());
    }

    pub(crate) fn unregister_active(&self, cpu: CpuId) {
        self.active.remove(&cpu);
    }

    pub(crate) fn detach(&self, cpu: CpuId) {
        self.active.remove(&cpu);
        self.attached.remove(&cpu);
    }
}
