//! Facility configuration via `txf.toml`
//!
//! On first open, a default `txf.toml` is created in the configuration
//! directory. To change settings, edit the file and restart the emulator.

use serde::{Deserialize, Serialize};
use std::path::Path;
use txf_core::{TxfError, TxfResult, MAX_TXF_TND};

/// Config file name placed in the configuration directory.
pub const CONFIG_FILE_NAME: &str = "txf.toml";

/// Tracing categories and filters, persisted under `[trace]`.
///
/// All categories are off by default. The filters narrow the abort events
/// that are traced once a category is enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceConfig {
    /// Trace successful transactions
    #[serde(default)]
    pub success: bool,
    /// Trace aborted transactions
    #[serde(default)]
    pub failure: bool,
    /// Trace unconstrained transactions
    #[serde(default)]
    pub unconstrained: bool,
    /// Trace constrained transactions
    #[serde(default)]
    pub constrained: bool,
    /// Dump the diagnostic block of traced aborts
    #[serde(default)]
    pub tdb: bool,
    /// Summarize the page maps of traced aborts
    #[serde(default)]
    pub map: bool,
    /// Dump every page map of traced aborts
    #[serde(default)]
    pub pages: bool,
    /// Dump modified cache lines of traced aborts
    #[serde(default)]
    pub lines: bool,
    /// Only trace at nesting depth >= `tnd` (0 traces every depth)
    #[serde(default)]
    pub tnd: u16,
    /// Only trace this CPU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u16>,
    /// Only trace this abort code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tac: Option<u64>,
    /// Only trace aborts with a why-bit in this mask
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_mask: Option<u32>,
    /// Only trace after this many consecutive failures on a CPU
    #[serde(default)]
    pub fails: u32,
}

/// Random abort injection, persisted under `[abort]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbortConfig {
    /// Percentage (0..=100) of transactional instructions that abort
    #[serde(default)]
    pub random_abort_percent: u8,
    /// Seed for the injection generator; entropy when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Guest storage geometry, persisted under `[storage]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Main storage size in 4K pages
    #[serde(default = "default_pages")]
    pub pages: usize,
}

fn default_pages() -> usize {
    256
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pages: default_pages(),
        }
    }
}

/// Facility configuration loaded from `txf.toml`.
///
/// # Example
///
/// ```toml
/// cpus = 4
///
/// [storage]
/// pages = 256
///
/// [abort]
/// random_abort_percent = 0
///
/// [trace]
/// failure = true
/// unconstrained = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxfConfig {
    /// Number of emulated CPUs
    #[serde(default = "default_cpus")]
    pub cpus: u16,
    /// Main storage geometry
    #[serde(default)]
    pub storage: StorageConfig,
    /// Random abort injection
    #[serde(default)]
    pub abort: AbortConfig,
    /// Tracing categories and filters
    #[serde(default)]
    pub trace: TraceConfig,
}

fn default_cpus() -> u16 {
    4
}

impl Default for TxfConfig {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            storage: StorageConfig::default(),
            abort: AbortConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

impl TxfConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `TxfError::Config` naming the first offending setting.
    pub fn validate(&self) -> TxfResult<()> {
        if self.cpus == 0 {
            return Err(TxfError::Config("cpus must be at least 1".to_string()));
        }
        if self.storage.pages == 0 {
            return Err(TxfError::Config(
                "storage.pages must be at least 1".to_string(),
            ));
        }
        if self.abort.random_abort_percent > 100 {
            return Err(TxfError::Config(format!(
                "abort.random_abort_percent is {}, expected 0..=100",
                self.abort.random_abort_percent
            )));
        }
        if self.trace.tnd > MAX_TXF_TND {
            return Err(TxfError::Config(format!(
                "trace.tnd is {}, expected 0..={}",
                self.trace.tnd, MAX_TXF_TND
            )));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Transactional-execution facility configuration
#
# Number of emulated CPUs that may run transactions
cpus = 4

[storage]
# Main storage size in 4K pages (default: 256 = 1 MiB)
pages = 256

[abort]
# Abort this percentage of transactional instructions at random (testing aid)
random_abort_percent = 0
# Fixed seed for reproducible injection; entropy when absent
# seed = 42

[trace]
# Categories (all off by default)
success = false
failure = false
unconstrained = false
constrained = false
# Extra dumps for traced aborts
tdb = false
map = false
pages = false
lines = false
# Filters
tnd = 0        # only nesting depth >= tnd (0 = any)
fails = 0      # only after this many consecutive failures
# cpu = 0      # only this CPU
# tac = 9      # only this abort code
# why_mask = 0x02000000
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> TxfResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TxfError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: TxfConfig = toml::from_str(&content).map_err(|e| {
            TxfError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> TxfResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> TxfResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TxfError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
