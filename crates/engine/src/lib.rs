//! Transactional-execution facility for an emulated CPU complex
//!
//! This crate is the surface the emulator talks to:
//! - TxfSystem: guest storage, access log, configuration and statistics
//!   shared by every CPU
//! - TxCpu: per-CPU facade the dispatcher drives (begin, end, abort,
//!   instruction and storage hooks)
//! - TxfConfig: `txf.toml` loading
//! - TraceFilter: which transaction events reach the log
//! - diagnostics: dumps of diagnostic blocks, page maps and cache lines
//!
//! The engine is the only component that knows about:
//! - Random abort injection
//! - Interruption filtering
//! - Trace gating and statistics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod cpu;
pub mod diagnostics;
pub mod interruption;
pub mod stats;
pub mod system;
pub mod trace_filter;

pub use config::{AbortConfig, StorageConfig, TraceConfig, TxfConfig, CONFIG_FILE_NAME};
pub use cpu::{TxCpu, TxStep};
pub use interruption::{is_filtered, program_interruption_class, Interruption};
pub use stats::{TxfStats, TxfStatsSnapshot};
pub use system::TxfSystem;
pub use trace_filter::{
    TraceFilter, TraceOutcome, TRACE_CONSTRAINED, TRACE_FAILURE, TRACE_LINES, TRACE_MAP,
    TRACE_PAGES, TRACE_SUCCESS, TRACE_TDB, TRACE_UNCONSTRAINED,
};

pub use txf_concurrency::{
    AbortDisposition, AbortOutcome, BeginRequest, InstructionClass, ProgramInterruption,
    RetryPolicy,
};
pub use txf_core::{
    AbortCode, AccessKind, ConditionCode, CpuId, CpuRegisters, InterruptionInfo, Tdb, TxAbort,
    TxfError, TxfResult, WhyAborted,
};
