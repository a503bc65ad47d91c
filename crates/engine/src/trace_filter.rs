//! Tracing filter
//!
//! Decides whether a transaction event is worth a log record. The filter is
//! built once from `[trace]` and then only read; every predicate is pure.
//!
//! An event passes when both its outcome category (`SUCCESS`/`FAILURE`)
//! and its kind category (`UNCONSTRAINED`/`CONSTRAINED`) are enabled. Abort
//! events additionally pass through the depth, CPU, abort-code, why-mask and
//! consecutive-failure filters.

use std::fmt;

use txf_core::{AbortCode, CpuId, WhyAborted};

use crate::config::TraceConfig;

/// Trace successful transactions
pub const TRACE_SUCCESS: u32 = 0x8000_0000;
/// Trace aborted transactions
pub const TRACE_FAILURE: u32 = 0x4000_0000;
/// Trace unconstrained transactions
pub const TRACE_UNCONSTRAINED: u32 = 0x2000_0000;
/// Trace constrained transactions
pub const TRACE_CONSTRAINED: u32 = 0x1000_0000;
/// Dump the diagnostic block
pub const TRACE_TDB: u32 = 0x0800_0000;
/// Summarize page maps
pub const TRACE_MAP: u32 = 0x0400_0000;
/// Dump each page map
pub const TRACE_PAGES: u32 = 0x0200_0000;
/// Dump modified cache lines
pub const TRACE_LINES: u32 = 0x0100_0000;

/// Outcome category of a traced event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    /// Transaction committed
    Success,
    /// Transaction aborted
    Failure,
}

/// Enabled trace categories plus abort filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFilter {
    bits: u32,
    tnd: u16,
    cpu: Option<CpuId>,
    tac: Option<AbortCode>,
    why_mask: Option<WhyAborted>,
    fails: u32,
}

impl TraceFilter {
    /// Filter with only the given category bits and no abort filters
    pub fn from_bits(bits: u32) -> Self {
        TraceFilter {
            bits,
            ..Default::default()
        }
    }

    /// Filter described by a `[trace]` section
    pub fn from_config(config: &TraceConfig) -> Self {
        let flags = [
            (config.success, TRACE_SUCCESS),
            (config.failure, TRACE_FAILURE),
            (config.unconstrained, TRACE_UNCONSTRAINED),
            (config.constrained, TRACE_CONSTRAINED),
            (config.tdb, TRACE_TDB),
            (config.map, TRACE_MAP),
            (config.pages, TRACE_PAGES),
            (config.lines, TRACE_LINES),
        ];
        let bits = flags
            .iter()
            .filter(|(enabled, _)| *enabled)
            .fold(0, |bits, (_, bit)| bits | bit);

        TraceFilter {
            bits,
            tnd: config.tnd,
            cpu: config.cpu.map(CpuId),
            tac: config.tac.map(AbortCode::new),
            why_mask: config.why_mask.map(WhyAborted::from_bits),
            fails: config.fails,
        }
    }

    /// Enabled category bits
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// True when nothing is ever traced
    pub fn is_disabled(&self) -> bool {
        self.bits & (TRACE_SUCCESS | TRACE_FAILURE) == 0
    }

    /// Should an event of this outcome and kind be traced at all
    pub fn should_trace(&self, outcome: TraceOutcome, constrained: bool) -> bool {
        let outcome_bit = match outcome {
            TraceOutcome::Success => TRACE_SUCCESS,
            TraceOutcome::Failure => TRACE_FAILURE,
        };
        self.bits & outcome_bit != 0 && self.trace_uc(constrained)
    }

    /// Is the transaction kind enabled
    pub fn trace_uc(&self, constrained: bool) -> bool {
        let kind_bit = if constrained {
            TRACE_CONSTRAINED
        } else {
            TRACE_UNCONSTRAINED
        };
        self.bits & kind_bit != 0
    }

    /// Dump the diagnostic block
    pub fn trace_tdb(&self) -> bool {
        self.bits & TRACE_TDB != 0
    }

    /// Summarize page maps
    pub fn trace_map(&self) -> bool {
        self.bits & TRACE_MAP != 0
    }

    /// Dump each page map
    pub fn trace_pages(&self) -> bool {
        self.bits & TRACE_PAGES != 0
    }

    /// Dump modified cache lines
    pub fn trace_lines(&self) -> bool {
        self.bits & TRACE_LINES != 0
    }

    /// Does an abort pass the depth, CPU, code, why and failure filters
    pub fn trace_abort(
        &self,
        tac: AbortCode,
        why: WhyAborted,
        tnd: u16,
        cpu: CpuId,
        failures: u32,
    ) -> bool {
        if tnd < self.tnd {
            return false;
        }
        if self.cpu.is_some_and(|only| only != cpu) {
            return false;
        }
        if self.tac.is_some_and(|only| only != tac) {
            return false;
        }
        if self.why_mask.is_some_and(|mask| !why.intersects(mask)) {
            return false;
        }
        failures >= self.fails
    }
}

impl fmt::Display for TraceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bits={:08X} tnd>={}", self.bits, self.tnd)?;
        if let Some(cpu) = self.cpu {
            write!(f, " cpu={}", cpu)?;
        }
        if let Some(tac) = self.tac {
            write!(f, " tac={}", tac)?;
        }
        if let Some(mask) = self.why_mask {
            write!(f, " why={:08X}", mask.bits())?;
        }
        if self.fails > 0 {
            write!(f, " fails>={}", self.fails)?;
        }
        Ok(())
    }
}
