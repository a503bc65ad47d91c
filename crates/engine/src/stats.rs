//! Facility statistics
//!
//! # Memory Ordering
//!
//! Counters are purely observational and use Relaxed ordering; they do not
//! synchronize any other memory operation.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use txf_concurrency::{AbortDisposition, AbortOutcome};

/// Counters shared by every CPU of a system
#[derive(Debug, Default)]
pub struct TxfStats {
    started: AtomicU64,
    started_constrained: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    aborted_by_cc: [AtomicU64; 4],
    constrained_retries: AtomicU64,
    program_checks: AtomicU64,
    conflicts: AtomicU64,
}

/// Point-in-time copy of [`TxfStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxfStatsSnapshot {
    /// Outermost transactions begun, retries included
    pub started: u64,
    /// ...of which constrained
    pub started_constrained: u64,
    /// Outermost transactions committed
    pub committed: u64,
    /// Aborts of any kind
    pub aborted: u64,
    /// Unconstrained aborts by condition code
    pub aborted_by_cc: [u64; 4],
    /// Silent re-executions of constrained transactions
    pub constrained_retries: u64,
    /// Aborts that raised a program interruption
    pub program_checks: u64,
    /// Aborts caused by fetch or store conflicts
    pub conflicts: u64,
}

impl TxfStats {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an outermost begin
    pub fn record_begin(&self, constrained: bool) {
        self.started.fetch_add(1, Ordering::Relaxed);
        if constrained {
            self.started_constrained.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count an outermost commit
    pub fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an abort and its disposition
    pub fn record_abort(&self, outcome: &AbortOutcome) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
        if let Some(cc) = outcome.condition_code {
            self.aborted_by_cc[cc.as_u8() as usize].fetch_add(1, Ordering::Relaxed);
        }
        if outcome.is_silent_retry() {
            self.constrained_retries.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(outcome.disposition, AbortDisposition::ProgramCheck(_)) {
            self.program_checks.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.tac.is_conflict() {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy every counter
    pub fn snapshot(&self) -> TxfStatsSnapshot {
        TxfStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            started_constrained: self.started_constrained.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            aborted_by_cc: [
                self.aborted_by_cc[0].load(Ordering::Relaxed),
                self.aborted_by_cc[1].load(Ordering::Relaxed),
                self.aborted_by_cc[2].load(Ordering::Relaxed),
                self.aborted_by_cc[3].load(Ordering::Relaxed),
            ],
            constrained_retries: self.constrained_retries.load(Ordering::Relaxed),
            program_checks: self.program_checks.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_commit_counts() {
        let stats = TxfStats::new();
        stats.record_begin(false);
        stats.record_begin(true);
        stats.record_commit();
        let snap = stats.snapshot();
        assert_eq!(snap.started, 2);
        assert_eq!(snap.started_constrained, 1);
        assert_eq!(snap.committed, 1);
        assert_eq!(snap.aborted, 0);
    }
}
