//! Shared cross-CPU access log
//!
//! The access log is the only conflict-detection state shared between
//! emulated CPUs. Every access (transactional or not) stamps the cache lines
//! it touched with a globally increasing sequence number and the accessing
//! CPU. A transaction remembers the sequence number at which it first
//! touched a page; any foreign stamp on one of its lines newer than that is
//! a potential conflict.
//!
//! # Design
//!
//! - DashMap keyed by page address, FxHash: one shard lock covers one page's
//!   line records, so stamping a page and reading its activity are linearized
//! - Per line, one stamp per CPU (last fetch, last store); a handful of CPUs
//!   fit inline in a SmallVec
//! - Sequence numbers come from a single `AtomicU64` and are taken while the
//!   page's shard lock is held
//!
//! # Concurrency contract
//!
//! Callers that modify storage must stamp the store while still holding the
//! page frame lock (see `GuestMemory`). A reader that copies a page under its
//! read lock and then samples `current_sequence()` is therefore guaranteed
//! that every store with a smaller sequence number is in its copy.

use dashmap::DashMap;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use txf_core::{AccessKind, CpuId, LineSpan, ZCACHE_LINE_PAGE};

/// Most recent foreign activity on one cache line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineActivity {
    /// Latest foreign fetch (cpu, sequence)
    pub fetch: Option<(CpuId, u64)>,
    /// Latest foreign store (cpu, sequence)
    pub store: Option<(CpuId, u64)>,
}

impl LineActivity {
    /// True when no foreign CPU touched the line
    pub fn is_quiet(&self) -> bool {
        self.fetch.is_none() && self.store.is_none()
    }
}

/// Foreign activity for every line of a page
pub type PageActivity = [LineActivity; ZCACHE_LINE_PAGE];

/// Line-level access log consulted by the conflict detector
///
/// Implementations are shared by all CPUs and must be internally
/// synchronized.
pub trait ConflictLog: Send + Sync {
    /// Stamp the lines of `span` for `cpu` and return the sequence number used
    fn record(&self, cpu: CpuId, span: &LineSpan, kind: AccessKind) -> u64;

    /// Sequence number of the most recent stamp
    fn current_sequence(&self) -> u64;

    /// Activity by CPUs other than `cpu` on `page` newer than `since`
    fn page_activity(&self, cpu: CpuId, page: u64, since: u64) -> PageActivity;

    /// Forget stamps older than `sequence`; returns the number of pages dropped
    fn prune_before(&self, sequence: u64) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct LineStamp {
    cpu: CpuId,
    fetched: u64,
    stored: u64,
}

impl LineStamp {
    fn latest(&self) -> u64 {
        self.fetched.max(self.stored)
    }
}

#[derive(Debug, Default)]
struct PageLog {
    lines: [SmallVec<[LineStamp; 2]>; ZCACHE_LINE_PAGE],
}

impl PageLog {
    fn stamp(&mut self, line: usize, cpu: CpuId, kind: AccessKind, sequence: u64) {
        let stamps = &mut self.lines[line];
        let index = match stamps.iter().position(|s| s.cpu == cpu) {
            Some(index) => index,
            None => {
                stamps.push(LineStamp {
                    cpu,
                    fetched: 0,
                    stored: 0,
                });
                stamps.len() - 1
            }
        };
        match kind {
            AccessKind::Fetch => stamps[index].fetched = sequence,
            AccessKind::Store => stamps[index].stored = sequence,
        }
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|stamps| stamps.is_empty())
    }
}

/// Shared access log backed by a sharded map
#[derive(Debug)]
pub struct SharedAccessLog {
    pages: DashMap<u64, PageLog, BuildHasherDefault<FxHasher>>,
    sequence: AtomicU64,
}

impl SharedAccessLog {
    /// Empty log
    pub fn new() -> Self {
        SharedAccessLog {
            pages: DashMap::with_hasher(BuildHasherDefault::default()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Number of pages with recorded activity
    pub fn tracked_pages(&self) -> usize {
        self.pages.len()
    }
}

impl Default for SharedAccessLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictLog for SharedAccessLog {
    fn record(&self, cpu: CpuId, span: &LineSpan, kind: AccessKind) -> u64 {
        let mut page = self.pages.entry(span.page).or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        for line in span.lines() {
            page.stamp(line, cpu, kind, sequence);
        }
        sequence
    }

    fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn page_activity(&self, cpu: CpuId, page: u64, since: u64) -> PageActivity {
        let mut activity = PageActivity::default();
        let Some(log) = self.pages.get(&page) else {
            return activity;
        };

        for (line, stamps) in log.lines.iter().enumerate() {
            for stamp in stamps.iter().filter(|s| s.cpu != cpu) {
                let entry = &mut activity[line];
                if stamp.fetched > since && entry.fetch.map_or(true, |(_, seq)| stamp.fetched > seq) {
                    entry.fetch = Some((stamp.cpu, stamp.fetched));
                }
                if stamp.stored > since && entry.store.map_or(true, |(_, seq)| stamp.stored > seq) {
                    entry.store = Some((stamp.cpu, stamp.stored));
                }
            }
        }

        activity
    }

    fn prune_before(&self, sequence: u64) -> usize {
        let before = self.pages.len();
        self.pages.retain(|_, log| {
            for stamps in log.lines.iter_mut() {
                stamps.retain(|s| s.latest() >= sequence);
            }
            !log.is_empty()
        });
        let dropped = before.saturating_sub(self.pages.len());
        if dropped > 0 {
            tracing::debug!(target: "txf::log", dropped, sequence, "Pruned access log");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txf_core::line_spans;

    fn span(address: u64, len: usize) -> LineSpan {
        line_spans(address, len)[0]
    }

    #[test]
    fn test_sequence_increases() {
        let log = SharedAccessLog::new();
        assert_eq!(log.current_sequence(), 0);
        let a = log.record(CpuId(0), &span(0x1000, 8), AccessKind::Fetch);
        let b = log.record(CpuId(1), &span(0x1000, 8), AccessKind::Store);
        assert!(b > a);
        assert_eq!(log.current_sequence(), b);
    }

    #[test]
    fn test_own_activity_is_invisible() {
        let log = SharedAccessLog::new();
        log.record(CpuId(0), &span(0x1500, 8), AccessKind::Store);
        let activity = log.page_activity(CpuId(0), 0x1000, 0);
        assert!(activity.iter().all(LineActivity::is_quiet));
    }

    #[test]
    fn test_foreign_activity_after_since() {
        let log = SharedAccessLog::new();
        let old = log.record(CpuId(1), &span(0x1500, 8), AccessKind::Store);
        let since = log.current_sequence();
        let fetch = log.record(CpuId(2), &span(0x1300, 8), AccessKind::Fetch);

        let activity = log.page_activity(CpuId(0), 0x1000, since);
        assert!(activity[5].is_quiet(), "store at {} predates since", old);
        assert_eq!(activity[3].fetch, Some((CpuId(2), fetch)));
        assert_eq!(activity[3].store, None);
    }

    #[test]
    fn test_latest_foreign_stamp_wins() {
        let log = SharedAccessLog::new();
        log.record(CpuId(1), &span(0x1000, 8), AccessKind::Store);
        let later = log.record(CpuId(2), &span(0x1000, 8), AccessKind::Store);
        let activity = log.page_activity(CpuId(0), 0x1000, 0);
        assert_eq!(activity[0].store, Some((CpuId(2), later)));
    }

    #[test]
    fn test_span_stamps_every_line() {
        let log = SharedAccessLog::new();
        log.record(CpuId(1), &span(0x10F0, 0x200), AccessKind::Fetch);
        let activity = log.page_activity(CpuId(0), 0x1000, 0);
        assert!(activity[0].fetch.is_some());
        assert!(activity[1].fetch.is_some());
        assert!(activity[2].fetch.is_some());
        assert!(activity[3].is_quiet());
    }

    #[test]
    fn test_prune_before() {
        let log = SharedAccessLog::new();
        log.record(CpuId(1), &span(0x1000, 8), AccessKind::Store);
        let keep = log.record(CpuId(1), &span(0x2000, 8), AccessKind::Store);
        assert_eq!(log.tracked_pages(), 2);

        assert_eq!(log.prune_before(keep), 1);
        assert_eq!(log.tracked_pages(), 1);
        assert!(log.page_activity(CpuId(0), 0x1000, 0)[0].is_quiet());
        assert!(log.page_activity(CpuId(0), 0x2000, 0)[0].store.is_some());
    }

    static_assertions::assert_impl_all!(SharedAccessLog: Send, Sync);
}
