//! Cache-line conflict detection
//!
//! The detector connects a CPU's `TransactionContext` to shared guest
//! memory. Every transactional reference goes through `record`, which
//! captures untouched pages, consults the shared access log, and escalates
//! line states.
//!
//! # Conflict rules
//!
//! Only accesses by *other* CPUs stamped after a map's capture sequence
//! count:
//!
//! | own line state | foreign fetch | foreign store |
//! |----------------|---------------|---------------|
//! | Fetched        | -             | `TAC_FETCH_CNF` |
//! | Stored         | `TAC_STORE_CNF` | `TAC_STORE_CNF` |
//!
//! The conflict token is the address of the conflicting cache line.
//!
//! # Commit
//!
//! Transactional stores stay in the private view until the outermost end.
//! `commit` then write-locks every touched page in ascending address
//! order, re-validates against the log and against the page contents, and
//! copies stored lines into main storage. The merged lines are stamped as
//! stores while the page locks are still held, so concurrent transactions
//! that touched them fail their own validation.

use std::sync::Arc;

use parking_lot::RwLockWriteGuard;
use tracing::debug;
use txf_core::{
    line_spans, AbortCode, AccessKind, CpuId, InterruptionInfo, LineSpan, TxAbort, WhyAborted,
    PGM_ADDRESSING_EXCEPTION, ZCACHE_LINE_SIZE,
};
use txf_storage::{GuestMemory, LineActivity, PageFrame};

use crate::pagemap::{LineState, PageShadowMap};
use crate::transaction::TransactionContext;

/// Summary of a successful commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Pages the nest touched
    pub pages: usize,
    /// Cache lines copied into main storage
    pub lines_stored: usize,
}

/// Checks transactional references against concurrent activity
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    memory: Arc<GuestMemory>,
}

impl ConflictDetector {
    /// Detector over `memory`
    pub fn new(memory: Arc<GuestMemory>) -> Self {
        ConflictDetector { memory }
    }

    /// Shared guest memory
    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    /// Record a transactional fetch of `len` bytes at `address`
    pub fn record_fetch(
        &self,
        ctx: &mut TransactionContext,
        address: u64,
        len: usize,
    ) -> Result<(), TxAbort> {
        self.record(ctx, address, len, AccessKind::Fetch)
    }

    /// Record a transactional store of `len` bytes at `address`
    ///
    /// Only the line states change; the bytes themselves reach the private
    /// view through [`ConflictDetector::write`].
    pub fn record_store(
        &self,
        ctx: &mut TransactionContext,
        address: u64,
        len: usize,
    ) -> Result<(), TxAbort> {
        self.record(ctx, address, len, AccessKind::Store)
    }

    /// Capture, check and mark every line covered by an access
    ///
    /// Outside a transaction this only stamps the log.
    pub fn record(
        &self,
        ctx: &mut TransactionContext,
        address: u64,
        len: usize,
        kind: AccessKind,
    ) -> Result<(), TxAbort> {
        if !ctx.is_active() {
            self.memory.note_access(ctx.cpu(), address, len, kind);
            return Ok(());
        }
        if !self.memory.storage().contains(address, len) {
            return Err(addressing_abort());
        }

        let cpu = ctx.cpu();
        for span in line_spans(address, len) {
            self.ensure_captured(ctx, span.page, kind)?;
            let Some(map) = ctx.page_map_mut(span.page) else {
                continue;
            };
            let activity = self.memory.log().page_activity(cpu, span.page, map.since());
            for line in span.lines() {
                let next = map.line_states()[line].after(kind);
                check_line(map.line_address(line), next, &activity[line])?;
                map.mark(line, kind);
            }
        }
        Ok(())
    }

    /// Transactional fetch through the private view
    pub fn read(
        &self,
        ctx: &mut TransactionContext,
        address: u64,
        buf: &mut [u8],
    ) -> Result<(), TxAbort> {
        if !ctx.is_active() {
            return self
                .memory
                .fetch(ctx.cpu(), address, buf)
                .map_err(|_| addressing_abort());
        }
        self.record_fetch(ctx, address, buf.len())?;
        for span in line_spans(address, buf.len()) {
            if let Some(map) = ctx.page_map(span.page) {
                map.read(span.offset, &mut buf[span_range(&span)]);
            }
        }
        Ok(())
    }

    /// Transactional store into the private view
    pub fn write(
        &self,
        ctx: &mut TransactionContext,
        address: u64,
        data: &[u8],
    ) -> Result<(), TxAbort> {
        if !ctx.is_active() {
            return self
                .memory
                .store(ctx.cpu(), address, data)
                .map_err(|_| addressing_abort());
        }
        self.record_store(ctx, address, data.len())?;
        for span in line_spans(address, data.len()) {
            if let Some(map) = ctx.page_map_mut(span.page) {
                map.write(span.offset, &data[span_range(&span)]);
            }
        }
        Ok(())
    }

    /// Check every touched line of the nest against the access log
    pub fn validate(&self, ctx: &TransactionContext) -> Result<(), TxAbort> {
        let cpu = ctx.cpu();
        for map in ctx.sorted_page_maps() {
            self.validate_map(cpu, map)?;
        }
        Ok(())
    }

    /// Validate and publish the stores of the outermost level
    ///
    /// Main storage is only modified when every page validates.
    pub fn commit(&self, ctx: &TransactionContext) -> Result<CommitSummary, TxAbort> {
        let cpu = ctx.cpu();
        let maps = ctx.sorted_page_maps();
        let mut frames: Vec<RwLockWriteGuard<'_, Box<PageFrame>>> =
            maps.iter().map(|map| map.main_page().write()).collect();

        for (map, frame) in maps.iter().zip(frames.iter()) {
            self.validate_map(cpu, map)?;
            for (line, state) in map.touched_lines() {
                if map.line_changed(frame, line) {
                    return Err(TxAbort::conflict(conflict_code(state), map.line_address(line)));
                }
            }
        }

        let mut summary = CommitSummary {
            pages: maps.len(),
            lines_stored: 0,
        };
        for (map, frame) in maps.iter().zip(frames.iter_mut()) {
            summary.lines_stored += map.merge_into(frame);
            for line in map.stored_lines() {
                let span = line_span(map.virtual_page_address(), line);
                self.memory.log().record(cpu, &span, AccessKind::Store);
            }
        }
        drop(frames);

        debug!(
            target: "txf::commit",
            cpu = %cpu,
            pages = summary.pages,
            lines = summary.lines_stored,
            "Transaction committed"
        );
        Ok(summary)
    }

    fn ensure_captured(
        &self,
        ctx: &mut TransactionContext,
        page: u64,
        kind: AccessKind,
    ) -> Result<(), TxAbort> {
        if ctx.page_map(page).is_some() {
            return Ok(());
        }
        let main_page = self
            .memory
            .storage()
            .page(page)
            .map_err(|_| addressing_abort())?;
        let map = PageShadowMap::capture(page, main_page, self.memory.log(), ctx.depth());
        ctx.insert_page_map(map, kind)
    }

    fn validate_map(&self, cpu: CpuId, map: &PageShadowMap) -> Result<(), TxAbort> {
        let activity = self
            .memory
            .log()
            .page_activity(cpu, map.virtual_page_address(), map.since());
        for (line, state) in map.touched_lines() {
            check_line(map.line_address(line), state, &activity[line])?;
        }
        Ok(())
    }
}

/// Decide whether foreign `activity` on a line conflicts with `state`
pub fn check_line(
    line_address: u64,
    state: LineState,
    activity: &LineActivity,
) -> Result<(), TxAbort> {
    let conflicts = match state {
        LineState::Clean => false,
        LineState::Fetched => activity.store.is_some(),
        LineState::Stored => activity.store.is_some() || activity.fetch.is_some(),
    };
    if conflicts {
        debug!(
            target: "txf::conflict",
            line = format_args!("{:016X}", line_address),
            ?state,
            fetch = ?activity.fetch,
            store = ?activity.store,
            "Cache-line conflict"
        );
        Err(TxAbort::conflict(conflict_code(state), line_address))
    } else {
        Ok(())
    }
}

fn conflict_code(state: LineState) -> AbortCode {
    match state {
        LineState::Stored => AbortCode::STORE_CNF,
        _ => AbortCode::FETCH_CNF,
    }
}

fn addressing_abort() -> TxAbort {
    TxAbort::new(AbortCode::UPGM, WhyAborted::UNFILT_INT)
        .with_interruption(InterruptionInfo::with_code(PGM_ADDRESSING_EXCEPTION))
}

fn span_range(span: &LineSpan) -> std::ops::Range<usize> {
    span.buffer_offset..span.buffer_offset + span.len
}

fn line_span(page: u64, line: usize) -> LineSpan {
    LineSpan {
        page,
        offset: line * ZCACHE_LINE_SIZE,
        len: ZCACHE_LINE_SIZE,
        buffer_offset: 0,
        first_line: line,
        last_line: line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::BeginRequest;

    fn setup() -> (Arc<GuestMemory>, ConflictDetector) {
        let memory = Arc::new(GuestMemory::new(4));
        let detector = ConflictDetector::new(Arc::clone(&memory));
        (memory, detector)
    }

    fn begin(cpu: u16) -> TransactionContext {
        let mut ctx = TransactionContext::new(CpuId(cpu));
        ctx.begin(&BeginRequest::unconstrained(0, 6), &[0; 16]).unwrap();
        ctx
    }

    #[test]
    fn test_record_marks_lines() {
        let (_memory, detector) = setup();
        let mut ctx = begin(0);
        detector.record_fetch(&mut ctx, 0x1500, 8).unwrap();
        detector.record_store(&mut ctx, 0x1300, 0x101).unwrap();
        let map = ctx.page_map(0x1000).unwrap();
        assert_eq!(map.line_state(5), Some(LineState::Fetched));
        assert_eq!(map.line_state(3), Some(LineState::Stored));
        assert_eq!(map.line_state(4), Some(LineState::Stored));
        assert_eq!(map.line_state(0), Some(LineState::Clean));
    }

    #[test]
    fn test_foreign_store_on_fetched_line_conflicts() {
        let (memory, detector) = setup();
        let mut ctx = begin(0);
        detector.record_fetch(&mut ctx, 0x1500, 8).unwrap();
        memory.store(CpuId(1), 0x1510, &[1]).unwrap();

        let abort = detector.validate(&ctx).unwrap_err();
        assert_eq!(abort.tac, AbortCode::FETCH_CNF);
        assert_eq!(abort.conflict_token, Some(0x1500));
        assert!(abort.why.contains(WhyAborted::CONFLICT));
    }

    #[test]
    fn test_foreign_fetch_on_stored_line_conflicts() {
        let (memory, detector) = setup();
        let mut ctx = begin(0);
        detector.write(&mut ctx, 0x2300, &[7]).unwrap();
        let mut buf = [0u8; 1];
        memory.fetch(CpuId(1), 0x2300, &mut buf).unwrap();

        let abort = detector.validate(&ctx).unwrap_err();
        assert_eq!(abort.tac, AbortCode::STORE_CNF);
        assert_eq!(abort.conflict_token, Some(0x2300));
    }

    #[test]
    fn test_foreign_fetch_on_fetched_line_is_fine() {
        let (memory, detector) = setup();
        let mut ctx = begin(0);
        detector.record_fetch(&mut ctx, 0x1500, 8).unwrap();
        let mut buf = [0u8; 8];
        memory.fetch(CpuId(1), 0x1500, &mut buf).unwrap();
        assert!(detector.validate(&ctx).is_ok());
    }

    #[test]
    fn test_own_accesses_never_conflict() {
        let (memory, detector) = setup();
        let mut ctx = begin(0);
        detector.record_fetch(&mut ctx, 0x1500, 8).unwrap();
        memory.store(CpuId(0), 0x1500, &[1]).unwrap();
        assert!(detector.validate(&ctx).is_ok());
    }

    #[test]
    fn test_accesses_before_capture_are_ignored() {
        let (memory, detector) = setup();
        memory.store(CpuId(1), 0x1500, &[1]).unwrap();
        let mut ctx = begin(0);
        detector.record_fetch(&mut ctx, 0x1500, 8).unwrap();
        assert!(detector.validate(&ctx).is_ok());
    }

    #[test]
    fn test_stores_are_private_until_commit() {
        let (memory, detector) = setup();
        let mut ctx = begin(0);
        detector.write(&mut ctx, 0x1300, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        detector.read(&mut ctx, 0x1300, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        memory.storage().read(0x1300, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);

        let summary = detector.commit(&ctx).unwrap();
        assert_eq!(summary, CommitSummary { pages: 1, lines_stored: 1 });
        memory.storage().read(0x1300, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_cross_page_write() {
        let (memory, detector) = setup();
        let mut ctx = begin(0);
        detector.write(&mut ctx, 0x1FFE, &[1, 2, 3, 4]).unwrap();
        assert!(ctx.page_map(0x1000).is_some());
        assert!(ctx.page_map(0x2000).is_some());
        detector.commit(&ctx).unwrap();

        let mut buf = [0u8; 4];
        memory.storage().read(0x1FFE, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_commit_detects_unlogged_change() {
        let (memory, detector) = setup();
        let mut ctx = begin(0);
        detector.record_fetch(&mut ctx, 0x1700, 4).unwrap();
        memory.storage().write(0x1700, &[9]).unwrap();

        let abort = detector.commit(&ctx).unwrap_err();
        assert_eq!(abort.tac, AbortCode::FETCH_CNF);
        assert_eq!(abort.conflict_token, Some(0x1700));
    }

    #[test]
    fn test_failed_commit_leaves_storage_untouched() {
        let (memory, detector) = setup();
        let mut ctx = begin(0);
        detector.write(&mut ctx, 0x1000, &[5; 16]).unwrap();
        detector.record_fetch(&mut ctx, 0x2000, 4).unwrap();
        memory.store(CpuId(1), 0x2000, &[1]).unwrap();

        assert!(detector.commit(&ctx).is_err());
        let mut buf = [0u8; 16];
        memory.storage().read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    fn test_first_committer_wins() {
        let (memory, detector) = setup();
        let mut a = begin(0);
        let mut b = begin(1);
        let mut buf = [0u8; 1];
        detector.read(&mut a, 0x1000, &mut buf).unwrap();
        detector.read(&mut b, 0x1000, &mut buf).unwrap();
        detector.write(&mut a, 0x1000, &[1]).unwrap();
        detector.write(&mut b, 0x1000, &[2]).unwrap();

        detector.commit(&a).unwrap();
        let abort = detector.commit(&b).unwrap_err();
        assert_eq!(abort.tac, AbortCode::STORE_CNF);

        memory.storage().read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1]);
    }

    #[test]
    fn test_addressing_outside_storage() {
        let (_memory, detector) = setup();
        let mut ctx = begin(0);
        let abort = detector.record_fetch(&mut ctx, 0x10_0000, 4).unwrap_err();
        assert_eq!(abort.tac, AbortCode::UPGM);
        assert_eq!(
            abort.interruption.map(|info| info.code),
            Some(PGM_ADDRESSING_EXCEPTION)
        );
    }

    #[test]
    fn test_nontransactional_record_only_stamps() {
        let (memory, detector) = setup();
        let mut idle = TransactionContext::new(CpuId(3));
        let before = memory.log().current_sequence();
        detector.record_store(&mut idle, 0x1000, 4).unwrap();
        assert!(memory.log().current_sequence() > before);
        assert!(idle.page_map(0x1000).is_none());
    }
}
