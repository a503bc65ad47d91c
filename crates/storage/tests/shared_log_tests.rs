//! Shared access log and guest memory under concurrent use

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;
use txf_core::{line_spans, AccessKind, CpuId, ZCACHE_LINE_PAGE};
use txf_storage::{ConflictLog, GuestMemory, SharedAccessLog};

static_assertions::assert_impl_all!(SharedAccessLog: Send, Sync);
static_assertions::assert_impl_all!(GuestMemory: Send, Sync);

#[test]
fn test_concurrent_stamps_get_unique_sequences() {
    const THREADS: u16 = 8;
    const STAMPS: usize = 500;

    let log = Arc::new(SharedAccessLog::new());
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|cpu| {
            let log = Arc::clone(&log);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let span = line_spans(0x1000 + u64::from(cpu) * 0x100, 8)[0];
                (0..STAMPS)
                    .map(|_| log.record(CpuId(cpu), &span, AccessKind::Store))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for sequence in handle.join().unwrap() {
            assert!(seen.insert(sequence), "sequence {} issued twice", sequence);
        }
    }
    assert_eq!(seen.len(), THREADS as usize * STAMPS);
    assert_eq!(log.current_sequence(), (THREADS as usize * STAMPS) as u64);
}

#[test]
fn test_concurrent_stores_are_all_visible_as_foreign_activity() {
    const THREADS: u16 = 4;

    let memory = Arc::new(GuestMemory::new(4));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (1..=THREADS)
        .map(|cpu| {
            let memory = Arc::clone(&memory);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let line = u64::from(cpu) * 0x100;
                for n in 0..100u8 {
                    memory.store(CpuId(cpu), 0x2000 + line, &[n]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let activity = memory.log().page_activity(CpuId(0), 0x2000, 0);
    for cpu in 1..=THREADS {
        let line = &activity[cpu as usize];
        assert_eq!(line.store.map(|(who, _)| who), Some(CpuId(cpu)));
        assert!(line.fetch.is_none());
    }
    assert!(activity[0].is_quiet());

    let mut buf = [0u8; 1];
    memory.storage().read(0x2100, &mut buf).unwrap();
    assert_eq!(buf, [99]);
}

#[test]
fn test_prune_then_new_activity() {
    let memory = GuestMemory::new(2);
    memory.note_access(CpuId(1), 0x0000, 8, AccessKind::Fetch);
    let horizon = memory.log().current_sequence() + 1;
    assert_eq!(memory.log().prune_before(horizon), 1);

    memory.note_access(CpuId(1), 0x0000, 8, AccessKind::Store);
    let activity = memory.log().page_activity(CpuId(0), 0, 0);
    assert!(activity[0].fetch.is_none());
    assert!(activity[0].store.is_some());
}

proptest! {
    #[test]
    fn prop_own_activity_never_reported(
        accesses in prop::collection::vec((0u16..4, 0u64..0x1000, 1usize..600, any::<bool>()), 1..40),
        observer in 0u16..4,
    ) {
        let log = SharedAccessLog::new();
        for (cpu, address, len, store) in &accesses {
            let kind = if *store { AccessKind::Store } else { AccessKind::Fetch };
            for span in line_spans(*address, *len) {
                log.record(CpuId(*cpu), &span, kind);
            }
        }

        for page in [0u64, 0x1000] {
            let activity = log.page_activity(CpuId(observer), page, 0);
            prop_assert_eq!(activity.len(), ZCACHE_LINE_PAGE);
            for line in activity.iter() {
                prop_assert!(line.fetch.map_or(true, |(cpu, _)| cpu != CpuId(observer)));
                prop_assert!(line.store.map_or(true, |(cpu, _)| cpu != CpuId(observer)));
            }
        }
    }

    #[test]
    fn prop_since_hides_older_stamps(count in 1usize..30) {
        let log = SharedAccessLog::new();
        let span = line_spans(0x300, 4)[0];
        for _ in 0..count {
            log.record(CpuId(1), &span, AccessKind::Store);
        }
        let now = log.current_sequence();
        prop_assert!(log.page_activity(CpuId(0), 0, now)[3].is_quiet());
        prop_assert_eq!(log.page_activity(CpuId(0), 0, now - 1)[3].store, Some((CpuId(1), now)));
    }
}
