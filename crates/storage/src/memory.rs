//! Guest memory: main storage plus the shared access log
//!
//! `GuestMemory` is the storage path used by every CPU outside a
//! transaction and by transaction commit. Each access copies the bytes and
//! stamps the access log while the page frame lock is still held, which is
//! what makes the log's sequence numbers a faithful order of storage updates.

use std::sync::Arc;
use txf_core::{line_spans, AccessKind, CpuId, TxfResult};

use crate::access_log::{ConflictLog, SharedAccessLog};
use crate::main_storage::MainStorage;

/// Main storage and access log shared by all CPUs
pub struct GuestMemory {
    storage: MainStorage,
    log: Arc<dyn ConflictLog>,
}

impl GuestMemory {
    /// Zeroed memory of `page_count` pages with a fresh shared access log
    pub fn new(page_count: usize) -> Self {
        Self::with_log(page_count, Arc::new(SharedAccessLog::new()))
    }

    /// Memory using a caller-provided access log
    pub fn with_log(page_count: usize, log: Arc<dyn ConflictLog>) -> Self {
        GuestMemory {
            storage: MainStorage::new(page_count),
            log,
        }
    }

    /// Underlying page frames
    pub fn storage(&self) -> &MainStorage {
        &self.storage
    }

    /// Shared access log
    pub fn log(&self) -> &dyn ConflictLog {
        self.log.as_ref()
    }

    /// Non-transactional fetch by `cpu`
    pub fn fetch(&self, cpu: CpuId, address: u64, buf: &mut [u8]) -> TxfResult<()> {
        self.storage.check_range(address, buf.len())?;
        for span in line_spans(address, buf.len()) {
            let page = self.storage.page(span.page)?;
            let frame = page.read();
            buf[span.buffer_offset..span.buffer_offset + span.len]
                .copy_from_slice(&frame[span.offset..span.offset + span.len]);
            self.log.record(cpu, &span, AccessKind::Fetch);
        }
        Ok(())
    }

    /// Non-transactional store by `cpu`
    pub fn store(&self, cpu: CpuId, address: u64, data: &[u8]) -> TxfResult<()> {
        self.storage.check_range(address, data.len())?;
        for span in line_spans(address, data.len()) {
            let page = self.storage.page(span.page)?;
            let mut frame = page.write();
            frame[span.offset..span.offset + span.len]
                .copy_from_slice(&data[span.buffer_offset..span.buffer_offset + span.len]);
            self.log.record(cpu, &span, AccessKind::Store);
        }
        Ok(())
    }

    /// Stamp an access performed by an external storage path
    ///
    /// The caller must already have completed the access. Returns the last
    /// sequence number used, or the current one for an empty range.
    pub fn note_access(&self, cpu: CpuId, address: u64, len: usize, kind: AccessKind) -> u64 {
        let mut last = None;
        for span in line_spans(address, len) {
            last = Some(self.log.record(cpu, &span, kind));
        }
        last.unwrap_or_else(|| self.log.current_sequence())
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("pages", &self.storage.page_count())
            .field("sequence", &self.log.current_sequence())
            .finish()
    }
}
