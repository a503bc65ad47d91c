//! Guest main storage
//!
//! Storage is a flat array of 4K page frames, each behind its own
//! `parking_lot::RwLock`. A page lock is held only for the duration of one
//! access to that page; multi-page accesses take the locks one page at a
//! time, so the only code holding several page locks at once is transaction
//! commit, which acquires them in ascending address order.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use txf_core::{line_spans, page_address, TxfError, TxfResult, ZPAGEFRAME_PAGESIZE};

/// Contents of one page frame
pub type PageFrame = [u8; ZPAGEFRAME_PAGESIZE];

/// One guest page frame
#[derive(Debug)]
pub struct GuestPage {
    address: u64,
    frame: RwLock<Box<PageFrame>>,
}

impl GuestPage {
    fn new(address: u64) -> Self {
        GuestPage {
            address,
            frame: RwLock::new(Box::new([0u8; ZPAGEFRAME_PAGESIZE])),
        }
    }

    /// Page address of this frame
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Shared access to the frame
    pub fn read(&self) -> RwLockReadGuard<'_, Box<PageFrame>> {
        self.frame.read()
    }

    /// Exclusive access to the frame
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<PageFrame>> {
        self.frame.write()
    }

    /// Copy of the current frame contents
    pub fn snapshot(&self) -> Box<PageFrame> {
        Box::new(**self.frame.read())
    }
}

/// Guest main storage
#[derive(Debug)]
pub struct MainStorage {
    pages: Vec<Arc<GuestPage>>,
}

impl MainStorage {
    /// Zeroed storage of `page_count` 4K pages
    pub fn new(page_count: usize) -> Self {
        let pages = (0..page_count)
            .map(|i| Arc::new(GuestPage::new((i * ZPAGEFRAME_PAGESIZE) as u64)))
            .collect();
        MainStorage { pages }
    }

    /// Number of page frames
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Storage size in bytes
    pub fn size(&self) -> u64 {
        (self.pages.len() * ZPAGEFRAME_PAGESIZE) as u64
    }

    /// True when every byte of `[address, address + len)` exists
    pub fn contains(&self, address: u64, len: usize) -> bool {
        match address.checked_add(len as u64) {
            Some(end) => end <= self.size(),
            None => false,
        }
    }

    /// Fail with `TxfError::Addressing` unless the range exists
    pub fn check_range(&self, address: u64, len: usize) -> TxfResult<()> {
        if self.contains(address, len) {
            Ok(())
        } else {
            Err(TxfError::Addressing { address, len })
        }
    }

    /// Page frame containing `address`
    pub fn page(&self, address: u64) -> TxfResult<Arc<GuestPage>> {
        let index = (page_address(address) / ZPAGEFRAME_PAGESIZE as u64) as usize;
        self.pages
            .get(index)
            .cloned()
            .ok_or(TxfError::Addressing { address, len: 1 })
    }

    /// Read `buf.len()` bytes starting at `address`
    pub fn read(&self, address: u64, buf: &mut [u8]) -> TxfResult<()> {
        self.check_range(address, buf.len())?;
        for span in line_spans(address, buf.len()) {
            let page = self.page(span.page)?;
            let frame = page.read();
            buf[span.buffer_offset..span.buffer_offset + span.len]
                .copy_from_slice(&frame[span.offset..span.offset + span.len]);
        }
        Ok(())
    }

    /// Write `data` starting at `address`
    pub fn write(&self, address: u64, data: &[u8]) -> TxfResult<()> {
        self.check_range(address, data.len())?;
        for span in line_spans(address, data.len()) {
            let page = self.page(span.page)?;
            let mut frame = page.write();
            frame[span.offset..span.offset + span.len]
                .copy_from_slice(&data[span.buffer_offset..span.buffer_offset + span.len]);
        }
        Ok(())
    }
}
