//! Architectural limits and storage geometry
//!
//! These values are fixed by the architecture. Exceeding a transactional limit
//! is itself an abort cause; the geometry constants define the granularity of
//! shadow copies (pages) and of conflict detection (cache lines).

/// Maximum transaction nesting depth
pub const MAX_TXF_TND: u16 = 15;

/// Maximum number of instructions in a constrained transaction
pub const MAX_TXF_CONTRAN_INSTR: u32 = 32;

/// Maximum number of distinct pages touched in one nesting level
pub const MAX_TXF_PAGES: usize = 64;

/// Maximum silent re-executions of a failing constrained transaction
pub const MAX_CAPTURE_TRIES: u32 = 128;

/// Page size (4K)
pub const ZPAGEFRAME_PAGESIZE: usize = 4096;

/// Mask selecting the byte offset within a page
pub const ZPAGEFRAME_BYTEMASK: u64 = 0x0000_0000_0000_0FFF;

/// Mask selecting the page address
pub const ZPAGEFRAME_PAGEMASK: u64 = 0xFFFF_FFFF_FFFF_F000;

/// Cache line size
pub const ZCACHE_LINE_SIZE: usize = 256;

/// Shift converting a page offset to a cache line index
pub const ZCACHE_LINE_SHIFT: u32 = 8;

/// Cache lines per page
pub const ZCACHE_LINE_PAGE: usize = ZPAGEFRAME_PAGESIZE / ZCACHE_LINE_SIZE;

static_assertions::const_assert_eq!(ZCACHE_LINE_PAGE, 16);
static_assertions::const_assert_eq!(1usize << ZCACHE_LINE_SHIFT, ZCACHE_LINE_SIZE);

/// Page address containing `address`
#[inline]
pub fn page_address(address: u64) -> u64 {
    address & ZPAGEFRAME_PAGEMASK
}

/// Byte offset of `address` within its page
#[inline]
pub fn page_offset(address: u64) -> usize {
    (address & ZPAGEFRAME_BYTEMASK) as usize
}

/// Index (0..16) of the cache line containing `address` within its page
#[inline]
pub fn cache_line_index(address: u64) -> usize {
    page_offset(address) >> ZCACHE_LINE_SHIFT
}

/// Address of cache line `line` of the page at `page`
#[inline]
pub fn cache_line_address(page: u64, line: usize) -> u64 {
    page_address(page) | ((line as u64) << ZCACHE_LINE_SHIFT)
}

/// The part of an access that falls within a single page
///
/// `first_line..=last_line` are the cache lines covered, `offset..offset+len`
/// the bytes within the page, and `buffer_offset` the position of the first
/// byte within the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    /// Page address
    pub page: u64,
    /// Byte offset within the page
    pub offset: usize,
    /// Number of bytes within this page
    pub len: usize,
    /// Offset of this span within the whole access
    pub buffer_offset: usize,
    /// First cache line touched
    pub first_line: usize,
    /// Last cache line touched (inclusive)
    pub last_line: usize,
}

impl LineSpan {
    /// Cache lines covered by this span
    pub fn lines(&self) -> std::ops::RangeInclusive<usize> {
        self.first_line..=self.last_line
    }
}

/// Split the access `[address, address + len)` into per-page spans
///
/// Addresses wrap at the top of the 64-bit address space. A zero-length
/// access covers nothing.
pub fn line_spans(address: u64, len: usize) -> Vec<LineSpan> {
    let mut spans = Vec::new();
    let mut current = address;
    let mut remaining = len;
    let mut buffer_offset = 0;

    while remaining > 0 {
        let offset = page_offset(current);
        let chunk = remaining.min(ZPAGEFRAME_PAGESIZE - offset);
        spans.push(LineSpan {
            page: page_address(current),
            offset,
            len: chunk,
            buffer_offset,
            first_line: offset >> ZCACHE_LINE_SHIFT,
            last_line: (offset + chunk - 1) >> ZCACHE_LINE_SHIFT,
        });
        remaining -= chunk;
        buffer_offset += chunk;
        current = current.wrapping_add(chunk as u64);
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(page_address(0x1234_5678), 0x1234_5000);
        assert_eq!(page_offset(0x1234_5678), 0x678);
        assert_eq!(cache_line_index(0x1234_5678), 6);
        assert_eq!(cache_line_address(0x5000, 3), 0x5300);
    }

    #[test]
    fn test_single_line_span() {
        let spans = line_spans(0x2310, 8);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].page, 0x2000);
        assert_eq!(spans[0].lines(), 3..=3);
        assert_eq!(spans[0].offset, 0x310);
    }

    #[test]
    fn test_span_crossing_lines() {
        let spans = line_spans(0x20F8, 16);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].lines(), 0..=1);
    }

    #[test]
    fn test_span_crossing_pages() {
        let spans = line_spans(0x2FFC, 8);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].page, 0x2000);
        assert_eq!(spans[0].len, 4);
        assert_eq!(spans[0].lines(), 15..=15);
        assert_eq!(spans[1].page, 0x3000);
        assert_eq!(spans[1].buffer_offset, 4);
        assert_eq!(spans[1].lines(), 0..=0);
    }

    #[test]
    fn test_zero_length() {
        assert!(line_spans(0x1000, 0).is_empty());
    }

    #[test]
    fn test_wraps_at_top_of_address_space() {
        let spans = line_spans(u64::MAX - 1, 4);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].page, 0);
    }
}
