//! Per-page shadow state of a running transaction
//!
//! The first transactional touch of a page captures it: a clean copy of the
//! page is taken under the page's read lock (`alt_page`) together with the
//! access-log sequence current at that moment (`since`). A second copy
//! (`work_page`) becomes the transaction's private view; transactional
//! stores land there and never in main storage until commit.
//!
//! # Line states
//!
//! Each of the 16 cache lines carries a monotone state:
//!
//! ```text
//! Clean --fetch--> Fetched --store--> Stored
//! Clean --store---------------------> Stored
//! ```
//!
//! A state never decreases while the map lives. Maps are discarded on abort
//! and after the outermost commit has merged stored lines into main storage.

use std::fmt;
use std::sync::Arc;

use txf_core::{cache_line_address, AccessKind, ZCACHE_LINE_PAGE, ZCACHE_LINE_SIZE};
use txf_storage::{ConflictLog, GuestPage, PageFrame};

/// Transactional state of one cache line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LineState {
    /// Not accessed by the transaction
    #[default]
    Clean = 0,
    /// Fetched, not stored
    Fetched = 1,
    /// Stored (possibly also fetched)
    Stored = 2,
}

impl LineState {
    /// State after an access of the given kind
    pub fn after(self, kind: AccessKind) -> LineState {
        match kind {
            AccessKind::Fetch => self.max(LineState::Fetched),
            AccessKind::Store => LineState::Stored,
        }
    }

    /// One-character symbol used in page map dumps
    pub fn symbol(self) -> char {
        match self {
            LineState::Clean => '.',
            LineState::Fetched => 'F',
            LineState::Stored => 'S',
        }
    }
}

/// Shadow state for one page touched by a transaction
pub struct PageShadowMap {
    virtual_page_address: u64,
    main_page: Arc<GuestPage>,
    alt_page: Box<PageFrame>,
    work_page: Box<PageFrame>,
    line_state: [LineState; ZCACHE_LINE_PAGE],
    since: u64,
    level: u16,
}

impl PageShadowMap {
    /// Capture `main_page` for a transaction running at nesting `level`
    ///
    /// The copy and the log sequence are taken while the page read lock is
    /// held, so every later foreign access to the page is stamped after
    /// `since`.
    pub fn capture(
        virtual_page_address: u64,
        main_page: Arc<GuestPage>,
        log: &dyn ConflictLog,
        level: u16,
    ) -> Self {
        let (alt_page, since) = {
            let frame = main_page.read();
            (frame.clone(), log.current_sequence())
        };
        let work_page = alt_page.clone();
        PageShadowMap {
            virtual_page_address,
            main_page,
            alt_page,
            work_page,
            line_state: [LineState::Clean; ZCACHE_LINE_PAGE],
            since,
            level,
        }
    }

    /// Guest page address this map shadows
    pub fn virtual_page_address(&self) -> u64 {
        self.virtual_page_address
    }

    /// Backing page in main storage
    pub fn main_page(&self) -> &Arc<GuestPage> {
        &self.main_page
    }

    /// Clean copy taken at first touch
    pub fn alt_page(&self) -> &PageFrame {
        &self.alt_page
    }

    /// The transaction's private view of the page
    pub fn work_page(&self) -> &PageFrame {
        &self.work_page
    }

    /// Access-log sequence at capture time
    pub fn since(&self) -> u64 {
        self.since
    }

    /// Nesting level that captured the page
    pub fn level(&self) -> u16 {
        self.level
    }

    pub(crate) fn set_level(&mut self, level: u16) {
        self.level = level;
    }

    /// State of cache line `line`, or `None` past the end of the page
    pub fn line_state(&self, line: usize) -> Option<LineState> {
        self.line_state.get(line).copied()
    }

    /// All line states, indexed by line
    pub fn line_states(&self) -> &[LineState; ZCACHE_LINE_PAGE] {
        &self.line_state
    }

    /// Escalate the state of `line` for an access; returns the new state
    pub(crate) fn mark(&mut self, line: usize, kind: AccessKind) -> LineState {
        let next = self.line_state[line].after(kind);
        self.line_state[line] = next;
        next
    }

    /// Lines that are not clean, with their state
    pub fn touched_lines(&self) -> impl Iterator<Item = (usize, LineState)> + '_ {
        self.line_state
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, state)| *state != LineState::Clean)
    }

    /// Lines in state `Stored`
    pub fn stored_lines(&self) -> impl Iterator<Item = usize> + '_ {
        self.touched_lines()
            .filter(|(_, state)| *state == LineState::Stored)
            .map(|(line, _)| line)
    }

    /// Cache-line address of `line`
    pub fn line_address(&self, line: usize) -> u64 {
        cache_line_address(self.virtual_page_address, line)
    }

    /// Copy bytes of the private view starting at `offset` into `buf`
    pub(crate) fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.work_page[offset..offset + buf.len()]);
    }

    /// Write `data` into the private view at `offset`
    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) {
        self.work_page[offset..offset + data.len()].copy_from_slice(data);
    }

    /// True when `frame` no longer matches the clean copy on `line`
    pub(crate) fn line_changed(&self, frame: &PageFrame, line: usize) -> bool {
        let range = line_range(line);
        frame[range.clone()] != self.alt_page[range]
    }

    /// Copy every stored line of the private view into `frame`
    ///
    /// Returns the number of lines copied.
    pub(crate) fn merge_into(&self, frame: &mut PageFrame) -> usize {
        let mut merged = 0;
        for line in self.stored_lines() {
            let range = line_range(line);
            frame[range.clone()].copy_from_slice(&self.work_page[range]);
            merged += 1;
        }
        merged
    }
}

impl fmt::Debug for PageShadowMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: String = self.line_state.iter().map(|s| s.symbol()).collect();
        f.debug_struct("PageShadowMap")
            .field("virtual_page_address", &format_args!("{:016X}", self.virtual_page_address))
            .field("lines", &states)
            .field("since", &self.since)
            .field("level", &self.level)
            .finish()
    }
}

fn line_range(line: usize) -> std::ops::Range<usize> {
    let start = line * ZCACHE_LINE_SIZE;
    start..start + ZCACHE_LINE_SIZE
}
