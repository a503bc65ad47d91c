//! Why-aborted bitmask
//!
//! Every cause that contributed to an abort decision sets its own bit. The
//! bits are independent and accumulate; the mask exists for tracing and
//! diagnostics only and never influences the abort disposition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Set of `TXF_WHY_*` flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WhyAborted(u32);

impl WhyAborted {
    /// Instruction-address trigger
    pub const INSTRADDR: WhyAborted = WhyAborted(0x8000_0000);
    /// Instruction-count trigger
    pub const INSTRCOUNT: WhyAborted = WhyAborted(0x4000_0000);
    /// Random abort injection
    pub const RAND_ABORT: WhyAborted = WhyAborted(0x2000_0000);
    /// COMPARE AND SWAP AND PURGE
    pub const CSP_INSTR: WhyAborted = WhyAborted(0x1000_0000);
    /// COMPARE AND SWAP AND PURGE (long)
    pub const CSPG_INSTR: WhyAborted = WhyAborted(0x0800_0000);
    /// SIE exit
    pub const SIE_EXIT: WhyAborted = WhyAborted(0x0400_0000);
    /// Cache-line conflict
    pub const CONFLICT: WhyAborted = WhyAborted(0x0200_0000);
    /// Maximum pages exceeded
    pub const MAX_PAGES: WhyAborted = WhyAborted(0x0100_0000);
    /// External interruption
    pub const EXT_INT: WhyAborted = WhyAborted(0x0080_0000);
    /// Unfiltered program interruption
    pub const UNFILT_INT: WhyAborted = WhyAborted(0x0040_0000);
    /// Filtered program interruption
    pub const FILT_INT: WhyAborted = WhyAborted(0x0020_0000);
    /// Restart interruption
    pub const RESTART_INT: WhyAborted = WhyAborted(0x0010_0000);
    /// I/O interruption
    pub const IO_INT: WhyAborted = WhyAborted(0x0008_0000);
    /// Machine-check interruption
    pub const MCK_INT: WhyAborted = WhyAborted(0x0004_0000);
    /// Abort requested earlier, taken later
    pub const DELAYED_ABORT: WhyAborted = WhyAborted(0x0002_0000);
    /// TABORT instruction
    pub const TABORT_INSTR: WhyAborted = WhyAborted(0x0001_0000);
    /// Instruction not allowed in a constrained transaction
    pub const CONTRAN_INSTR: WhyAborted = WhyAborted(0x0000_8000);
    /// Branch not allowed in a constrained transaction
    pub const CONTRAN_BRANCH: WhyAborted = WhyAborted(0x0000_4000);
    /// Backward relative branch in a constrained transaction
    pub const CONTRAN_RELATIVE_BRANCH: WhyAborted = WhyAborted(0x0000_2000);
    /// Instruction not allowed in a transaction
    pub const TRAN_INSTR: WhyAborted = WhyAborted(0x0000_1000);
    /// Floating-point instruction with the F control off
    pub const TRAN_FLOAT_INSTR: WhyAborted = WhyAborted(0x0000_0800);
    /// Access-register instruction with the A control off
    pub const TRAN_ACCESS_INSTR: WhyAborted = WhyAborted(0x0000_0400);
    /// Non-relative branch in a transaction
    pub const TRAN_NONRELATIVE_BRANCH: WhyAborted = WhyAborted(0x0000_0200);
    /// Branch-and-set-mode in a transaction
    pub const TRAN_BRANCH_SET_MODE: WhyAborted = WhyAborted(0x0000_0100);
    /// Set-addressing-mode in a transaction
    pub const TRAN_SET_ADDRESSING_MODE: WhyAborted = WhyAborted(0x0000_0080);
    /// Miscellaneous restricted instruction
    pub const TRAN_MISC_INSTR: WhyAborted = WhyAborted(0x0000_0040);
    /// Nesting depth exceeded
    pub const NESTING: WhyAborted = WhyAborted(0x0000_0020);
    /// Constrained transaction retries exhausted
    pub const CAPTURE_FAIL: WhyAborted = WhyAborted(0x0000_0010);

    /// Empty mask
    pub const fn empty() -> Self {
        WhyAborted(0)
    }

    /// Mask from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        WhyAborted(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when no bit is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set
    pub const fn contains(self, other: WhyAborted) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set
    pub const fn intersects(self, other: WhyAborted) -> bool {
        self.0 & other.0 != 0
    }

    /// Add the bits of `other`
    pub fn insert(&mut self, other: WhyAborted) {
        self.0 |= other.0;
    }

    /// Names of every set bit, most significant first
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        WHY_NAMES
            .iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
    }
}

static WHY_NAMES: [(WhyAborted, &'static str); 28] = [
    (WhyAborted::INSTRADDR, "INSTRADDR"),
    (WhyAborted::INSTRCOUNT, "INSTRCOUNT"),
    (WhyAborted::RAND_ABORT, "RAND_ABORT"),
    (WhyAborted::CSP_INSTR, "CSP_INSTR"),
    (WhyAborted::CSPG_INSTR, "CSPG_INSTR"),
    (WhyAborted::SIE_EXIT, "SIE_EXIT"),
    (WhyAborted::CONFLICT, "CONFLICT"),
    (WhyAborted::MAX_PAGES, "MAX_PAGES"),
    (WhyAborted::EXT_INT, "EXT_INT"),
    (WhyAborted::UNFILT_INT, "UNFILT_INT"),
    (WhyAborted::FILT_INT, "FILT_INT"),
    (WhyAborted::RESTART_INT, "RESTART_INT"),
    (WhyAborted::IO_INT, "IO_INT"),
    (WhyAborted::MCK_INT, "MCK_INT"),
    (WhyAborted::DELAYED_ABORT, "DELAYED_ABORT"),
    (WhyAborted::TABORT_INSTR, "TABORT_INSTR"),
    (WhyAborted::CONTRAN_INSTR, "CONTRAN_INSTR"),
    (WhyAborted::CONTRAN_BRANCH, "CONTRAN_BRANCH"),
    (WhyAborted::CONTRAN_RELATIVE_BRANCH, "CONTRAN_RELATIVE_BRANCH"),
    (WhyAborted::TRAN_INSTR, "TRAN_INSTR"),
    (WhyAborted::TRAN_FLOAT_INSTR, "TRAN_FLOAT_INSTR"),
    (WhyAborted::TRAN_ACCESS_INSTR, "TRAN_ACCESS_INSTR"),
    (WhyAborted::TRAN_NONRELATIVE_BRANCH, "TRAN_NONRELATIVE_BRANCH"),
    (WhyAborted::TRAN_BRANCH_SET_MODE, "TRAN_BRANCH_SET_MODE"),
    (WhyAborted::TRAN_SET_ADDRESSING_MODE, "TRAN_SET_ADDRESSING_MODE"),
    (WhyAborted::TRAN_MISC_INSTR, "TRAN_MISC_INSTR"),
    (WhyAborted::NESTING, "NESTING"),
    (WhyAborted::CAPTURE_FAIL, "CAPTURE_FAIL"),
];

impl BitOr for WhyAborted {
    type Output = WhyAborted;

    fn bitor(self, rhs: WhyAborted) -> WhyAborted {
        WhyAborted(self.0 | rhs.0)
    }
}

impl BitOrAssign for WhyAborted {
    fn bitor_assign(&mut self, rhs: WhyAborted) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for WhyAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_why_aborted(self.0))
    }
}

/// Render a why-aborted bitmask as space-separated flag names
///
/// Bits without a name (the four reserved low-order bits) are shown as a
/// trailing hex remainder. An empty mask renders as `"(none)"`.
pub fn format_why_aborted(bits: u32) -> String {
    let why = WhyAborted::from_bits(bits);
    let mut text: Vec<String> = why.names().map(str::to_string).collect();

    let known = WHY_NAMES.iter().fold(0, |acc, (flag, _)| acc | flag.0);
    let unknown = bits & !known;
    if unknown != 0 {
        text.push(format!("0x{:08X}", unknown));
    }

    if text.is_empty() {
        "(none)".to_string()
    } else {
        text.join(" ")
    }
}
