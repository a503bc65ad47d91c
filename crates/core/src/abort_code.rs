//! Transaction abort codes and condition codes
//!
//! An abort code (TAC) is stored in the diagnostic block and identifies why a
//! transaction could not complete. Codes 256 and above are reserved for the
//! TABORT instruction, whose operand becomes the abort code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction abort code (TAC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbortCode(u64);

impl AbortCode {
    /// External interruption
    pub const EXT: AbortCode = AbortCode(2);
    /// Program interruption (unfiltered)
    pub const UPGM: AbortCode = AbortCode(4);
    /// Machine-check interruption
    pub const MCK: AbortCode = AbortCode(5);
    /// I/O interruption
    pub const IO: AbortCode = AbortCode(6);
    /// Fetch overflow
    pub const FETCH_OVF: AbortCode = AbortCode(7);
    /// Store overflow
    pub const STORE_OVF: AbortCode = AbortCode(8);
    /// Fetch conflict
    pub const FETCH_CNF: AbortCode = AbortCode(9);
    /// Store conflict
    pub const STORE_CNF: AbortCode = AbortCode(10);
    /// Restricted instruction
    pub const INSTR: AbortCode = AbortCode(11);
    /// Program interruption (filtered)
    pub const FPGM: AbortCode = AbortCode(12);
    /// Nesting depth exceeded
    pub const NESTING: AbortCode = AbortCode(13);
    /// Cache (fetch related)
    pub const FETCH_OTH: AbortCode = AbortCode(14);
    /// Cache (store related)
    pub const STORE_OTH: AbortCode = AbortCode(15);
    /// Cache (other)
    pub const CACHE_OTH: AbortCode = AbortCode(16);
    /// Guarded-storage event related
    pub const GUARDED: AbortCode = AbortCode(19);
    /// Miscellaneous condition
    pub const MISC: AbortCode = AbortCode(255);
    /// TABORT instruction (lowest TABORT code)
    pub const TABORT: AbortCode = AbortCode(256);

    /// Wrap a raw abort code
    pub const fn new(raw: u64) -> Self {
        AbortCode(raw)
    }

    /// Raw abort code value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// True for codes produced by the TABORT instruction
    pub const fn is_tabort(self) -> bool {
        self.0 >= Self::TABORT.0
    }

    /// True for the two conflict codes
    pub const fn is_conflict(self) -> bool {
        self.0 == Self::FETCH_CNF.0 || self.0 == Self::STORE_CNF.0
    }

    /// Short symbolic name, e.g. `"TAC_INSTR"`
    pub fn short_name(self) -> &'static str {
        match self.0 {
            2 => "TAC_EXT",
            4 => "TAC_UPGM",
            5 => "TAC_MCK",
            6 => "TAC_IO",
            7 => "TAC_FETCH_OVF",
            8 => "TAC_STORE_OVF",
            9 => "TAC_FETCH_CNF",
            10 => "TAC_STORE_CNF",
            11 => "TAC_INSTR",
            12 => "TAC_FPGM",
            13 => "TAC_NESTING",
            14 => "TAC_FETCH_OTH",
            15 => "TAC_STORE_OTH",
            16 => "TAC_CACHE_OTH",
            19 => "TAC_GUARDED",
            255 => "TAC_MISC",
            n if n >= 256 => "TAC_TABORT",
            _ => "TAC_UNKNOWN",
        }
    }

    /// Long human-readable description, e.g. `"Restricted instruction"`
    pub fn long_description(self) -> &'static str {
        match self.0 {
            2 => "External interruption",
            4 => "PGM Interruption (Unfiltered)",
            5 => "Machine-check Interruption",
            6 => "I/O Interruption",
            7 => "Fetch overflow",
            8 => "Store overflow",
            9 => "Fetch conflict",
            10 => "Store conflict",
            11 => "Restricted instruction",
            12 => "PGM Interruption (Filtered)",
            13 => "Nesting Depth exceeded",
            14 => "Cache (fetch related)",
            15 => "Cache (store related)",
            16 => "Cache (other)",
            19 => "Guarded-Storage Event related",
            255 => "Miscellaneous condition",
            n if n >= 256 => "TABORT instruction",
            _ => "Unknown abort code",
        }
    }
}

impl From<u64> for AbortCode {
    fn from(raw: u64) -> Self {
        AbortCode(raw)
    }
}

impl fmt::Display for AbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.short_name(), self.0)
    }
}

/// Short name of a raw abort code
pub fn tac_short_name(code: u64) -> &'static str {
    AbortCode::new(code).short_name()
}

/// Long description of a raw abort code
pub fn tac_long_description(code: u64) -> &'static str {
    AbortCode::new(code).long_description()
}

/// Condition code a transaction begin or abort leaves in the PSW
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConditionCode {
    /// Transaction successfully initiated
    Success = 0,
    /// Indeterminate condition; successful retry unlikely
    Indeterminate = 1,
    /// Transient condition; successful retry likely
    Transient = 2,
    /// Persistent condition; successful retry not likely under current conditions
    Persistent = 3,
}

impl ConditionCode {
    /// Numeric condition code
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// True when retrying the transaction is likely to succeed
    pub const fn is_retriable(self) -> bool {
        matches!(self, ConditionCode::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names() {
        assert_eq!(tac_short_name(11), "TAC_INSTR");
        assert_eq!(tac_short_name(9), "TAC_FETCH_CNF");
        assert_eq!(tac_short_name(255), "TAC_MISC");
        assert_eq!(tac_short_name(256), "TAC_TABORT");
        assert_eq!(tac_short_name(4711), "TAC_TABORT");
        assert_eq!(tac_short_name(3), "TAC_UNKNOWN");
    }

    #[test]
    fn test_long_descriptions() {
        assert_eq!(tac_long_description(11), "Restricted instruction");
        assert_eq!(tac_long_description(13), "Nesting Depth exceeded");
        assert_eq!(tac_long_description(1000), "TABORT instruction");
        assert_eq!(tac_long_description(0), "Unknown abort code");
    }

    #[test]
    fn test_classification_helpers() {
        assert!(AbortCode::new(300).is_tabort());
        assert!(!AbortCode::MISC.is_tabort());
        assert!(AbortCode::FETCH_CNF.is_conflict());
        assert!(AbortCode::STORE_CNF.is_conflict());
        assert!(!AbortCode::FETCH_OVF.is_conflict());
    }

    #[test]
    fn test_display() {
        assert_eq!(AbortCode::NESTING.to_string(), "TAC_NESTING (13)");
    }

    #[test]
    fn test_condition_codes() {
        assert_eq!(ConditionCode::Success.as_u8(), 0);
        assert_eq!(ConditionCode::Indeterminate.as_u8(), 1);
        assert_eq!(ConditionCode::Transient.as_u8(), 2);
        assert_eq!(ConditionCode::Persistent.as_u8(), 3);
        assert!(ConditionCode::Transient.is_retriable());
        assert!(!ConditionCode::Persistent.is_retriable());
    }
}
