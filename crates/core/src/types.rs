//! Small shared types: CPU identity, access kinds, register state

use serde::{Deserialize, Serialize};
use std::fmt;

/// Program-interruption code for an addressing exception
pub const PGM_ADDRESSING_EXCEPTION: u16 = 0x0005;

/// Program-interruption code for a transaction-constraint exception
pub const PGM_TRANSACTION_CONSTRAINT_EXCEPTION: u16 = 0x0018;

/// Emulated CPU address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuId(pub u16);

impl CpuId {
    /// Raw CPU address
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CP{:02X}", self.0)
    }
}

/// Kind of storage access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// Storage was read
    Fetch,
    /// Storage was written
    Store,
}

impl AccessKind {
    /// True for stores
    pub const fn is_store(self) -> bool {
        matches!(self, AccessKind::Store)
    }
}

/// The slice of CPU state the facility reads and rewrites
///
/// The dispatcher owns the full CPU; it hands this structure to the
/// facility so that an abort can snapshot the general registers into the
/// diagnostic block, restore the saved register pairs, set the condition
/// code and redirect the instruction address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuRegisters {
    /// General purpose registers
    pub gpr: [u64; 16],
    /// PSW instruction address
    pub psw_address: u64,
    /// PSW condition code
    pub cc: u8,
    /// Breaking-event address
    pub bea: u64,
}

/// Details of a program interruption that caused an abort
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptionInfo {
    /// Program interruption code
    pub code: u16,
    /// Instruction length code
    pub ilc: u8,
    /// Data-exception code
    pub dxc: u8,
    /// Exception access identifier
    pub eaid: u8,
    /// Translation-exception identification
    pub teid: u64,
}

impl InterruptionInfo {
    /// Interruption with only a code set
    pub fn with_code(code: u16) -> Self {
        InterruptionInfo {
            code,
            ..Default::default()
        }
    }

    /// Program-interruption identifier (ILC above the interruption code)
    pub fn piid(&self) -> u32 {
        ((self.ilc as u32) << 16) | self.code as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_id_display() {
        assert_eq!(CpuId(0).to_string(), "CP00");
        assert_eq!(CpuId(0x1F).to_string(), "CP1F");
    }

    #[test]
    fn test_piid() {
        let info = InterruptionInfo {
            code: 0x0011,
            ilc: 4,
            ..Default::default()
        };
        assert_eq!(info.piid(), 0x0004_0011);
        assert_eq!(InterruptionInfo::with_code(5).piid(), 5);
    }
}
