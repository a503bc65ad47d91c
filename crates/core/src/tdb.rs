//! Transaction diagnostic block (TDB)
//!
//! The TDB is written into guest storage when a transaction aborts, so its
//! layout is architecturally fixed and must be reproduced byte for byte.
//!
//! # Format
//!
//! ```text
//! +--------+------+--------------------------------------+
//! | offset | size | field                                |
//! +--------+------+--------------------------------------+
//! |   0    |  1   | format (0 invalid, 1 valid)          |
//! |   1    |  1   | flags (CTV 0x80, CTI 0x40)           |
//! |   2    |  4   | reserved                             |
//! |   6    |  2   | transaction nesting depth            |
//! |   8    |  8   | transaction abort code               |
//! |  16    |  8   | conflict token                       |
//! |  24    |  8   | aborted-transaction instruction addr |
//! |  32    |  1   | exception access identifier          |
//! |  33    |  1   | data-exception code                  |
//! |  34    |  2   | reserved                             |
//! |  36    |  4   | program-interruption identifier      |
//! |  40    |  8   | translation-exception identifier     |
//! |  48    |  8   | breaking-event address               |
//! |  56    |  72  | reserved                             |
//! |  128   |  128 | general registers 0-15               |
//! +--------+------+--------------------------------------+
//! ```
//!
//! Guest storage is big-endian; [`Tdb::to_bytes`] and [`Tdb::from_bytes`]
//! convert between the in-memory struct and the guest image.

use crate::abort_code::AbortCode;
use crate::error::{TxfError, TxfResult};
use byteorder::{BigEndian, ByteOrder};
use std::mem::{offset_of, size_of};

/// Size of the diagnostic block in bytes
pub const TDB_SIZE: usize = 256;

/// Conflict-token validity
pub const TDB_CTV: u8 = 0x80;

/// Constrained-transaction indicator
pub const TDB_CTI: u8 = 0x40;

/// Transaction diagnostic block
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tdb {
    /// Format, 0 = invalid, 1 = valid
    pub format: u8,
    /// `TDB_CTV` / `TDB_CTI`
    pub flags: u8,
    resv1: [u8; 4],
    /// Transaction nesting depth at abort
    pub tnd: u16,
    /// Transaction abort code
    pub tac: u64,
    /// Conflict token
    pub conflict: u64,
    /// Aborted-transaction instruction address
    pub atia: u64,
    /// Exception access identifier
    pub eaid: u8,
    /// Data-exception code
    pub dxc: u8,
    resv2: [u8; 2],
    /// Program-interruption identifier
    pub piid: u32,
    /// Translation-exception identifier
    pub teid: u64,
    /// Breaking-event address
    pub bea: u64,
    resv3: [u64; 9],
    /// General registers at the abort point
    pub gpr: [u64; 16],
}

static_assertions::const_assert_eq!(size_of::<Tdb>(), TDB_SIZE);
static_assertions::const_assert_eq!(offset_of!(Tdb, tnd), 6);
static_assertions::const_assert_eq!(offset_of!(Tdb, tac), 8);
static_assertions::const_assert_eq!(offset_of!(Tdb, atia), 24);
static_assertions::const_assert_eq!(offset_of!(Tdb, eaid), 32);
static_assertions::const_assert_eq!(offset_of!(Tdb, piid), 36);
static_assertions::const_assert_eq!(offset_of!(Tdb, bea), 48);
static_assertions::const_assert_eq!(offset_of!(Tdb, gpr), 128);

impl Tdb {
    /// A valid (format 1) block for the given abort code and depth
    pub fn new(tac: AbortCode, tnd: u16) -> Self {
        Tdb {
            format: 1,
            tnd,
            tac: tac.as_u64(),
            ..Default::default()
        }
    }

    /// True when the block is format 1
    pub fn is_valid(&self) -> bool {
        self.format == 1
    }

    /// Abort code as a typed value
    pub fn abort_code(&self) -> AbortCode {
        AbortCode::new(self.tac)
    }

    /// Record the conflict token and mark it valid
    pub fn set_conflict_token(&mut self, token: u64) {
        self.conflict = token;
        self.flags |= TDB_CTV;
    }

    /// Conflict token if the CTV flag is set
    pub fn conflict_token(&self) -> Option<u64> {
        (self.flags & TDB_CTV != 0).then_some(self.conflict)
    }

    /// Mark the block as describing a constrained transaction
    pub fn set_constrained(&mut self) {
        self.flags |= TDB_CTI;
    }

    /// True when the CTI flag is set
    pub fn is_constrained(&self) -> bool {
        self.flags & TDB_CTI != 0
    }

    /// Big-endian guest image
    pub fn to_bytes(&self) -> [u8; TDB_SIZE] {
        let mut buf = [0u8; TDB_SIZE];

        buf[0] = self.format;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.resv1);
        BigEndian::write_u16(&mut buf[6..8], self.tnd);
        BigEndian::write_u64(&mut buf[8..16], self.tac);
        BigEndian::write_u64(&mut buf[16..24], self.conflict);
        BigEndian::write_u64(&mut buf[24..32], self.atia);
        buf[32] = self.eaid;
        buf[33] = self.dxc;
        buf[34..36].copy_from_slice(&self.resv2);
        BigEndian::write_u32(&mut buf[36..40], self.piid);
        BigEndian::write_u64(&mut buf[40..48], self.teid);
        BigEndian::write_u64(&mut buf[48..56], self.bea);
        BigEndian::write_u64_into(&self.resv3, &mut buf[56..128]);
        BigEndian::write_u64_into(&self.gpr, &mut buf[128..256]);

        buf
    }

    /// Decode a guest image
    ///
    /// # Errors
    /// Returns `TxfError::InvalidRecord` if `bytes` is not exactly 256 bytes.
    pub fn from_bytes(bytes: &[u8]) -> TxfResult<Self> {
        if bytes.len() != TDB_SIZE {
            return Err(TxfError::InvalidRecord(format!(
                "expected {} bytes, got {}",
                TDB_SIZE,
                bytes.len()
            )));
        }

        let mut tdb = Tdb {
            format: bytes[0],
            flags: bytes[1],
            tnd: BigEndian::read_u16(&bytes[6..8]),
            tac: BigEndian::read_u64(&bytes[8..16]),
            conflict: BigEndian::read_u64(&bytes[16..24]),
            atia: BigEndian::read_u64(&bytes[24..32]),
            eaid: bytes[32],
            dxc: bytes[33],
            piid: BigEndian::read_u32(&bytes[36..40]),
            teid: BigEndian::read_u64(&bytes[40..48]),
            bea: BigEndian::read_u64(&bytes[48..56]),
            ..Default::default()
        };
        tdb.resv1.copy_from_slice(&bytes[2..6]);
        tdb.resv2.copy_from_slice(&bytes[34..36]);
        BigEndian::read_u64_into(&bytes[56..128], &mut tdb.resv3);
        BigEndian::read_u64_into(&bytes[128..256], &mut tdb.gpr);

        Ok(tdb)
    }
}
