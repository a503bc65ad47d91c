//! Core types for the transactional-execution facility
//!
//! This crate defines the foundational types used throughout the system:
//! - Limits: architectural constants (nesting depth, page and cache-line geometry)
//! - AbortCode: transaction abort codes (TAC) and their printable names
//! - ConditionCode: the condition codes a transaction can end with
//! - WhyAborted: the diagnostic bitmask of every contributing abort cause
//! - Tdb: the 256-byte transaction diagnostic block
//! - Error: error types (`TxfError`) and the typed abort signal (`TxAbort`)
//! - Types: CPU identifiers, access kinds, register state, interruption details

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abort_code;
pub mod error;
pub mod limits;
pub mod tdb;
pub mod types;
pub mod why;

pub use abort_code::{tac_long_description, tac_short_name, AbortCode, ConditionCode};
pub use error::{TxAbort, TxfError, TxfResult};
pub use limits::{
    cache_line_address, cache_line_index, line_spans, page_address, page_offset, LineSpan,
    MAX_CAPTURE_TRIES, MAX_TXF_CONTRAN_INSTR, MAX_TXF_PAGES, MAX_TXF_TND, ZCACHE_LINE_PAGE,
    ZCACHE_LINE_SHIFT, ZCACHE_LINE_SIZE, ZPAGEFRAME_BYTEMASK, ZPAGEFRAME_PAGEMASK,
    ZPAGEFRAME_PAGESIZE,
};
pub use tdb::{Tdb, TDB_CTI, TDB_CTV, TDB_SIZE};
pub use types::{
    AccessKind, CpuId, CpuRegisters, InterruptionInfo, PGM_ADDRESSING_EXCEPTION,
    PGM_TRANSACTION_CONSTRAINT_EXCEPTION,
};
pub use why::{format_why_aborted, WhyAborted};
