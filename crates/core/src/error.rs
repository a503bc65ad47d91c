//! Error types for the transactional-execution facility
//!
//! Two kinds of failure travel through the system:
//! - [`TxfError`]: caller misuse, configuration problems and internal
//!   consistency faults. These never become guest-visible conditions.
//! - [`TxAbort`]: the typed signal that the running transaction must abort.
//!   It flows through `Result` returns up to the abort engine, which turns it
//!   into a condition code or a program interruption.

use crate::abort_code::AbortCode;
use crate::types::{CpuId, InterruptionInfo};
use crate::why::WhyAborted;
use std::io;
use thiserror::Error;

/// Result type alias for facility operations
pub type TxfResult<T> = std::result::Result<T, TxfError>;

/// Error types for the facility
#[derive(Debug, Error)]
pub enum TxfError {
    /// An operation that needs an active transaction was called at depth 0
    #[error("No transaction is active")]
    NotInTransaction,

    /// TABORT operand below 256
    #[error("Invalid TABORT code {0}: codes below 256 are reserved")]
    InvalidAbortCode(u64),

    /// A facade for this CPU is already in use
    #[error("{0} is already attached")]
    CpuAttached(CpuId),

    /// Access outside configured main storage
    #[error("Address {address:#018x} (length {len}) is outside main storage")]
    Addressing {
        /// First byte of the access
        address: u64,
        /// Length of the access
        len: usize,
    },

    /// Diagnostic block image could not be decoded
    #[error("Invalid diagnostic block: {0}")]
    InvalidRecord(String),

    /// Configuration could not be read or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal-consistency fault, e.g. an unwind past depth 0
    #[error("Internal consistency fault: {0}")]
    Internal(String),
}

/// Request to abort the running transaction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transaction abort {tac}: {why}")]
pub struct TxAbort {
    /// Abort code
    pub tac: AbortCode,
    /// Contributing causes
    pub why: WhyAborted,
    /// Address of the conflicting cache line, when known
    pub conflict_token: Option<u64>,
    /// Program interruption to deliver after the abort (unfiltered only)
    pub interruption: Option<InterruptionInfo>,
}

impl TxAbort {
    /// Abort with a code and cause
    pub fn new(tac: AbortCode, why: WhyAborted) -> Self {
        TxAbort {
            tac,
            why,
            conflict_token: None,
            interruption: None,
        }
    }

    /// Conflict abort naming the conflicting cache line
    pub fn conflict(tac: AbortCode, line_address: u64) -> Self {
        TxAbort {
            tac,
            why: WhyAborted::CONFLICT,
            conflict_token: Some(line_address),
            interruption: None,
        }
    }

    /// Attach a program interruption that must still be delivered
    pub fn with_interruption(mut self, info: InterruptionInfo) -> Self {
        self.interruption = Some(info);
        self
    }
}
