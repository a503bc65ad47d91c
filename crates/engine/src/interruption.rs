//! Interruptions during transactional execution
//!
//! Any interruption taken while a transaction runs aborts it. Program
//! interruptions may be filtered by the program-interruption filtering
//! control (PIFC) of an unconstrained transaction:
//!
//! | PIFC | filtered classes |
//! |------|------------------|
//! | 0    | none             |
//! | 1    | 3                |
//! | 2    | 2 and 3          |
//!
//! A filtered program interruption aborts the transaction without being
//! delivered. Constrained transactions never filter.

use txf_core::{AbortCode, InterruptionInfo, TxAbort, WhyAborted};

/// An interruption that arrived while a transaction was running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// External interruption
    External,
    /// I/O interruption
    Io,
    /// Machine-check interruption
    MachineCheck,
    /// Restart interruption
    Restart,
    /// Program interruption
    Program(InterruptionInfo),
}

/// Filtering class of a program-interruption code
///
/// Class 3 are arithmetic exceptions, class 2 translation exceptions;
/// everything else is class 1 and never filtered.
pub fn program_interruption_class(code: u16) -> u8 {
    match code & 0x7F {
        0x07..=0x0F => 3,
        0x10 | 0x11 | 0x38..=0x3B => 2,
        _ => 1,
    }
}

/// True when `pifc` filters program interruptions of `class`
pub fn is_filtered(pifc: u8, class: u8) -> bool {
    class > 1 && u16::from(pifc) + u16::from(class) >= 4
}

impl Interruption {
    /// Abort request for this interruption
    ///
    /// `pifc` is the effective filtering control of the current level.
    pub fn to_abort(&self, pifc: u8, constrained: bool) -> TxAbort {
        match *self {
            Interruption::External => TxAbort::new(AbortCode::EXT, WhyAborted::EXT_INT),
            Interruption::Io => TxAbort::new(AbortCode::IO, WhyAborted::IO_INT),
            Interruption::MachineCheck => TxAbort::new(AbortCode::MCK, WhyAborted::MCK_INT),
            Interruption::Restart => TxAbort::new(AbortCode::MISC, WhyAborted::RESTART_INT),
            Interruption::Program(info) => {
                let class = program_interruption_class(info.code);
                if !constrained && is_filtered(pifc, class) {
                    TxAbort::new(AbortCode::FPGM, WhyAborted::FILT_INT)
                } else {
                    TxAbort::new(AbortCode::UPGM, WhyAborted::UNFILT_INT).with_interruption(info)
                }
            }
        }
    }
}
