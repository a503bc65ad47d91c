//! Transactional-execution engine for one emulated CPU
//!
//! This crate holds the per-CPU half of the facility:
//! - PageShadowMap: clean copy, private view and line states of a touched page
//! - TransactionContext: the nest of levels, limits and restrictions
//! - ConflictDetector: cache-line conflict checks against the shared log,
//!   plus the locked commit that publishes stores
//! - AbortEngine: unwind, condition-code policy, constrained retry and
//!   diagnostic block storage
//!
//! A context is owned by exactly one CPU thread. Cross-CPU interaction
//! happens only through `txf_storage::GuestMemory`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abort;
pub mod conflict;
pub mod pagemap;
pub mod transaction;

pub use abort::{
    condition_code_for, AbortDisposition, AbortEngine, AbortOutcome, AbortRequest,
    ProgramInterruption, RetryPolicy,
};
pub use conflict::{check_line, CommitSummary, ConflictDetector};
pub use pagemap::{LineState, PageShadowMap};
pub use transaction::{
    BeginRequest, EndOutcome, InstructionClass, TransactionContext, TransactionLevel, Unwound,
};
