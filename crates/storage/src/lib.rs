//! Shared guest storage for the transactional-execution facility
//!
//! Everything in this crate is shared by all emulated CPUs:
//! - MainStorage: the guest's 4K page frames, one lock per page
//! - SharedAccessLog: sequence-stamped fetch/store activity per cache line,
//!   the source of truth for cross-CPU conflict detection
//! - GuestMemory: storage plus log, performing each access and its stamp
//!   under the same page lock so that no access escapes the log

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access_log;
pub mod main_storage;
pub mod memory;

pub use access_log::{ConflictLog, LineActivity, PageActivity, SharedAccessLog};
pub use main_storage::{GuestPage, MainStorage, PageFrame};
pub use memory::GuestMemory;
