//! TXF - software transactional-execution facility
//!
//! Emulates the z/Architecture Transactional-Execution Facility for an
//! instruction-set emulator running on conventional hardware: page shadowing,
//! cache-line conflict detection against other emulated CPUs, nesting and
//! instruction limits, abort dispositions and the 256-byte transaction
//! diagnostic block.
//!
//! # Quick Start
//!
//! ```ignore
//! use txfacility::{BeginRequest, CpuId, TxStep, TxfConfig, TxfSystem};
//!
//! let system = TxfSystem::new(TxfConfig::default())?;
//! let mut cpu = system.cpu(CpuId(0))?;
//!
//! cpu.begin_transaction(&BeginRequest::unconstrained(0x1000, 6))?;
//! cpu.store(0x2300, &[0xAA; 8])?;
//! assert!(matches!(cpu.end_transaction()?, TxStep::Proceed));
//! ```
//!
//! # Architecture
//!
//! The dispatcher and storage path talk to a [`TxCpu`]; everything else
//! (storage, access log, per-CPU transaction nest, abort engine) sits below it.

pub use txf_engine::*;
