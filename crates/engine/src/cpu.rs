//! Per-CPU facade consumed by the instruction dispatcher
//!
//! `TxCpu` is what an emulated CPU thread talks to. It owns the CPU's
//! `TransactionContext` and the slice of register state the facility
//! rewrites, and routes every abort, whatever its cause, through the abort
//! engine. Operations that can abort return a [`TxStep`]; caller misuse
//! (ending at depth 0, a TABORT code below 256, a bad TDB address) is an
//! `Err`.
//!
//! # Dispatcher protocol
//!
//! ```text
//! begin_transaction(TBEGIN/TBEGINC operands)
//! loop {
//!     note_instruction(class)          // before each instruction
//!     fetch / store                     // storage operands
//! }
//! end_transaction()                     // TEND
//! ```
//!
//! On `TxStep::Aborted`, the dispatcher continues at the outcome's
//! `resume_address` (already loaded into `registers().psw_address`) and acts
//! on the disposition: nothing more for `Return`, the condition code is
//! already set for `ConditionCode`, and `ProgramCheck` must be delivered.

use std::fmt::Write as _;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info};
use txf_concurrency::{
    AbortEngine, AbortOutcome, AbortRequest, BeginRequest, ConflictDetector, EndOutcome,
    InstructionClass, RetryPolicy, TransactionContext,
};
use txf_core::{
    AbortCode, AccessKind, CpuId, CpuRegisters, TxAbort, TxfError, TxfResult, WhyAborted,
    TDB_SIZE,
};

use crate::diagnostics::{abort_summary, dump_diagnostic_record, dump_page_map};
use crate::interruption::Interruption;
use crate::system::TxfSystem;
use crate::trace_filter::TraceOutcome;

/// Result of an operation that may abort the running transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStep {
    /// Continue with the next instruction
    Proceed,
    /// The transaction was aborted
    Aborted(Box<AbortOutcome>),
}

impl TxStep {
    /// True when the transaction was aborted
    pub fn is_aborted(&self) -> bool {
        matches!(self, TxStep::Aborted(_))
    }

    /// Abort outcome, if any
    pub fn outcome(&self) -> Option<&AbortOutcome> {
        match self {
            TxStep::Proceed => None,
            TxStep::Aborted(outcome) => Some(outcome),
        }
    }
}

/// Transactional-execution state of one emulated CPU
pub struct TxCpu {
    id: CpuId,
    system: Arc<TxfSystem>,
    ctx: TransactionContext,
    regs: CpuRegisters,
    detector: ConflictDetector,
    engine: AbortEngine,
    rng: StdRng,
    random_abort_percent: u8,
    consecutive_failures: u32,
}

impl TxCpu {
    pub(crate) fn new(id: CpuId, system: Arc<TxfSystem>) -> Self {
        let memory = Arc::clone(system.memory());
        let abort = &system.config().abort;
        let rng = match abort.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ u64::from(id.as_u16())),
            None => StdRng::from_entropy(),
        };
        let random_abort_percent = abort.random_abort_percent;

        TxCpu {
            id,
            ctx: TransactionContext::new(id),
            regs: CpuRegisters::default(),
            detector: ConflictDetector::new(Arc::clone(&memory)),
            engine: AbortEngine::new(memory),
            rng,
            random_abort_percent,
            consecutive_failures: 0,
            system,
        }
    }

    /// CPU address
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Registers as the facility last left them
    pub fn registers(&self) -> &CpuRegisters {
        &self.regs
    }

    /// Registers, for the dispatcher to update as it executes
    pub fn registers_mut(&mut self) -> &mut CpuRegisters {
        &mut self.regs
    }

    /// Current nesting depth
    pub fn depth(&self) -> u16 {
        self.ctx.depth()
    }

    /// True while a transaction is running
    pub fn is_transactional(&self) -> bool {
        self.ctx.is_active()
    }

    /// True while a constrained transaction is running
    pub fn is_constrained(&self) -> bool {
        self.ctx.is_constrained()
    }

    /// The CPU's transaction context
    pub fn context(&self) -> &TransactionContext {
        &self.ctx
    }

    /// Aborts since the last successful outermost commit
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// TBEGIN / TBEGINC
    ///
    /// On success depth grows by one, the condition code is 0 and the PSW
    /// points after the begin instruction.
    ///
    /// # Errors
    ///
    /// `TxfError::Addressing` when the outermost TBEGIN names a TDB address
    /// outside main storage.
    pub fn begin_transaction(&mut self, request: &BeginRequest) -> TxfResult<TxStep> {
        let outermost = !self.ctx.is_active();
        if outermost && !request.constrained {
            if let Some(address) = request.tdb_address {
                self.system
                    .memory()
                    .storage()
                    .check_range(address, TDB_SIZE)?;
            }
        }

        let depth = match self.ctx.begin(request, &self.regs.gpr) {
            Ok(depth) => depth,
            Err(abort) => return self.abort_with(abort, RetryPolicy::ConditionCode),
        };

        if outermost {
            self.system.register_active(self.id);
            self.system.stats().record_begin(request.constrained);
        }
        self.regs.cc = 0;
        self.regs.psw_address = request.next_instruction_address();

        if self.system.filter().trace_uc(self.ctx.is_constrained()) {
            debug!(
                target: "txf::begin",
                cpu = %self.id,
                depth,
                constrained = self.ctx.is_constrained(),
                address = format_args!("{:016X}", request.instruction_address),
                retries = self.ctx.capture_tries(),
                "Transaction begun"
            );
        }
        Ok(TxStep::Proceed)
    }

    /// TEND
    ///
    /// Ending the outermost level validates the nest and publishes its
    /// stores; an inner level only validates.
    ///
    /// # Errors
    ///
    /// `TxfError::NotInTransaction` at depth 0.
    pub fn end_transaction(&mut self) -> TxfResult<TxStep> {
        if !self.ctx.is_active() {
            return Err(TxfError::NotInTransaction);
        }
        let constrained = self.ctx.is_constrained();
        let depth = self.ctx.depth();

        let checked = if depth == 1 {
            self.detector.commit(&self.ctx).map(Some)
        } else {
            self.detector.validate(&self.ctx).map(|_| None)
        };
        let summary = match checked {
            Ok(summary) => summary,
            Err(abort) => return self.abort_with(abort, RetryPolicy::ConditionCode),
        };

        if let EndOutcome::Completed { pages } = self.ctx.end()? {
            self.system.unregister_active(self.id);
            self.system.stats().record_commit();
            self.consecutive_failures = 0;

            if self.system.filter().should_trace(TraceOutcome::Success, constrained) {
                info!(
                    target: "txf::commit",
                    cpu = %self.id,
                    constrained,
                    pages,
                    lines = summary.map_or(0, |s| s.lines_stored),
                    "Transaction succeeded"
                );
            }
        }
        self.regs.cc = 0;
        Ok(TxStep::Proceed)
    }

    /// Abort on behalf of the dispatcher
    ///
    /// # Errors
    ///
    /// `TxfError::NotInTransaction` at depth 0.
    pub fn abort_transaction(&mut self, abort: TxAbort, policy: RetryPolicy) -> TxfResult<TxStep> {
        if !self.ctx.is_active() {
            return Err(TxfError::NotInTransaction);
        }
        self.abort_with(abort, policy)
    }

    /// TABORT with the given abort code
    ///
    /// # Errors
    ///
    /// `TxfError::InvalidAbortCode` for codes below 256 and
    /// `TxfError::NotInTransaction` at depth 0.
    pub fn tabort(&mut self, code: u64) -> TxfResult<TxStep> {
        if code < AbortCode::TABORT.as_u64() {
            return Err(TxfError::InvalidAbortCode(code));
        }
        if !self.ctx.is_active() {
            return Err(TxfError::NotInTransaction);
        }
        let abort = if self.ctx.is_constrained() {
            TxAbort::new(
                AbortCode::INSTR,
                WhyAborted::CONTRAN_INSTR | WhyAborted::TRAN_INSTR,
            )
        } else {
            TxAbort::new(AbortCode::new(code), WhyAborted::TABORT_INSTR)
        };
        self.abort_with(abort, RetryPolicy::ConditionCode)
    }

    /// An interruption arrived; aborts the running transaction, if any
    pub fn abort_for_interruption(&mut self, interruption: Interruption) -> TxfResult<TxStep> {
        let Some(level) = self.ctx.current_level() else {
            return Ok(TxStep::Proceed);
        };
        let abort = interruption.to_abort(level.pifc, self.ctx.is_constrained());
        self.abort_with(abort, RetryPolicy::ConditionCode)
    }

    /// Account for the next instruction of a transaction
    ///
    /// Checks the instruction restrictions, charges the constrained budget,
    /// applies random abort injection and re-validates the footprint against
    /// concurrent activity. A no-op outside a transaction.
    pub fn note_instruction(&mut self, class: InstructionClass) -> TxfResult<TxStep> {
        if !self.ctx.is_active() {
            return Ok(TxStep::Proceed);
        }
        let checked = self
            .ctx
            .check_instruction(class)
            .and_then(|_| self.ctx.note_instruction())
            .and_then(|_| self.random_abort())
            .and_then(|_| self.detector.validate(&self.ctx));
        match checked {
            Ok(()) => Ok(TxStep::Proceed),
            Err(abort) => self.abort_with(abort, RetryPolicy::ConditionCode),
        }
    }

    /// Transactional fetch on behalf of another storage path
    ///
    /// The operand is filled from the transaction's view of storage, so the
    /// caller sees its own earlier transactional stores.
    ///
    /// # Errors
    ///
    /// `TxfError::NotInTransaction` at depth 0.
    pub fn on_transactional_fetch(&mut self, address: u64, buf: &mut [u8]) -> TxfResult<TxStep> {
        if !self.ctx.is_active() {
            return Err(TxfError::NotInTransaction);
        }
        self.fetch(address, buf)
    }

    /// Transactional store on behalf of another storage path
    ///
    /// The operand goes into the transaction's private view; the caller must
    /// not write main storage itself.
    ///
    /// # Errors
    ///
    /// `TxfError::NotInTransaction` at depth 0.
    pub fn on_transactional_store(&mut self, address: u64, data: &[u8]) -> TxfResult<TxStep> {
        if !self.ctx.is_active() {
            return Err(TxfError::NotInTransaction);
        }
        self.store(address, data)
    }

    /// Stamp an access this CPU made outside a transaction
    pub fn on_nontransactional_access(&self, address: u64, len: usize, kind: AccessKind) -> u64 {
        self.system
            .on_nontransactional_access(self.id, address, len, kind)
    }

    /// Fetch a storage operand
    ///
    /// Inside a transaction the bytes come from the transaction's view of
    /// storage.
    ///
    /// # Errors
    ///
    /// `TxfError::Addressing` for a range outside storage when not in a
    /// transaction; inside one the same condition aborts.
    pub fn fetch(&mut self, address: u64, buf: &mut [u8]) -> TxfResult<TxStep> {
        if !self.ctx.is_active() {
            self.system.memory().fetch(self.id, address, buf)?;
            return Ok(TxStep::Proceed);
        }
        match self.detector.read(&mut self.ctx, address, buf) {
            Ok(()) => Ok(TxStep::Proceed),
            Err(abort) => self.abort_with(abort, RetryPolicy::ConditionCode),
        }
    }

    /// Store a storage operand
    ///
    /// Inside a transaction the bytes stay private until the outermost
    /// TEND.
    pub fn store(&mut self, address: u64, data: &[u8]) -> TxfResult<TxStep> {
        if !self.ctx.is_active() {
            self.system.memory().store(self.id, address, data)?;
            return Ok(TxStep::Proceed);
        }
        match self.detector.write(&mut self.ctx, address, data) {
            Ok(()) => Ok(TxStep::Proceed),
            Err(abort) => self.abort_with(abort, RetryPolicy::ConditionCode),
        }
    }

    fn random_abort(&mut self) -> Result<(), TxAbort> {
        if self.random_abort_percent > 0 && self.rng.gen_range(0..100u8) < self.random_abort_percent
        {
            return Err(TxAbort::new(AbortCode::MISC, WhyAborted::RAND_ABORT));
        }
        Ok(())
    }

    fn abort_with(&mut self, abort: TxAbort, policy: RetryPolicy) -> TxfResult<TxStep> {
        let constrained = self.ctx.is_constrained();
        let traced = self
            .system
            .filter()
            .should_trace(TraceOutcome::Failure, constrained)
            && self.system.filter().trace_abort(
                abort.tac,
                abort.why,
                self.ctx.depth(),
                self.id,
                self.consecutive_failures + 1,
            );
        let map_dump = if traced {
            self.page_map_dump()
        } else {
            None
        };
        let tdb_address = self.ctx.tdb_address();

        let outcome = self
            .engine
            .abort(&mut self.ctx, AbortRequest::with_policy(abort, policy), &mut self.regs)
            .inspect_err(|e| {
                error!(target: "txf::abort", cpu = %self.id, error = %e, "Abort failed");
            })?;

        self.system.unregister_active(self.id);
        self.system.stats().record_abort(&outcome);
        self.consecutive_failures += 1;

        if traced {
            info!(
                target: "txf::abort",
                cpu = %self.id,
                depth = outcome.depth,
                constrained,
                cc = ?outcome.condition_code.map(|cc| cc.as_u8()),
                retries = outcome.capture_tries,
                failures = self.consecutive_failures,
                "Transaction aborted: {}",
                abort_summary(outcome.tac, outcome.why)
            );
            if self.system.filter().trace_tdb() {
                let address = tdb_address.filter(|_| outcome.tdb_stored);
                debug!(target: "txf::dump", "{}", dump_diagnostic_record(&outcome.tdb, address));
            }
            if let Some(dump) = map_dump {
                debug!(target: "txf::dump", "{}", dump);
            }
        }

        Ok(TxStep::Aborted(Box::new(outcome)))
    }

    fn page_map_dump(&self) -> Option<String> {
        let filter = self.system.filter();
        if !(filter.trace_map() || filter.trace_pages() || filter.trace_lines()) {
            return None;
        }
        let maps = self.ctx.sorted_page_maps();
        let mut out = String::new();
        if filter.trace_map() {
            let _ = write!(out, "{} page(s):", maps.len());
            for map in &maps {
                let _ = write!(out, " {:X}@{}", map.virtual_page_address(), map.level());
            }
            out.push('\n');
        }
        if filter.trace_pages() || filter.trace_lines() {
            for map in &maps {
                out.push_str(&dump_page_map(map, filter.trace_lines()));
            }
        }
        Some(out)
    }
}

impl Drop for TxCpu {
    fn drop(&mut self) {
        if self.ctx.is_active() {
            debug!(
                target: "txf::system",
                cpu = %self.id,
                depth = self.ctx.depth(),
                "Facade dropped inside a transaction; private stores discarded"
            );
        }
        self.system.detach(self.id);
    }
}

impl std::fmt::Debug for TxCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxCpu")
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .field("regs", &self.regs)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}
