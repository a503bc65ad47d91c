//! Per-CPU transaction context
//!
//! A `TransactionContext` belongs to exactly one emulated CPU and is never
//! shared. It holds the stack of nesting levels, the page shadow maps of
//! the whole nest, and the bookkeeping that survives between attempts of a
//! constrained transaction (the capture-retry counter).
//!
//! # Nesting
//!
//! Depth 0 means "not in a transaction". Each begin pushes a level, up to
//! `MAX_TXF_TND`. Every page shadow map is tagged with the level that
//! captured it; the per-level page limit counts only maps tagged with the
//! current depth. Ending an inner level hands its maps to the enclosing
//! level. Only the outermost end makes stores visible, and any abort
//! unwinds the entire nest.
//!
//! # Constrained transactions
//!
//! The outermost level decides whether the nest is constrained. A
//! constrained nest has an instruction budget of at most
//! `MAX_TXF_CONTRAN_INSTR` and a restricted instruction set; a begin of
//! either kind inside it is a restricted instruction.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use txf_core::{
    AbortCode, AccessKind, CpuId, TxAbort, TxfError, TxfResult, WhyAborted,
    MAX_TXF_CONTRAN_INSTR, MAX_TXF_PAGES, MAX_TXF_TND,
};

use crate::pagemap::PageShadowMap;

/// Operands of a transaction-begin instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    /// Address of the begin instruction
    pub instruction_address: u64,
    /// Length of the begin instruction in bytes
    pub instruction_length: u8,
    /// TBEGINC rather than TBEGIN
    pub constrained: bool,
    /// Instruction budget for a constrained transaction (clamped to 32)
    pub instruction_limit: u32,
    /// General-register save mask, one bit per even/odd pair, pair 0 first
    pub grsm: u8,
    /// Access-register modification allowed
    pub allow_ar_modification: bool,
    /// Floating-point operations allowed
    pub allow_float: bool,
    /// Program-interruption filtering control (0..=2)
    pub pifc: u8,
    /// Where to store the diagnostic block on abort
    pub tdb_address: Option<u64>,
}

impl BeginRequest {
    /// TBEGIN at `instruction_address`
    pub fn unconstrained(instruction_address: u64, instruction_length: u8) -> Self {
        BeginRequest {
            instruction_address,
            instruction_length,
            constrained: false,
            instruction_limit: MAX_TXF_CONTRAN_INSTR,
            grsm: 0,
            allow_ar_modification: true,
            allow_float: true,
            pifc: 0,
            tdb_address: None,
        }
    }

    /// TBEGINC at `instruction_address`
    pub fn constrained(instruction_address: u64, instruction_length: u8) -> Self {
        BeginRequest {
            constrained: true,
            allow_float: false,
            ..Self::unconstrained(instruction_address, instruction_length)
        }
    }

    /// Store the diagnostic block at `address` on abort
    pub fn with_tdb(mut self, address: u64) -> Self {
        self.tdb_address = Some(address);
        self
    }

    /// Save and restore the register pairs selected by `grsm`
    pub fn with_grsm(mut self, grsm: u8) -> Self {
        self.grsm = grsm;
        self
    }

    /// Set the access-register and floating-point controls
    pub fn with_controls(mut self, allow_ar_modification: bool, allow_float: bool) -> Self {
        self.allow_ar_modification = allow_ar_modification;
        self.allow_float = allow_float;
        self
    }

    /// Set the program-interruption filtering control
    pub fn with_pifc(mut self, pifc: u8) -> Self {
        self.pifc = pifc.min(2);
        self
    }

    /// Set the instruction budget of a constrained transaction
    pub fn with_instruction_limit(mut self, limit: u32) -> Self {
        self.instruction_limit = limit;
        self
    }

    /// Address of the instruction following the begin instruction
    pub fn next_instruction_address(&self) -> u64 {
        self.instruction_address
            .wrapping_add(self.instruction_length as u64)
    }
}

/// Instruction categories that transactional execution restricts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionClass {
    /// Unrestricted instruction
    General,
    /// Relative branch; backward branches are restricted when constrained
    RelativeBranch {
        /// Branch target precedes the branch
        backward: bool,
    },
    /// Branch through a register
    NonRelativeBranch,
    /// Floating-point instruction
    FloatingPoint,
    /// Access-register modification
    AccessRegister,
    /// SET ADDRESSING MODE
    SetAddressingMode,
    /// BRANCH AND SET MODE
    BranchAndSetMode,
    /// COMPARE AND SWAP AND PURGE
    CompareAndSwapPurge,
    /// COMPARE AND SWAP AND PURGE (64)
    CompareAndSwapPurgeLong,
    /// Instruction never allowed inside a transaction
    Restricted,
    /// Instruction restricted under specific modes
    Miscellaneous,
}

/// One level of the transaction nest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLevel {
    /// Level was begun by TBEGINC as the outermost level
    pub constrained: bool,
    /// Effective access-register control
    pub allow_ar_modification: bool,
    /// Effective floating-point control
    pub allow_float: bool,
    /// Effective program-interruption filtering control
    pub pifc: u8,
    /// Address of the begin instruction
    pub begin_address: u64,
    /// Address after the begin instruction
    pub resume_address: u64,
}

/// Result of ending a level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// An inner level ended; the nest continues at `depth`
    Nested {
        /// Depth after the end
        depth: u16,
    },
    /// The outermost level ended
    Completed {
        /// Page shadow maps released
        pages: usize,
    },
}

/// State discarded by an unwind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwound {
    /// Depth at the time of the unwind
    pub depth: u16,
    /// The nest was constrained
    pub constrained: bool,
    /// Page shadow maps discarded
    pub pages_discarded: usize,
    /// Outermost begin instruction address
    pub begin_address: u64,
    /// Address after the outermost begin instruction
    pub resume_address: u64,
    /// Registers saved at the outermost begin
    pub saved_gpr: [u64; 16],
    /// Register-save mask of the outermost begin
    pub grsm: u8,
    /// Diagnostic block address of the outermost begin
    pub tdb_address: Option<u64>,
}

/// Transaction state of one emulated CPU
#[derive(Debug)]
pub struct TransactionContext {
    cpu: CpuId,
    levels: SmallVec<[TransactionLevel; 4]>,
    page_maps: FxHashMap<u64, PageShadowMap>,
    instr_budget: u32,
    capture_tries: u32,
    retry_address: Option<u64>,
    saved_gpr: [u64; 16],
    grsm: u8,
    tdb_address: Option<u64>,
}

impl TransactionContext {
    /// Idle context for `cpu`
    pub fn new(cpu: CpuId) -> Self {
        TransactionContext {
            cpu,
            levels: SmallVec::new(),
            page_maps: FxHashMap::default(),
            instr_budget: 0,
            capture_tries: 0,
            retry_address: None,
            saved_gpr: [0; 16],
            grsm: 0,
            tdb_address: None,
        }
    }

    /// Owning CPU
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Current nesting depth, 0 when idle
    pub fn depth(&self) -> u16 {
        self.levels.len() as u16
    }

    /// True while a transaction is running
    pub fn is_active(&self) -> bool {
        !self.levels.is_empty()
    }

    /// True when the outermost level is constrained
    pub fn is_constrained(&self) -> bool {
        self.levels.first().is_some_and(|level| level.constrained)
    }

    /// Innermost level
    pub fn current_level(&self) -> Option<&TransactionLevel> {
        self.levels.last()
    }

    /// Outermost level
    pub fn outermost_level(&self) -> Option<&TransactionLevel> {
        self.levels.first()
    }

    /// All levels, outermost first
    pub fn levels(&self) -> &[TransactionLevel] {
        &self.levels
    }

    /// Remaining constrained-instruction budget
    pub fn instr_budget(&self) -> u32 {
        self.instr_budget
    }

    /// Silent retries of the constrained transaction at `retry_address`
    pub fn capture_tries(&self) -> u32 {
        self.capture_tries
    }

    /// Begin address of the constrained transaction being retried
    pub fn retry_address(&self) -> Option<u64> {
        self.retry_address
    }

    /// Diagnostic block address of the running nest
    pub fn tdb_address(&self) -> Option<u64> {
        self.tdb_address
    }

    /// Begin a new level
    ///
    /// `gpr` is the register file at the begin instruction; it is saved
    /// only by the outermost begin.
    pub fn begin(&mut self, request: &BeginRequest, gpr: &[u64; 16]) -> Result<u16, TxAbort> {
        let depth = self.depth();

        if self.is_constrained() {
            return Err(TxAbort::new(AbortCode::INSTR, WhyAborted::CONTRAN_INSTR));
        }
        if depth >= MAX_TXF_TND {
            return Err(TxAbort::new(AbortCode::NESTING, WhyAborted::NESTING));
        }

        let level = match self.levels.last() {
            None => {
                let constrained = request.constrained;
                if self.retry_address != Some(request.instruction_address) {
                    self.capture_tries = 0;
                    self.retry_address = None;
                }
                self.saved_gpr = *gpr;
                self.grsm = request.grsm;
                self.tdb_address = if constrained {
                    None
                } else {
                    request.tdb_address
                };
                self.instr_budget = if constrained {
                    request.instruction_limit.min(MAX_TXF_CONTRAN_INSTR)
                } else {
                    0
                };
                TransactionLevel {
                    constrained,
                    allow_ar_modification: request.allow_ar_modification,
                    allow_float: request.allow_float && !constrained,
                    pifc: if constrained { 0 } else { request.pifc.min(2) },
                    begin_address: request.instruction_address,
                    resume_address: request.next_instruction_address(),
                }
            }
            Some(outer) => TransactionLevel {
                constrained: false,
                allow_ar_modification: outer.allow_ar_modification
                    && request.allow_ar_modification,
                allow_float: outer.allow_float && request.allow_float,
                pifc: outer.pifc.max(request.pifc.min(2)),
                begin_address: request.instruction_address,
                resume_address: request.next_instruction_address(),
            },
        };

        self.levels.push(level);
        Ok(self.depth())
    }

    /// End the innermost level
    ///
    /// Stores of the outermost level must already have been merged into main
    /// storage; this only releases the nest's bookkeeping.
    pub fn end(&mut self) -> TxfResult<EndOutcome> {
        let depth = self.depth();
        if depth == 0 {
            return Err(TxfError::NotInTransaction);
        }
        self.levels.pop();

        if depth > 1 {
            let outer = depth - 1;
            for map in self.page_maps.values_mut() {
                if map.level() == depth {
                    map.set_level(outer);
                }
            }
            return Ok(EndOutcome::Nested { depth: outer });
        }

        let pages = self.page_maps.len();
        self.page_maps.clear();
        self.instr_budget = 0;
        self.capture_tries = 0;
        self.retry_address = None;
        self.tdb_address = None;
        Ok(EndOutcome::Completed { pages })
    }

    /// Charge one instruction against the constrained budget
    pub fn note_instruction(&mut self) -> Result<(), TxAbort> {
        if !self.is_constrained() {
            return Ok(());
        }
        if self.instr_budget == 0 {
            return Err(TxAbort::new(
                AbortCode::INSTR,
                WhyAborted::INSTRCOUNT | WhyAborted::CONTRAN_INSTR,
            ));
        }
        self.instr_budget -= 1;
        Ok(())
    }

    /// Check whether an instruction of `class` may execute at the current level
    pub fn check_instruction(&self, class: InstructionClass) -> Result<(), TxAbort> {
        let Some(level) = self.current_level() else {
            return Ok(());
        };
        match restriction(class, level, self.is_constrained()) {
            Some(why) => Err(TxAbort::new(AbortCode::INSTR, why)),
            None => Ok(()),
        }
    }

    /// Shadow map of `page`, if the nest has touched it
    pub fn page_map(&self, page: u64) -> Option<&PageShadowMap> {
        self.page_maps.get(&page)
    }

    /// Mutable shadow map of `page`
    pub fn page_map_mut(&mut self, page: u64) -> Option<&mut PageShadowMap> {
        self.page_maps.get_mut(&page)
    }

    /// Every shadow map of the nest, in no particular order
    pub fn page_maps(&self) -> impl Iterator<Item = &PageShadowMap> {
        self.page_maps.values()
    }

    /// Shadow maps of the nest ordered by page address
    pub fn sorted_page_maps(&self) -> Vec<&PageShadowMap> {
        let mut maps: Vec<&PageShadowMap> = self.page_maps.values().collect();
        maps.sort_by_key(|map| map.virtual_page_address());
        maps
    }

    /// Number of pages captured by the current level
    pub fn pages_at_current_level(&self) -> usize {
        let depth = self.depth();
        self.page_maps
            .values()
            .filter(|map| map.level() == depth)
            .count()
    }

    /// Add the shadow map of a newly touched page
    ///
    /// Fails with an overflow abort when the current level already holds
    /// `MAX_TXF_PAGES` pages.
    pub fn insert_page_map(&mut self, map: PageShadowMap, kind: AccessKind) -> Result<(), TxAbort> {
        if self.pages_at_current_level() >= MAX_TXF_PAGES {
            let tac = match kind {
                AccessKind::Fetch => AbortCode::FETCH_OVF,
                AccessKind::Store => AbortCode::STORE_OVF,
            };
            return Err(TxAbort::new(tac, WhyAborted::MAX_PAGES));
        }
        self.page_maps.insert(map.virtual_page_address(), map);
        Ok(())
    }

    /// Discard the whole nest
    ///
    /// Unwinding an idle context is an internal-consistency fault.
    pub fn unwind(&mut self) -> TxfResult<Unwound> {
        let Some(outermost) = self.levels.first().copied() else {
            return Err(TxfError::Internal(
                "unwind requested at nesting depth 0".to_string(),
            ));
        };
        let unwound = Unwound {
            depth: self.depth(),
            constrained: outermost.constrained,
            pages_discarded: self.page_maps.len(),
            begin_address: outermost.begin_address,
            resume_address: outermost.resume_address,
            saved_gpr: self.saved_gpr,
            grsm: self.grsm,
            tdb_address: self.tdb_address,
        };
        self.levels.clear();
        self.page_maps.clear();
        self.instr_budget = 0;
        self.tdb_address = None;
        Ok(unwound)
    }

    /// Count another silent retry of the constrained transaction at `address`
    pub fn note_capture_retry(&mut self, address: u64) -> u32 {
        self.retry_address = Some(address);
        self.capture_tries += 1;
        self.capture_tries
    }

    /// Forget the constrained retry history
    pub fn reset_capture_tries(&mut self) {
        self.capture_tries = 0;
        self.retry_address = None;
    }
}

fn restriction(
    class: InstructionClass,
    level: &TransactionLevel,
    constrained: bool,
) -> Option<WhyAborted> {
    use InstructionClass::*;

    let why = match class {
        General => return None,
        RelativeBranch { backward } => {
            if constrained && backward {
                WhyAborted::CONTRAN_RELATIVE_BRANCH
            } else {
                return None;
            }
        }
        NonRelativeBranch => {
            if constrained {
                WhyAborted::CONTRAN_BRANCH | WhyAborted::TRAN_NONRELATIVE_BRANCH
            } else {
                return None;
            }
        }
        FloatingPoint => {
            if level.allow_float {
                return None;
            }
            WhyAborted::TRAN_FLOAT_INSTR
        }
        AccessRegister => {
            if level.allow_ar_modification {
                return None;
            }
            WhyAborted::TRAN_ACCESS_INSTR
        }
        SetAddressingMode => WhyAborted::TRAN_SET_ADDRESSING_MODE,
        BranchAndSetMode => WhyAborted::TRAN_BRANCH_SET_MODE,
        CompareAndSwapPurge => WhyAborted::CSP_INSTR,
        CompareAndSwapPurgeLong => WhyAborted::CSPG_INSTR,
        Restricted => WhyAborted::TRAN_INSTR,
        Miscellaneous => WhyAborted::TRAN_MISC_INSTR,
    };

    if constrained {
        Some(why | WhyAborted::CONTRAN_INSTR)
    } else {
        Some(why)
    }
}
