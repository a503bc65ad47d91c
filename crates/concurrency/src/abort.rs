//! Abort processing
//!
//! Every abort, whatever its source, ends up in [`AbortEngine::abort`]. The
//! engine:
//!
//! 1. builds the transaction diagnostic block from the abort request and
//!    the CPU registers at the abort point,
//! 2. unwinds the whole nest (shadow maps are dropped; main storage was
//!    never written speculatively, so nothing has to be restored),
//! 3. restores the register pairs selected by the outermost GRSM,
//! 4. decides how control returns to the program, and
//! 5. stores the diagnostic block if the outermost begin asked for one.
//!
//! # Dispositions
//!
//! Unconstrained transactions resume after the outermost TBEGIN with a
//! condition code taken from [`condition_code_for`]. Constrained
//! transactions never see a condition code: transient failures are retried
//! silently from the TBEGINC, persistent ones and retry exhaustion raise a
//! transaction-constraint program interruption.

use std::sync::Arc;

use tracing::{debug, warn};
use txf_core::{
    AbortCode, ConditionCode, CpuRegisters, Tdb, TxAbort, TxfResult, WhyAborted,
    MAX_CAPTURE_TRIES, PGM_TRANSACTION_CONSTRAINT_EXCEPTION,
};
use txf_storage::GuestMemory;

use crate::transaction::TransactionContext;

/// How the caller wants control returned for an unconstrained abort
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Report the abort without touching the condition code
    Return,
    /// Resume after the TBEGIN with a condition code
    #[default]
    ConditionCode,
    /// Raise a transaction-constraint program interruption
    ProgramCheck,
}

/// Program interruption the dispatcher must deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInterruption {
    /// Interruption code
    pub code: u16,
    /// Diagnostic block for the prefix area
    pub tdb: Tdb,
}

/// What the dispatcher must do after an abort
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortDisposition {
    /// Continue at `resume_address` without a condition code
    Return,
    /// Continue at `resume_address` with the condition code set
    ConditionCode(ConditionCode),
    /// Deliver a program interruption
    ProgramCheck(ProgramInterruption),
}

/// An abort to process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortRequest {
    /// Cause of the abort
    pub abort: TxAbort,
    /// Requested disposition for unconstrained transactions
    pub policy: RetryPolicy,
}

impl AbortRequest {
    /// Abort resolved with a condition code
    pub fn new(abort: TxAbort) -> Self {
        AbortRequest {
            abort,
            policy: RetryPolicy::ConditionCode,
        }
    }

    /// Abort resolved with `policy`
    pub fn with_policy(abort: TxAbort, policy: RetryPolicy) -> Self {
        AbortRequest { abort, policy }
    }
}

/// Result of processing an abort
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortOutcome {
    /// Final abort code
    pub tac: AbortCode,
    /// Every contributing cause
    pub why: WhyAborted,
    /// Nesting depth at the abort
    pub depth: u16,
    /// The nest was constrained
    pub constrained: bool,
    /// Condition code set in the PSW, if any
    pub condition_code: Option<ConditionCode>,
    /// Instructions to the dispatcher
    pub disposition: AbortDisposition,
    /// Address where execution continues
    pub resume_address: u64,
    /// Diagnostic block describing the abort
    pub tdb: Tdb,
    /// The diagnostic block was written to guest storage
    pub tdb_stored: bool,
    /// Silent retries of the constrained transaction so far
    pub capture_tries: u32,
    /// Page shadow maps discarded
    pub pages_discarded: usize,
}

impl AbortOutcome {
    /// True when the constrained transaction will be re-executed silently
    pub fn is_silent_retry(&self) -> bool {
        self.constrained && self.disposition == AbortDisposition::Return
    }
}

/// Condition code for an abort code
pub fn condition_code_for(tac: AbortCode) -> ConditionCode {
    match tac {
        AbortCode::FETCH_OVF
        | AbortCode::STORE_OVF
        | AbortCode::INSTR
        | AbortCode::FPGM
        | AbortCode::NESTING => ConditionCode::Persistent,
        code if code.is_tabort() => {
            if code.as_u64() & 1 == 0 {
                ConditionCode::Transient
            } else {
                ConditionCode::Persistent
            }
        }
        _ => ConditionCode::Transient,
    }
}

/// Unwinds transactions and decides how control returns
#[derive(Debug, Clone)]
pub struct AbortEngine {
    memory: Arc<GuestMemory>,
}

impl AbortEngine {
    /// Engine storing diagnostic blocks into `memory`
    pub fn new(memory: Arc<GuestMemory>) -> Self {
        AbortEngine { memory }
    }

    /// Abort the running nest of `ctx`
    ///
    /// `regs` holds the registers at the abort point and is updated in
    /// place: saved pairs restored, condition code set, instruction address
    /// redirected. Fails only when no transaction is running.
    pub fn abort(
        &self,
        ctx: &mut TransactionContext,
        request: AbortRequest,
        regs: &mut CpuRegisters,
    ) -> TxfResult<AbortOutcome> {
        let abort = request.abort;
        let mut tdb = build_tdb(&abort, ctx.depth(), ctx.is_constrained(), regs);

        let unwound = ctx.unwind()?;
        restore_grsm(regs, unwound.grsm, &unwound.saved_gpr);

        let mut tac = abort.tac;
        let mut why = abort.why;
        let mut condition_code = None;
        let mut tdb_stored = false;

        let (disposition, resume_address) = if unwound.constrained {
            let unproductive = condition_code_for(tac) == ConditionCode::Persistent
                || request.policy == RetryPolicy::ProgramCheck;

            let disposition = if let Some(info) = abort.interruption {
                ctx.reset_capture_tries();
                AbortDisposition::ProgramCheck(ProgramInterruption {
                    code: info.code,
                    tdb: tdb.clone(),
                })
            } else if unproductive {
                ctx.reset_capture_tries();
                constraint_exception(&tdb)
            } else if ctx.note_capture_retry(unwound.begin_address) > MAX_CAPTURE_TRIES {
                tac = AbortCode::MISC;
                why |= WhyAborted::CAPTURE_FAIL;
                tdb.tac = tac.as_u64();
                ctx.reset_capture_tries();
                constraint_exception(&tdb)
            } else {
                AbortDisposition::Return
            };
            (disposition, unwound.begin_address)
        } else {
            let mut cc = condition_code_for(tac);
            if let Some(address) = unwound.tdb_address {
                match self.memory.store(ctx.cpu(), address, &tdb.to_bytes()) {
                    Ok(()) => tdb_stored = true,
                    Err(e) => {
                        warn!(
                            target: "txf::abort",
                            cpu = %ctx.cpu(),
                            address = format_args!("{:016X}", address),
                            error = %e,
                            "Diagnostic block could not be stored"
                        );
                        cc = ConditionCode::Indeterminate;
                    }
                }
            }
            let silent = abort.interruption.is_none() && request.policy == RetryPolicy::Return;
            if !silent {
                regs.cc = cc.as_u8();
                condition_code = Some(cc);
            }

            let disposition = match (abort.interruption, request.policy) {
                (Some(info), _) => AbortDisposition::ProgramCheck(ProgramInterruption {
                    code: info.code,
                    tdb: tdb.clone(),
                }),
                (None, RetryPolicy::Return) => AbortDisposition::Return,
                (None, RetryPolicy::ConditionCode) => AbortDisposition::ConditionCode(cc),
                (None, RetryPolicy::ProgramCheck) => constraint_exception(&tdb),
            };
            (disposition, unwound.resume_address)
        };

        regs.psw_address = resume_address;

        debug!(
            target: "txf::abort",
            cpu = %ctx.cpu(),
            tac = %tac,
            why = %why,
            depth = unwound.depth,
            constrained = unwound.constrained,
            "Transaction aborted"
        );

        Ok(AbortOutcome {
            tac,
            why,
            depth: unwound.depth,
            constrained: unwound.constrained,
            condition_code,
            disposition,
            resume_address,
            tdb,
            tdb_stored,
            capture_tries: ctx.capture_tries(),
            pages_discarded: unwound.pages_discarded,
        })
    }
}

fn build_tdb(abort: &TxAbort, depth: u16, constrained: bool, regs: &CpuRegisters) -> Tdb {
    let mut tdb = Tdb::new(abort.tac, depth);
    if let Some(token) = abort.conflict_token {
        tdb.set_conflict_token(token);
    }
    if constrained {
        tdb.set_constrained();
    }
    if let Some(info) = abort.interruption {
        tdb.eaid = info.eaid;
        tdb.dxc = info.dxc;
        tdb.piid = info.piid();
        tdb.teid = info.teid;
    }
    tdb.atia = regs.psw_address;
    tdb.bea = regs.bea;
    tdb.gpr = regs.gpr;
    tdb
}

fn restore_grsm(regs: &mut CpuRegisters, grsm: u8, saved: &[u64; 16]) {
    for pair in 0..8 {
        if grsm & (0x80 >> pair) != 0 {
            regs.gpr[2 * pair] = saved[2 * pair];
            regs.gpr[2 * pair + 1] = saved[2 * pair + 1];
        }
    }
}

fn constraint_exception(tdb: &Tdb) -> AbortDisposition {
    AbortDisposition::ProgramCheck(ProgramInterruption {
        code: PGM_TRANSACTION_CONSTRAINT_EXCEPTION,
        tdb: tdb.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::BeginRequest;
    use txf_core::{CpuId, InterruptionInfo, TxfError};

    fn setup() -> (Arc<GuestMemory>, AbortEngine, TransactionContext) {
        let memory = Arc::new(GuestMemory::new(4));
        let engine = AbortEngine::new(Arc::clone(&memory));
        (memory, engine, TransactionContext::new(CpuId(0)))
    }

    #[test]
    fn test_condition_code_table() {
        assert_eq!(condition_code_for(AbortCode::FETCH_CNF), ConditionCode::Transient);
        assert_eq!(condition_code_for(AbortCode::EXT), ConditionCode::Transient);
        assert_eq!(condition_code_for(AbortCode::MISC), ConditionCode::Transient);
        assert_eq!(condition_code_for(AbortCode::STORE_OVF), ConditionCode::Persistent);
        assert_eq!(condition_code_for(AbortCode::NESTING), ConditionCode::Persistent);
        assert_eq!(condition_code_for(AbortCode::new(256)), ConditionCode::Transient);
        assert_eq!(condition_code_for(AbortCode::new(257)), ConditionCode::Persistent);
    }

    #[test]
    fn test_unconstrained_abort_sets_cc_and_resumes() {
        let (_memory, engine, mut ctx) = setup();
        ctx.begin(&BeginRequest::unconstrained(0x1000, 6), &[0; 16]).unwrap();
        let mut regs = CpuRegisters {
            psw_address: 0x1040,
            ..Default::default()
        };

        let outcome = engine
            .abort(
                &mut ctx,
                AbortRequest::new(TxAbort::conflict(AbortCode::FETCH_CNF, 0x2500)),
                &mut regs,
            )
            .unwrap();

        assert_eq!(outcome.disposition, AbortDisposition::ConditionCode(ConditionCode::Transient));
        assert_eq!(outcome.resume_address, 0x1006);
        assert_eq!(regs.psw_address, 0x1006);
        assert_eq!(regs.cc, 2);
        assert_eq!(outcome.tdb.tac, AbortCode::FETCH_CNF.as_u64());
        assert_eq!(outcome.tdb.conflict_token(), Some(0x2500));
        assert_eq!(outcome.tdb.atia, 0x1040);
        assert!(!ctx.is_active());
    }

    #[test]
    fn test_return_policy_leaves_condition_code_alone() {
        let (memory, engine, mut ctx) = setup();
        ctx.begin(&BeginRequest::unconstrained(0x1000, 6).with_tdb(0x3000), &[0; 16])
            .unwrap();
        let mut regs = CpuRegisters {
            cc: 1,
            ..Default::default()
        };

        let outcome = engine
            .abort(
                &mut ctx,
                AbortRequest::with_policy(
                    TxAbort::conflict(AbortCode::STORE_CNF, 0x2100),
                    RetryPolicy::Return,
                ),
                &mut regs,
            )
            .unwrap();

        assert_eq!(outcome.disposition, AbortDisposition::Return);
        assert_eq!(outcome.condition_code, None);
        assert_eq!(regs.cc, 1);
        assert_eq!(regs.psw_address, 0x1006);
        assert!(outcome.tdb_stored);
        assert!(!outcome.is_silent_retry());

        let mut image = [0u8; 256];
        memory.storage().read(0x3000, &mut image).unwrap();
        assert_eq!(Tdb::from_bytes(&image).unwrap().tac, AbortCode::STORE_CNF.as_u64());
    }

    #[test]
    fn test_grsm_pairs_restored() {
        let (_memory, engine, mut ctx) = setup();
        let mut saved = [0u64; 16];
        for (n, r) in saved.iter_mut().enumerate() {
            *r = n as u64;
        }
        ctx.begin(&BeginRequest::unconstrained(0, 6).with_grsm(0x81), &saved)
            .unwrap();

        let mut regs = CpuRegisters {
            gpr: [0xFF; 16],
            ..Default::default()
        };
        let outcome = engine
            .abort(
                &mut ctx,
                AbortRequest::new(TxAbort::new(AbortCode::MISC, WhyAborted::empty())),
                &mut regs,
            )
            .unwrap();

        assert_eq!(&regs.gpr[0..2], &[0, 1]);
        assert_eq!(&regs.gpr[14..16], &[14, 15]);
        assert_eq!(regs.gpr[2], 0xFF);
        assert_eq!(outcome.tdb.gpr, [0xFF; 16]);
    }

    #[test]
    fn test_tdb_stored_at_operand_address() {
        let (memory, engine, mut ctx) = setup();
        ctx.begin(&BeginRequest::unconstrained(0, 6).with_tdb(0x3000), &[0; 16])
            .unwrap();
        let outcome = engine
            .abort(
                &mut ctx,
                AbortRequest::new(TxAbort::new(AbortCode::new(300), WhyAborted::TABORT_INSTR)),
                &mut CpuRegisters::default(),
            )
            .unwrap();
        assert!(outcome.tdb_stored);

        let mut image = [0u8; 256];
        memory.storage().read(0x3000, &mut image).unwrap();
        assert_eq!(Tdb::from_bytes(&image).unwrap(), outcome.tdb);
    }

    #[test]
    fn test_tdb_store_failure_is_indeterminate() {
        let (_memory, engine, mut ctx) = setup();
        ctx.begin(&BeginRequest::unconstrained(0, 6).with_tdb(0x4_0000), &[0; 16])
            .unwrap();
        let mut regs = CpuRegisters::default();
        let outcome = engine
            .abort(
                &mut ctx,
                AbortRequest::new(TxAbort::new(AbortCode::EXT, WhyAborted::EXT_INT)),
                &mut regs,
            )
            .unwrap();
        assert!(!outcome.tdb_stored);
        assert_eq!(outcome.condition_code, Some(ConditionCode::Indeterminate));
        assert_eq!(regs.cc, 1);
    }

    #[test]
    fn test_constrained_transient_abort_retries_silently() {
        let (_memory, engine, mut ctx) = setup();
        ctx.begin(&BeginRequest::constrained(0x2000, 4), &[0; 16]).unwrap();
        let mut regs = CpuRegisters {
            cc: 0,
            ..Default::default()
        };
        let outcome = engine
            .abort(
                &mut ctx,
                AbortRequest::new(TxAbort::conflict(AbortCode::STORE_CNF, 0x1000)),
                &mut regs,
            )
            .unwrap();
        assert!(outcome.is_silent_retry());
        assert_eq!(outcome.condition_code, None);
        assert_eq!(outcome.resume_address, 0x2000);
        assert_eq!(outcome.capture_tries, 1);
        assert!(outcome.tdb.is_constrained());
    }

    #[test]
    fn test_constrained_persistent_abort_is_constraint_exception() {
        let (_memory, engine, mut ctx) = setup();
        ctx.begin(&BeginRequest::constrained(0x2000, 4), &[0; 16]).unwrap();
        let outcome = engine
            .abort(
                &mut ctx,
                AbortRequest::new(TxAbort::new(AbortCode::INSTR, WhyAborted::INSTRCOUNT)),
                &mut CpuRegisters::default(),
            )
            .unwrap();
        match outcome.disposition {
            AbortDisposition::ProgramCheck(ref pi) => {
                assert_eq!(pi.code, PGM_TRANSACTION_CONSTRAINT_EXCEPTION)
            }
            ref other => panic!("unexpected disposition {:?}", other),
        }
        assert_eq!(outcome.capture_tries, 0);
    }

    #[test]
    fn test_constrained_retry_exhaustion() {
        let (_memory, engine, mut ctx) = setup();
        let mut outcome = None;
        for _ in 0..=MAX_CAPTURE_TRIES {
            ctx.begin(&BeginRequest::constrained(0x2000, 4), &[0; 16]).unwrap();
            let result = engine
                .abort(
                    &mut ctx,
                    AbortRequest::new(TxAbort::conflict(AbortCode::FETCH_CNF, 0x1000)),
                    &mut CpuRegisters::default(),
                )
                .unwrap();
            outcome = Some(result);
        }
        let outcome = outcome.unwrap();
        assert_eq!(outcome.tac, AbortCode::MISC);
        assert!(outcome.why.contains(WhyAborted::CAPTURE_FAIL));
        assert!(matches!(outcome.disposition, AbortDisposition::ProgramCheck(_)));
        assert_eq!(ctx.capture_tries(), 0);
    }

    #[test]
    fn test_unfiltered_program_interruption_delivered() {
        let (_memory, engine, mut ctx) = setup();
        ctx.begin(&BeginRequest::unconstrained(0, 6), &[0; 16]).unwrap();
        let abort = TxAbort::new(AbortCode::UPGM, WhyAborted::UNFILT_INT)
            .with_interruption(InterruptionInfo::with_code(0x0011));
        let outcome = engine
            .abort(&mut ctx, AbortRequest::new(abort), &mut CpuRegisters::default())
            .unwrap();
        match outcome.disposition {
            AbortDisposition::ProgramCheck(ref pi) => {
                assert_eq!(pi.code, 0x0011);
                assert_eq!(pi.tdb.piid, 0x0011);
            }
            ref other => panic!("unexpected disposition {:?}", other),
        }
        assert_eq!(outcome.condition_code, Some(ConditionCode::Transient));
    }

    #[test]
    fn test_abort_when_idle_is_internal_fault() {
        let (_memory, engine, mut ctx) = setup();
        let result = engine.abort(
            &mut ctx,
            AbortRequest::new(TxAbort::new(AbortCode::MISC, WhyAborted::empty())),
            &mut CpuRegisters::default(),
        );
        assert!(matches!(result, Err(TxfError::Internal(_))));
    }
}
