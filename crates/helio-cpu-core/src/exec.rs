//! The fetch–decode–execute entry point and the per-CPU execution glue.
//!
//! [`step`] runs exactly one instruction: it consumes a contiguous run of
//! bytes starting at the pre-fetch IP, and on success the instruction
//! pointer has advanced by exactly the encoded length (or to the branch
//! target). Raised [`Exception`]s leave RIP at the faulting instruction so
//! the fault frame points at a restartable location.
//!
//! [`Vcpu`] layers the pending-event machinery on top: faults feed the
//! exception pipeline, software interrupts are raised and delivered at the
//! instruction boundary, and the STI/MOV-SS shadow is aged here.

use crate::decode::{decode_prefixes, CodeStream};
use crate::exceptions::{CpuExit, Exception};
use crate::interp::{self, Ctx};
use crate::interrupts::CpuCore;
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState};

/// How one instruction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// Sequential instruction; RIP has advanced past it.
    Continue,
    /// Same, but maskable-interrupt delivery is blocked for one more
    /// instruction (STI, MOV SS, POP SS).
    ContinueInhibitInterrupts,
    /// Same, and an active STI deferral window was cancelled (CLI).
    ContinueClearShadow,
    /// The handler rewrote RIP.
    Branch,
    /// HLT: the CPU sleeps until the next interrupt.
    Halt,
    /// INT n / INT3 / INT1 / INTO: to be raised through the event pipeline
    /// with the return IP already past the instruction.
    SoftwareInterrupt { vector: u8 },
}

/// Mask applied to a sequentially advancing IP (16-bit code wraps at 64
/// KiB, 32-bit at 4 GiB).
fn ip_mask(state: &CpuState) -> u64 {
    match state.mode() {
        CpuMode::Long => u64::MAX,
        _ if state.segments.cs.db() => 0xFFFF_FFFF,
        _ => 0xFFFF,
    }
}

/// Execute a single instruction against `bus`.
pub fn step<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<StepExit, Exception> {
    let mut stream = CodeStream::at(state);
    let (prefixes, opcode) = decode_prefixes(state, bus, &mut stream)?;

    let exit = {
        let mut ctx = Ctx {
            state: &mut *state,
            bus: &mut *bus,
            stream: &mut stream,
            prefixes: &prefixes,
        };
        interp::dispatch(&mut ctx, opcode)?
    };

    if exit != StepExit::Branch {
        let next = state.rip().wrapping_add(stream.len() as u64) & ip_mask(state);
        state.set_rip(next);
    }
    state.msr.tsc = state.msr.tsc.wrapping_add(1);
    Ok(exit)
}

/// A CPU core bound to its bus, with fault and interrupt plumbing.
pub struct Vcpu<B: CpuBus> {
    pub cpu: CpuCore,
    pub bus: B,
    /// Set once the CPU has stopped for good (triple fault or an internal
    /// error); further steps are no-ops.
    pub exit: Option<CpuExit>,
}

impl<B: CpuBus> Vcpu<B> {
    pub fn new_with_mode(mode: CpuMode, bus: B) -> Self {
        Self {
            cpu: CpuCore::new(mode),
            bus,
            exit: None,
        }
    }

    /// Execute one instruction, including any fault or software-interrupt
    /// delivery it triggers. Halted CPUs stay put.
    pub fn step(&mut self) -> Result<StepExit, CpuExit> {
        if let Some(exit) = &self.exit {
            return Err(exit.clone());
        }
        if self.cpu.state.halted {
            return Ok(StepExit::Halt);
        }

        let start_rip = self.cpu.state.rip();
        let result = step(&mut self.cpu.state, &mut self.bus);
        let exit = match result {
            Ok(exit) => {
                match exit {
                    StepExit::ContinueInhibitInterrupts => {
                        self.cpu.pending.inhibit_interrupts_for_one_instruction();
                    }
                    StepExit::ContinueClearShadow => {
                        self.cpu.pending.clear_interrupt_shadow();
                        self.cpu.pending.retire_instruction();
                    }
                    StepExit::Halt => {
                        self.cpu.state.halted = true;
                        self.cpu.pending.retire_instruction();
                    }
                    StepExit::SoftwareInterrupt { vector } => {
                        let return_rip = self.cpu.state.rip();
                        self.cpu
                            .pending
                            .raise_software_interrupt(vector, return_rip);
                        self.cpu.pending.retire_instruction();
                    }
                    _ => self.cpu.pending.retire_instruction(),
                }
                exit
            }
            Err(exception) => {
                self.cpu
                    .pending
                    .raise_exception_fault(exception, start_rip);
                self.cpu.pending.retire_instruction();
                StepExit::Continue
            }
        };

        if self.cpu.pending.has_pending_event() {
            if let Err(cpu_exit) = self.cpu.deliver_pending_event(&mut self.bus) {
                self.exit = Some(cpu_exit.clone());
                return Err(cpu_exit);
            }
        }
        Ok(exit)
    }

    /// Deliver one queued external vector if the CPU accepts interrupts
    /// right now. Returns whether a vector was actually taken.
    pub fn maybe_deliver_interrupt(&mut self) -> bool {
        let before = self.cpu.pending.external_interrupts.len();
        if before == 0 {
            return false;
        }
        match self.cpu.deliver_external_interrupt(&mut self.bus) {
            Ok(()) => self.cpu.pending.external_interrupts.len() < before,
            Err(cpu_exit) => {
                self.exit = Some(cpu_exit);
                false
            }
        }
    }

    /// Run up to `max_insns` instructions, attempting external-interrupt
    /// delivery at every boundary. Stops early on HLT or a CPU exit.
    pub fn run(&mut self, max_insns: u64) -> Result<(), CpuExit> {
        for _ in 0..max_insns {
            self.maybe_deliver_interrupt();
            if self.cpu.state.halted {
                break;
            }
            self.step()?;
        }
        Ok(())
    }
}
