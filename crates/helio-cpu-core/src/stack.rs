//! Stack push/pop over SS:SP.
//!
//! The stack pointer's arithmetic width follows the current stack size
//! (SS.D/B in protected mode, 64-bit in long mode, 16-bit otherwise);
//! operand width decides how many bytes move. A push pre-decrements SP and
//! then writes; the pushed value is evaluated by the caller beforehand, so
//! `PUSH (E)SP` stores the pre-decrement value. A pop reads before it
//! post-increments, so a faulting pop leaves SP untouched.

use helio_x86::{gpr, SegReg, Width};

use crate::addressing::linear_address;
use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::state::CpuState;

pub fn push<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    w: Width,
    value: u64,
) -> Result<(), Exception> {
    let sw = state.stack_width();
    let sp = state.read_gpr64(gpr::RSP) & sw.mask();
    let new_sp = sp.wrapping_sub(w.bytes()) & sw.mask();
    state.write_gpr64(
        gpr::RSP,
        state.read_gpr64(gpr::RSP) & !sw.mask() | new_sp,
    );
    let linear = linear_address(state, SegReg::Ss, new_sp);
    bus.write_wide(linear, w.bits() / 8, value & w.mask())
}

pub fn pop<B: CpuBus>(state: &mut CpuState, bus: &mut B, w: Width) -> Result<u64, Exception> {
    let sw = state.stack_width();
    let sp = state.read_gpr64(gpr::RSP) & sw.mask();
    let linear = linear_address(state, SegReg::Ss, sp);
    let value = bus.read_wide(linear, w.bits() / 8)?;
    let new_sp = sp.wrapping_add(w.bytes()) & sw.mask();
    state.write_gpr64(
        gpr::RSP,
        state.read_gpr64(gpr::RSP) & !sw.mask() | new_sp,
    );
    Ok(value)
}

/// Peek at the stack without moving SP (used by RETF/IRET to validate a
/// frame before committing it).
pub fn peek<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    w: Width,
    index: u64,
) -> Result<u64, Exception> {
    let sw = state.stack_width();
    let sp = state.read_gpr64(gpr::RSP) & sw.mask();
    let addr = sp.wrapping_add(index * w.bytes()) & sw.mask();
    let linear = linear_address(state, SegReg::Ss, addr);
    bus.read_wide(linear, w.bits() / 8)
}
