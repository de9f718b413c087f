//! Stack instructions: PUSH/POP forms, PUSHA/POPA, PUSHF/POPF and the
//! frame helpers ENTER/LEAVE.

use helio_x86::{gpr, SegReg, Width};

use super::Ctx;
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::interrupts::apply_flags;
use crate::mem::CpuBus;
use crate::segmentation;
use crate::stack;
use crate::state::CpuMode;

/// PUSH/POP operand width: 64-bit mode promotes the default to 64 (no
/// 32-bit stack ops there; 0x66 still selects 16).
fn stack_op_width<B: CpuBus>(ctx: &Ctx<B>) -> Width {
    if ctx.state.mode() == CpuMode::Long {
        if ctx.prefixes.operand_size {
            Width::W16
        } else {
            Width::W64
        }
    } else {
        ctx.op_width()
    }
}

pub(super) fn push_reg<B: CpuBus>(ctx: &mut Ctx<B>, reg: u8) -> Result<StepExit, Exception> {
    let w = stack_op_width(ctx);
    let reg = reg | ctx.prefixes.rex_b() << 3;
    let value = ctx.reg_read(reg, w);
    stack::push(ctx.state, ctx.bus, w, value)?;
    Ok(StepExit::Continue)
}

pub(super) fn pop_reg<B: CpuBus>(ctx: &mut Ctx<B>, reg: u8) -> Result<StepExit, Exception> {
    let w = stack_op_width(ctx);
    let reg = reg | ctx.prefixes.rex_b() << 3;
    let value = stack::pop(ctx.state, ctx.bus, w)?;
    ctx.reg_write(reg, w, value);
    Ok(StepExit::Continue)
}

pub(super) fn push_seg<B: CpuBus>(ctx: &mut Ctx<B>, seg: SegReg) -> Result<StepExit, Exception> {
    let w = stack_op_width(ctx);
    let value = ctx.state.segments.get(seg).selector as u64;
    stack::push(ctx.state, ctx.bus, w, value)?;
    Ok(StepExit::Continue)
}

pub(super) fn pop_seg<B: CpuBus>(ctx: &mut Ctx<B>, seg: SegReg) -> Result<StepExit, Exception> {
    let w = stack_op_width(ctx);
    let selector = stack::pop(ctx.state, ctx.bus, w)? as u16;
    segmentation::load_segment(ctx.state, ctx.bus, seg, selector)?;
    if seg == SegReg::Ss {
        Ok(StepExit::ContinueInhibitInterrupts)
    } else {
        Ok(StepExit::Continue)
    }
}

/// PUSH imm (0x68/0x6A); the byte form sign-extends.
pub(super) fn push_imm<B: CpuBus>(ctx: &mut Ctx<B>, byte: bool) -> Result<StepExit, Exception> {
    let w = stack_op_width(ctx);
    let value = if byte {
        Width::W8.sign_extend(ctx.imm8()? as u64) & w.mask()
    } else {
        // The immediate is at most 32 bits; 64-bit pushes sign-extend it.
        ctx.stream.next_imm(ctx.bus, w)?
    };
    stack::push(ctx.state, ctx.bus, w, value)?;
    Ok(StepExit::Continue)
}

/// POP r/m (0x8F, digit 0).
pub(super) fn pop_rm<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = stack_op_width(ctx);
    let modrm = ctx.modrm()?;
    if modrm.reg() != 0 {
        return Err(Exception::InvalidOpcode);
    }
    // The pop happens before the effective address uses the new SP.
    let value = stack::pop(ctx.state, ctx.bus, w)?;
    let rm = ctx.resolve_rm(modrm)?;
    ctx.rm_write(&rm, w, value)?;
    Ok(StepExit::Continue)
}

const PUSHA_ORDER: [usize; 8] = [
    gpr::RAX,
    gpr::RCX,
    gpr::RDX,
    gpr::RBX,
    gpr::RSP,
    gpr::RBP,
    gpr::RSI,
    gpr::RDI,
];

/// PUSHA: the eight GPRs, with SP's pre-push value in the SP slot.
pub(super) fn pusha<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let original_sp = ctx.state.read_gpr(gpr::RSP, w);
    for reg in PUSHA_ORDER {
        let value = if reg == gpr::RSP {
            original_sp
        } else {
            ctx.state.read_gpr(reg, w)
        };
        stack::push(ctx.state, ctx.bus, w, value)?;
    }
    Ok(StepExit::Continue)
}

/// POPA: reverse order, discarding the stored SP.
pub(super) fn popa<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    for reg in PUSHA_ORDER.iter().rev() {
        let value = stack::pop(ctx.state, ctx.bus, w)?;
        if *reg != gpr::RSP {
            ctx.state.write_gpr(*reg, value, w);
        }
    }
    Ok(StepExit::Continue)
}

pub(super) fn pushf<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = stack_op_width(ctx);
    let flags = ctx.state.rflags();
    stack::push(ctx.state, ctx.bus, w, flags)?;
    Ok(StepExit::Continue)
}

/// POPF: flag restore filtered by privilege (IOPL only at CPL 0, IF only
/// when CPL ≤ IOPL). Silently keeps protected bits rather than faulting.
pub(super) fn popf<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = stack_op_width(ctx);
    let value = stack::pop(ctx.state, ctx.bus, w)?;
    apply_flags(ctx.state, value, w);
    Ok(StepExit::Continue)
}

/// ENTER imm16, imm8.
pub(super) fn enter<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let alloc = ctx.stream.next_u16(ctx.bus)? as u64;
    let nesting = (ctx.imm8()? % 32) as u64;
    let w = stack_op_width(ctx);
    let sw = ctx.state.stack_width();

    let old_bp = ctx.state.read_gpr(gpr::RBP, w);
    stack::push(ctx.state, ctx.bus, w, old_bp)?;
    let frame_temp = ctx.state.read_gpr(gpr::RSP, sw);

    if nesting > 0 {
        let bp = ctx.state.read_gpr(gpr::RBP, sw);
        for level in 1..nesting {
            let slot = bp.wrapping_sub(level * w.bytes()) & sw.mask();
            let linear = crate::addressing::linear_address(ctx.state, SegReg::Ss, slot);
            let saved = ctx.bus.read_wide(linear, w.bits() / 8)?;
            stack::push(ctx.state, ctx.bus, w, saved)?;
        }
        stack::push(ctx.state, ctx.bus, w, frame_temp)?;
    }

    ctx.state.write_gpr(gpr::RBP, frame_temp, w);
    let new_sp = frame_temp.wrapping_sub(alloc) & sw.mask();
    ctx.state.write_gpr(gpr::RSP, new_sp, sw);
    Ok(StepExit::Continue)
}

/// LEAVE: SP ← BP, then pop BP.
pub(super) fn leave<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = stack_op_width(ctx);
    let sw = ctx.state.stack_width();
    let bp = ctx.state.read_gpr(gpr::RBP, sw);
    ctx.state.write_gpr(gpr::RSP, bp, sw);
    let value = stack::pop(ctx.state, ctx.bus, w)?;
    ctx.state.write_gpr(gpr::RBP, value, w);
    Ok(StepExit::Continue)
}
