//! Control flow: conditional and unconditional branches, near and far
//! calls and returns, loops, software interrupts and IRET.

use helio_x86::{gpr, Width};
use tracing::debug;

use super::{condition, Ctx};
use crate::addressing::RmOperand;
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::interrupts::iret_inner;
use crate::mem::CpuBus;
use crate::segmentation::{
    self, read_descriptor, GateDescriptor, SegmentDescriptor,
};
use crate::stack;
use crate::state::{CpuMode, FLAG_OF, FLAG_ZF};

/// Return-address width: far/near calls and returns push the operand size,
/// promoted to 64 bits in long mode.
fn branch_width<B: CpuBus>(ctx: &Ctx<B>) -> Width {
    if ctx.state.mode() == CpuMode::Long {
        Width::W64
    } else {
        ctx.op_width()
    }
}

pub(super) fn jcc_short<B: CpuBus>(ctx: &mut Ctx<B>, cc: u8) -> Result<StepExit, Exception> {
    let disp = ctx.stream.next_i8(ctx.bus)? as i64;
    if condition(ctx.state, cc) {
        let target = ctx.ip_after().wrapping_add(disp as u64);
        ctx.branch_to(target)
    } else {
        Ok(StepExit::Continue)
    }
}

pub(super) fn jmp_short<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let disp = ctx.stream.next_i8(ctx.bus)? as i64;
    let target = ctx.ip_after().wrapping_add(disp as u64);
    ctx.branch_to(target)
}

fn near_displacement<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<i64, Exception> {
    Ok(match ctx.op_width() {
        Width::W16 => ctx.stream.next_u16(ctx.bus)? as i16 as i64,
        _ => ctx.stream.next_u32(ctx.bus)? as i32 as i64,
    })
}

pub(super) fn jmp_near<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let disp = near_displacement(ctx)?;
    let target = ctx.ip_after().wrapping_add(disp as u64);
    ctx.branch_to(target)
}

pub(super) fn call_near<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let disp = near_displacement(ctx)?;
    let return_ip = ctx.ip_after();
    let target = return_ip.wrapping_add(disp as u64);
    let w = branch_width(ctx);
    stack::push(ctx.state, ctx.bus, w, return_ip)?;
    ctx.branch_to(target)
}

pub(super) fn ret_near<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = branch_width(ctx);
    let target = stack::pop(ctx.state, ctx.bus, w)?;
    ctx.branch_to(target)
}

pub(super) fn ret_near_imm<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let release = ctx.stream.next_u16(ctx.bus)? as u64;
    let w = branch_width(ctx);
    let target = stack::pop(ctx.state, ctx.bus, w)?;
    let sw = ctx.state.stack_width();
    let sp = ctx.state.read_gpr(gpr::RSP, sw).wrapping_add(release) & sw.mask();
    ctx.state.write_gpr(gpr::RSP, sp, sw);
    ctx.branch_to(target)
}

/// LOOP/LOOPE/LOOPNE: decrement rCX (address width) and branch while it is
/// non-zero, optionally gated on ZF.
pub(super) fn loop_cc<B: CpuBus>(
    ctx: &mut Ctx<B>,
    zf_requirement: Option<bool>,
) -> Result<StepExit, Exception> {
    let disp = ctx.stream.next_i8(ctx.bus)? as i64;
    let aw = ctx.addr_width();
    let count = ctx.state.read_gpr(gpr::RCX, aw).wrapping_sub(1) & aw.mask();
    ctx.state.write_gpr(gpr::RCX, count, aw);

    let zf_ok = zf_requirement.map_or(true, |want| ctx.state.get_flag(FLAG_ZF) == want);
    if count != 0 && zf_ok {
        let target = ctx.ip_after().wrapping_add(disp as u64);
        ctx.branch_to(target)
    } else {
        Ok(StepExit::Continue)
    }
}

/// JCXZ/JECXZ/JRCXZ.
pub(super) fn jcxz<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let disp = ctx.stream.next_i8(ctx.bus)? as i64;
    let aw = ctx.addr_width();
    if ctx.state.read_gpr(gpr::RCX, aw) == 0 {
        let target = ctx.ip_after().wrapping_add(disp as u64);
        ctx.branch_to(target)
    } else {
        Ok(StepExit::Continue)
    }
}

/// Far transfer to `selector:offset`. In protected mode the selector may
/// name a code segment or a call gate; gates redirect the target and, on a
/// privilege increase, switch stacks and copy the declared parameter count.
fn far_transfer<B: CpuBus>(
    ctx: &mut Ctx<B>,
    selector: u16,
    offset: u64,
    is_call: bool,
) -> Result<StepExit, Exception> {
    let w = ctx.op_width();

    if !ctx.state.is_protected() {
        let old_cs = ctx.state.segments.cs.selector as u64;
        let return_ip = ctx.ip_after();
        ctx.state.segments.cs.set_real_mode(selector);
        if is_call {
            stack::push(ctx.state, ctx.bus, w, old_cs)?;
            stack::push(ctx.state, ctx.bus, w, return_ip)?;
        }
        ctx.state.set_rip(offset & w.mask());
        return Ok(StepExit::Branch);
    }

    let raw = read_descriptor(ctx.state, ctx.bus, selector)?;
    let desc = SegmentDescriptor::parse(raw);

    if desc.is_system() {
        let gate = GateDescriptor::parse32(raw);
        if !gate.is_call_gate() {
            return Err(Exception::GeneralProtection(selector & !0x7));
        }
        let rpl = (selector & 0x3) as u8;
        if gate.dpl < ctx.state.cpl() || gate.dpl < rpl {
            return Err(Exception::GeneralProtection(selector & !0x7));
        }
        if !gate.present {
            return Err(Exception::SegmentNotPresent(selector & !0x7));
        }
        return call_gate_transfer(ctx, gate, is_call);
    }

    let old_cs = ctx.state.segments.cs.selector as u64;
    let return_ip = ctx.ip_after();
    segmentation::load_code_segment(ctx.state, ctx.bus, selector)?;
    if is_call {
        stack::push(ctx.state, ctx.bus, w, old_cs)?;
        stack::push(ctx.state, ctx.bus, w, return_ip)?;
    }
    ctx.state.set_rip(offset & w.mask());
    Ok(StepExit::Branch)
}

/// The call-gate leg of a far transfer.
fn call_gate_transfer<B: CpuBus>(
    ctx: &mut Ctx<B>,
    gate: GateDescriptor,
    is_call: bool,
) -> Result<StepExit, Exception> {
    let target_raw = read_descriptor(ctx.state, ctx.bus, gate.selector)?;
    let target = SegmentDescriptor::parse(target_raw);
    if !target.is_code() {
        return Err(Exception::GeneralProtection(gate.selector & !0x7));
    }
    if !target.present() {
        return Err(Exception::SegmentNotPresent(gate.selector & !0x7));
    }

    let word = if gate.is_16bit() { Width::W16 } else { Width::W32 };
    let old_cpl = ctx.state.cpl();

    if is_call && !target.is_conforming() && target.dpl() < old_cpl {
        // Privilege increase: switch to the target ring's stack, copy the
        // declared parameters across, then push the return linkage.
        let new_cpl = target.dpl();
        let tss = ctx.state.tables.tr;
        let slot = tss.base.wrapping_add(4 + 8 * new_cpl as u64);
        let new_sp = ctx.bus.read_u32(slot)? as u64;
        let new_ss = ctx.bus.read_u16(slot.wrapping_add(4))?;

        let old_ss = ctx.state.segments.ss.selector as u64;
        let old_sp = ctx.state.read_gpr(gpr::RSP, ctx.state.stack_width());

        let mut params = Vec::with_capacity(gate.param_count as usize);
        for i in 0..gate.param_count as u64 {
            params.push(stack::peek(ctx.state, ctx.bus, word, i)?);
        }

        debug!(
            selector = gate.selector,
            new_cpl, new_ss, new_sp, params = gate.param_count, "call gate stack switch"
        );
        ctx.state.segments.ss.selector = new_ss;
        ctx.state.write_gpr64(gpr::RSP, new_sp);

        stack::push(ctx.state, ctx.bus, word, old_ss)?;
        stack::push(ctx.state, ctx.bus, word, old_sp)?;
        for value in params.iter().rev() {
            stack::push(ctx.state, ctx.bus, word, *value)?;
        }
        let old_cs = ctx.state.segments.cs.selector as u64;
        let return_ip = ctx.ip_after();
        stack::push(ctx.state, ctx.bus, word, old_cs)?;
        stack::push(ctx.state, ctx.bus, word, return_ip)?;

        ctx.state.segments.cs.selector = gate.selector & !0x3 | new_cpl as u16;
        ctx.state.set_rip(gate.offset & word.mask());
        return Ok(StepExit::Branch);
    }

    // Same-privilege transfer through the gate.
    let old_cs = ctx.state.segments.cs.selector as u64;
    let return_ip = ctx.ip_after();
    if is_call {
        stack::push(ctx.state, ctx.bus, word, old_cs)?;
        stack::push(ctx.state, ctx.bus, word, return_ip)?;
    }
    ctx.state.segments.cs.selector = gate.selector & !0x3 | old_cpl as u16;
    ctx.state.set_rip(gate.offset & word.mask());
    Ok(StepExit::Branch)
}

/// CALL ptr16:16/32 (0x9A).
pub(super) fn call_far_imm<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let offset = ctx.imm(w)?;
    let selector = ctx.stream.next_u16(ctx.bus)?;
    far_transfer(ctx, selector, offset, true)
}

/// JMP ptr16:16/32 (0xEA).
pub(super) fn jmp_far_imm<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let offset = ctx.imm(w)?;
    let selector = ctx.stream.next_u16(ctx.bus)?;
    far_transfer(ctx, selector, offset, false)
}

/// RETF (+imm16): far return, optionally to an outer ring.
pub(super) fn ret_far<B: CpuBus>(ctx: &mut Ctx<B>, with_imm: bool) -> Result<StepExit, Exception> {
    let release = if with_imm {
        ctx.stream.next_u16(ctx.bus)? as u64
    } else {
        0
    };
    let w = branch_width(ctx);

    let ip = stack::pop(ctx.state, ctx.bus, w)?;
    let cs = stack::pop(ctx.state, ctx.bus, w)? as u16;

    if ctx.state.is_protected() {
        let new_cpl = (cs & 0x3) as u8;
        if new_cpl < ctx.state.cpl() {
            return Err(Exception::gp0());
        }
        if new_cpl > ctx.state.cpl() {
            // Returning outward: the caller's SS:SP sits above the release
            // area on the current stack.
            let sw = ctx.state.stack_width();
            let sp = ctx.state.read_gpr(gpr::RSP, sw).wrapping_add(release) & sw.mask();
            ctx.state.write_gpr(gpr::RSP, sp, sw);
            let outer_sp = stack::pop(ctx.state, ctx.bus, w)?;
            let outer_ss = stack::pop(ctx.state, ctx.bus, w)? as u16;
            ctx.state.segments.cs.selector = cs;
            ctx.state.segments.ss.selector = outer_ss;
            // The release count strips gate-copied parameters from the
            // outer stack as well.
            ctx.state
                .write_gpr(gpr::RSP, outer_sp.wrapping_add(release), ctx.state.stack_width());
            ctx.state.set_rip(ip & w.mask());
            return Ok(StepExit::Branch);
        }
        ctx.state.segments.cs.selector = cs;
    } else {
        ctx.state.segments.cs.set_real_mode(cs);
    }

    let sw = ctx.state.stack_width();
    let sp = ctx.state.read_gpr(gpr::RSP, sw).wrapping_add(release) & sw.mask();
    ctx.state.write_gpr(gpr::RSP, sp, sw);
    ctx.state.set_rip(ip & w.mask());
    Ok(StepExit::Branch)
}

/// Group 5 (0xFF): INC/DEC rm, CALL/JMP near and far through r/m, PUSH rm.
pub(super) fn group5<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let modrm = ctx.modrm()?;
    match modrm.reg() {
        0 | 1 => {
            let w = ctx.op_width();
            let rm = ctx.resolve_rm(modrm)?;
            let dst = ctx.rm_read(&rm, w)?;
            let result = if modrm.reg() == 0 {
                crate::alu::inc(ctx.state, w, dst)
            } else {
                crate::alu::dec(ctx.state, w, dst)
            };
            ctx.rm_write(&rm, w, result)?;
            Ok(StepExit::Continue)
        }
        2 => {
            let w = branch_width(ctx);
            let rm = ctx.resolve_rm(modrm)?;
            let target = ctx.rm_read(&rm, w)?;
            let return_ip = ctx.ip_after();
            stack::push(ctx.state, ctx.bus, w, return_ip)?;
            ctx.branch_to(target)
        }
        4 => {
            let w = branch_width(ctx);
            let rm = ctx.resolve_rm(modrm)?;
            let target = ctx.rm_read(&rm, w)?;
            ctx.branch_to(target)
        }
        3 | 5 => {
            // Far pointer in memory: offset then selector.
            let w = ctx.op_width();
            let rm = ctx.resolve_rm(modrm)?;
            let RmOperand::Memory(ea) = rm else {
                return Err(Exception::InvalidOpcode);
            };
            let linear = ea.linear(ctx.state, ctx.stream.len());
            let offset = ctx.bus.read_wide(linear, w.bits() / 8)?;
            let selector = ctx.bus.read_u16(linear.wrapping_add(w.bytes()))?;
            far_transfer(ctx, selector, offset, modrm.reg() == 3)
        }
        6 => {
            let w = if ctx.state.mode() == CpuMode::Long {
                if ctx.prefixes.operand_size {
                    Width::W16
                } else {
                    Width::W64
                }
            } else {
                ctx.op_width()
            };
            let rm = ctx.resolve_rm(modrm)?;
            let value = ctx.rm_read(&rm, w)?;
            stack::push(ctx.state, ctx.bus, w, value)?;
            Ok(StepExit::Continue)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

/// INTO (0xCE): `#OF` through the exception pipeline when OF is set.
pub(super) fn into<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    if ctx.state.get_flag(FLAG_OF) {
        Ok(StepExit::SoftwareInterrupt { vector: 4 })
    } else {
        Ok(StepExit::Continue)
    }
}

/// IRET/IRETD/IRETQ (0xCF).
pub(super) fn iret<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    iret_inner(ctx.state, ctx.bus, w)?;
    Ok(StepExit::Branch)
}

/// BOUND (0x62): array index against a signed bounds pair in memory.
pub(super) fn bound<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let RmOperand::Memory(ea) = rm else {
        return Err(Exception::InvalidOpcode);
    };
    let linear = ea.linear(ctx.state, ctx.stream.len());
    let lower = w.sign_extend(ctx.bus.read_wide(linear, w.bits() / 8)?) as i64;
    let upper = w.sign_extend(ctx.bus.read_wide(linear.wrapping_add(w.bytes()), w.bits() / 8)?) as i64;
    let index =
        w.sign_extend(ctx.reg_read(super::addressing_reg(ctx, modrm), w)) as i64;
    if index < lower || index > upper {
        return Err(Exception::BoundRange);
    }
    Ok(StepExit::Continue)
}

/// ARPL (0x63 outside long mode): raise the RPL of a selector to match.
pub(super) fn arpl<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    if !ctx.state.is_protected() {
        return Err(Exception::InvalidOpcode);
    }
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let dst = ctx.rm_read(&rm, Width::W16)? as u16;
    let src = ctx.reg_read(super::addressing_reg(ctx, modrm), Width::W16) as u16;
    if dst & 0x3 < src & 0x3 {
        ctx.rm_write(&rm, Width::W16, (dst & !0x3 | src & 0x3) as u64)?;
        ctx.state.set_flag(FLAG_ZF, true);
    } else {
        ctx.state.set_flag(FLAG_ZF, false);
    }
    Ok(StepExit::Continue)
}
