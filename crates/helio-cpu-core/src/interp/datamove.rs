//! Data movement: MOV in all its encodings, XCHG, LEA, far-pointer loads,
//! flag byte transfers and XLAT.

use helio_x86::{gpr, SegReg, Width};

use super::Ctx;
use crate::addressing::{linear_address, RmOperand};
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::segmentation;
use crate::state::{FLAG_AF, FLAG_CF, FLAG_PF, FLAG_SF, FLAG_ZF};

/// MOV r/m↔r (0x88..0x8B); direction from opcode bit 1.
pub(super) fn mov_rm_reg<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let reg = super::addressing_reg(ctx, modrm);
    if opcode & 2 == 0 {
        let value = ctx.reg_read(reg, w);
        ctx.rm_write(&rm, w, value)?;
    } else {
        let value = ctx.rm_read(&rm, w)?;
        ctx.reg_write(reg, w, value);
    }
    Ok(StepExit::Continue)
}

/// MOV r/m16, sreg (0x8C). Register destinations zero-extend to the full
/// operand width.
pub(super) fn mov_rm_sreg<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let modrm = ctx.modrm()?;
    let seg = SegReg::from_code(modrm.reg()).ok_or(Exception::InvalidOpcode)?;
    let rm = ctx.resolve_rm(modrm)?;
    let value = ctx.state.segments.get(seg).selector as u64;
    let w = if rm.is_memory() { Width::W16 } else { ctx.op_width() };
    ctx.rm_write(&rm, w, value)?;
    Ok(StepExit::Continue)
}

/// MOV sreg, r/m16 (0x8E). CS is not a valid destination; loading SS opens
/// the one-instruction interrupt shadow.
pub(super) fn mov_sreg_rm<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let modrm = ctx.modrm()?;
    let seg = SegReg::from_code(modrm.reg()).ok_or(Exception::InvalidOpcode)?;
    if seg == SegReg::Cs {
        return Err(Exception::InvalidOpcode);
    }
    let rm = ctx.resolve_rm(modrm)?;
    let selector = ctx.rm_read(&rm, Width::W16)? as u16;
    segmentation::load_segment(ctx.state, ctx.bus, seg, selector)?;
    if seg == SegReg::Ss {
        Ok(StepExit::ContinueInhibitInterrupts)
    } else {
        Ok(StepExit::Continue)
    }
}

/// LEA: the effective address itself, no memory access.
pub(super) fn lea<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let RmOperand::Memory(ea) = rm else {
        return Err(Exception::InvalidOpcode);
    };
    let offset = if ea.rip_relative {
        ctx.ip_after().wrapping_add(ea.offset)
    } else {
        ea.offset
    } & ea.offset_mask;
    ctx.reg_write(super::addressing_reg(ctx, modrm), w, offset & w.mask());
    Ok(StepExit::Continue)
}

pub(super) fn xchg_rm_reg<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let reg = super::addressing_reg(ctx, modrm);
    let rm_val = ctx.rm_read(&rm, w)?;
    let reg_val = ctx.reg_read(reg, w);
    ctx.rm_write(&rm, w, reg_val)?;
    ctx.reg_write(reg, w, rm_val);
    Ok(StepExit::Continue)
}

pub(super) fn xchg_ax_reg<B: CpuBus>(ctx: &mut Ctx<B>, reg: u8) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let reg = reg | ctx.prefixes.rex_b() << 3;
    let acc = ctx.state.read_gpr(gpr::RAX, w);
    let other = ctx.reg_read(reg, w);
    ctx.state.write_gpr(gpr::RAX, other, w);
    ctx.reg_write(reg, w, acc);
    Ok(StepExit::Continue)
}

/// MOV AL/eAX ↔ moffs (0xA0..0xA3): a direct offset of address-size width.
pub(super) fn mov_moffs<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    let aw = ctx.addr_width();
    let offset = match aw {
        Width::W16 => ctx.stream.next_u16(ctx.bus)? as u64,
        Width::W32 => ctx.stream.next_u32(ctx.bus)? as u64,
        _ => ctx.stream.next_u64(ctx.bus)?,
    };
    let seg = ctx.data_segment(SegReg::Ds);
    let linear = linear_address(ctx.state, seg, offset & aw.mask());

    if opcode & 2 == 0 {
        let value = ctx.bus.read_wide(linear, w.bits() / 8)?;
        ctx.state.write_gpr(gpr::RAX, value, w);
    } else {
        let value = ctx.state.read_gpr(gpr::RAX, w);
        ctx.bus.write_wide(linear, w.bits() / 8, value)?;
    }
    Ok(StepExit::Continue)
}

/// MOV r8, imm8 (0xB0..0xB7).
pub(super) fn mov_reg_imm8<B: CpuBus>(ctx: &mut Ctx<B>, reg: u8) -> Result<StepExit, Exception> {
    let reg = reg | ctx.prefixes.rex_b() << 3;
    let imm = ctx.imm8()?;
    ctx.reg_write(reg, Width::W8, imm as u64);
    Ok(StepExit::Continue)
}

/// MOV r, imm (0xB8..0xBF). The REX.W form is the only instruction with a
/// full 64-bit immediate.
pub(super) fn mov_reg_imm<B: CpuBus>(ctx: &mut Ctx<B>, reg: u8) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let reg = reg | ctx.prefixes.rex_b() << 3;
    let imm = match w {
        Width::W64 => ctx.stream.next_u64(ctx.bus)?,
        _ => ctx.imm(w)?,
    };
    ctx.reg_write(reg, w, imm);
    Ok(StepExit::Continue)
}

/// Group 11 (0xC6/0xC7): MOV r/m, imm. Only digit 0 is defined.
pub(super) fn mov_rm_imm<B: CpuBus>(ctx: &mut Ctx<B>, wide: bool) -> Result<StepExit, Exception> {
    let w = if wide { ctx.op_width() } else { Width::W8 };
    let modrm = ctx.modrm()?;
    if modrm.reg() != 0 {
        return Err(Exception::InvalidOpcode);
    }
    let rm = ctx.resolve_rm(modrm)?;
    let imm = ctx.imm(w)?;
    ctx.rm_write(&rm, w, imm)?;
    Ok(StepExit::Continue)
}

/// LES/LDS (0xC4/0xC5): load a far pointer into a segment:register pair.
pub(super) fn load_far_pointer<B: CpuBus>(
    ctx: &mut Ctx<B>,
    seg: SegReg,
) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let RmOperand::Memory(ea) = rm else {
        return Err(Exception::InvalidOpcode);
    };
    let linear = ea.linear(ctx.state, ctx.stream.len());
    let offset = ctx.bus.read_wide(linear, w.bits() / 8)?;
    let selector = ctx.bus.read_u16(linear.wrapping_add(w.bytes()))?;
    segmentation::load_segment(ctx.state, ctx.bus, seg, selector)?;
    ctx.reg_write(super::addressing_reg(ctx, modrm), w, offset);
    Ok(StepExit::Continue)
}

/// MOVSXD (0x63 in long mode): r64 ← sign-extended r/m32.
pub(super) fn movsxd<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let value = ctx.rm_read(&rm, Width::W32)?;
    let extended = if w == Width::W64 {
        Width::W32.sign_extend(value)
    } else {
        value & w.mask()
    };
    ctx.reg_write(super::addressing_reg(ctx, modrm), w, extended);
    Ok(StepExit::Continue)
}

/// MOVZX/MOVSX (0x0F 0xB6/0xB7/0xBE/0xBF).
pub(super) fn mov_extend<B: CpuBus>(
    ctx: &mut Ctx<B>,
    sign: bool,
    src_width: Width,
) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let value = ctx.rm_read(&rm, src_width)?;
    let extended = if sign {
        src_width.sign_extend(value) & w.mask()
    } else {
        value
    };
    ctx.reg_write(super::addressing_reg(ctx, modrm), w, extended);
    Ok(StepExit::Continue)
}

const SAHF_MASK: u64 = FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF;

pub(super) fn sahf<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let ah = ctx.state.read_gpr8_high(gpr::RAX) as u64;
    let flags = ctx.state.rflags() & !SAHF_MASK | ah & SAHF_MASK;
    ctx.state.set_rflags(flags);
    Ok(StepExit::Continue)
}

pub(super) fn lahf<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let flags = ctx.state.rflags() & SAHF_MASK | 0x2;
    ctx.state.write_gpr8_high(gpr::RAX, flags as u8);
    Ok(StepExit::Continue)
}

/// XLAT (0xD7): AL ← [seg:rBX + AL].
pub(super) fn xlat<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let aw = ctx.addr_width();
    let base = ctx.state.read_gpr(gpr::RBX, aw);
    let al = ctx.state.read_gpr8(gpr::RAX) as u64;
    let seg = ctx.data_segment(SegReg::Ds);
    let linear = linear_address(ctx.state, seg, base.wrapping_add(al) & aw.mask());
    let value = ctx.bus.read_u8(linear)?;
    ctx.state.write_gpr8(gpr::RAX, value);
    Ok(StepExit::Continue)
}
