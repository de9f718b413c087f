//! ALU instruction families: the classic 0x00–0x3D block, the immediate
//! groups, unary group 3, INC/DEC forms, widening converts and the BCD
//! adjustment set.

use helio_x86::{gpr, Width};

use super::Ctx;
use crate::alu;
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;

/// Apply ALU operation `op` (bits 5..3 of the opcode / the group-1 digit).
/// Returns the result and whether it is written back (CMP is compare-only).
fn alu_apply<B: CpuBus>(
    ctx: &mut Ctx<B>,
    op: u8,
    w: Width,
    dst: u64,
    src: u64,
) -> (u64, bool) {
    match op {
        0 => (alu::add(ctx.state, w, dst, src), true),
        1 => (alu::or(ctx.state, w, dst, src), true),
        2 => (alu::adc(ctx.state, w, dst, src), true),
        3 => (alu::sbb(ctx.state, w, dst, src), true),
        4 => (alu::and(ctx.state, w, dst, src), true),
        5 => (alu::sub(ctx.state, w, dst, src), true),
        6 => (alu::xor(ctx.state, w, dst, src), true),
        _ => {
            alu::cmp(ctx.state, w, dst, src);
            (dst, false)
        }
    }
}

/// ADD/OR/ADC/SBB/AND/SUB/XOR/CMP: four r/m forms plus the accumulator
/// immediates, selected by the low three opcode bits.
pub(super) fn alu_family<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let op = (opcode >> 3) & 0x7;
    let form = opcode & 0x7;
    let w = ctx.width_for(opcode);

    match form {
        // op rm, reg
        0 | 1 => {
            let modrm = ctx.modrm()?;
            let rm = ctx.resolve_rm(modrm)?;
            let src = ctx.reg_read(super::addressing_reg(ctx, modrm), w);
            let dst = ctx.rm_read(&rm, w)?;
            let (result, write) = alu_apply(ctx, op, w, dst, src);
            if write {
                ctx.rm_write(&rm, w, result)?;
            }
        }
        // op reg, rm
        2 | 3 => {
            let modrm = ctx.modrm()?;
            let rm = ctx.resolve_rm(modrm)?;
            let reg = super::addressing_reg(ctx, modrm);
            let src = ctx.rm_read(&rm, w)?;
            let dst = ctx.reg_read(reg, w);
            let (result, write) = alu_apply(ctx, op, w, dst, src);
            if write {
                ctx.reg_write(reg, w, result);
            }
        }
        // op AL/eAX, imm
        _ => {
            let src = ctx.imm(w)?;
            let dst = ctx.state.read_gpr(gpr::RAX, w);
            let (result, write) = alu_apply(ctx, op, w, dst, src);
            if write {
                ctx.state.write_gpr(gpr::RAX, result, w);
            }
        }
    }
    Ok(StepExit::Continue)
}

/// Group 1 (0x80/0x81/0x83): ALU op selected by the ModR/M digit, immediate
/// operand, optionally sign-extended from 8 bits.
pub(super) fn group1<B: CpuBus>(
    ctx: &mut Ctx<B>,
    wide: bool,
    sign_extend_imm: bool,
) -> Result<StepExit, Exception> {
    let w = if wide { ctx.op_width() } else { Width::W8 };
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let imm = if sign_extend_imm {
        Width::W8.sign_extend(ctx.imm8()? as u64) & w.mask()
    } else {
        ctx.imm(w)?
    };
    let dst = ctx.rm_read(&rm, w)?;
    let (result, write) = alu_apply(ctx, modrm.reg(), w, dst, imm);
    if write {
        ctx.rm_write(&rm, w, result)?;
    }
    Ok(StepExit::Continue)
}

pub(super) fn test_rm_reg<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let src = ctx.reg_read(super::addressing_reg(ctx, modrm), w);
    let dst = ctx.rm_read(&rm, w)?;
    alu::test(ctx.state, w, dst, src);
    Ok(StepExit::Continue)
}

pub(super) fn test_acc_imm<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    let imm = ctx.imm(w)?;
    let acc = ctx.state.read_gpr(gpr::RAX, w);
    alu::test(ctx.state, w, acc, imm);
    Ok(StepExit::Continue)
}

/// Single-byte INC r16/32 (0x40..0x47; unreachable in long mode where the
/// bytes decode as REX).
pub(super) fn inc_reg<B: CpuBus>(ctx: &mut Ctx<B>, reg: u8) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let value = ctx.reg_read(reg, w);
    let result = alu::inc(ctx.state, w, value);
    ctx.reg_write(reg, w, result);
    Ok(StepExit::Continue)
}

pub(super) fn dec_reg<B: CpuBus>(ctx: &mut Ctx<B>, reg: u8) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let value = ctx.reg_read(reg, w);
    let result = alu::dec(ctx.state, w, value);
    ctx.reg_write(reg, w, result);
    Ok(StepExit::Continue)
}

/// Group 3 (0xF6/0xF7): TEST imm, NOT, NEG, MUL, IMUL, DIV, IDIV.
pub(super) fn group3<B: CpuBus>(ctx: &mut Ctx<B>, wide: bool) -> Result<StepExit, Exception> {
    let w = if wide { ctx.op_width() } else { Width::W8 };
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;

    match modrm.reg() {
        0 | 1 => {
            let imm = ctx.imm(w)?;
            let dst = ctx.rm_read(&rm, w)?;
            alu::test(ctx.state, w, dst, imm);
        }
        2 => {
            let dst = ctx.rm_read(&rm, w)?;
            let result = alu::not(w, dst);
            ctx.rm_write(&rm, w, result)?;
        }
        3 => {
            let dst = ctx.rm_read(&rm, w)?;
            let result = alu::neg(ctx.state, w, dst);
            ctx.rm_write(&rm, w, result)?;
        }
        4 | 5 => {
            let src = ctx.rm_read(&rm, w)?;
            let acc = ctx.state.read_gpr(gpr::RAX, w);
            let (lo, hi) = if modrm.reg() == 4 {
                alu::mul(ctx.state, w, acc, src)
            } else {
                alu::imul_wide(ctx.state, w, acc, src)
            };
            write_mul_result(ctx, w, lo, hi);
        }
        6 | 7 => {
            let src = ctx.rm_read(&rm, w)?;
            let (lo, hi) = read_div_dividend(ctx, w);
            let (quot, rem) = if modrm.reg() == 6 {
                alu::div(w, lo, hi, src)?
            } else {
                alu::idiv(w, lo, hi, src)?
            };
            write_div_result(ctx, w, quot, rem);
        }
        _ => unreachable!(),
    }
    Ok(StepExit::Continue)
}

/// 8-bit forms use AX as the implicit double-width register; wider forms
/// use the DX:AX pair.
fn write_mul_result<B: CpuBus>(ctx: &mut Ctx<B>, w: Width, lo: u64, hi: u64) {
    if w == Width::W8 {
        ctx.state.write_gpr16(gpr::RAX, (hi << 8 | lo) as u16);
    } else {
        ctx.state.write_gpr(gpr::RAX, lo, w);
        ctx.state.write_gpr(gpr::RDX, hi, w);
    }
}

fn read_div_dividend<B: CpuBus>(ctx: &Ctx<B>, w: Width) -> (u64, u64) {
    if w == Width::W8 {
        let ax = ctx.state.read_gpr16(gpr::RAX) as u64;
        (ax & 0xFF, ax >> 8)
    } else {
        (
            ctx.state.read_gpr(gpr::RAX, w),
            ctx.state.read_gpr(gpr::RDX, w),
        )
    }
}

fn write_div_result<B: CpuBus>(ctx: &mut Ctx<B>, w: Width, quot: u64, rem: u64) {
    if w == Width::W8 {
        ctx.state.write_gpr16(gpr::RAX, (rem << 8 | quot & 0xFF) as u16);
    } else {
        ctx.state.write_gpr(gpr::RAX, quot, w);
        ctx.state.write_gpr(gpr::RDX, rem, w);
    }
}

/// Group 4 (0xFE): INC/DEC r/m8. The remaining digits are undefined.
pub(super) fn group4<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let dst = ctx.rm_read(&rm, Width::W8)?;
    let result = match modrm.reg() {
        0 => alu::inc(ctx.state, Width::W8, dst),
        1 => alu::dec(ctx.state, Width::W8, dst),
        _ => return Err(Exception::InvalidOpcode),
    };
    ctx.rm_write(&rm, Width::W8, result)?;
    Ok(StepExit::Continue)
}

/// IMUL r, r/m, imm (0x69/0x6B).
pub(super) fn imul_rm_imm<B: CpuBus>(
    ctx: &mut Ctx<B>,
    byte_imm: bool,
) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let imm = if byte_imm {
        Width::W8.sign_extend(ctx.imm8()? as u64) & w.mask()
    } else {
        ctx.imm(w)?
    };
    let src = ctx.rm_read(&rm, w)?;
    let result = alu::imul_truncated(ctx.state, w, src, imm);
    ctx.reg_write(super::addressing_reg(ctx, modrm), w, result);
    Ok(StepExit::Continue)
}

/// CBW/CWDE/CDQE: sign-extend the accumulator's lower half in place.
pub(super) fn cbw<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    match ctx.op_width() {
        Width::W16 => {
            let al = ctx.state.read_gpr8(gpr::RAX);
            ctx.state.write_gpr16(gpr::RAX, al as i8 as i16 as u16);
        }
        Width::W32 => {
            let ax = ctx.state.read_gpr16(gpr::RAX);
            ctx.state.write_gpr32(gpr::RAX, ax as i16 as i32 as u32);
        }
        _ => {
            let eax = ctx.state.read_gpr32(gpr::RAX);
            ctx.state.write_gpr64(gpr::RAX, eax as i32 as i64 as u64);
        }
    }
    Ok(StepExit::Continue)
}

/// CWD/CDQ/CQO: spread the accumulator's sign through DX/EDX/RDX.
pub(super) fn cwd<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let acc = ctx.state.read_gpr(gpr::RAX, w);
    let fill = if acc & w.sign_bit() != 0 { w.mask() } else { 0 };
    ctx.state.write_gpr(gpr::RDX, fill, w);
    Ok(StepExit::Continue)
}

pub(super) fn daa<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    alu::daa(ctx.state);
    Ok(StepExit::Continue)
}

pub(super) fn das<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    alu::das(ctx.state);
    Ok(StepExit::Continue)
}

pub(super) fn aaa<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    alu::aaa(ctx.state);
    Ok(StepExit::Continue)
}

pub(super) fn aas<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    alu::aas(ctx.state);
    Ok(StepExit::Continue)
}

pub(super) fn aam<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let base = ctx.imm8()?;
    alu::aam(ctx.state, base)?;
    Ok(StepExit::Continue)
}

pub(super) fn aad<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let base = ctx.imm8()?;
    alu::aad(ctx.state, base);
    Ok(StepExit::Continue)
}
