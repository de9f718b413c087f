//! The 0x0F two-byte opcode map.

use helio_x86::{gpr, SegReg, Width};

use super::{condition, Ctx};
use crate::addressing::RmOperand;
use crate::alu;
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::segmentation;
use crate::state::{FLAG_CF, FLAG_ZF};

use super::{datamove, shift, stack_ops, system};

pub(super) fn dispatch<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let opcode = ctx.stream.next_u8(ctx.bus)?;
    match opcode {
        0x00 => system::group6(ctx),
        0x01 => system::group7(ctx),
        0x02 => system::lar_lsl(ctx, false),
        0x03 => system::lar_lsl(ctx, true),
        0x06 => system::clts(ctx),
        // INVD/WBINVD: no caches to invalidate.
        0x08 | 0x09 => Ok(StepExit::Continue),
        0x0B => Err(Exception::InvalidOpcode),
        // Prefetch hints and the long NOP both take a ModR/M operand.
        0x0D | 0x18..=0x1F => {
            let modrm = ctx.modrm()?;
            let _ = ctx.resolve_rm(modrm)?;
            Ok(StepExit::Continue)
        }

        0x20 => system::mov_cr(ctx, false),
        0x21 => system::mov_dr(ctx, false),
        0x22 => system::mov_cr(ctx, true),
        0x23 => system::mov_dr(ctx, true),

        0x30 => system::wrmsr(ctx),
        0x31 => system::rdtsc(ctx),
        0x32 => system::rdmsr(ctx),

        0x40..=0x4F => cmovcc(ctx, opcode & 0xF),

        0x80..=0x8F => jcc_near(ctx, opcode & 0xF),
        0x90..=0x9F => setcc(ctx, opcode & 0xF),

        0xA0 => stack_ops::push_seg(ctx, SegReg::Fs),
        0xA1 => stack_ops::pop_seg(ctx, SegReg::Fs),
        0xA2 => system::cpuid(ctx),
        0xA3 => bt_family(ctx, BitOp::Test, BitSource::Reg),
        0xA4 => shift::double_shift(ctx, true, false),
        0xA5 => shift::double_shift(ctx, true, true),
        0xA8 => stack_ops::push_seg(ctx, SegReg::Gs),
        0xA9 => stack_ops::pop_seg(ctx, SegReg::Gs),
        0xAB => bt_family(ctx, BitOp::Set, BitSource::Reg),
        0xAC => shift::double_shift(ctx, false, false),
        0xAD => shift::double_shift(ctx, false, true),
        0xAF => imul_reg_rm(ctx),

        0xB0 | 0xB1 => cmpxchg(ctx, opcode),
        0xB2 => load_far_seg(ctx, SegReg::Ss),
        0xB3 => bt_family(ctx, BitOp::Reset, BitSource::Reg),
        0xB4 => load_far_seg(ctx, SegReg::Fs),
        0xB5 => load_far_seg(ctx, SegReg::Gs),
        0xB6 => datamove::mov_extend(ctx, false, Width::W8),
        0xB7 => datamove::mov_extend(ctx, false, Width::W16),
        0xBA => group8(ctx),
        0xBB => bt_family(ctx, BitOp::Complement, BitSource::Reg),
        0xBC => bit_scan(ctx, false),
        0xBD => bit_scan(ctx, true),
        0xBE => datamove::mov_extend(ctx, true, Width::W8),
        0xBF => datamove::mov_extend(ctx, true, Width::W16),

        0xC0 | 0xC1 => xadd(ctx, opcode),
        0xC7 => cmpxchg8b(ctx),
        0xC8..=0xCF => bswap(ctx, opcode & 0x7),

        _ => Err(Exception::InvalidOpcode),
    }
}

fn jcc_near<B: CpuBus>(ctx: &mut Ctx<B>, cc: u8) -> Result<StepExit, Exception> {
    let disp = match ctx.op_width() {
        Width::W16 => ctx.stream.next_u16(ctx.bus)? as i16 as i64,
        _ => ctx.stream.next_u32(ctx.bus)? as i32 as i64,
    };
    if condition(ctx.state, cc) {
        let target = ctx.ip_after().wrapping_add(disp as u64);
        ctx.branch_to(target)
    } else {
        Ok(StepExit::Continue)
    }
}

fn setcc<B: CpuBus>(ctx: &mut Ctx<B>, cc: u8) -> Result<StepExit, Exception> {
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let value = condition(ctx.state, cc) as u64;
    ctx.rm_write(&rm, Width::W8, value)?;
    Ok(StepExit::Continue)
}

fn cmovcc<B: CpuBus>(ctx: &mut Ctx<B>, cc: u8) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let value = ctx.rm_read(&rm, w)?;
    if condition(ctx.state, cc) {
        ctx.reg_write(super::addressing_reg(ctx, modrm), w, value);
    }
    Ok(StepExit::Continue)
}

fn imul_reg_rm<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let reg = super::addressing_reg(ctx, modrm);
    let src = ctx.rm_read(&rm, w)?;
    let dst = ctx.reg_read(reg, w);
    let result = alu::imul_truncated(ctx.state, w, dst, src);
    ctx.reg_write(reg, w, result);
    Ok(StepExit::Continue)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

#[derive(Debug, Clone, Copy)]
enum BitSource {
    Reg,
    Imm,
}

/// BT/BTS/BTR/BTC. Register bit offsets into memory operands address the
/// containing word with signed scaling; immediate offsets wrap within the
/// operand.
fn bt_family<B: CpuBus>(
    ctx: &mut Ctx<B>,
    op: BitOp,
    source: BitSource,
) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let bits = w.bits() as i64;

    let raw_offset = match source {
        BitSource::Reg => {
            w.sign_extend(ctx.reg_read(super::addressing_reg(ctx, modrm), w)) as i64
        }
        BitSource::Imm => ctx.imm8()? as i64,
    };

    let (value, bit_idx, mem_addr) = match &rm {
        RmOperand::Register(code) => (
            ctx.reg_read(*code, w),
            raw_offset.rem_euclid(bits) as u32,
            None,
        ),
        RmOperand::Memory(ea) => {
            let base = ea.linear(ctx.state, ctx.stream.len());
            let addr = match source {
                BitSource::Reg => base
                    .wrapping_add((raw_offset.div_euclid(bits) * (bits / 8)) as u64),
                BitSource::Imm => base,
            };
            let bit_idx = raw_offset.rem_euclid(bits) as u32;
            (ctx.bus.read_wide(addr, w.bits() / 8)?, bit_idx, Some(addr))
        }
    };

    ctx.state.set_flag(FLAG_CF, value >> bit_idx & 1 != 0);
    if op == BitOp::Test {
        return Ok(StepExit::Continue);
    }

    let result = match op {
        BitOp::Set => value | 1 << bit_idx,
        BitOp::Reset => value & !(1 << bit_idx),
        _ => value ^ 1 << bit_idx,
    } & w.mask();

    match (&rm, mem_addr) {
        (RmOperand::Register(code), _) => ctx.reg_write(*code, w, result),
        (_, Some(addr)) => ctx.bus.write_wide(addr, w.bits() / 8, result)?,
        _ => unreachable!(),
    }
    Ok(StepExit::Continue)
}

/// Group 8 (0x0F 0xBA): the BT family with an immediate bit offset, which
/// wraps within the operand instead of scaling the address.
fn group8<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let bit = ctx.imm8()? as u32 % w.bits();

    let value = ctx.rm_read(&rm, w)?;
    ctx.state.set_flag(FLAG_CF, value >> bit & 1 != 0);

    let result = match modrm.reg() {
        4 => return Ok(StepExit::Continue),
        5 => value | 1 << bit,
        6 => value & !(1 << bit),
        7 => value ^ 1 << bit,
        _ => return Err(Exception::InvalidOpcode),
    } & w.mask();
    ctx.rm_write(&rm, w, result)?;
    Ok(StepExit::Continue)
}

fn bit_scan<B: CpuBus>(ctx: &mut Ctx<B>, reverse: bool) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let value = ctx.rm_read(&rm, w)?;
    if value == 0 {
        ctx.state.set_flag(FLAG_ZF, true);
        return Ok(StepExit::Continue);
    }
    ctx.state.set_flag(FLAG_ZF, false);
    let index = if reverse {
        63 - value.leading_zeros() as u64
    } else {
        value.trailing_zeros() as u64
    };
    ctx.reg_write(super::addressing_reg(ctx, modrm), w, index);
    Ok(StepExit::Continue)
}

/// CMPXCHG (0x0F 0xB0/0xB1).
fn cmpxchg<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let dst = ctx.rm_read(&rm, w)?;
    let acc = ctx.state.read_gpr(gpr::RAX, w);
    alu::cmp(ctx.state, w, acc, dst);
    if acc == dst {
        let src = ctx.reg_read(super::addressing_reg(ctx, modrm), w);
        ctx.rm_write(&rm, w, src)?;
    } else {
        ctx.state.write_gpr(gpr::RAX, dst, w);
    }
    Ok(StepExit::Continue)
}

/// Group 9 (0x0F 0xC7): CMPXCHG8B m64.
fn cmpxchg8b<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let modrm = ctx.modrm()?;
    if modrm.reg() != 1 {
        return Err(Exception::InvalidOpcode);
    }
    let rm = ctx.resolve_rm(modrm)?;
    let RmOperand::Memory(ea) = rm else {
        return Err(Exception::InvalidOpcode);
    };
    let linear = ea.linear(ctx.state, ctx.stream.len());
    let current = ctx.bus.read_u64(linear)?;
    let expected = ctx.state.read_gpr32(gpr::RAX) as u64
        | (ctx.state.read_gpr32(gpr::RDX) as u64) << 32;
    if current == expected {
        let replacement = ctx.state.read_gpr32(gpr::RBX) as u64
            | (ctx.state.read_gpr32(gpr::RCX) as u64) << 32;
        ctx.bus.write_u64(linear, replacement)?;
        ctx.state.set_flag(FLAG_ZF, true);
    } else {
        ctx.state.write_gpr32(gpr::RAX, current as u32);
        ctx.state.write_gpr32(gpr::RDX, (current >> 32) as u32);
        ctx.state.set_flag(FLAG_ZF, false);
    }
    Ok(StepExit::Continue)
}

/// XADD (0x0F 0xC0/0xC1).
fn xadd<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let reg = super::addressing_reg(ctx, modrm);
    let dst = ctx.rm_read(&rm, w)?;
    let src = ctx.reg_read(reg, w);
    let sum = alu::add(ctx.state, w, dst, src);
    ctx.rm_write(&rm, w, sum)?;
    ctx.reg_write(reg, w, dst);
    Ok(StepExit::Continue)
}

fn bswap<B: CpuBus>(ctx: &mut Ctx<B>, reg: u8) -> Result<StepExit, Exception> {
    let reg = reg | ctx.prefixes.rex_b() << 3;
    if ctx.prefixes.rex_w() {
        let value = ctx.state.read_gpr64(reg as usize);
        ctx.state.write_gpr64(reg as usize, value.swap_bytes());
    } else {
        let value = ctx.state.read_gpr32(reg as usize);
        ctx.state.write_gpr32(reg as usize, value.swap_bytes());
    }
    Ok(StepExit::Continue)
}

/// LSS/LFS/LGS through the 0x0F map.
fn load_far_seg<B: CpuBus>(ctx: &mut Ctx<B>, seg: SegReg) -> Result<StepExit, Exception> {
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
    if seg == SegReg::Ss {
        Ok(StepExit::ContinueInhibitInterrupts)
    } else {
        Ok(StepExit::Continue)
    }
}
