//! Shift and rotate group 2, plus the double-precision shifts reached
//! through the 0x0F map.

use helio_x86::{gpr, Width};

use super::Ctx;
use crate::alu;
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::state::{FLAG_CF, FLAG_OF};

/// Where group 2 takes its shift count from.
#[derive(Debug, Clone, Copy)]
pub(super) enum Count {
    One,
    Cl,
    Imm8,
}

/// Group 2 (0xC0/0xC1/0xD0..0xD3): ROL/ROR/RCL/RCR/SHL/SHR/SAL/SAR by the
/// ModR/M digit.
pub(super) fn group2<B: CpuBus>(
    ctx: &mut Ctx<B>,
    wide: bool,
    count: Count,
) -> Result<StepExit, Exception> {
    let w = if wide { ctx.op_width() } else { Width::W8 };
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let count = match count {
        Count::One => 1,
        Count::Cl => ctx.state.read_gpr8(gpr::RCX) as u64,
        Count::Imm8 => ctx.imm8()? as u64,
    };
    let dst = ctx.rm_read(&rm, w)?;

    let result = match modrm.reg() {
        0 => alu::rol(ctx.state, w, dst, count),
        1 => alu::ror(ctx.state, w, dst, count),
        2 => alu::rcl(ctx.state, w, dst, count),
        3 => alu::rcr(ctx.state, w, dst, count),
        // Digit 6 (SAL alias) shifts left like digit 4.
        4 | 6 => alu::shl(ctx.state, w, dst, count),
        5 => alu::shr(ctx.state, w, dst, count),
        _ => alu::sar(ctx.state, w, dst, count),
    };
    ctx.rm_write(&rm, w, result)?;
    Ok(StepExit::Continue)
}

/// SHLD/SHRD (0x0F 0xA4/0xA5/0xAC/0xAD): shift r/m taking the inflowing
/// bits from the `reg` operand.
pub(super) fn double_shift<B: CpuBus>(
    ctx: &mut Ctx<B>,
    left: bool,
    count_in_cl: bool,
) -> Result<StepExit, Exception> {
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let count = if count_in_cl {
        ctx.state.read_gpr8(gpr::RCX) as u64
    } else {
        ctx.imm8()? as u64
    };
    let count_mask: u64 = if w == Width::W64 { 0x3F } else { 0x1F };
    let c = (count & count_mask) as u32;
    if c == 0 {
        return Ok(StepExit::Continue);
    }

    let dst = ctx.rm_read(&rm, w)?;
    let src = ctx.reg_read(super::addressing_reg(ctx, modrm), w);
    let bits = w.bits();
    if c > bits {
        // Result and flags are undefined; leave the destination alone.
        return Ok(StepExit::Continue);
    }

    let (result, carry) = if left {
        let res = if c == bits {
            src & w.mask()
        } else {
            (dst << c | src >> (bits - c)) & w.mask()
        };
        (res, dst >> (bits - c) & 1 != 0)
    } else {
        let res = if c == bits {
            src & w.mask()
        } else {
            (dst >> c | src << (bits - c)) & w.mask()
        };
        (res, dst >> (c - 1) & 1 != 0)
    };

    ctx.state.set_flag(FLAG_CF, carry);
    if c == 1 {
        let msb_old = dst & w.sign_bit() != 0;
        let msb_new = result & w.sign_bit() != 0;
        ctx.state.set_flag(FLAG_OF, msb_old != msb_new);
    }
    alu::set_szp(ctx.state, w, result);
    ctx.rm_write(&rm, w, result)?;
    Ok(StepExit::Continue)
}
