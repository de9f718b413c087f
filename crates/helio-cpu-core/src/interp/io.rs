//! Port I/O: IN/OUT and the string forms INS/OUTS.
//!
//! Every access is gated by the privilege model: `CPL ≤ IOPL` or a clear
//! run of bits in the TSS I/O permission bitmap; otherwise `#GP(0)`.

use helio_x86::{gpr, SegReg, Width};
use tracing::debug;

use super::Ctx;
use crate::addressing::linear_address;
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::segmentation::io_permitted;
use crate::state::FLAG_DF;

fn check_io<B: CpuBus>(ctx: &mut Ctx<B>, port: u16, w: Width) -> Result<(), Exception> {
    if !io_permitted(ctx.state, ctx.bus, port, w.bits() / 8)? {
        debug!(port, cpl = ctx.state.cpl(), iopl = ctx.state.iopl(), "I/O access denied");
        return Err(Exception::gp0());
    }
    Ok(())
}

/// IN with an immediate port (0xE4/0xE5). The 32-bit operand form never
/// widens to 64 bits.
fn io_width<B: CpuBus>(ctx: &Ctx<B>, opcode: u8) -> Width {
    if opcode & 1 == 0 {
        Width::W8
    } else {
        match ctx.op_width() {
            Width::W16 => Width::W16,
            _ => Width::W32,
        }
    }
}

pub(super) fn in_imm<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = io_width(ctx, opcode);
    let port = ctx.imm8()? as u16;
    check_io(ctx, port, w)?;
    let value = ctx.bus.io_read(port, w.bits() / 8)?;
    ctx.state.write_gpr(gpr::RAX, value, w);
    Ok(StepExit::Continue)
}

pub(super) fn out_imm<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = io_width(ctx, opcode);
    let port = ctx.imm8()? as u16;
    check_io(ctx, port, w)?;
    let value = ctx.state.read_gpr(gpr::RAX, w);
    ctx.bus.io_write(port, w.bits() / 8, value)?;
    Ok(StepExit::Continue)
}

pub(super) fn in_dx<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = io_width(ctx, opcode);
    let port = ctx.state.read_gpr16(gpr::RDX);
    check_io(ctx, port, w)?;
    let value = ctx.bus.io_read(port, w.bits() / 8)?;
    ctx.state.write_gpr(gpr::RAX, value, w);
    Ok(StepExit::Continue)
}

pub(super) fn out_dx<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = io_width(ctx, opcode);
    let port = ctx.state.read_gpr16(gpr::RDX);
    check_io(ctx, port, w)?;
    let value = ctx.state.read_gpr(gpr::RAX, w);
    ctx.bus.io_write(port, w.bits() / 8, value)?;
    Ok(StepExit::Continue)
}

fn advance_index<B: CpuBus>(ctx: &mut Ctx<B>, reg: usize, w: Width) {
    let aw = ctx.prefixes.address_width(ctx.state);
    let value = ctx.state.read_gpr(reg, aw);
    let next = if ctx.state.get_flag(FLAG_DF) {
        value.wrapping_sub(w.bytes())
    } else {
        value.wrapping_add(w.bytes())
    } & aw.mask();
    ctx.state.write_gpr(reg, next, aw);
}

fn rep_io_loop<B: CpuBus, F>(ctx: &mut Ctx<B>, mut body: F) -> Result<StepExit, Exception>
where
    F: FnMut(&mut Ctx<B>) -> Result<(), Exception>,
{
    if ctx.prefixes.rep.is_none() {
        body(ctx)?;
        return Ok(StepExit::Continue);
    }
    let aw = ctx.prefixes.address_width(ctx.state);
    loop {
        let count = ctx.state.read_gpr(gpr::RCX, aw);
        if count == 0 {
            break;
        }
        body(ctx)?;
        ctx.state
            .write_gpr(gpr::RCX, count.wrapping_sub(1) & aw.mask(), aw);
    }
    Ok(StepExit::Continue)
}

/// INS (0x6C/0x6D): port → ES:rDI.
pub(super) fn ins<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = io_width(ctx, opcode);
    let port = ctx.state.read_gpr16(gpr::RDX);
    check_io(ctx, port, w)?;
    rep_io_loop(ctx, |ctx| {
        let aw = ctx.prefixes.address_width(ctx.state);
        let dst = linear_address(ctx.state, SegReg::Es, ctx.state.read_gpr(gpr::RDI, aw));
        let value = ctx.bus.io_read(port, w.bits() / 8)?;
        ctx.bus.write_wide(dst, w.bits() / 8, value)?;
        advance_index(ctx, gpr::RDI, w);
        Ok(())
    })
}

/// OUTS (0x6E/0x6F): seg:rSI → port.
pub(super) fn outs<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = io_width(ctx, opcode);
    let port = ctx.state.read_gpr16(gpr::RDX);
    check_io(ctx, port, w)?;
    rep_io_loop(ctx, |ctx| {
        let aw = ctx.prefixes.address_width(ctx.state);
        let seg = ctx.data_segment(SegReg::Ds);
        let src = linear_address(ctx.state, seg, ctx.state.read_gpr(gpr::RSI, aw));
        let value = ctx.bus.read_wide(src, w.bits() / 8)?;
        ctx.bus.io_write(port, w.bits() / 8, value)?;
        advance_index(ctx, gpr::RSI, w);
        Ok(())
    })
}
