//! String operations (MOVS/CMPS/SCAS/LODS/STOS) with REP/REPE/REPNE.
//!
//! Sources read `seg:rSI` (segment override applies to the source only),
//! destinations write `ES:rDI`. Index registers advance by the element
//! width after each element's memory access, and the count register is
//! updated per element, so a fault mid-REP leaves SI/DI/CX reflecting the
//! elements already completed and the instruction restartable.

use helio_x86::{gpr, SegReg, Width};

use super::Ctx;
use crate::addressing::linear_address;
use crate::alu;
use crate::decode::RepKind;
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::state::{FLAG_DF, FLAG_ZF};

/// Advance an index register by one element, respecting DF and the address
/// width.
fn advance_index<B: CpuBus>(ctx: &mut Ctx<B>, reg: usize, w: Width) {
    let aw = ctx.prefixes.address_width(ctx.state);
    let delta = w.bytes();
    let value = ctx.state.read_gpr(reg, aw);
    let next = if ctx.state.get_flag(FLAG_DF) {
        value.wrapping_sub(delta)
    } else {
        value.wrapping_add(delta)
    } & aw.mask();
    ctx.state.write_gpr(reg, next, aw);
}

/// Drive one string-op body under the REP machinery.
///
/// `observes_zf`: CMPS/SCAS terminate early when ZF stops matching the
/// REPE/REPNE expectation.
fn rep_loop<B: CpuBus, F>(
    ctx: &mut Ctx<B>,
    observes_zf: bool,
    mut body: F,
) -> Result<StepExit, Exception>
where
    F: FnMut(&mut Ctx<B>) -> Result<(), Exception>,
{
    let Some(rep) = ctx.prefixes.rep else {
        body(ctx)?;
        return Ok(StepExit::Continue);
    };

    let aw = ctx.prefixes.address_width(ctx.state);
    loop {
        let count = ctx.state.read_gpr(gpr::RCX, aw);
        if count == 0 {
            break;
        }
        body(ctx)?;
        ctx.state
            .write_gpr(gpr::RCX, count.wrapping_sub(1) & aw.mask(), aw);

        if observes_zf {
            let zf = ctx.state.get_flag(FLAG_ZF);
            let keep_going = match rep {
                RepKind::Rep => zf,
                RepKind::Repne => !zf,
            };
            if !keep_going {
                break;
            }
        }
    }
    Ok(StepExit::Continue)
}

fn src_linear<B: CpuBus>(ctx: &Ctx<B>) -> u64 {
    let aw = ctx.prefixes.address_width(ctx.state);
    let seg = ctx.data_segment(SegReg::Ds);
    linear_address(ctx.state, seg, ctx.state.read_gpr(gpr::RSI, aw))
}

fn dst_linear<B: CpuBus>(ctx: &Ctx<B>) -> u64 {
    let aw = ctx.prefixes.address_width(ctx.state);
    linear_address(ctx.state, SegReg::Es, ctx.state.read_gpr(gpr::RDI, aw))
}

pub(super) fn movs<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    rep_loop(ctx, false, |ctx| {
        let src = src_linear(ctx);
        let value = ctx.bus.read_wide(src, w.bits() / 8)?;
        let dst = dst_linear(ctx);
        ctx.bus.write_wide(dst, w.bits() / 8, value)?;
        advance_index(ctx, gpr::RSI, w);
        advance_index(ctx, gpr::RDI, w);
        Ok(())
    })
}

pub(super) fn cmps<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    rep_loop(ctx, true, |ctx| {
        let src = src_linear(ctx);
        let a = ctx.bus.read_wide(src, w.bits() / 8)?;
        let dst = dst_linear(ctx);
        let b = ctx.bus.read_wide(dst, w.bits() / 8)?;
        alu::cmp(ctx.state, w, a, b);
        advance_index(ctx, gpr::RSI, w);
        advance_index(ctx, gpr::RDI, w);
        Ok(())
    })
}

pub(super) fn scas<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    rep_loop(ctx, true, |ctx| {
        let acc = ctx.state.read_gpr(gpr::RAX, w);
        let dst = dst_linear(ctx);
        let value = ctx.bus.read_wide(dst, w.bits() / 8)?;
        alu::cmp(ctx.state, w, acc, value);
        advance_index(ctx, gpr::RDI, w);
        Ok(())
    })
}

pub(super) fn lods<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    rep_loop(ctx, false, |ctx| {
        let src = src_linear(ctx);
        let value = ctx.bus.read_wide(src, w.bits() / 8)?;
        ctx.state.write_gpr(gpr::RAX, value, w);
        advance_index(ctx, gpr::RSI, w);
        Ok(())
    })
}

pub(super) fn stos<B: CpuBus>(ctx: &mut Ctx<B>, opcode: u8) -> Result<StepExit, Exception> {
    let w = ctx.width_for(opcode);
    rep_loop(ctx, false, |ctx| {
        let value = ctx.state.read_gpr(gpr::RAX, w);
        let dst = dst_linear(ctx);
        ctx.bus.write_wide(dst, w.bits() / 8, value)?;
        advance_index(ctx, gpr::RDI, w);
        Ok(())
    })
}
