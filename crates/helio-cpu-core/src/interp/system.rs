//! System instructions: interrupt-flag control, HLT, descriptor-table
//! loads, control/debug register moves, MSR access, CPUID and the x87
//! escape window.

use helio_x86::{gpr, Width};
use tracing::debug;

use super::Ctx;
use crate::addressing::RmOperand;
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::segmentation::{read_descriptor, SegmentDescriptor};
use crate::state::{CpuMode, FLAG_CF, FLAG_DF, FLAG_IF, FLAG_ZF, CR0_TS};

fn require_ring0<B: CpuBus>(ctx: &Ctx<B>) -> Result<(), Exception> {
    if ctx.state.cpl() != 0 {
        return Err(Exception::gp0());
    }
    Ok(())
}

/// CLI/STI privilege: IOPL gates the interrupt flag in protected mode.
fn require_if_access<B: CpuBus>(ctx: &Ctx<B>) -> Result<(), Exception> {
    if ctx.state.is_protected() && ctx.state.iopl() < ctx.state.cpl() {
        return Err(Exception::gp0());
    }
    Ok(())
}

pub(super) fn hlt<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    if ctx.state.is_protected() && ctx.state.cpl() != 0 {
        return Err(Exception::gp0());
    }
    Ok(StepExit::Halt)
}

pub(super) fn cli<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    require_if_access(ctx)?;
    ctx.state.set_flag(FLAG_IF, false);
    // CLI also drops any pending STI deferral window.
    Ok(StepExit::ContinueClearShadow)
}

/// STI sets IF but defers interrupt acceptance for exactly one more
/// instruction; no window opens if IF was already set.
pub(super) fn sti<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    require_if_access(ctx)?;
    let was_set = ctx.state.get_flag(FLAG_IF);
    ctx.state.set_flag(FLAG_IF, true);
    if was_set {
        Ok(StepExit::Continue)
    } else {
        Ok(StepExit::ContinueInhibitInterrupts)
    }
}

pub(super) fn cmc<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let cf = ctx.state.get_flag(FLAG_CF);
    ctx.state.set_flag(FLAG_CF, !cf);
    Ok(StepExit::Continue)
}

pub(super) fn set_carry<B: CpuBus>(ctx: &mut Ctx<B>, value: bool) -> Result<StepExit, Exception> {
    ctx.state.set_flag(FLAG_CF, value);
    Ok(StepExit::Continue)
}

pub(super) fn set_direction<B: CpuBus>(
    ctx: &mut Ctx<B>,
    value: bool,
) -> Result<StepExit, Exception> {
    ctx.state.set_flag(FLAG_DF, value);
    Ok(StepExit::Continue)
}

/// x87 escape block (0xD8..0xDF): the operand encoding is parsed so the
/// stream advances past the full instruction, the operation itself is not
/// modelled.
pub(super) fn x87_escape<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let modrm = ctx.modrm()?;
    let _ = ctx.resolve_rm(modrm)?;
    Ok(StepExit::Continue)
}

/// Group 6 (0x0F 0x00): LDT/TR bookkeeping and descriptor verification.
pub(super) fn group6<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    if !ctx.state.is_protected() {
        return Err(Exception::InvalidOpcode);
    }
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    match modrm.reg() {
        // SLDT / STR
        0 => {
            let sel = ctx.state.tables.ldtr.selector as u64;
            ctx.rm_write(&rm, Width::W16, sel)?;
        }
        1 => {
            let sel = ctx.state.tables.tr.selector as u64;
            ctx.rm_write(&rm, Width::W16, sel)?;
        }
        // LLDT / LTR
        2 | 3 => {
            require_ring0(ctx)?;
            let selector = ctx.rm_read(&rm, Width::W16)? as u16;
            let raw = read_descriptor(ctx.state, ctx.bus, selector)?;
            let desc = SegmentDescriptor::parse(raw);
            let target = if modrm.reg() == 2 {
                &mut ctx.state.tables.ldtr
            } else {
                &mut ctx.state.tables.tr
            };
            target.selector = selector;
            target.base = desc.base as u64;
            target.limit = desc.limit;
            target.access = desc.access;
        }
        // VERR / VERW
        4 | 5 => {
            let selector = ctx.rm_read(&rm, Width::W16)? as u16;
            let ok = read_descriptor(ctx.state, ctx.bus, selector)
                .map(SegmentDescriptor::parse)
                .map(|d| {
                    if d.is_system() {
                        false
                    } else if modrm.reg() == 4 {
                        d.is_data() || d.is_readable_code()
                    } else {
                        d.is_writable_data()
                    }
                })
                .unwrap_or(false);
            ctx.state.set_flag(FLAG_ZF, ok);
        }
        _ => return Err(Exception::InvalidOpcode),
    }
    Ok(StepExit::Continue)
}

/// Base width of LGDT/LIDT/SGDT/SIDT operands per operand size.
fn table_base_mask<B: CpuBus>(ctx: &Ctx<B>) -> u64 {
    match ctx.state.mode() {
        CpuMode::Long => u64::MAX,
        _ if ctx.op_width() == Width::W16 => 0x00FF_FFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// Group 7 (0x0F 0x01): descriptor-table registers, SMSW/LMSW, INVLPG.
pub(super) fn group7<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let base_bytes: u32 = if ctx.state.mode() == CpuMode::Long { 8 } else { 4 };

    match modrm.reg() {
        // SGDT / SIDT
        0 | 1 => {
            let RmOperand::Memory(ea) = rm else {
                return Err(Exception::InvalidOpcode);
            };
            let table = if modrm.reg() == 0 {
                ctx.state.tables.gdtr
            } else {
                ctx.state.tables.idtr
            };
            let linear = ea.linear(ctx.state, ctx.stream.len());
            ctx.bus.write_u16(linear, table.limit)?;
            ctx.bus
                .write_wide(linear.wrapping_add(2), base_bytes, table.base)?;
        }
        // LGDT / LIDT
        2 | 3 => {
            require_ring0(ctx)?;
            let RmOperand::Memory(ea) = rm else {
                return Err(Exception::InvalidOpcode);
            };
            let linear = ea.linear(ctx.state, ctx.stream.len());
            let limit = ctx.bus.read_u16(linear)?;
            let base =
                ctx.bus.read_wide(linear.wrapping_add(2), base_bytes)? & table_base_mask(ctx);
            let table = if modrm.reg() == 2 {
                &mut ctx.state.tables.gdtr
            } else {
                &mut ctx.state.tables.idtr
            };
            table.limit = limit;
            table.base = base;
            debug!(reg = modrm.reg(), base, limit, "descriptor table loaded");
        }
        // SMSW
        4 => {
            let w = if rm.is_memory() { Width::W16 } else { ctx.op_width() };
            ctx.rm_write(&rm, w, ctx.state.control.cr0 & 0xFFFF)?;
        }
        // LMSW: low four bits of CR0; PE can be set but not cleared.
        6 => {
            require_ring0(ctx)?;
            let value = ctx.rm_read(&rm, Width::W16)?;
            let keep_pe = ctx.state.control.cr0 & 0x1;
            ctx.state.control.cr0 =
                ctx.state.control.cr0 & !0xE | value & 0xF | keep_pe;
            ctx.state.update_mode();
        }
        // INVLPG: the engine keeps no translation cache, so this is a
        // privileged no-op over a memory operand.
        7 => {
            require_ring0(ctx)?;
            if !rm.is_memory() {
                return Err(Exception::InvalidOpcode);
            }
        }
        _ => return Err(Exception::InvalidOpcode),
    }
    Ok(StepExit::Continue)
}

/// MOV to/from CR (0x0F 0x20/0x22).
pub(super) fn mov_cr<B: CpuBus>(ctx: &mut Ctx<B>, to_cr: bool) -> Result<StepExit, Exception> {
    require_ring0(ctx)?;
    let modrm = ctx.modrm()?;
    // CR moves always use the register form of r/m regardless of mod bits.
    let reg_code = modrm.rm() | ctx.prefixes.rex_b() << 3;
    let cr = modrm.reg() | ctx.prefixes.rex_r() << 3;
    let w = if ctx.state.mode() == CpuMode::Long {
        Width::W64
    } else {
        Width::W32
    };

    if to_cr {
        let value = ctx.reg_read(reg_code, w);
        match cr {
            0 => {
                ctx.state.control.cr0 = value;
                ctx.state.update_mode();
                debug!(cr0 = value, "CR0 written");
            }
            2 => ctx.state.control.cr2 = value,
            3 => ctx.state.control.cr3 = value,
            4 => ctx.state.control.cr4 = value,
            8 => ctx.state.control.cr8 = value,
            _ => return Err(Exception::InvalidOpcode),
        }
    } else {
        let value = match cr {
            0 => ctx.state.control.cr0,
            2 => ctx.state.control.cr2,
            3 => ctx.state.control.cr3,
            4 => ctx.state.control.cr4,
            8 => ctx.state.control.cr8,
            _ => return Err(Exception::InvalidOpcode),
        };
        ctx.reg_write(reg_code, w, value);
    }
    Ok(StepExit::Continue)
}

/// MOV to/from DR (0x0F 0x21/0x23).
pub(super) fn mov_dr<B: CpuBus>(ctx: &mut Ctx<B>, to_dr: bool) -> Result<StepExit, Exception> {
    require_ring0(ctx)?;
    let modrm = ctx.modrm()?;
    let reg_code = modrm.rm() | ctx.prefixes.rex_b() << 3;
    let dr = (modrm.reg() | ctx.prefixes.rex_r() << 3) as usize;
    if dr >= 8 {
        return Err(Exception::InvalidOpcode);
    }
    let w = if ctx.state.mode() == CpuMode::Long {
        Width::W64
    } else {
        Width::W32
    };
    if to_dr {
        ctx.state.dr[dr] = ctx.reg_read(reg_code, w);
    } else {
        ctx.reg_write(reg_code, w, ctx.state.dr[dr]);
    }
    Ok(StepExit::Continue)
}

pub(super) fn clts<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    require_ring0(ctx)?;
    ctx.state.control.cr0 &= !CR0_TS;
    Ok(StepExit::Continue)
}

// MSR numbers the model knows about.
const MSR_TSC: u32 = 0x10;
const MSR_APIC_BASE: u32 = 0x1B;
const MSR_EFER: u32 = 0xC000_0080;
const MSR_FS_BASE: u32 = 0xC000_0100;
const MSR_GS_BASE: u32 = 0xC000_0101;
const MSR_KERNEL_GS_BASE: u32 = 0xC000_0102;

pub(super) fn rdmsr<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    require_ring0(ctx)?;
    let msr = ctx.state.read_gpr32(gpr::RCX);
    let value = match msr {
        MSR_TSC => ctx.state.msr.tsc,
        MSR_APIC_BASE => ctx.state.msr.apic_base,
        MSR_EFER => ctx.state.msr.efer,
        MSR_FS_BASE => ctx.state.msr.fs_base,
        MSR_GS_BASE => ctx.state.msr.gs_base,
        MSR_KERNEL_GS_BASE => ctx.state.msr.kernel_gs_base,
        _ => {
            debug!(msr, "RDMSR of unknown MSR");
            return Err(Exception::gp0());
        }
    };
    ctx.state.write_gpr32(gpr::RAX, value as u32);
    ctx.state.write_gpr32(gpr::RDX, (value >> 32) as u32);
    Ok(StepExit::Continue)
}

pub(super) fn wrmsr<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    require_ring0(ctx)?;
    let msr = ctx.state.read_gpr32(gpr::RCX);
    let value =
        ctx.state.read_gpr32(gpr::RAX) as u64 | (ctx.state.read_gpr32(gpr::RDX) as u64) << 32;
    match msr {
        MSR_TSC => ctx.state.msr.tsc = value,
        MSR_APIC_BASE => ctx.state.msr.apic_base = value,
        MSR_EFER => {
            ctx.state.msr.efer = value;
            ctx.state.update_mode();
        }
        MSR_FS_BASE => ctx.state.msr.fs_base = value,
        MSR_GS_BASE => ctx.state.msr.gs_base = value,
        MSR_KERNEL_GS_BASE => ctx.state.msr.kernel_gs_base = value,
        _ => {
            debug!(msr, value, "WRMSR to unknown MSR");
            return Err(Exception::gp0());
        }
    }
    Ok(StepExit::Continue)
}

pub(super) fn rdtsc<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let tsc = ctx.state.msr.tsc;
    ctx.state.write_gpr32(gpr::RAX, tsc as u32);
    ctx.state.write_gpr32(gpr::RDX, (tsc >> 32) as u32);
    Ok(StepExit::Continue)
}

pub(super) fn cpuid<B: CpuBus>(ctx: &mut Ctx<B>) -> Result<StepExit, Exception> {
    let leaf = ctx.state.read_gpr32(gpr::RAX);
    let (eax, ebx, ecx, edx) = match leaf {
        0 => (
            1,
            u32::from_le_bytes(*b"Genu"),
            u32::from_le_bytes(*b"ntel"),
            u32::from_le_bytes(*b"ineI"),
        ),
        1 => {
            // Family 6, model 1; FPU, TSC, MSR, CMPXCHG8B, APIC, CMOV.
            const FEAT_EDX: u32 = 1 | 1 << 4 | 1 << 5 | 1 << 8 | 1 << 9 | 1 << 15;
            (0x0000_0611, 0, 0, FEAT_EDX)
        }
        0x8000_0000 => (0x8000_0001, 0, 0, 0),
        0x8000_0001 => {
            // Long mode available.
            (0, 0, 0, 1 << 29)
        }
        _ => (0, 0, 0, 0),
    };
    ctx.state.write_gpr32(gpr::RAX, eax);
    ctx.state.write_gpr32(gpr::RBX, ebx);
    ctx.state.write_gpr32(gpr::RCX, ecx);
    ctx.state.write_gpr32(gpr::RDX, edx);
    Ok(StepExit::Continue)
}

/// LAR/LSL (0x0F 0x02/0x03): descriptor attribute probes.
pub(super) fn lar_lsl<B: CpuBus>(ctx: &mut Ctx<B>, limit: bool) -> Result<StepExit, Exception> {
    if !ctx.state.is_protected() {
        return Err(Exception::InvalidOpcode);
    }
    let w = ctx.op_width();
    let modrm = ctx.modrm()?;
    let rm = ctx.resolve_rm(modrm)?;
    let selector = ctx.rm_read(&rm, Width::W16)? as u16;

    match read_descriptor(ctx.state, ctx.bus, selector).map(SegmentDescriptor::parse) {
        Ok(desc) if desc.present() => {
            let value = if limit {
                desc.limit as u64
            } else {
                // Access byte and flags nibble in their descriptor positions.
                (desc.access as u64) << 8 | (desc.flags as u64) << 20
            };
            ctx.reg_write(super::addressing_reg(ctx, modrm), w, value & w.mask());
            ctx.state.set_flag(FLAG_ZF, true);
        }
        _ => ctx.state.set_flag(FLAG_ZF, false),
    }
    Ok(StepExit::Continue)
}
