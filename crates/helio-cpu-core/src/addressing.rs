//! Effective-address resolution and r/m operand access.
//!
//! `resolve_rm` consumes the SIB and displacement bytes exactly once and
//! returns an [`RmOperand`] caching the resolved `(segment, offset)` pair;
//! handlers that both read and write an operand reuse the same resolution,
//! so displacement bytes are never re-read and read/write see the same
//! address even for RIP-relative operands.

use helio_x86::{Register, RegisterView, SegReg, Width};

use crate::decode::{CodeStream, ModRm, Prefixes};
use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState};

/// A memory operand: segment, offset and how to finalise the offset.
#[derive(Debug, Clone, Copy)]
pub struct EffectiveAddress {
    pub segment: SegReg,
    pub offset: u64,
    /// RIP-relative addressing: `offset` is a displacement from the end of
    /// the instruction, resolved at access time.
    pub rip_relative: bool,
    /// Mask applied to the final offset (16/32/64-bit addressing).
    pub offset_mask: u64,
}

impl EffectiveAddress {
    /// Linear address of this operand. `insn_len` must be the full encoded
    /// length of the current instruction (RIP-relative operands are relative
    /// to the *next* instruction).
    pub fn linear(&self, state: &CpuState, insn_len: usize) -> u64 {
        let offset = if self.rip_relative {
            state
                .rip()
                .wrapping_add(insn_len as u64)
                .wrapping_add(self.offset)
        } else {
            self.offset
        } & self.offset_mask;
        linear_address(state, self.segment, offset)
    }
}

/// `segment:offset` → linear, truncated per mode (64-bit linear addresses
/// only exist in long mode).
pub fn linear_address(state: &CpuState, segment: SegReg, offset: u64) -> u64 {
    let linear = state.segment_base(segment).wrapping_add(offset);
    if state.mode() == CpuMode::Long {
        linear
    } else {
        linear & 0xFFFF_FFFF
    }
}

/// Where an r/m operand lives.
#[derive(Debug, Clone, Copy)]
pub enum RmOperand {
    /// Register slot code (REX.B already applied).
    Register(u8),
    Memory(EffectiveAddress),
}

impl RmOperand {
    pub fn is_memory(&self) -> bool {
        matches!(self, RmOperand::Memory(_))
    }

    pub fn read<B: CpuBus>(
        &self,
        state: &CpuState,
        bus: &mut B,
        w: Width,
        insn_len: usize,
    ) -> Result<u64, Exception> {
        match self {
            RmOperand::Register(code) => Ok(read_register(state, *code, w, true)),
            RmOperand::Memory(ea) => bus.read_wide(ea.linear(state, insn_len), w.bits() / 8),
        }
    }

    pub fn write<B: CpuBus>(
        &self,
        state: &mut CpuState,
        bus: &mut B,
        w: Width,
        value: u64,
        insn_len: usize,
    ) -> Result<(), Exception> {
        match self {
            RmOperand::Register(code) => {
                write_register(state, *code, w, value, true);
                Ok(())
            }
            RmOperand::Memory(ea) => {
                bus.write_wide(ea.linear(state, insn_len), w.bits() / 8, value)
            }
        }
    }
}

/// Read a GPR by encoded code. `rex_any` reports whether any REX prefix was
/// present (it redirects 8-bit codes 4..7 from AH..BH to SPL..DIL).
pub fn read_register(state: &CpuState, code: u8, w: Width, rex_any: bool) -> u64 {
    match Register::from_code(code, w, rex_any) {
        RegisterView::Low8(i) => state.read_gpr8(i) as u64,
        RegisterView::High8(i) => state.read_gpr8_high(i) as u64,
        RegisterView::Word(i) => state.read_gpr16(i) as u64,
        RegisterView::Dword(i) => state.read_gpr32(i) as u64,
        RegisterView::Qword(i) => state.read_gpr64(i),
        RegisterView::Segment(_) => unreachable!("GPR codes never map to segments"),
    }
}

pub fn write_register(state: &mut CpuState, code: u8, w: Width, value: u64, rex_any: bool) {
    match Register::from_code(code, w, rex_any) {
        RegisterView::Low8(i) => state.write_gpr8(i, value as u8),
        RegisterView::High8(i) => state.write_gpr8_high(i, value as u8),
        RegisterView::Word(i) => state.write_gpr16(i, value as u16),
        RegisterView::Dword(i) => state.write_gpr32(i, value as u32),
        RegisterView::Qword(i) => state.write_gpr64(i, value),
        RegisterView::Segment(_) => unreachable!("GPR codes never map to segments"),
    }
}

/// The `reg` field of a ModR/M byte as a register operand (REX.R applied).
pub fn reg_operand(prefixes: &Prefixes, modrm: ModRm) -> u8 {
    modrm.reg() | prefixes.rex_r() << 3
}

/// Resolve the r/m operand, consuming SIB and displacement bytes.
pub fn resolve_rm<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    stream: &mut CodeStream,
    prefixes: &Prefixes,
    modrm: ModRm,
) -> Result<RmOperand, Exception> {
    if modrm.is_register() {
        return Ok(RmOperand::Register(modrm.rm() | prefixes.rex_b() << 3));
    }
    let ea = match prefixes.address_width(state) {
        Width::W16 => resolve_rm16(state, bus, stream, prefixes, modrm)?,
        aw => resolve_rm32_64(state, bus, stream, prefixes, modrm, aw)?,
    };
    Ok(RmOperand::Memory(ea))
}

fn with_override(prefixes: &Prefixes, default: SegReg) -> SegReg {
    prefixes.segment.unwrap_or(default)
}

fn resolve_rm16<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    stream: &mut CodeStream,
    prefixes: &Prefixes,
    modrm: ModRm,
) -> Result<EffectiveAddress, Exception> {
    use helio_x86::gpr::{RBP, RBX, RDI, RSI};

    // Classic 16-bit table: base/index pair per rm, SS default where BP is
    // the base.
    let (base, seg) = match modrm.rm() {
        0 => (
            state.read_gpr16(RBX).wrapping_add(state.read_gpr16(RSI)),
            SegReg::Ds,
        ),
        1 => (
            state.read_gpr16(RBX).wrapping_add(state.read_gpr16(RDI)),
            SegReg::Ds,
        ),
        2 => (
            state.read_gpr16(RBP).wrapping_add(state.read_gpr16(RSI)),
            SegReg::Ss,
        ),
        3 => (
            state.read_gpr16(RBP).wrapping_add(state.read_gpr16(RDI)),
            SegReg::Ss,
        ),
        4 => (state.read_gpr16(RSI), SegReg::Ds),
        5 => (state.read_gpr16(RDI), SegReg::Ds),
        6 if modrm.mode() == 0 => (0, SegReg::Ds),
        6 => (state.read_gpr16(RBP), SegReg::Ss),
        _ => (state.read_gpr16(RBX), SegReg::Ds),
    };

    let disp = match modrm.mode() {
        0 if modrm.rm() == 6 => stream.next_u16(bus)? as u64,
        0 => 0,
        1 => stream.next_i8(bus)? as i16 as u16 as u64,
        _ => stream.next_u16(bus)? as u64,
    };

    Ok(EffectiveAddress {
        segment: with_override(prefixes, seg),
        offset: (base as u64).wrapping_add(disp) & 0xFFFF,
        rip_relative: false,
        offset_mask: 0xFFFF,
    })
}

fn resolve_rm32_64<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    stream: &mut CodeStream,
    prefixes: &Prefixes,
    modrm: ModRm,
    aw: Width,
) -> Result<EffectiveAddress, Exception> {
    let mask = aw.mask();
    let mut seg = SegReg::Ds;
    let mut offset: u64 = 0;
    let mut rip_relative = false;

    match modrm.rm() {
        4 => {
            // SIB byte.
            let sib = stream.next_u8(bus)?;
            let scale = sib >> 6;
            let index_code = (sib >> 3) & 0x7 | prefixes.rex_x() << 3;
            let base_code = sib & 0x7 | prefixes.rex_b() << 3;

            // Index 100 with no REX.X means "no index".
            if index_code != 4 {
                offset = state.read_gpr64(index_code as usize) << scale;
            }
            if base_code & 0x7 == 5 && modrm.mode() == 0 {
                let disp = stream.next_u32(bus)? as i32 as i64 as u64;
                offset = offset.wrapping_add(disp);
            } else {
                offset = offset.wrapping_add(state.read_gpr64(base_code as usize));
                if base_code & 0x7 == 4 || base_code & 0x7 == 5 {
                    seg = SegReg::Ss;
                }
            }
        }
        5 if modrm.mode() == 0 => {
            let disp = stream.next_u32(bus)? as i32 as i64 as u64;
            if state.mode() == CpuMode::Long {
                rip_relative = true;
                offset = disp;
            } else {
                offset = disp;
            }
        }
        rm => {
            let code = rm | prefixes.rex_b() << 3;
            offset = state.read_gpr64(code as usize);
            if code & 0x7 == 5 {
                seg = SegReg::Ss;
            }
        }
    }

    let disp = match modrm.mode() {
        1 => stream.next_i8(bus)? as i64 as u64,
        2 => stream.next_u32(bus)? as i32 as i64 as u64,
        _ => 0,
    };
    offset = offset.wrapping_add(disp);

    Ok(EffectiveAddress {
        segment: with_override(prefixes, seg),
        offset: if rip_relative { offset } else { offset & mask },
        rip_relative,
        offset_mask: mask,
    })
}
