//! Opcode dispatch and instruction handlers.
//!
//! Dispatch is a flat match on the primary opcode byte with a second table
//! behind the 0x0F escape; opcode groups re-dispatch on the ModR/M `reg`
//! digit. Handlers receive the collected [`Prefixes`] and the live
//! [`CodeStream`] and reduce to `alu`/`addressing`/`stack` calls.
//!
//! Handler discipline: immediates are consumed from the stream *before* the
//! first r/m memory access, so RIP-relative operands (which resolve against
//! the end of the instruction) always see the final instruction length.

mod arith;
mod control;
mod datamove;
mod io;
mod shift;
mod stack_ops;
mod string;
mod system;
mod twobyte;

use helio_x86::{SegReg, Width};

use crate::addressing::{self, RmOperand};
use crate::decode::{CodeStream, ModRm, Prefixes};
use crate::exceptions::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

/// Everything a handler needs for one instruction.
pub(crate) struct Ctx<'a, B: CpuBus> {
    pub state: &'a mut CpuState,
    pub bus: &'a mut B,
    pub stream: &'a mut CodeStream,
    pub prefixes: &'a Prefixes,
}

impl<'a, B: CpuBus> Ctx<'a, B> {
    /// Operand width after overrides; opcode bit 0 selects the 8-bit form
    /// in the classic ALU/MOV encodings.
    pub fn width_for(&self, opcode: u8) -> Width {
        if opcode & 1 == 0 {
            Width::W8
        } else {
            self.op_width()
        }
    }

    pub fn op_width(&self) -> Width {
        self.prefixes.operand_width(self.state)
    }

    pub fn addr_width(&self) -> Width {
        self.prefixes.address_width(self.state)
    }

    pub fn modrm(&mut self) -> Result<ModRm, Exception> {
        ModRm::parse(self.stream, self.bus)
    }

    pub fn resolve_rm(&mut self, modrm: ModRm) -> Result<RmOperand, Exception> {
        addressing::resolve_rm(self.state, self.bus, self.stream, self.prefixes, modrm)
    }

    pub fn rm_read(&mut self, rm: &RmOperand, w: Width) -> Result<u64, Exception> {
        rm.read(self.state, self.bus, w, self.stream.len())
    }

    pub fn rm_write(&mut self, rm: &RmOperand, w: Width, value: u64) -> Result<(), Exception> {
        rm.write(self.state, self.bus, w, value, self.stream.len())
    }

    pub fn reg_read(&self, code: u8, w: Width) -> u64 {
        addressing::read_register(self.state, code, w, self.prefixes.rex_present())
    }

    pub fn reg_write(&mut self, code: u8, w: Width, value: u64) {
        addressing::write_register(self.state, code, w, value, self.prefixes.rex_present());
    }

    pub fn imm8(&mut self) -> Result<u8, Exception> {
        self.stream.next_u8(self.bus)
    }

    pub fn imm(&mut self, w: Width) -> Result<u64, Exception> {
        self.stream.next_imm(self.bus, w)
    }

    /// Linear address of the instruction following this one.
    pub fn ip_after(&self) -> u64 {
        self.state
            .rip()
            .wrapping_add(self.stream.len() as u64)
    }

    /// Transfer control to `target`, truncated to the operand width (near
    /// branches with a 16-bit operand size wrap IP at 64 KiB).
    pub fn branch_to(&mut self, target: u64) -> Result<StepExit, Exception> {
        let mask = match self.op_width() {
            Width::W16 => 0xFFFF,
            _ if self.state.mode() == CpuMode::Long => u64::MAX,
            _ => 0xFFFF_FFFF,
        };
        self.state.set_rip(target & mask);
        Ok(StepExit::Branch)
    }

    /// Segment for a non-ModR/M memory access (string sources, moffs, XLAT).
    pub fn data_segment(&self, default: SegReg) -> SegReg {
        self.prefixes.segment.unwrap_or(default)
    }
}

/// The ModR/M `reg` field as a register code with REX.R applied.
pub(crate) fn addressing_reg<B: CpuBus>(ctx: &Ctx<B>, modrm: ModRm) -> u8 {
    addressing::reg_operand(ctx.prefixes, modrm)
}

/// Evaluate a condition code (the low nibble of Jcc/SETcc/CMOVcc opcodes).
pub(crate) fn condition(state: &CpuState, cc: u8) -> bool {
    let result = match cc >> 1 {
        0 => state.get_flag(FLAG_OF),
        1 => state.get_flag(FLAG_CF),
        2 => state.get_flag(FLAG_ZF),
        3 => state.get_flag(FLAG_CF) || state.get_flag(FLAG_ZF),
        4 => state.get_flag(FLAG_SF),
        5 => state.get_flag(FLAG_PF),
        6 => state.get_flag(FLAG_SF) != state.get_flag(FLAG_OF),
        _ => state.get_flag(FLAG_ZF) || state.get_flag(FLAG_SF) != state.get_flag(FLAG_OF),
    };
    result != (cc & 1 != 0)
}

fn long_mode_invalid<B: CpuBus>(ctx: &Ctx<B>) -> Result<(), Exception> {
    if ctx.state.mode() == CpuMode::Long {
        Err(Exception::InvalidOpcode)
    } else {
        Ok(())
    }
}

/// Primary opcode dispatch.
pub(crate) fn dispatch<B: CpuBus>(
    ctx: &mut Ctx<B>,
    opcode: u8,
) -> Result<StepExit, Exception> {
    match opcode {
        // Classic ALU families: two bits select the form, bits 5..3 the op.
        0x00..=0x05 | 0x08..=0x0D | 0x10..=0x15 | 0x18..=0x1D | 0x20..=0x25 | 0x28..=0x2D
        | 0x30..=0x35 | 0x38..=0x3D => arith::alu_family(ctx, opcode),

        0x06 => {
            long_mode_invalid(ctx)?;
            stack_ops::push_seg(ctx, SegReg::Es)
        }
        0x07 => {
            long_mode_invalid(ctx)?;
            stack_ops::pop_seg(ctx, SegReg::Es)
        }
        0x0E => {
            long_mode_invalid(ctx)?;
            stack_ops::push_seg(ctx, SegReg::Cs)
        }
        0x16 => {
            long_mode_invalid(ctx)?;
            stack_ops::push_seg(ctx, SegReg::Ss)
        }
        0x17 => {
            long_mode_invalid(ctx)?;
            stack_ops::pop_seg(ctx, SegReg::Ss)
        }
        0x1E => {
            long_mode_invalid(ctx)?;
            stack_ops::push_seg(ctx, SegReg::Ds)
        }
        0x1F => {
            long_mode_invalid(ctx)?;
            stack_ops::pop_seg(ctx, SegReg::Ds)
        }

        0x0F => twobyte::dispatch(ctx),

        0x27 => {
            long_mode_invalid(ctx)?;
            arith::daa(ctx)
        }
        0x2F => {
            long_mode_invalid(ctx)?;
            arith::das(ctx)
        }
        0x37 => {
            long_mode_invalid(ctx)?;
            arith::aaa(ctx)
        }
        0x3F => {
            long_mode_invalid(ctx)?;
            arith::aas(ctx)
        }

        // In long mode 0x40..=0x4F are REX prefixes and never reach here.
        0x40..=0x47 => arith::inc_reg(ctx, opcode & 0x7),
        0x48..=0x4F => arith::dec_reg(ctx, opcode & 0x7),

        0x50..=0x57 => stack_ops::push_reg(ctx, opcode & 0x7),
        0x58..=0x5F => stack_ops::pop_reg(ctx, opcode & 0x7),

        0x60 => {
            long_mode_invalid(ctx)?;
            stack_ops::pusha(ctx)
        }
        0x61 => {
            long_mode_invalid(ctx)?;
            stack_ops::popa(ctx)
        }
        0x62 => {
            long_mode_invalid(ctx)?;
            control::bound(ctx)
        }
        0x63 => {
            if ctx.state.mode() == CpuMode::Long {
                datamove::movsxd(ctx)
            } else {
                control::arpl(ctx)
            }
        }

        0x68 => stack_ops::push_imm(ctx, false),
        0x69 => arith::imul_rm_imm(ctx, false),
        0x6A => stack_ops::push_imm(ctx, true),
        0x6B => arith::imul_rm_imm(ctx, true),

        0x6C | 0x6D => io::ins(ctx, opcode),
        0x6E | 0x6F => io::outs(ctx, opcode),

        0x70..=0x7F => control::jcc_short(ctx, opcode & 0xF),

        0x80 | 0x82 => arith::group1(ctx, false, false),
        0x81 => arith::group1(ctx, true, false),
        0x83 => arith::group1(ctx, true, true),

        0x84 | 0x85 => arith::test_rm_reg(ctx, opcode),
        0x86 | 0x87 => datamove::xchg_rm_reg(ctx, opcode),

        0x88..=0x8B => datamove::mov_rm_reg(ctx, opcode),
        0x8C => datamove::mov_rm_sreg(ctx),
        0x8D => datamove::lea(ctx),
        0x8E => datamove::mov_sreg_rm(ctx),
        0x8F => stack_ops::pop_rm(ctx),

        // NOP / PAUSE; with REX.B it is a real XCHG against R8.
        0x90 => {
            if ctx.prefixes.rex_b() != 0 {
                datamove::xchg_ax_reg(ctx, 0)
            } else {
                Ok(StepExit::Continue)
            }
        }
        0x91..=0x97 => datamove::xchg_ax_reg(ctx, opcode & 0x7),

        0x98 => arith::cbw(ctx),
        0x99 => arith::cwd(ctx),

        0x9A => {
            long_mode_invalid(ctx)?;
            control::call_far_imm(ctx)
        }
        0x9B => Ok(StepExit::Continue), // FWAIT: x87 synchronisation, nothing to wait for
        0x9C => stack_ops::pushf(ctx),
        0x9D => stack_ops::popf(ctx),
        0x9E => datamove::sahf(ctx),
        0x9F => datamove::lahf(ctx),

        0xA0..=0xA3 => datamove::mov_moffs(ctx, opcode),
        0xA4 | 0xA5 => string::movs(ctx, opcode),
        0xA6 | 0xA7 => string::cmps(ctx, opcode),
        0xA8 | 0xA9 => arith::test_acc_imm(ctx, opcode),
        0xAA | 0xAB => string::stos(ctx, opcode),
        0xAC | 0xAD => string::lods(ctx, opcode),
        0xAE | 0xAF => string::scas(ctx, opcode),

        0xB0..=0xB7 => datamove::mov_reg_imm8(ctx, opcode & 0x7),
        0xB8..=0xBF => datamove::mov_reg_imm(ctx, opcode & 0x7),

        0xC0 => shift::group2(ctx, false, shift::Count::Imm8),
        0xC1 => shift::group2(ctx, true, shift::Count::Imm8),
        0xC2 => control::ret_near_imm(ctx),
        0xC3 => control::ret_near(ctx),
        0xC4 => {
            long_mode_invalid(ctx)?;
            datamove::load_far_pointer(ctx, SegReg::Es)
        }
        0xC5 => {
            long_mode_invalid(ctx)?;
            datamove::load_far_pointer(ctx, SegReg::Ds)
        }
        0xC6 => datamove::mov_rm_imm(ctx, false),
        0xC7 => datamove::mov_rm_imm(ctx, true),
        0xC8 => stack_ops::enter(ctx),
        0xC9 => stack_ops::leave(ctx),
        0xCA => control::ret_far(ctx, true),
        0xCB => control::ret_far(ctx, false),
        0xCC => Ok(StepExit::SoftwareInterrupt { vector: 3 }),
        0xCD => {
            let vector = ctx.imm8()?;
            Ok(StepExit::SoftwareInterrupt { vector })
        }
        0xCE => {
            long_mode_invalid(ctx)?;
            control::into(ctx)
        }
        0xCF => control::iret(ctx),

        0xD0 => shift::group2(ctx, false, shift::Count::One),
        0xD1 => shift::group2(ctx, true, shift::Count::One),
        0xD2 => shift::group2(ctx, false, shift::Count::Cl),
        0xD3 => shift::group2(ctx, true, shift::Count::Cl),

        0xD4 => {
            long_mode_invalid(ctx)?;
            arith::aam(ctx)
        }
        0xD5 => {
            long_mode_invalid(ctx)?;
            arith::aad(ctx)
        }
        0xD7 => datamove::xlat(ctx),

        // x87 escapes: decode the operand form and ignore the operation.
        0xD8..=0xDF => system::x87_escape(ctx),

        0xE0 => control::loop_cc(ctx, Some(false)),
        0xE1 => control::loop_cc(ctx, Some(true)),
        0xE2 => control::loop_cc(ctx, None),
        0xE3 => control::jcxz(ctx),

        0xE4 | 0xE5 => io::in_imm(ctx, opcode),
        0xE6 | 0xE7 => io::out_imm(ctx, opcode),
        0xE8 => control::call_near(ctx),
        0xE9 => control::jmp_near(ctx),
        0xEA => {
            long_mode_invalid(ctx)?;
            control::jmp_far_imm(ctx)
        }
        0xEB => control::jmp_short(ctx),
        0xEC | 0xED => io::in_dx(ctx, opcode),
        0xEE | 0xEF => io::out_dx(ctx, opcode),

        0xF1 => Ok(StepExit::SoftwareInterrupt { vector: 1 }),
        0xF4 => system::hlt(ctx),
        0xF5 => system::cmc(ctx),
        0xF6 => arith::group3(ctx, false),
        0xF7 => arith::group3(ctx, true),
        0xF8 => system::set_carry(ctx, false),
        0xF9 => system::set_carry(ctx, true),
        0xFA => system::cli(ctx),
        0xFB => system::sti(ctx),
        0xFC => system::set_direction(ctx, false),
        0xFD => system::set_direction(ctx, true),
        0xFE => arith::group4(ctx),
        0xFF => control::group5(ctx),

        _ => Err(Exception::InvalidOpcode),
    }
}
