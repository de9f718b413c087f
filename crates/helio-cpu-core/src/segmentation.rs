//! Descriptor tables, segment loads and the I/O permission bitmap.
//!
//! The descriptor walker implements the single-table model: the TI bit of a
//! selector is ignored and every index resolves against the GDT. Hidden
//! descriptor caches are only ever populated here and by the real-mode load
//! path, so all protection checks live in one place.

use helio_x86::SegReg;
use tracing::debug;

use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::state::{
    CpuState, SegmentRegister, SEG_ACCESS_DC, SEG_ACCESS_EXEC, SEG_ACCESS_PRESENT, SEG_ACCESS_RW,
    SEG_ACCESS_S, SEG_FLAG_GRAN,
};

/// A parsed 8-byte code/data segment descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u32,
    /// Byte-granular limit (already ×4096 | 0xFFF when G is set).
    pub limit: u32,
    pub access: u8,
    /// Flags nibble: AVL, L, D/B, G.
    pub flags: u8,
}

impl SegmentDescriptor {
    pub fn parse(raw: u64) -> Self {
        let limit_raw = (raw & 0xFFFF) as u32 | (((raw >> 48) & 0xF) as u32) << 16;
        let base = ((raw >> 16) & 0xFFFF) as u32
            | (((raw >> 32) & 0xFF) as u32) << 16
            | (((raw >> 56) & 0xFF) as u32) << 24;
        let access = (raw >> 40) as u8;
        let flags = ((raw >> 52) & 0xF) as u8;
        let limit = if flags & SEG_FLAG_GRAN != 0 {
            limit_raw << 12 | 0xFFF
        } else {
            limit_raw
        };
        Self {
            base,
            limit,
            access,
            flags,
        }
    }

    pub fn encode(&self) -> u64 {
        let limit_raw = if self.flags & SEG_FLAG_GRAN != 0 {
            self.limit >> 12
        } else {
            self.limit
        };
        (limit_raw & 0xFFFF) as u64
            | ((self.base & 0xFFFF) as u64) << 16
            | ((self.base >> 16 & 0xFF) as u64) << 32
            | (self.access as u64) << 40
            | ((limit_raw >> 16 & 0xF) as u64) << 48
            | ((self.flags & 0xF) as u64) << 52
            | ((self.base >> 24 & 0xFF) as u64) << 56
    }

    pub fn present(&self) -> bool {
        self.access & SEG_ACCESS_PRESENT != 0
    }

    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 0x3
    }

    /// S bit clear: gates, TSS, LDT.
    pub fn is_system(&self) -> bool {
        self.access & SEG_ACCESS_S == 0
    }

    pub fn is_code(&self) -> bool {
        !self.is_system() && self.access & SEG_ACCESS_EXEC != 0
    }

    pub fn is_data(&self) -> bool {
        !self.is_system() && self.access & SEG_ACCESS_EXEC == 0
    }

    pub fn is_writable_data(&self) -> bool {
        self.is_data() && self.access & SEG_ACCESS_RW != 0
    }

    pub fn is_readable_code(&self) -> bool {
        self.is_code() && self.access & SEG_ACCESS_RW != 0
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access & SEG_ACCESS_DC != 0
    }

    pub fn apply_to(&self, reg: &mut SegmentRegister, selector: u16) {
        reg.selector = selector;
        reg.base = self.base as u64;
        reg.limit = self.limit;
        reg.access = self.access;
        reg.flags = self.flags;
    }
}

/// A parsed gate descriptor (interrupt/trap/call gate).
#[derive(Debug, Clone, Copy)]
pub struct GateDescriptor {
    pub selector: u16,
    pub offset: u64,
    /// Type nibble: 0xC call gate, 0xE interrupt gate, 0xF trap gate (32-bit
    /// forms; 0x4/0x6/0x7 are their 16-bit counterparts).
    pub gate_type: u8,
    pub dpl: u8,
    pub present: bool,
    /// Call gates: dwords to copy on a stack switch. IDT gates in long mode
    /// reuse the slot for the IST index.
    pub param_count: u8,
}

impl GateDescriptor {
    pub fn parse32(raw: u64) -> Self {
        Self {
            selector: (raw >> 16) as u16,
            offset: (raw & 0xFFFF) | (raw >> 48 << 16) & 0xFFFF_0000,
            gate_type: (raw >> 40) as u8 & 0xF,
            dpl: (raw >> 45) as u8 & 0x3,
            present: raw & 1 << 47 != 0,
            param_count: (raw >> 32) as u8 & 0x1F,
        }
    }

    pub fn parse64(low: u64, high: u64) -> Self {
        Self {
            selector: (low >> 16) as u16,
            offset: (low & 0xFFFF) | (low >> 48 << 16) & 0xFFFF_0000 | (high & 0xFFFF_FFFF) << 32,
            gate_type: (low >> 40) as u8 & 0xF,
            dpl: (low >> 45) as u8 & 0x3,
            present: low & 1 << 47 != 0,
            param_count: (low >> 32) as u8 & 0x7,
        }
    }

    pub fn is_interrupt_gate(&self) -> bool {
        matches!(self.gate_type, 0x6 | 0xE)
    }

    pub fn is_trap_gate(&self) -> bool {
        matches!(self.gate_type, 0x7 | 0xF)
    }

    pub fn is_call_gate(&self) -> bool {
        matches!(self.gate_type, 0x4 | 0xC)
    }

    /// 16-bit gate types push 16-bit frames.
    pub fn is_16bit(&self) -> bool {
        matches!(self.gate_type, 0x4 | 0x6 | 0x7)
    }
}

/// Read the raw descriptor for `selector` from the GDT. The TI bit is
/// ignored (single-table model); a limit violation is `#GP(selector)`.
pub fn read_descriptor<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    selector: u16,
) -> Result<u64, Exception> {
    let index = (selector >> 3) as u64;
    let offset = index * 8;
    if offset + 7 > state.tables.gdtr.limit as u64 {
        return Err(Exception::GeneralProtection(selector & !0x7));
    }
    bus.read_u64(state.tables.gdtr.base.wrapping_add(offset))
}

/// Load a data-class segment register (DS/ES/FS/GS/SS).
///
/// Real mode reloads the cache with `selector << 4`. Protected mode walks
/// the GDT and applies the SDM checks: SS must be a writable data segment
/// with DPL = CPL = RPL, other registers accept data or readable code, and
/// a clear present bit is `#NP` (`#SS` for the stack segment).
pub fn load_segment<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg: SegReg,
    selector: u16,
) -> Result<(), Exception> {
    debug_assert!(seg != SegReg::Cs, "CS loads go through far transfers");

    if !state.is_protected() {
        state.segments.get_mut(seg).set_real_mode(selector);
        return Ok(());
    }

    if selector & !0x3 == 0 {
        // Null selector: legal everywhere except SS, loads a non-present
        // cache that faults on use.
        if seg == SegReg::Ss {
            return Err(Exception::gp0());
        }
        let reg = state.segments.get_mut(seg);
        reg.selector = selector;
        reg.base = 0;
        reg.limit = 0;
        reg.access = 0;
        reg.flags = 0;
        return Ok(());
    }

    let raw = read_descriptor(state, bus, selector)?;
    let desc = SegmentDescriptor::parse(raw);
    let rpl = (selector & 0x3) as u8;

    if desc.is_system() {
        debug!(selector, seg = ?seg, "segment load rejected: system descriptor");
        return Err(Exception::GeneralProtection(selector & !0x7));
    }

    if seg == SegReg::Ss {
        if !desc.is_writable_data() || desc.dpl() != state.cpl() || rpl != state.cpl() {
            return Err(Exception::GeneralProtection(selector & !0x7));
        }
        if !desc.present() {
            return Err(Exception::StackSegment(selector & !0x7));
        }
    } else {
        // Data registers accept data segments and readable code segments.
        if !(desc.is_data() || desc.is_readable_code()) {
            debug!(selector, seg = ?seg, "segment load rejected: type mismatch");
            return Err(Exception::GeneralProtection(selector & !0x7));
        }
        if desc.is_data() || !desc.is_conforming() {
            let dpl = desc.dpl();
            if rpl > dpl || state.cpl() > dpl {
                return Err(Exception::GeneralProtection(selector & !0x7));
            }
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(selector & !0x7));
        }
    }

    desc.apply_to(state.segments.get_mut(seg), selector);
    Ok(())
}

/// Load CS for a far transfer to `selector`. Applies code-segment type and
/// privilege checks and updates CPL from the selector's RPL.
pub fn load_code_segment<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
) -> Result<(), Exception> {
    if !state.is_protected() {
        state.segments.cs.set_real_mode(selector);
        return Ok(());
    }
    if selector & !0x3 == 0 {
        return Err(Exception::gp0());
    }

    let raw = read_descriptor(state, bus, selector)?;
    let desc = SegmentDescriptor::parse(raw);
    let rpl = (selector & 0x3) as u8;

    if !desc.is_code() {
        return Err(Exception::GeneralProtection(selector & !0x7));
    }
    if desc.is_conforming() {
        if desc.dpl() > state.cpl() {
            return Err(Exception::GeneralProtection(selector & !0x7));
        }
    } else if rpl > state.cpl() || desc.dpl() != state.cpl() {
        return Err(Exception::GeneralProtection(selector & !0x7));
    }
    if !desc.present() {
        return Err(Exception::SegmentNotPresent(selector & !0x7));
    }

    // CPL is carried in the CS selector's RPL: conforming transfers keep the
    // caller's privilege, non-conforming ones run at the target DPL.
    let new_cpl = if desc.is_conforming() {
        state.cpl()
    } else {
        desc.dpl()
    };
    desc.apply_to(&mut state.segments.cs, selector & !0x3 | new_cpl as u16);
    state.update_mode();
    Ok(())
}

/// I/O permission check: `CPL ≤ IOPL` short-circuits; otherwise the TSS I/O
/// permission bitmap decides. Real mode always permits.
pub fn io_permitted<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    port: u16,
    width: u32,
) -> Result<bool, Exception> {
    if !state.is_protected() || state.cpl() <= state.iopl() {
        return Ok(true);
    }

    let tr = &state.tables.tr;
    if tr.access & SEG_ACCESS_PRESENT == 0 {
        return Ok(false);
    }
    // 32-bit TSS: I/O map base at +0x66.
    if tr.limit < 0x67 {
        return Ok(false);
    }
    let iomap_base = bus.read_u16(tr.base.wrapping_add(0x66))? as u64;

    let first = port as u64;
    let last = first + width as u64 - 1;
    if iomap_base + last / 8 > tr.limit as u64 {
        return Ok(false);
    }
    // Every bit covering the access must be clear.
    let byte_lo = bus.read_u8(tr.base + iomap_base + first / 8)?;
    let byte_hi = bus.read_u8(tr.base + iomap_base + last / 8)?;
    let bits = byte_lo as u16 | (byte_hi as u16) << 8;
    let mask = ((1u32 << width) - 1) << (first % 8) as u32;
    Ok(bits as u32 & mask == 0)
}
