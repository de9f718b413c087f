//! CPU register file, flag word, segment caches and mode bookkeeping.

use helio_x86::{Register, RegisterView, SegReg, Width};

pub use helio_x86::gpr;

// RFLAGS bits (standard positions; bit 1 always reads as 1).
pub const FLAG_CF: u64 = 1 << 0;
pub const FLAG_ALWAYS_ON: u64 = 1 << 1;
pub const FLAG_PF: u64 = 1 << 2;
pub const FLAG_AF: u64 = 1 << 4;
pub const FLAG_ZF: u64 = 1 << 6;
pub const FLAG_SF: u64 = 1 << 7;
pub const FLAG_TF: u64 = 1 << 8;
pub const FLAG_IF: u64 = 1 << 9;
pub const FLAG_DF: u64 = 1 << 10;
pub const FLAG_OF: u64 = 1 << 11;
pub const FLAG_IOPL_MASK: u64 = 3 << 12;
pub const FLAG_NT: u64 = 1 << 14;
pub const FLAG_RF: u64 = 1 << 16;
pub const FLAG_VM: u64 = 1 << 17;
pub const FLAG_AC: u64 = 1 << 18;
pub const FLAG_VIF: u64 = 1 << 19;
pub const FLAG_VIP: u64 = 1 << 20;
pub const FLAG_ID: u64 = 1 << 21;

/// Bits an RFLAGS write can actually change.
const RFLAGS_WRITABLE: u64 = FLAG_CF
    | FLAG_PF
    | FLAG_AF
    | FLAG_ZF
    | FLAG_SF
    | FLAG_TF
    | FLAG_IF
    | FLAG_DF
    | FLAG_OF
    | FLAG_IOPL_MASK
    | FLAG_NT
    | FLAG_RF
    | FLAG_VM
    | FLAG_AC
    | FLAG_VIF
    | FLAG_VIP
    | FLAG_ID;

// CR0 bits.
pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_EM: u64 = 1 << 2;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_ET: u64 = 1 << 4;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_AM: u64 = 1 << 18;
pub const CR0_NW: u64 = 1 << 29;
pub const CR0_CD: u64 = 1 << 30;
pub const CR0_PG: u64 = 1 << 31;

// CR4 bits.
pub const CR4_VME: u64 = 1 << 0;
pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;

// EFER bits.
pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

// Segment access byte.
pub const SEG_ACCESS_ACCESSED: u8 = 1 << 0;
pub const SEG_ACCESS_RW: u8 = 1 << 1;
pub const SEG_ACCESS_DC: u8 = 1 << 2;
pub const SEG_ACCESS_EXEC: u8 = 1 << 3;
pub const SEG_ACCESS_S: u8 = 1 << 4;
pub const SEG_ACCESS_DPL_SHIFT: u8 = 5;
pub const SEG_ACCESS_PRESENT: u8 = 1 << 7;

// Segment flags nibble.
pub const SEG_FLAG_AVL: u8 = 1 << 0;
pub const SEG_FLAG_LONG: u8 = 1 << 1;
pub const SEG_FLAG_DB: u8 = 1 << 2;
pub const SEG_FLAG_GRAN: u8 = 1 << 3;

/// Processor operating mode, derived from CR0.PE, EFER.LMA and CS.L.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    /// Long mode with a 16/32-bit code segment (CS.L = 0).
    Compatibility,
    /// 64-bit code (CS.L = 1).
    Long,
}

/// A segment register with its hidden descriptor cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    /// Byte-granular limit (already scaled when G was set).
    pub limit: u32,
    pub access: u8,
    pub flags: u8,
}

impl SegmentRegister {
    pub fn present(&self) -> bool {
        self.access & SEG_ACCESS_PRESENT != 0
    }

    pub fn dpl(&self) -> u8 {
        (self.access >> SEG_ACCESS_DPL_SHIFT) & 0x3
    }

    pub fn is_code(&self) -> bool {
        self.access & (SEG_ACCESS_S | SEG_ACCESS_EXEC) == (SEG_ACCESS_S | SEG_ACCESS_EXEC)
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access & SEG_ACCESS_DC != 0
    }

    pub fn db(&self) -> bool {
        self.flags & SEG_FLAG_DB != 0
    }

    pub fn long(&self) -> bool {
        self.flags & SEG_FLAG_LONG != 0
    }

    /// Real-mode style load: base = selector << 4, 64 KiB limit.
    pub fn set_real_mode(&mut self, selector: u16) {
        self.selector = selector;
        self.base = (selector as u64) << 4;
        self.limit = 0xFFFF;
        self.access = SEG_ACCESS_PRESENT | SEG_ACCESS_S | SEG_ACCESS_RW | SEG_ACCESS_ACCESSED;
        self.flags = 0;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentRegs {
    pub es: SegmentRegister,
    pub cs: SegmentRegister,
    pub ss: SegmentRegister,
    pub ds: SegmentRegister,
    pub fs: SegmentRegister,
    pub gs: SegmentRegister,
}

impl SegmentRegs {
    pub fn get(&self, seg: SegReg) -> &SegmentRegister {
        match seg {
            SegReg::Es => &self.es,
            SegReg::Cs => &self.cs,
            SegReg::Ss => &self.ss,
            SegReg::Ds => &self.ds,
            SegReg::Fs => &self.fs,
            SegReg::Gs => &self.gs,
        }
    }

    pub fn get_mut(&mut self, seg: SegReg) -> &mut SegmentRegister {
        match seg {
            SegReg::Es => &mut self.es,
            SegReg::Cs => &mut self.cs,
            SegReg::Ss => &mut self.ss,
            SegReg::Ds => &mut self.ds,
            SegReg::Fs => &mut self.fs,
            SegReg::Gs => &mut self.gs,
        }
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// LDTR / TR (selector plus cached base, limit and access byte).
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTables {
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub ldtr: TaskRegister,
    pub tr: TaskRegister,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModelSpecific {
    pub efer: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub kernel_gs_base: u64,
    pub apic_base: u64,
    pub tsc: u64,
}

/// The complete architectural CPU state.
#[derive(Debug, Clone)]
pub struct CpuState {
    pub gprs: [u64; 16],
    rip: u64,
    rflags: u64,
    pub segments: SegmentRegs,
    pub tables: SystemTables,
    pub control: ControlRegs,
    pub msr: ModelSpecific,
    pub dr: [u64; 8],
    mode: CpuMode,
    pub halted: bool,
}

impl CpuState {
    /// Architectural reset state, then forced into `mode` the way the
    /// teacherless test rigs expect: segment caches are made flat and
    /// present so state can be poked directly without a GDT walk.
    pub fn new(mode: CpuMode) -> Self {
        let mut state = Self {
            gprs: [0; 16],
            rip: 0xFFF0,
            rflags: FLAG_ALWAYS_ON,
            segments: SegmentRegs::default(),
            tables: SystemTables::default(),
            control: ControlRegs::default(),
            msr: ModelSpecific::default(),
            dr: [0; 8],
            mode: CpuMode::Real,
            halted: false,
        };
        state.segments.cs.set_real_mode(0xF000);
        state.segments.ss.set_real_mode(0);
        state.segments.ds.set_real_mode(0);
        state.segments.es.set_real_mode(0);
        state.segments.fs.set_real_mode(0);
        state.segments.gs.set_real_mode(0);

        match mode {
            CpuMode::Real => {}
            CpuMode::Protected => {
                state.control.cr0 |= CR0_PE;
                state.flatten_segments(SEG_FLAG_DB);
                state.set_rip(0);
            }
            CpuMode::Compatibility => {
                state.control.cr0 |= CR0_PE | CR0_PG;
                state.control.cr4 |= CR4_PAE;
                state.msr.efer |= EFER_LME | EFER_LMA;
                state.flatten_segments(SEG_FLAG_DB);
                state.set_rip(0);
            }
            CpuMode::Long => {
                state.control.cr0 |= CR0_PE | CR0_PG;
                state.control.cr4 |= CR4_PAE;
                state.msr.efer |= EFER_LME | EFER_LMA;
                state.flatten_segments(SEG_FLAG_LONG);
                state.set_rip(0);
            }
        }
        state.mode = mode;
        state
    }

    fn flatten_segments(&mut self, cs_flags: u8) {
        for seg in [
            SegReg::Es,
            SegReg::Cs,
            SegReg::Ss,
            SegReg::Ds,
            SegReg::Fs,
            SegReg::Gs,
        ] {
            let reg = self.segments.get_mut(seg);
            reg.base = 0;
            reg.limit = u32::MAX;
            reg.access = SEG_ACCESS_PRESENT | SEG_ACCESS_S | SEG_ACCESS_RW | SEG_ACCESS_ACCESSED;
            reg.flags = SEG_FLAG_DB;
        }
        let cs = &mut self.segments.cs;
        cs.access |= SEG_ACCESS_EXEC;
        cs.flags = cs_flags;
    }

    // --- mode ---

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    /// Re-derive the operating mode from CR0.PE, EFER.LMA and CS.L.
    pub fn update_mode(&mut self) {
        self.mode = if self.control.cr0 & CR0_PE == 0 {
            CpuMode::Real
        } else if self.msr.efer & EFER_LMA != 0 {
            if self.segments.cs.long() {
                CpuMode::Long
            } else {
                CpuMode::Compatibility
            }
        } else {
            CpuMode::Protected
        };
    }

    pub fn set_protected_enable(&mut self, enable: bool) {
        if enable {
            self.control.cr0 |= CR0_PE;
        } else {
            self.control.cr0 &= !CR0_PE;
        }
        self.update_mode();
    }

    pub fn is_long_mode(&self) -> bool {
        self.mode == CpuMode::Long
    }

    pub fn is_protected(&self) -> bool {
        self.control.cr0 & CR0_PE != 0
    }

    /// Default operand width of the current code segment, before any 0x66
    /// override.
    pub fn operand_width(&self) -> Width {
        match self.mode {
            CpuMode::Real => Width::W16,
            CpuMode::Long => Width::W32,
            CpuMode::Protected | CpuMode::Compatibility => {
                if self.segments.cs.db() {
                    Width::W32
                } else {
                    Width::W16
                }
            }
        }
    }

    /// Default address width of the current code segment, before any 0x67
    /// override.
    pub fn address_width(&self) -> Width {
        match self.mode {
            CpuMode::Real => Width::W16,
            CpuMode::Long => Width::W64,
            CpuMode::Protected | CpuMode::Compatibility => {
                if self.segments.cs.db() {
                    Width::W32
                } else {
                    Width::W16
                }
            }
        }
    }

    /// Width of the stack pointer: SS.D/B in protected mode, 64-bit in long
    /// mode, 16-bit in real mode.
    pub fn stack_width(&self) -> Width {
        match self.mode {
            CpuMode::Real => Width::W16,
            CpuMode::Long => Width::W64,
            CpuMode::Protected | CpuMode::Compatibility => {
                if self.segments.ss.db() {
                    Width::W32
                } else {
                    Width::W16
                }
            }
        }
    }

    // --- privilege ---

    /// Current privilege level: the RPL of the executing code selector.
    /// Real mode is always ring 0.
    pub fn cpl(&self) -> u8 {
        if self.is_protected() {
            (self.segments.cs.selector & 0x3) as u8
        } else {
            0
        }
    }

    pub fn iopl(&self) -> u8 {
        ((self.rflags & FLAG_IOPL_MASK) >> 12) as u8
    }

    // --- RIP / RFLAGS ---

    pub fn rip(&self) -> u64 {
        self.rip
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip;
    }

    pub fn rflags(&self) -> u64 {
        self.rflags | FLAG_ALWAYS_ON
    }

    pub fn set_rflags(&mut self, value: u64) {
        self.rflags = (value & RFLAGS_WRITABLE) | FLAG_ALWAYS_ON;
    }

    pub fn get_flag(&self, mask: u64) -> bool {
        self.rflags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u64, value: bool) {
        if value {
            self.rflags |= mask;
        } else {
            self.rflags &= !mask;
        }
    }

    // --- GPR access by slot ---

    pub fn read_gpr64(&self, idx: usize) -> u64 {
        self.gprs[idx]
    }

    pub fn write_gpr64(&mut self, idx: usize, value: u64) {
        self.gprs[idx] = value;
    }

    pub fn read_gpr32(&self, idx: usize) -> u32 {
        self.gprs[idx] as u32
    }

    /// 32-bit view write. In 64-bit mode this zero-extends into bits 63..32;
    /// elsewhere the (architecturally invisible) upper half is preserved.
    pub fn write_gpr32(&mut self, idx: usize, value: u32) {
        if self.mode == CpuMode::Long {
            self.gprs[idx] = value as u64;
        } else {
            self.gprs[idx] = (self.gprs[idx] & !0xFFFF_FFFF) | value as u64;
        }
    }

    pub fn read_gpr16(&self, idx: usize) -> u16 {
        self.gprs[idx] as u16
    }

    pub fn write_gpr16(&mut self, idx: usize, value: u16) {
        self.gprs[idx] = (self.gprs[idx] & !0xFFFF) | value as u64;
    }

    pub fn read_gpr8(&self, idx: usize) -> u8 {
        self.gprs[idx] as u8
    }

    pub fn write_gpr8(&mut self, idx: usize, value: u8) {
        self.gprs[idx] = (self.gprs[idx] & !0xFF) | value as u64;
    }

    pub fn read_gpr8_high(&self, idx: usize) -> u8 {
        (self.gprs[idx] >> 8) as u8
    }

    pub fn write_gpr8_high(&mut self, idx: usize, value: u8) {
        self.gprs[idx] = (self.gprs[idx] & !0xFF00) | ((value as u64) << 8);
    }

    pub fn read_gpr(&self, idx: usize, width: Width) -> u64 {
        self.gprs[idx] & width.mask()
    }

    pub fn write_gpr(&mut self, idx: usize, value: u64, width: Width) {
        match width {
            Width::W8 => self.write_gpr8(idx, value as u8),
            Width::W16 => self.write_gpr16(idx, value as u16),
            Width::W32 => self.write_gpr32(idx, value as u32),
            Width::W64 => self.write_gpr64(idx, value),
        }
    }

    // --- named register access ---

    pub fn read_reg(&self, reg: Register) -> u64 {
        match reg.view() {
            RegisterView::Low8(i) => self.read_gpr8(i) as u64,
            RegisterView::High8(i) => self.read_gpr8_high(i) as u64,
            RegisterView::Word(i) => self.read_gpr16(i) as u64,
            RegisterView::Dword(i) => self.read_gpr32(i) as u64,
            RegisterView::Qword(i) => self.read_gpr64(i),
            RegisterView::Segment(s) => self.segments.get(s).selector as u64,
        }
    }

    /// Write a register by architectural name. Segment writes go through the
    /// real-mode style load (tests use this to point selectors at flat
    /// memory); descriptor-table loads are the business of
    /// `segmentation::load_segment`.
    pub fn write_reg(&mut self, reg: Register, value: u64) {
        match reg.view() {
            RegisterView::Low8(i) => self.write_gpr8(i, value as u8),
            RegisterView::High8(i) => self.write_gpr8_high(i, value as u8),
            RegisterView::Word(i) => self.write_gpr16(i, value as u16),
            RegisterView::Dword(i) => self.write_gpr32(i, value as u32),
            RegisterView::Qword(i) => self.write_gpr64(i, value),
            RegisterView::Segment(s) => {
                if self.is_protected() {
                    self.segments.get_mut(s).selector = value as u16;
                } else {
                    self.segments.get_mut(s).set_real_mode(value as u16);
                }
            }
        }
    }

    pub fn set_stack_ptr(&mut self, value: u64) {
        self.gprs[gpr::RSP] = value;
    }

    /// Base of a segment for linear-address formation. In 64-bit mode only
    /// FS/GS carry a base (from their MSRs); the others are forced flat.
    pub fn segment_base(&self, seg: SegReg) -> u64 {
        if self.mode == CpuMode::Long {
            match seg {
                SegReg::Fs => self.msr.fs_base,
                SegReg::Gs => self.msr.gs_base,
                _ => 0,
            }
        } else {
            self.segments.get(seg).base
        }
    }
}
