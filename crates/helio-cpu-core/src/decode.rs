//! Instruction-stream decoding: legacy prefix stacking, REX, ModR/M.
//!
//! Decode state is threaded explicitly: [`Prefixes`] is collected once per
//! instruction and handed to the handler, so prefix bytes never re-enter
//! dispatch. The [`CodeStream`] is the program counter within one
//! instruction: it tracks how many bytes have been consumed and enforces the
//! 15-byte architectural length limit.

use helio_x86::{SegReg, Width};

use crate::exceptions::Exception;
use crate::mem::{CpuBus, MAX_INSN_LEN};
use crate::state::{CpuMode, CpuState};

/// REX prefix byte (0x40..=0x4F), valid only in 64-bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rex(pub u8);

impl Rex {
    #[inline]
    pub fn w(self) -> bool {
        self.0 & 0x8 != 0
    }

    #[inline]
    pub fn r(self) -> bool {
        self.0 & 0x4 != 0
    }

    #[inline]
    pub fn x(self) -> bool {
        self.0 & 0x2 != 0
    }

    #[inline]
    pub fn b(self) -> bool {
        self.0 & 0x1 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepKind {
    /// 0xF3: REP for plain string ops, REPE for CMPS/SCAS.
    Rep,
    /// 0xF2: REPNE.
    Repne,
}

/// All prefixes observed in front of the opcode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    pub segment: Option<SegReg>,
    pub operand_size: bool,
    pub address_size: bool,
    pub lock: bool,
    pub rep: Option<RepKind>,
    pub rex: Option<Rex>,
}

impl Prefixes {
    #[inline]
    pub fn rex_present(&self) -> bool {
        self.rex.is_some()
    }

    #[inline]
    pub fn rex_w(&self) -> bool {
        self.rex.is_some_and(Rex::w)
    }

    #[inline]
    pub fn rex_r(&self) -> u8 {
        self.rex.is_some_and(Rex::r) as u8
    }

    #[inline]
    pub fn rex_x(&self) -> u8 {
        self.rex.is_some_and(Rex::x) as u8
    }

    #[inline]
    pub fn rex_b(&self) -> u8 {
        self.rex.is_some_and(Rex::b) as u8
    }

    /// Operand width after the 0x66 override and REX.W.
    pub fn operand_width(&self, state: &CpuState) -> Width {
        if state.mode() == CpuMode::Long && self.rex_w() {
            return Width::W64;
        }
        match (state.operand_width(), self.operand_size) {
            (Width::W16, true) => Width::W32,
            (Width::W16, false) => Width::W16,
            (_, true) => Width::W16,
            (_, false) => Width::W32,
        }
    }

    /// Address width after the 0x67 override.
    pub fn address_width(&self, state: &CpuState) -> Width {
        match (state.address_width(), self.address_size) {
            (Width::W64, true) => Width::W32,
            (Width::W64, false) => Width::W64,
            (Width::W32, true) => Width::W16,
            (Width::W32, false) => Width::W32,
            (_, true) => Width::W32,
            (_, false) => Width::W16,
        }
    }
}

/// Sequential reader over the bytes of one instruction.
///
/// Reads go through the CPU bus at `CS.base + RIP + consumed`, so a fetch
/// can fault exactly like any other memory access. Exceeding the 15-byte
/// limit raises `#GP(0)`.
#[derive(Debug, Clone, Copy)]
pub struct CodeStream {
    start_linear: u64,
    len: usize,
}

impl CodeStream {
    pub fn at(state: &CpuState) -> Self {
        let base = state.segment_base(SegReg::Cs);
        Self {
            start_linear: base.wrapping_add(state.rip()),
            len: 0,
        }
    }

    /// Bytes consumed so far; equals the instruction length once decode is
    /// complete.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn next_u8<B: CpuBus>(&mut self, bus: &mut B) -> Result<u8, Exception> {
        if self.len >= MAX_INSN_LEN {
            return Err(Exception::gp0());
        }
        let byte = bus.read_u8(self.start_linear.wrapping_add(self.len as u64))?;
        self.len += 1;
        Ok(byte)
    }

    pub fn next_i8<B: CpuBus>(&mut self, bus: &mut B) -> Result<i8, Exception> {
        Ok(self.next_u8(bus)? as i8)
    }

    pub fn next_u16<B: CpuBus>(&mut self, bus: &mut B) -> Result<u16, Exception> {
        let lo = self.next_u8(bus)? as u16;
        let hi = self.next_u8(bus)? as u16;
        Ok(lo | hi << 8)
    }

    pub fn next_u32<B: CpuBus>(&mut self, bus: &mut B) -> Result<u32, Exception> {
        let lo = self.next_u16(bus)? as u32;
        let hi = self.next_u16(bus)? as u32;
        Ok(lo | hi << 16)
    }

    pub fn next_u64<B: CpuBus>(&mut self, bus: &mut B) -> Result<u64, Exception> {
        let lo = self.next_u32(bus)? as u64;
        let hi = self.next_u32(bus)? as u64;
        Ok(lo | hi << 32)
    }

    /// Immediate of the given width (64-bit operands take a sign-extended
    /// 32-bit immediate except for the dedicated MOV r64, imm64 form).
    pub fn next_imm<B: CpuBus>(&mut self, bus: &mut B, w: Width) -> Result<u64, Exception> {
        Ok(match w {
            Width::W8 => self.next_u8(bus)? as u64,
            Width::W16 => self.next_u16(bus)? as u64,
            Width::W32 => self.next_u32(bus)? as u64,
            Width::W64 => Width::W32.sign_extend(self.next_u32(bus)? as u64),
        })
    }
}

/// A decoded ModR/M byte; `reg` doubles as the group "digit".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub byte: u8,
}

impl ModRm {
    pub fn parse<B: CpuBus>(stream: &mut CodeStream, bus: &mut B) -> Result<Self, Exception> {
        Ok(Self {
            byte: stream.next_u8(bus)?,
        })
    }

    #[inline]
    pub fn mode(self) -> u8 {
        self.byte >> 6
    }

    #[inline]
    pub fn reg(self) -> u8 {
        (self.byte >> 3) & 0x7
    }

    #[inline]
    pub fn rm(self) -> u8 {
        self.byte & 0x7
    }

    #[inline]
    pub fn is_register(self) -> bool {
        self.mode() == 3
    }
}

/// Collect legacy prefixes plus REX and return the opcode byte.
///
/// A REX byte is only honoured when it immediately precedes the opcode;
/// a legacy prefix after REX voids it, matching hardware.
pub fn decode_prefixes<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    stream: &mut CodeStream,
) -> Result<(Prefixes, u8), Exception> {
    let mut prefixes = Prefixes::default();
    loop {
        let byte = stream.next_u8(bus)?;
        match byte {
            0x26 => prefixes.segment = Some(SegReg::Es),
            0x2E => prefixes.segment = Some(SegReg::Cs),
            0x36 => prefixes.segment = Some(SegReg::Ss),
            0x3E => prefixes.segment = Some(SegReg::Ds),
            0x64 => prefixes.segment = Some(SegReg::Fs),
            0x65 => prefixes.segment = Some(SegReg::Gs),
            0x66 => prefixes.operand_size = true,
            0x67 => prefixes.address_size = true,
            0xF0 => prefixes.lock = true,
            0xF2 => prefixes.rep = Some(RepKind::Repne),
            0xF3 => prefixes.rep = Some(RepKind::Rep),
            0x40..=0x4F if state.mode() == CpuMode::Long => {
                prefixes.rex = Some(Rex(byte));
                continue;
            }
            _ => return Ok((prefixes, byte)),
        }
        // Any legacy prefix after a REX byte invalidates it.
        prefixes.rex = None;
    }
}
