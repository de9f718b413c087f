//! Architectural register model shared by the CPU core and its embedders.
//!
//! The register file itself lives in `helio-cpu-core`; this crate only fixes
//! the *names*: architectural registers with their overlapping views, the
//! compact 0..15 register codes used by ModR/M + REX encodings, and operand
//! widths.

/// Operand width of an instruction or a register view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    #[inline]
    pub fn bytes(self) -> u64 {
        (self.bits() / 8) as u64
    }

    /// All-ones mask for the view, e.g. `0xFFFF` for [`Width::W16`].
    #[inline]
    pub fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
            Width::W64 => u64::MAX,
        }
    }

    /// Mask selecting only the sign bit of the view.
    #[inline]
    pub fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    /// Sign-extend a value of this width to 64 bits.
    #[inline]
    pub fn sign_extend(self, value: u64) -> u64 {
        match self {
            Width::W8 => value as u8 as i8 as i64 as u64,
            Width::W16 => value as u16 as i16 as i64 as u64,
            Width::W32 => value as u32 as i32 as i64 as u64,
            Width::W64 => value,
        }
    }
}

/// General-purpose register slot indices.
///
/// The numbering matches the hardware encoding: ModR/M `reg`/`rm` fields
/// extended by REX.R/B select these slots directly.
pub mod gpr {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
    pub const R8: usize = 8;
    pub const R9: usize = 9;
    pub const R10: usize = 10;
    pub const R11: usize = 11;
    pub const R12: usize = 12;
    pub const R13: usize = 13;
    pub const R14: usize = 14;
    pub const R15: usize = 15;
}

/// Segment register indices in encoding order (ModR/M `reg` field of
/// `MOV sreg` and the segment-override prefix map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub fn from_code(code: u8) -> Option<SegReg> {
        Some(match code & 0x7 {
            0 => SegReg::Es,
            1 => SegReg::Cs,
            2 => SegReg::Ss,
            3 => SegReg::Ds,
            4 => SegReg::Fs,
            5 => SegReg::Gs,
            _ => return None,
        })
    }
}

/// An architectural register name: a GPR view, a segment selector, or the
/// instruction pointer. `read_reg`/`write_reg` on the CPU state accept these
/// so tests and embedders never deal in raw slot codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    // 8-bit low views.
    AL,
    CL,
    DL,
    BL,
    SPL,
    BPL,
    SIL,
    DIL,
    R8B,
    R9B,
    R10B,
    R11B,
    R12B,
    R13B,
    R14B,
    R15B,
    // 8-bit high views (no REX).
    AH,
    CH,
    DH,
    BH,
    // 16-bit views.
    AX,
    CX,
    DX,
    BX,
    SP,
    BP,
    SI,
    DI,
    R8W,
    R9W,
    R10W,
    R11W,
    R12W,
    R13W,
    R14W,
    R15W,
    // 32-bit views.
    EAX,
    ECX,
    EDX,
    EBX,
    ESP,
    EBP,
    ESI,
    EDI,
    R8D,
    R9D,
    R10D,
    R11D,
    R12D,
    R13D,
    R14D,
    R15D,
    // 64-bit views.
    RAX,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    // Segment selectors.
    ES,
    CS,
    SS,
    DS,
    FS,
    GS,
}

/// How a [`Register`] maps onto the register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterView {
    /// Bits 7..0 of the slot.
    Low8(usize),
    /// Bits 15..8 of the slot (legacy AH/CH/DH/BH).
    High8(usize),
    /// Bits 15..0.
    Word(usize),
    /// Bits 31..0.
    Dword(usize),
    /// The full slot.
    Qword(usize),
    /// A segment selector.
    Segment(SegReg),
}

impl Register {
    pub fn view(self) -> RegisterView {
        use Register::*;
        use RegisterView::*;
        match self {
            AL => Low8(0),
            CL => Low8(1),
            DL => Low8(2),
            BL => Low8(3),
            SPL => Low8(4),
            BPL => Low8(5),
            SIL => Low8(6),
            DIL => Low8(7),
            R8B => Low8(8),
            R9B => Low8(9),
            R10B => Low8(10),
            R11B => Low8(11),
            R12B => Low8(12),
            R13B => Low8(13),
            R14B => Low8(14),
            R15B => Low8(15),
            AH => High8(0),
            CH => High8(1),
            DH => High8(2),
            BH => High8(3),
            AX => Word(0),
            CX => Word(1),
            DX => Word(2),
            BX => Word(3),
            SP => Word(4),
            BP => Word(5),
            SI => Word(6),
            DI => Word(7),
            R8W => Word(8),
            R9W => Word(9),
            R10W => Word(10),
            R11W => Word(11),
            R12W => Word(12),
            R13W => Word(13),
            R14W => Word(14),
            R15W => Word(15),
            EAX => Dword(0),
            ECX => Dword(1),
            EDX => Dword(2),
            EBX => Dword(3),
            ESP => Dword(4),
            EBP => Dword(5),
            ESI => Dword(6),
            EDI => Dword(7),
            R8D => Dword(8),
            R9D => Dword(9),
            R10D => Dword(10),
            R11D => Dword(11),
            R12D => Dword(12),
            R13D => Dword(13),
            R14D => Dword(14),
            R15D => Dword(15),
            RAX => Qword(0),
            RCX => Qword(1),
            RDX => Qword(2),
            RBX => Qword(3),
            RSP => Qword(4),
            RBP => Qword(5),
            RSI => Qword(6),
            RDI => Qword(7),
            R8 => Qword(8),
            R9 => Qword(9),
            R10 => Qword(10),
            R11 => Qword(11),
            R12 => Qword(12),
            R13 => Qword(13),
            R14 => Qword(14),
            R15 => Qword(15),
            Register::ES => Segment(SegReg::Es),
            Register::CS => Segment(SegReg::Cs),
            Register::SS => Segment(SegReg::Ss),
            Register::DS => Segment(SegReg::Ds),
            Register::FS => Segment(SegReg::Fs),
            Register::GS => Segment(SegReg::Gs),
        }
    }

    /// GPR view for an encoded register code at a given width.
    ///
    /// `rex_present` changes the meaning of 8-bit codes 4..7: without REX they
    /// are the legacy high-byte registers, with any REX prefix they address
    /// SPL/BPL/SIL/DIL.
    pub fn from_code(code: u8, width: Width, rex_present: bool) -> RegisterView {
        let slot = (code & 0xF) as usize;
        match width {
            Width::W8 => {
                if !rex_present && (4..8).contains(&slot) {
                    RegisterView::High8(slot - 4)
                } else {
                    RegisterView::Low8(slot)
                }
            }
            Width::W16 => RegisterView::Word(slot),
            Width::W32 => RegisterView::Dword(slot),
            Width::W64 => RegisterView::Qword(slot),
        }
    }
}
