//! Local APIC model: the register window, 256-bit IRR/ISR pair, and the
//! one-shot/periodic timer.
//!
//! The timer is advanced cooperatively from the platform clock; there is
//! no background thread. Priority is simplified to highest-vector-wins,
//! which is exact for fixed-priority delivery without TPR games.

use bitflags::bitflags;
use tracing::debug;

pub use helio_pc_constants::{IOAPIC_MMIO_BASE, LAPIC_MMIO_BASE};

/// Register offsets within the 4 KiB LAPIC window (16-byte strides).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LapicRegister {
    Id = 0x20,
    Version = 0x30,
    TaskPriority = 0x80,
    Eoi = 0xB0,
    LogicalDestination = 0xD0,
    DestinationFormat = 0xE0,
    SpuriousVector = 0xF0,
    InService = 0x100,
    RequestBase = 0x200,
    ErrorStatus = 0x280,
    LvtTimer = 0x320,
    LvtLint0 = 0x350,
    LvtLint1 = 0x360,
    LvtError = 0x370,
    InitialCount = 0x380,
    CurrentCount = 0x390,
    DivideConfig = 0x3E0,
}

bitflags! {
    /// LVT timer entry bits the model honours.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LvtTimerFlags: u32 {
        const MASKED = 1 << 16;
        const PERIODIC = 1 << 17;
    }
}

/// Timer base frequency before the divide configuration: one tick per
/// nanosecond of platform-clock time.
pub const TIMER_BASE_HZ: u64 = 1_000_000_000;

#[derive(Debug)]
pub struct LocalApic {
    pub id: u8,
    enabled: bool,
    spurious_vector: u32,
    task_priority: u32,
    error_status: u32,
    lvt_timer: u32,
    lvt_lint0: u32,
    lvt_lint1: u32,
    lvt_error: u32,
    initial_count: u32,
    current_count: u32,
    divide_config: u32,
    /// Sub-tick remainder carried between timer advances.
    tick_fraction: u64,
    /// Platform-clock timestamp of the previous advance.
    last_advance_ns: u64,
    irr: [u32; 8],
    isr: [u32; 8],
    in_service: Option<u8>,
    /// Level-triggered vectors currently asserted (keyed by vector).
    level_asserted: [bool; 256],
}

impl Default for LocalApic {
    fn default() -> Self {
        Self::new(0)
    }
}

#[inline]
fn bit_get(words: &[u32; 8], vector: u8) -> bool {
    words[(vector >> 5) as usize] & 1 << (vector & 31) != 0
}

#[inline]
fn bit_set(words: &mut [u32; 8], vector: u8, value: bool) {
    let word = &mut words[(vector >> 5) as usize];
    if value {
        *word |= 1 << (vector & 31);
    } else {
        *word &= !(1 << (vector & 31));
    }
}

impl LocalApic {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            enabled: true,
            spurious_vector: 0xFF,
            task_priority: 0,
            error_status: 0,
            lvt_timer: LvtTimerFlags::MASKED.bits(),
            lvt_lint0: LvtTimerFlags::MASKED.bits(),
            lvt_lint1: LvtTimerFlags::MASKED.bits(),
            lvt_error: LvtTimerFlags::MASKED.bits(),
            initial_count: 0,
            current_count: 0,
            divide_config: 0,
            tick_fraction: 0,
            last_advance_ns: 0,
            irr: [0; 8],
            isr: [0; 8],
            in_service: None,
            level_asserted: [false; 256],
        }
    }

    pub fn software_enabled(&self) -> bool {
        self.enabled && self.spurious_vector & 1 << 8 != 0
    }

    /// Queue `vector` for delivery unless it is already pending or in
    /// service.
    pub fn queue_vector(&mut self, vector: u8) {
        if bit_get(&self.irr, vector) || bit_get(&self.isr, vector) {
            return;
        }
        bit_set(&mut self.irr, vector, true);
    }

    pub fn queue_level_vector(&mut self, vector: u8) {
        self.level_asserted[vector as usize] = true;
        self.queue_vector(vector);
    }

    /// Highest pending vector, if any, without acknowledging it.
    pub fn highest_pending(&self) -> Option<u8> {
        if self.in_service.is_some() {
            return None;
        }
        for word in (0..8).rev() {
            if self.irr[word] != 0 {
                let bit = 31 - self.irr[word].leading_zeros();
                return Some((word as u32 * 32 + bit) as u8);
            }
        }
        None
    }

    /// Move the highest pending vector into service and return it.
    pub fn take_pending_vector(&mut self) -> Option<u8> {
        let vector = self.highest_pending()?;
        bit_set(&mut self.irr, vector, false);
        bit_set(&mut self.isr, vector, true);
        self.in_service = Some(vector);
        debug!(vector, "LAPIC vector moved to in-service");
        Some(vector)
    }

    pub fn in_service(&self) -> Option<u8> {
        self.in_service
    }

    /// EOI: retire the in-service vector and drop its level assertion.
    /// Returns the retired vector so the embedding can broadcast it to the
    /// IOAPIC.
    pub fn end_of_interrupt(&mut self) -> Option<u8> {
        let vector = self.in_service.take()?;
        bit_set(&mut self.isr, vector, false);
        self.level_asserted[vector as usize] = false;
        Some(vector)
    }

    /// Timer divider per the divide-configuration register.
    fn divider(&self) -> u64 {
        match self.divide_config & 0xB {
            0b1011 => 1,
            0b0000 => 2,
            0b0001 => 4,
            0b0010 => 8,
            0b0011 => 16,
            0b1000 => 32,
            0b1001 => 64,
            _ => 128,
        }
    }

    /// Advance the timer to platform time `now_ns`, invoking `deliver` for
    /// each timer expiry (the platform routes it back into `queue_vector`
    /// or the PIC depending on wiring).
    pub fn advance_timer(&mut self, now_ns: u64, deliver: &mut dyn FnMut(u8)) {
        let elapsed = now_ns.saturating_sub(self.last_advance_ns);
        self.last_advance_ns = now_ns;
        if self.current_count == 0 && !self.timer_periodic() {
            return;
        }

        let divider = self.divider();
        let total = elapsed + self.tick_fraction;
        let ticks = total / divider;
        self.tick_fraction = total % divider;
        if ticks == 0 {
            return;
        }

        let mut remaining = ticks;
        while remaining > 0 {
            if self.current_count as u64 > remaining {
                self.current_count -= remaining as u32;
                break;
            }
            remaining -= self.current_count as u64;
            if !self.timer_masked() {
                deliver((self.lvt_timer & 0xFF) as u8);
            }
            if self.timer_periodic() && self.initial_count != 0 {
                self.current_count = self.initial_count;
            } else {
                self.current_count = 0;
                break;
            }
        }
    }

    fn timer_masked(&self) -> bool {
        LvtTimerFlags::from_bits_truncate(self.lvt_timer).contains(LvtTimerFlags::MASKED)
    }

    fn timer_periodic(&self) -> bool {
        LvtTimerFlags::from_bits_truncate(self.lvt_timer).contains(LvtTimerFlags::PERIODIC)
    }

    /// 32-bit register read at `offset` into the LAPIC window. Narrower
    /// guest accesses are widened by the platform before they get here.
    pub fn mmio_read(&mut self, offset: u16) -> u32 {
        match offset & 0xFF0 {
            0x20 => (self.id as u32) << 24,
            // Version 0x14, six LVT entries.
            0x30 => 0x0005_0014,
            0x80 => self.task_priority,
            0xF0 => self.spurious_vector,
            0x100..=0x170 => self.isr[((offset - 0x100) >> 4) as usize],
            0x200..=0x270 => self.irr[((offset - 0x200) >> 4) as usize],
            0x280 => self.error_status,
            0x320 => self.lvt_timer,
            0x350 => self.lvt_lint0,
            0x360 => self.lvt_lint1,
            0x370 => self.lvt_error,
            0x380 => self.initial_count,
            0x390 => self.current_count,
            0x3E0 => self.divide_config,
            _ => 0,
        }
    }

    pub fn mmio_write(&mut self, offset: u16, value: u32) {
        match offset & 0xFF0 {
            0x20 => self.id = (value >> 24) as u8,
            0x80 => self.task_priority = value,
            0xB0 => {
                self.end_of_interrupt();
            }
            0xF0 => {
                self.spurious_vector = value;
                debug!(svr = value, "LAPIC spurious vector register written");
            }
            0x280 => self.error_status = 0,
            0x320 => self.lvt_timer = value,
            0x350 => self.lvt_lint0 = value,
            0x360 => self.lvt_lint1 = value,
            0x370 => self.lvt_error = value,
            0x380 => {
                self.initial_count = value;
                self.current_count = value;
                self.tick_fraction = 0;
            }
            0x3E0 => self.divide_config = value,
            _ => {}
        }
    }
}
