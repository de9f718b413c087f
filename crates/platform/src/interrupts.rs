//! The interrupt-complex facade: one place that owns the PIC pair, the
//! IOAPIC and the (single) local APIC, routes device lines to whichever is
//! active, and hands vectors to the CPU.

use std::cell::RefCell;
use std::rc::Rc;

use helio_interrupts::{DualPic, IoApic, LocalApic};
use tracing::debug;

/// Which controller the guest has steered external interrupts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlatformInterruptMode {
    #[default]
    Pic,
    Apic,
}

/// A device-side interrupt input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptInput {
    /// Legacy ISA line 0..15.
    IsaIrq(u8),
    /// Global system interrupt (IOAPIC pin).
    Gsi(u32),
}

pub struct PlatformInterrupts {
    mode: PlatformInterruptMode,
    pic: DualPic,
    ioapic: IoApic,
    lapic: LocalApic,
}

impl Default for PlatformInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformInterrupts {
    pub fn new() -> Self {
        Self {
            mode: PlatformInterruptMode::Pic,
            pic: DualPic::new(),
            ioapic: IoApic::new(),
            lapic: LocalApic::new(0),
        }
    }

    pub fn mode(&self) -> PlatformInterruptMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PlatformInterruptMode) {
        debug!(?mode, "platform interrupt mode switched");
        self.mode = mode;
    }

    pub fn pic(&self) -> &DualPic {
        &self.pic
    }

    pub fn pic_mut(&mut self) -> &mut DualPic {
        &mut self.pic
    }

    pub fn lapic(&self) -> &LocalApic {
        &self.lapic
    }

    pub fn lapic_mut(&mut self) -> &mut LocalApic {
        &mut self.lapic
    }

    pub fn ioapic_mut(&mut self) -> &mut IoApic {
        &mut self.ioapic
    }

    /// Non-blocking device-side injection.
    pub fn raise_irq(&mut self, input: InterruptInput) {
        match (self.mode, input) {
            (PlatformInterruptMode::Pic, InterruptInput::IsaIrq(irq)) => self.pic.raise_irq(irq),
            (PlatformInterruptMode::Pic, InterruptInput::Gsi(gsi)) => {
                if gsi < 16 {
                    self.pic.raise_irq(gsi as u8);
                }
            }
            (PlatformInterruptMode::Apic, InterruptInput::IsaIrq(irq)) => {
                // ISA lines are wired 1:1 onto the first 16 IOAPIC pins;
                // edges are modelled as assert+deassert.
                self.ioapic.set_irq_line(irq as u32, true);
                self.ioapic.set_irq_line(irq as u32, false);
                self.drain_ioapic();
            }
            (PlatformInterruptMode::Apic, InterruptInput::Gsi(gsi)) => {
                self.ioapic.set_irq_line(gsi, true);
                self.drain_ioapic();
            }
        }
    }

    pub fn lower_irq(&mut self, input: InterruptInput) {
        match input {
            InterruptInput::IsaIrq(irq) => match self.mode {
                PlatformInterruptMode::Pic => self.pic.lower_irq(irq),
                PlatformInterruptMode::Apic => self.ioapic.set_irq_line(irq as u32, false),
            },
            InterruptInput::Gsi(gsi) => match self.mode {
                PlatformInterruptMode::Pic => {
                    if gsi < 16 {
                        self.pic.lower_irq(gsi as u8);
                    }
                }
                PlatformInterruptMode::Apic => self.ioapic.set_irq_line(gsi, false),
            },
        }
    }

    fn drain_ioapic(&mut self) {
        while let Some(delivery) = self.ioapic.pop_delivery() {
            // Single-CPU model: every destination lands on the one LAPIC.
            if delivery.level_triggered {
                self.lapic.queue_level_vector(delivery.vector);
            } else {
                self.lapic.queue_vector(delivery.vector);
            }
        }
    }

    /// Peek at the next deliverable vector.
    pub fn get_pending(&self) -> Option<u8> {
        match self.mode {
            PlatformInterruptMode::Pic => self.pic.get_pending_vector(),
            PlatformInterruptMode::Apic => self.lapic.highest_pending(),
        }
    }

    /// Acknowledge and return the next deliverable vector (the CPU-side
    /// interrupt-controller handshake).
    pub fn take_pending(&mut self) -> Option<u8> {
        match self.mode {
            PlatformInterruptMode::Pic => self.pic.take_pending_vector(),
            PlatformInterruptMode::Apic => self.lapic.take_pending_vector(),
        }
    }

    /// Advance the LAPIC timer against the platform clock; expirations
    /// queue the LVT vector on the LAPIC itself.
    pub fn advance_lapic_timer(&mut self, now_ns: u64) {
        let lapic = &mut self.lapic;
        let mut fired = Vec::new();
        lapic.advance_timer(now_ns, &mut |vector| fired.push(vector));
        for vector in fired {
            lapic.queue_vector(vector);
        }
    }

    /// LAPIC register window access. EOI writes are intercepted so the
    /// retirement can be broadcast to the IOAPIC's level entries.
    pub fn lapic_mmio_write(&mut self, offset: u16, value: u32) {
        if offset & 0xFF0 == 0xB0 {
            if let Some(vector) = self.lapic.end_of_interrupt() {
                self.ioapic.end_of_interrupt(vector);
                self.drain_ioapic();
            }
            return;
        }
        self.lapic.mmio_write(offset, value);
    }

    pub fn lapic_mmio_read(&mut self, offset: u16) -> u32 {
        self.lapic.mmio_read(offset)
    }

    pub fn ioapic_mmio_write(&mut self, offset: u64, value: u32) {
        self.ioapic.mmio_write(offset, value);
        self.drain_ioapic();
    }

    pub fn ioapic_mmio_read(&mut self, offset: u64) -> u32 {
        self.ioapic.mmio_read(offset)
    }
}

/// A device-held handle that raises a fixed input on the shared complex.
#[derive(Clone)]
pub struct PlatformIrqLine {
    interrupts: Rc<RefCell<PlatformInterrupts>>,
    input: InterruptInput,
}

impl PlatformIrqLine {
    pub fn isa(interrupts: Rc<RefCell<PlatformInterrupts>>, irq: u8) -> Self {
        Self {
            interrupts,
            input: InterruptInput::IsaIrq(irq),
        }
    }

    pub fn gsi(interrupts: Rc<RefCell<PlatformInterrupts>>, gsi: u32) -> Self {
        Self {
            interrupts,
            input: InterruptInput::Gsi(gsi),
        }
    }

    pub fn raise(&self) {
        self.interrupts.borrow_mut().raise_irq(self.input);
    }

    pub fn lower(&self) {
        self.interrupts.borrow_mut().lower_irq(self.input);
    }
}
