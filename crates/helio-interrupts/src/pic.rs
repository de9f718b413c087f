//! Dual 8259A programmable interrupt controller.
//!
//! The pair is modelled as one unit: the slave hangs off master IRQ 2, so
//! IRQs 0..7 belong to the master and 8..15 to the slave. The guest
//! programs each chip through its command/data port pair (ICW1..ICW4 for
//! initialisation, OCW1..OCW3 afterwards); the host side raises IRQ lines
//! and acknowledges vectors.

use std::collections::VecDeque;

use tracing::debug;

/// Per-chip 8259 state.
#[derive(Debug, Default)]
struct Pic8259 {
    /// Interrupt mask register: a set bit inhibits that line.
    imr: u8,
    /// Interrupt request register: lines raised but not yet in service.
    irr: u8,
    /// In-service register: lines being handled, cleared by EOI.
    isr: u8,
    /// Vector base programmed by ICW2.
    base: u8,
    /// Which initialisation word the next data-port write is (0 = none).
    init_step: u8,
    expect_icw4: bool,
    /// OCW3 read-back selector: command-port reads return ISR when set.
    read_isr: bool,
    special_mask: bool,
}

impl Pic8259 {
    fn start_init(&mut self, icw1: u8) {
        self.init_step = 2;
        self.expect_icw4 = icw1 & 0x01 != 0;
        self.imr = 0;
        self.isr = 0;
        self.read_isr = false;
        self.special_mask = false;
    }

    /// Data-port write: ICW2..ICW4 while initialising, IMR afterwards.
    fn write_data(&mut self, value: u8) {
        match self.init_step {
            2 => {
                self.base = value & 0xF8;
                self.init_step = 3;
            }
            3 => {
                // ICW3 (cascade wiring) is fixed in this model.
                self.init_step = if self.expect_icw4 { 4 } else { 0 };
            }
            4 => {
                // ICW4: 8086 mode assumed; auto-EOI unsupported.
                self.init_step = 0;
            }
            _ => self.imr = value,
        }
    }

    /// Command-port write after initialisation: OCW2 (EOI forms) or OCW3.
    fn write_command(&mut self, value: u8) {
        if value & 0x08 == 0 {
            // OCW2.
            match value & 0xE0 {
                // Non-specific EOI: retire the highest-priority in-service
                // line.
                0x20 => {
                    if self.isr != 0 {
                        let irq = self.isr.trailing_zeros() as u8;
                        self.isr &= !(1 << irq);
                    }
                }
                // Specific EOI.
                0x60 => {
                    let irq = value & 0x07;
                    self.isr &= !(1 << irq);
                }
                _ => {}
            }
        } else {
            // OCW3.
            match value & 0x03 {
                0x02 => self.read_isr = false,
                0x03 => self.read_isr = true,
                _ => {}
            }
            match value & 0x60 {
                0x60 => self.special_mask = true,
                0x40 => self.special_mask = false,
                _ => {}
            }
        }
    }

    fn read_command(&self) -> u8 {
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    /// Whether `irq` can be delivered right now: the line must be pending,
    /// unmasked, and not already in service (special mask mode relaxes the
    /// in-service check for other levels).
    fn deliverable(&self, irq: u8) -> bool {
        let bit = 1u8 << irq;
        if self.irr & bit == 0 || self.imr & bit != 0 {
            return false;
        }
        if self.special_mask {
            self.isr & bit == 0
        } else {
            // Fixed priority: lower line numbers win.
            self.isr & (bit | bit.wrapping_sub(1)) == 0
        }
    }

    fn begin_service(&mut self, irq: u8) {
        let bit = 1u8 << irq;
        self.irr &= !bit;
        self.isr |= bit;
    }
}

/// The cascaded master/slave pair with the FIFO of raised lines.
#[derive(Debug)]
pub struct DualPic {
    master: Pic8259,
    slave: Pic8259,
    /// FIFO of raised IRQ numbers (0..15) awaiting service.
    pending: VecDeque<u8>,
}

impl Default for DualPic {
    fn default() -> Self {
        Self::new()
    }
}

impl DualPic {
    pub fn new() -> Self {
        let mut pic = Self {
            master: Pic8259::default(),
            slave: Pic8259::default(),
            pending: VecDeque::new(),
        };
        // Pre-ICW defaults mirroring a BIOS-less power-on: everything
        // masked until the guest programs the pair.
        pic.master.imr = 0xFF;
        pic.slave.imr = 0xFF;
        pic
    }

    pub fn set_offsets(&mut self, master_base: u8, slave_base: u8) {
        self.master.base = master_base & 0xF8;
        self.slave.base = slave_base & 0xF8;
    }

    pub fn set_masked(&mut self, irq: u8, masked: bool) {
        let (chip, line) = self.chip_mut(irq);
        if masked {
            chip.imr |= 1 << line;
        } else {
            chip.imr &= !(1 << line);
        }
    }

    fn chip_mut(&mut self, irq: u8) -> (&mut Pic8259, u8) {
        if irq < 8 {
            (&mut self.master, irq)
        } else {
            (&mut self.slave, irq - 8)
        }
    }

    /// Raise an IRQ line (0..15). Non-blocking; duplicates are not queued
    /// twice while still pending, and in special-mask mode only one entry
    /// may sit in the queue at a time.
    pub fn raise_irq(&mut self, irq: u8) {
        debug_assert!(irq < 16);
        let (chip, line) = self.chip_mut(irq);
        chip.irr |= 1 << line;
        if irq >= 8 {
            // Cascade: the slave requests service through master IRQ 2.
            self.master.irr |= 1 << 2;
        }
        let special = self.master.special_mask || self.slave.special_mask;
        if special && !self.pending.is_empty() {
            return;
        }
        if !self.pending.contains(&irq) {
            self.pending.push_back(irq);
        }
    }

    /// Drop a level-triggered line that was deasserted before service.
    pub fn lower_irq(&mut self, irq: u8) {
        let (chip, line) = self.chip_mut(irq);
        chip.irr &= !(1 << line);
    }

    /// Peek at the next deliverable vector without acknowledging it.
    pub fn get_pending_vector(&self) -> Option<u8> {
        for &irq in &self.pending {
            if irq < 8 {
                if self.master.deliverable(irq) {
                    return Some(self.master.base + irq);
                }
            } else if self.slave.deliverable(irq - 8) && self.master.imr & (1 << 2) == 0 {
                return Some(self.slave.base + irq - 8);
            }
        }
        None
    }

    /// Acknowledge `vector`: move the line from IRR to ISR and drop it
    /// from the FIFO. Slave delivery also marks the cascade line in
    /// service on the master.
    pub fn acknowledge(&mut self, vector: u8) {
        let irq = if vector.wrapping_sub(self.master.base) < 8 {
            vector - self.master.base
        } else {
            8 + (vector - self.slave.base)
        };
        if irq < 8 {
            self.master.begin_service(irq);
        } else {
            self.slave.begin_service(irq - 8);
            self.master.begin_service(2);
        }
        if let Some(pos) = self.pending.iter().position(|&p| p == irq) {
            self.pending.remove(pos);
        }
        debug!(vector, irq, "PIC vector acknowledged");
    }

    /// Dequeue the next deliverable vector, acknowledging it in one step.
    pub fn take_pending_vector(&mut self) -> Option<u8> {
        let vector = self.get_pending_vector()?;
        self.acknowledge(vector);
        Some(vector)
    }

    pub fn master_isr(&self) -> u8 {
        self.master.isr
    }

    pub fn slave_isr(&self) -> u8 {
        self.slave.isr
    }

    /// Guest port access: 0x20/0x21 master, 0xA0/0xA1 slave.
    pub fn port_write(&mut self, port: u16, value: u8) {
        let chip = if port & 0x80 == 0 {
            &mut self.master
        } else {
            &mut self.slave
        };
        if port & 1 == 0 {
            if value & 0x10 != 0 {
                debug!(port, icw1 = value, "PIC initialisation started");
                chip.start_init(value);
            } else {
                chip.write_command(value);
            }
        } else {
            chip.write_data(value);
        }
    }

    pub fn port_read(&mut self, port: u16) -> u8 {
        let chip = if port & 0x80 == 0 {
            &self.master
        } else {
            &self.slave
        };
        if port & 1 == 0 {
            chip.read_command()
        } else {
            chip.imr
        }
    }
}
