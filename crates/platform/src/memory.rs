//! The platform's physical memory bus: guest RAM behind the A20 mask,
//! with the LAPIC/IOAPIC register windows and the linear framebuffer
//! dispatched before the backing store.
//!
//! APIC registers are 32-bit with 16-byte strides; narrower guest accesses
//! are carved out of the containing 32-bit register, wider ones decompose.

use std::cell::RefCell;
use std::rc::Rc;

use helio_pc_constants::{
    IOAPIC_MMIO_BASE, IOAPIC_MMIO_SIZE, LAPIC_MMIO_BASE, LAPIC_MMIO_SIZE, LFB_MMIO_BASE,
    LFB_MMIO_SIZE,
};
use memory::GuestRam;
use memory::MemoryBus as _;

use crate::chipset::A20Gate;
use crate::interrupts::PlatformInterrupts;

pub struct MemoryBus {
    ram: GuestRam,
    framebuffer: GuestRam,
    a20: A20Gate,
    interrupts: Rc<RefCell<PlatformInterrupts>>,
}

enum Window {
    Ram(u64),
    Lapic(u16),
    Ioapic(u64),
    Framebuffer(u64),
}

impl MemoryBus {
    pub fn new(
        ram_size: u64,
        a20: A20Gate,
        interrupts: Rc<RefCell<PlatformInterrupts>>,
    ) -> Self {
        Self {
            ram: GuestRam::new(ram_size),
            framebuffer: GuestRam::new(LFB_MMIO_SIZE),
            a20,
            interrupts,
        }
    }

    pub fn ram_size(&self) -> u64 {
        self.ram.size()
    }

    fn route(&self, paddr: u64) -> Window {
        let paddr = paddr & self.a20.mask();
        if (LAPIC_MMIO_BASE..LAPIC_MMIO_BASE + LAPIC_MMIO_SIZE).contains(&paddr) {
            Window::Lapic((paddr - LAPIC_MMIO_BASE) as u16)
        } else if (IOAPIC_MMIO_BASE..IOAPIC_MMIO_BASE + IOAPIC_MMIO_SIZE).contains(&paddr) {
            Window::Ioapic(paddr - IOAPIC_MMIO_BASE)
        } else if (LFB_MMIO_BASE..LFB_MMIO_BASE + LFB_MMIO_SIZE).contains(&paddr) {
            Window::Framebuffer(paddr - LFB_MMIO_BASE)
        } else {
            Window::Ram(paddr)
        }
    }

    /// Aligned 32-bit MMIO register read backing every APIC-window access.
    fn mmio_reg_read(&mut self, window: &Window) -> u32 {
        match window {
            Window::Lapic(offset) => self
                .interrupts
                .borrow_mut()
                .lapic_mmio_read(offset & !0x3),
            Window::Ioapic(offset) => self.interrupts.borrow_mut().ioapic_mmio_read(offset & !0x3),
            _ => unreachable!(),
        }
    }

    fn mmio_reg_write(&mut self, window: &Window, value: u32) {
        match window {
            Window::Lapic(offset) => self
                .interrupts
                .borrow_mut()
                .lapic_mmio_write(offset & !0x3, value),
            Window::Ioapic(offset) => self
                .interrupts
                .borrow_mut()
                .ioapic_mmio_write(offset & !0x3, value),
            _ => unreachable!(),
        }
    }
}

impl memory::MemoryBus for MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        match self.route(paddr) {
            Window::Ram(addr) => self.ram.read_u8(addr),
            Window::Framebuffer(offset) => self.framebuffer.read_u8(offset),
            window @ (Window::Lapic(_) | Window::Ioapic(_)) => {
                let shift = (paddr & 0x3) * 8;
                (self.mmio_reg_read(&window) >> shift) as u8
            }
        }
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        match self.route(paddr) {
            Window::Ram(addr) => self.ram.write_u8(addr, value),
            Window::Framebuffer(offset) => self.framebuffer.write_u8(offset, value),
            window @ (Window::Lapic(_) | Window::Ioapic(_)) => {
                // Sub-register writes are truncated into the register.
                let shift = (paddr & 0x3) * 8;
                let old = self.mmio_reg_read(&window);
                let merged = old & !(0xFF << shift) | (value as u32) << shift;
                self.mmio_reg_write(&window, merged);
            }
        }
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        match self.route(paddr) {
            Window::Ram(addr) => self.ram.read_u32(addr),
            Window::Framebuffer(offset) => self.framebuffer.read_u32(offset),
            window @ (Window::Lapic(_) | Window::Ioapic(_)) => self.mmio_reg_read(&window),
        }
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        match self.route(paddr) {
            Window::Ram(addr) => self.ram.write_u32(addr, value),
            Window::Framebuffer(offset) => self.framebuffer.write_u32(offset, value),
            window @ (Window::Lapic(_) | Window::Ioapic(_)) => {
                self.mmio_reg_write(&window, value);
            }
        }
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        match self.route(paddr) {
            Window::Ram(addr) => self.ram.read_u16(addr),
            Window::Framebuffer(offset) => self.framebuffer.read_u16(offset),
            window @ (Window::Lapic(_) | Window::Ioapic(_)) => {
                let shift = (paddr & 0x3) * 8;
                (self.mmio_reg_read(&window) >> shift) as u16
            }
        }
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        match self.route(paddr) {
            Window::Ram(addr) => self.ram.write_u16(addr, value),
            Window::Framebuffer(offset) => self.framebuffer.write_u16(offset, value),
            _ => {
                // Decompose into the byte-merge path.
                self.write_u8(paddr, value as u8);
                self.write_u8(paddr.wrapping_add(1), (value >> 8) as u8);
            }
        }
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        match self.route(paddr) {
            Window::Ram(addr) => self.ram.read_u64(addr),
            Window::Framebuffer(offset) => self.framebuffer.read_u64(offset),
            _ => self.read_u32(paddr) as u64 | (self.read_u32(paddr.wrapping_add(4)) as u64) << 32,
        }
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        match self.route(paddr) {
            Window::Ram(addr) => self.ram.write_u64(addr, value),
            Window::Framebuffer(offset) => self.framebuffer.write_u64(offset, value),
            _ => {
                self.write_u32(paddr, value as u32);
                self.write_u32(paddr.wrapping_add(4), (value >> 32) as u32);
            }
        }
    }

    fn read_physical(&mut self, paddr: u64, out: &mut [u8]) {
        if let Window::Ram(addr) = self.route(paddr) {
            if let Window::Ram(end) = self.route(paddr.wrapping_add(out.len() as u64)) {
                if end == addr + out.len() as u64 {
                    self.ram.copy_into(addr, out);
                    return;
                }
            }
        }
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.read_u8(paddr.wrapping_add(i as u64));
        }
    }

    fn write_physical(&mut self, paddr: u64, data: &[u8]) {
        if let Window::Ram(addr) = self.route(paddr) {
            if let Window::Ram(end) = self.route(paddr.wrapping_add(data.len() as u64)) {
                if end == addr + data.len() as u64 {
                    self.ram.copy_from(addr, data);
                    return;
                }
            }
        }
        for (i, b) in data.iter().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u64), *b);
        }
    }
}
