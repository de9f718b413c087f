//! The CPU's view of the PC platform.
//!
//! Linear addresses map straight onto platform physical space (the engine
//! runs with paging off; this bus is the seam where a translation layer
//! would slot in). Port I/O lands on the platform's I/O bus, and the
//! interrupt-controller handshake drains the platform complex.

use std::cell::RefCell;
use std::rc::Rc;

use helio_cpu_core::exceptions::Exception;
use helio_cpu_core::interrupts::InterruptController;
use helio_cpu_core::mem::CpuBus;
use helio_platform::interrupts::PlatformInterrupts;
use helio_platform::PcPlatform;
use memory::MemoryBus as _;

pub struct PcCpuBus {
    pub platform: PcPlatform,
}

impl PcCpuBus {
    pub fn new(platform: PcPlatform) -> Self {
        Self { platform }
    }

    /// Handle the CPU core polls for vectors between instructions.
    pub fn interrupt_controller(&self) -> PlatformInterruptController {
        PlatformInterruptController {
            interrupts: self.platform.interrupts.clone(),
        }
    }
}

impl CpuBus for PcCpuBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Exception> {
        Ok(self.platform.memory.read_u8(vaddr))
    }

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Exception> {
        self.platform.memory.write_u8(vaddr, val);
        Ok(())
    }

    fn read_u16(&mut self, vaddr: u64) -> Result<u16, Exception> {
        Ok(self.platform.memory.read_u16(vaddr))
    }

    fn read_u32(&mut self, vaddr: u64) -> Result<u32, Exception> {
        Ok(self.platform.memory.read_u32(vaddr))
    }

    fn read_u64(&mut self, vaddr: u64) -> Result<u64, Exception> {
        Ok(self.platform.memory.read_u64(vaddr))
    }

    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), Exception> {
        self.platform.memory.write_u16(vaddr, val);
        Ok(())
    }

    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Exception> {
        self.platform.memory.write_u32(vaddr, val);
        Ok(())
    }

    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), Exception> {
        self.platform.memory.write_u64(vaddr, val);
        Ok(())
    }

    fn io_read(&mut self, port: u16, size: u32) -> Result<u64, Exception> {
        Ok(self.platform.io.read(port, size) as u64)
    }

    fn io_write(&mut self, port: u16, size: u32, val: u64) -> Result<(), Exception> {
        self.platform.io.write(port, size, val as u32);
        Ok(())
    }
}

/// Adapter from the platform interrupt complex to the CPU core's
/// controller handshake.
pub struct PlatformInterruptController {
    interrupts: Rc<RefCell<PlatformInterrupts>>,
}

impl InterruptController for PlatformInterruptController {
    fn poll_interrupt(&mut self) -> Option<u8> {
        self.interrupts.borrow_mut().take_pending()
    }
}
