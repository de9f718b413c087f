//! Chipset glue: the A20 gate and the fast reset path on port 0x92.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::debug;

use crate::io::PortIoDevice;

/// Shared handle on the A20 line. Disabled after reset; while disabled,
/// physical bit 20 is forced low and the first megabyte aliases.
#[derive(Debug, Clone, Default)]
pub struct A20Gate {
    enabled: Rc<Cell<bool>>,
}

impl A20Gate {
    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.get() != enabled {
            debug!(enabled, "A20 gate toggled");
        }
        self.enabled.set(enabled);
    }

    /// Mask applied to every physical address.
    pub fn mask(&self) -> u64 {
        if self.enabled.get() {
            u64::MAX
        } else {
            !(1u64 << 20)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEvent {
    System,
}

#[derive(Default)]
pub struct Chipset {
    a20: A20Gate,
    reset_events: Rc<RefCell<Vec<ResetEvent>>>,
}

impl Chipset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn a20(&self) -> A20Gate {
        self.a20.clone()
    }

    pub fn take_reset_events(&mut self) -> Vec<ResetEvent> {
        std::mem::take(&mut *self.reset_events.borrow_mut())
    }

    /// The port 0x92 "system control port A" device.
    pub fn control_port(&self) -> SystemControlPortA {
        SystemControlPortA {
            a20: self.a20.clone(),
            reset_events: self.reset_events.clone(),
        }
    }
}

/// Port 0x92: bit 1 is the fast A20 gate, bit 0 pulses system reset.
pub struct SystemControlPortA {
    a20: A20Gate,
    reset_events: Rc<RefCell<Vec<ResetEvent>>>,
}

impl PortIoDevice for SystemControlPortA {
    fn read_u8(&mut self, _port: u16) -> u8 {
        (self.a20.enabled() as u8) << 1
    }

    fn write_u8(&mut self, _port: u16, value: u8) {
        self.a20.set_enabled(value & 0x02 != 0);
        if value & 0x01 != 0 {
            debug!("fast reset requested via port 0x92");
            self.reset_events.borrow_mut().push(ResetEvent::System);
        }
    }
}
