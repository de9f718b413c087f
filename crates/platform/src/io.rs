//! The programmed-I/O port bus.
//!
//! Devices claim inclusive port ranges; unclaimed ports behave as open bus
//! (reads return all-ones, writes vanish). Multi-byte accesses decompose
//! into byte accesses by default, which matches how the legacy devices on
//! this bus are actually addressed.

use std::cell::RefCell;
use std::ops::RangeInclusive;
use std::rc::Rc;

use tracing::debug;

pub trait PortIoDevice {
    fn read_u8(&mut self, port: u16) -> u8;
    fn write_u8(&mut self, port: u16, value: u8);

    fn read(&mut self, port: u16, size: u32) -> u32 {
        let mut value = 0u32;
        for i in 0..size.min(4) {
            value |= (self.read_u8(port.wrapping_add(i as u16)) as u32) << (8 * i);
        }
        value
    }

    fn write(&mut self, port: u16, size: u32, value: u32) {
        for i in 0..size.min(4) {
            self.write_u8(port.wrapping_add(i as u16), (value >> (8 * i)) as u8);
        }
    }
}

type SharedDevice = Rc<RefCell<dyn PortIoDevice>>;

#[derive(Default)]
pub struct IoPortBus {
    ranges: Vec<(RangeInclusive<u16>, SharedDevice)>,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, range: RangeInclusive<u16>, device: SharedDevice) {
        self.ranges.push((range, device));
    }

    fn device_for(&self, port: u16) -> Option<&SharedDevice> {
        self.ranges
            .iter()
            .find(|(range, _)| range.contains(&port))
            .map(|(_, dev)| dev)
    }

    pub fn read(&mut self, port: u16, size: u32) -> u32 {
        match self.device_for(port) {
            Some(dev) => dev.borrow_mut().read(port, size),
            None => {
                debug!(port, size, "port read from open bus");
                u32::MAX >> (32 - 8 * size.clamp(1, 4))
            }
        }
    }

    pub fn write(&mut self, port: u16, size: u32, value: u32) {
        match self.device_for(port) {
            Some(dev) => dev.borrow_mut().write(port, size, value),
            None => debug!(port, size, value, "port write to open bus"),
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, 1, value as u32);
    }
}
