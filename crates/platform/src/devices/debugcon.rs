//! Bochs-style debug console on port 0xE9: bytes written are collected
//! for the embedding and mirrored to the log; reads return the signature
//! byte guests use to probe for the port.

use tracing::debug;

use crate::io::PortIoDevice;

#[derive(Debug, Default)]
pub struct Debugcon {
    buffer: Vec<u8>,
}

impl Debugcon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl PortIoDevice for Debugcon {
    fn read_u8(&mut self, _port: u16) -> u8 {
        0xE9
    }

    fn write_u8(&mut self, _port: u16, value: u8) {
        debug!(byte = value, "debugcon write");
        self.buffer.push(value);
    }
}
