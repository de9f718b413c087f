//! 8254 programmable interval timer, channel 0 wired to IRQ 0.
//!
//! Counting is driven cooperatively from the platform clock at the
//! canonical 1.193182 MHz input frequency; expirations raise the IRQ line
//! handed in at construction. Channels 1 and 2 accept programming but only
//! keep count (no speaker model).

use tracing::debug;

use crate::clock::Clock;
use crate::interrupts::PlatformIrqLine;
use crate::io::PortIoDevice;

pub const PIT_INPUT_HZ: u64 = 1_193_182;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    LoByte,
    HiByte,
    LoHi,
}

#[derive(Debug)]
struct Channel {
    reload: u16,
    count: u32,
    mode: u8,
    access: AccessMode,
    /// Next data-port byte is the high half of a lo/hi pair.
    expect_hi: bool,
    latched: Option<u16>,
    armed: bool,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            reload: 0,
            count: 0,
            mode: 0,
            access: AccessMode::LoHi,
            expect_hi: false,
            latched: None,
            armed: false,
        }
    }
}

impl Channel {
    fn effective_reload(&self) -> u32 {
        if self.reload == 0 {
            0x10000
        } else {
            self.reload as u32
        }
    }

    fn write_data(&mut self, value: u8) -> bool {
        let mut complete = false;
        match self.access {
            AccessMode::LoByte => {
                self.reload = self.reload & 0xFF00 | value as u16;
                complete = true;
            }
            AccessMode::HiByte => {
                self.reload = self.reload & 0x00FF | (value as u16) << 8;
                complete = true;
            }
            AccessMode::LoHi => {
                if self.expect_hi {
                    self.reload = self.reload & 0x00FF | (value as u16) << 8;
                    complete = true;
                } else {
                    self.reload = self.reload & 0xFF00 | value as u16;
                }
                self.expect_hi = !self.expect_hi;
            }
        }
        if complete {
            self.count = self.effective_reload();
            self.armed = true;
        }
        complete
    }

    fn read_data(&mut self) -> u8 {
        let value = self.latched.take().unwrap_or(self.count as u16);
        match self.access {
            AccessMode::HiByte => (value >> 8) as u8,
            AccessMode::LoHi => {
                if self.expect_hi {
                    // Second half of the pair; the latch was dropped by the
                    // `take` above.
                    self.expect_hi = false;
                    (value >> 8) as u8
                } else {
                    // Keep the snapshot so the high read is coherent.
                    self.latched = Some(value);
                    self.expect_hi = true;
                    value as u8
                }
            }
            _ => value as u8,
        }
    }
}

pub struct Pit {
    channels: [Channel; 3],
    clock: Clock,
    irq0: PlatformIrqLine,
    last_ns: u64,
    tick_fraction: u64,
}

impl Pit {
    pub fn new(clock: Clock, irq0: PlatformIrqLine) -> Self {
        let last_ns = clock.now_ns();
        Self {
            channels: [Channel::default(), Channel::default(), Channel::default()],
            clock,
            irq0,
            last_ns,
            tick_fraction: 0,
        }
    }

    /// Advance counters to the current platform time, firing IRQ 0 for
    /// each channel-0 expiry.
    pub fn process(&mut self) {
        let now = self.clock.now_ns();
        let elapsed = now.saturating_sub(self.last_ns);
        self.last_ns = now;

        let numer = elapsed
            .saturating_mul(PIT_INPUT_HZ)
            .saturating_add(self.tick_fraction);
        let ticks = numer / 1_000_000_000;
        self.tick_fraction = numer % 1_000_000_000;
        if ticks == 0 {
            return;
        }

        let ch = &mut self.channels[0];
        if !ch.armed {
            return;
        }
        let mut remaining = ticks;
        while remaining > 0 {
            if ch.count as u64 > remaining {
                ch.count -= remaining as u32;
                break;
            }
            remaining -= ch.count as u64;
            self.irq0.raise();
            match ch.mode {
                // Mode 0: one shot.
                0 => {
                    ch.count = 0;
                    ch.armed = false;
                    break;
                }
                // Rate generator / square wave reload.
                _ => ch.count = ch.effective_reload(),
            }
        }
    }
}

impl PortIoDevice for Pit {
    fn read_u8(&mut self, port: u16) -> u8 {
        match port & 0x3 {
            ch @ 0..=2 => self.channels[ch as usize].read_data(),
            _ => 0,
        }
    }

    fn write_u8(&mut self, port: u16, value: u8) {
        match port & 0x3 {
            ch @ 0..=2 => {
                if self.channels[ch as usize].write_data(value) {
                    debug!(
                        channel = ch,
                        reload = self.channels[ch as usize].reload,
                        "PIT channel armed"
                    );
                }
            }
            _ => {
                // Mode/command word.
                let ch = (value >> 6) as usize;
                if ch > 2 {
                    return; // read-back command unsupported
                }
                let channel = &mut self.channels[ch];
                match (value >> 4) & 0x3 {
                    // Counter latch command: access mode is untouched.
                    0 => channel.latched = Some(channel.count as u16),
                    1 => {
                        channel.access = AccessMode::LoByte;
                        channel.mode = (value >> 1) & 0x7;
                    }
                    2 => {
                        channel.access = AccessMode::HiByte;
                        channel.mode = (value >> 1) & 0x7;
                    }
                    _ => {
                        channel.access = AccessMode::LoHi;
                        channel.expect_hi = false;
                        channel.mode = (value >> 1) & 0x7;
                    }
                }
            }
        }
    }
}
