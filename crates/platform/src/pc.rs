//! Canonical PC wiring: memory with its MMIO windows, the port map, the
//! interrupt complex and the timed devices, bundled behind one value.

use std::cell::RefCell;
use std::rc::Rc;

use helio_pc_constants::{
    A20_GATE_PORT, CMOS_DATA_PORT, CMOS_INDEX_PORT, DEBUGCON_PORT, PIC_MASTER_CMD,
    PIC_MASTER_DATA, PIC_SLAVE_CMD, PIC_SLAVE_DATA, PIT_CH0, PIT_CMD,
};

use crate::chipset::{Chipset, ResetEvent};
use crate::clock::Clock;
use crate::devices::{Cmos, Debugcon, Pit};
use crate::interrupts::{InterruptInput, PlatformInterrupts, PlatformIrqLine};
use crate::io::{IoPortBus, PortIoDevice};
use crate::memory::MemoryBus;

/// Forwards the PIC's port pair from the I/O bus into the shared complex.
struct PicPorts(Rc<RefCell<PlatformInterrupts>>);

impl PortIoDevice for PicPorts {
    fn read_u8(&mut self, port: u16) -> u8 {
        self.0.borrow_mut().pic_mut().port_read(port)
    }

    fn write_u8(&mut self, port: u16, value: u8) {
        self.0.borrow_mut().pic_mut().port_write(port, value);
    }
}

pub struct PcPlatform {
    pub memory: MemoryBus,
    pub io: IoPortBus,
    pub chipset: Chipset,
    pub interrupts: Rc<RefCell<PlatformInterrupts>>,
    clock: Clock,
    pit: Rc<RefCell<Pit>>,
    rtc: Rc<RefCell<Cmos>>,
    debugcon: Rc<RefCell<Debugcon>>,
}

impl PcPlatform {
    pub fn new(ram_size: u64) -> Self {
        let clock = Clock::new();
        let chipset = Chipset::new();
        let interrupts = Rc::new(RefCell::new(PlatformInterrupts::new()));

        let memory = MemoryBus::new(ram_size, chipset.a20(), interrupts.clone());

        let pit = Rc::new(RefCell::new(Pit::new(
            clock.clone(),
            PlatformIrqLine::isa(interrupts.clone(), 0),
        )));
        let rtc = Rc::new(RefCell::new(Cmos::new(clock.clone())));
        let debugcon = Rc::new(RefCell::new(Debugcon::new()));

        let mut io = IoPortBus::new();
        let pic_ports: Rc<RefCell<PicPorts>> =
            Rc::new(RefCell::new(PicPorts(interrupts.clone())));
        io.register(PIC_MASTER_CMD..=PIC_MASTER_DATA, pic_ports.clone());
        io.register(PIC_SLAVE_CMD..=PIC_SLAVE_DATA, pic_ports);
        io.register(PIT_CH0..=PIT_CMD, pit.clone());
        io.register(CMOS_INDEX_PORT..=CMOS_DATA_PORT, rtc.clone());
        io.register(
            A20_GATE_PORT..=A20_GATE_PORT,
            Rc::new(RefCell::new(chipset.control_port())),
        );
        io.register(DEBUGCON_PORT..=DEBUGCON_PORT, debugcon.clone());

        Self {
            memory,
            io,
            chipset,
            interrupts,
            clock,
            pit,
            rtc,
            debugcon,
        }
    }

    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    pub fn pit(&self) -> Rc<RefCell<Pit>> {
        self.pit.clone()
    }

    pub fn rtc(&self) -> Rc<RefCell<Cmos>> {
        self.rtc.clone()
    }

    pub fn debugcon(&self) -> Rc<RefCell<Debugcon>> {
        self.debugcon.clone()
    }

    pub fn take_reset_events(&mut self) -> Vec<ResetEvent> {
        self.chipset.take_reset_events()
    }

    /// Advance every timed device to the current platform time.
    pub fn process_timers(&mut self) {
        self.pit.borrow_mut().process();
        let now = self.clock.now_ns();
        self.interrupts.borrow_mut().advance_lapic_timer(now);
    }

    pub fn raise_irq(&mut self, irq: u8) {
        self.interrupts
            .borrow_mut()
            .raise_irq(InterruptInput::IsaIrq(irq));
    }

    pub fn raise_gsi(&mut self, gsi: u32) {
        self.interrupts
            .borrow_mut()
            .raise_irq(InterruptInput::Gsi(gsi));
    }

    pub fn lower_gsi(&mut self, gsi: u32) {
        self.interrupts
            .borrow_mut()
            .lower_irq(InterruptInput::Gsi(gsi));
    }
}
