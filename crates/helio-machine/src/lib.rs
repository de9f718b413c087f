//! The machine front: a CPU core wired to the PC platform, exposing the
//! host-facing `step`/`run` surface and interrupt injection.

mod bus;

use helio_cpu_core::exceptions::CpuExit;
use helio_cpu_core::exec::{StepExit, Vcpu};
use helio_cpu_core::state::CpuMode;
use helio_pc_constants::{RESET_CS, RESET_IP};
use helio_platform::PcPlatform;
use memory::MemoryBus as _;
use tracing::warn;

pub use bus::{PcCpuBus, PlatformInterruptController};

/// Machine construction knobs. The defaults boot a bare real-mode CPU at
/// the architectural reset vector with 2 MiB of RAM.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub ram_size: u64,
    /// Override the reset CS:IP (fixtures that load flat code at a known
    /// physical address).
    pub entry: Option<(u16, u16)>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: 2 * 1024 * 1024,
            entry: None,
        }
    }
}

/// Outcome of one host-visible step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// An instruction retired; keep going.
    Continue,
    /// The CPU is halted waiting for an interrupt.
    Halted,
    /// Unrecoverable guest fault cascade.
    TripleFault,
    /// A bug in the emulator itself; the CPU is stopped.
    Internal(String),
}

pub struct Machine {
    vcpu: Vcpu<PcCpuBus>,
    controller: PlatformInterruptController,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let platform = PcPlatform::new(config.ram_size);
        let bus = PcCpuBus::new(platform);
        let controller = bus.interrupt_controller();
        let mut vcpu = Vcpu::new_with_mode(CpuMode::Real, bus);

        let (cs, ip) = config.entry.unwrap_or((RESET_CS, RESET_IP));
        vcpu.cpu.state.segments.cs.set_real_mode(cs);
        vcpu.cpu.state.set_rip(ip as u64);
        Self { vcpu, controller }
    }

    pub fn platform(&self) -> &PcPlatform {
        &self.vcpu.bus.platform
    }

    pub fn platform_mut(&mut self) -> &mut PcPlatform {
        &mut self.vcpu.bus.platform
    }

    pub fn cpu(&self) -> &helio_cpu_core::interrupts::CpuCore {
        &self.vcpu.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut helio_cpu_core::interrupts::CpuCore {
        &mut self.vcpu.cpu
    }

    /// Device-side interrupt injection; non-blocking and callable at any
    /// instruction boundary.
    pub fn inject_irq(&mut self, irq: u8) {
        self.vcpu.bus.platform.raise_irq(irq);
    }

    pub fn raise_gsi(&mut self, gsi: u32) {
        self.vcpu.bus.platform.raise_gsi(gsi);
    }

    pub fn lower_gsi(&mut self, gsi: u32) {
        self.vcpu.bus.platform.lower_gsi(gsi);
    }

    pub fn write_physical(&mut self, paddr: u64, data: &[u8]) {
        self.vcpu.bus.platform.memory.write_physical(paddr, data);
    }

    pub fn read_physical(&mut self, paddr: u64, out: &mut [u8]) {
        self.vcpu.bus.platform.memory.read_physical(paddr, out);
    }

    pub fn write_physical_u32(&mut self, paddr: u64, value: u32) {
        self.vcpu.bus.platform.memory.write_u32(paddr, value);
    }

    pub fn read_physical_u32(&mut self, paddr: u64) -> u32 {
        self.vcpu.bus.platform.memory.read_u32(paddr)
    }

    /// Execute one instruction, servicing timers and pending interrupts at
    /// the boundary first.
    pub fn step(&mut self) -> RunExit {
        self.vcpu.bus.platform.process_timers();

        if let Err(exit) = self
            .vcpu
            .cpu
            .poll_and_deliver_external_interrupt(&mut self.vcpu.bus, &mut self.controller)
        {
            return Self::map_exit(exit);
        }

        if self.vcpu.cpu.state.halted {
            return RunExit::Halted;
        }

        match self.vcpu.step() {
            Ok(StepExit::Halt) => RunExit::Halted,
            Ok(_) => RunExit::Continue,
            Err(exit) => Self::map_exit(exit),
        }
    }

    fn map_exit(exit: CpuExit) -> RunExit {
        match exit {
            CpuExit::TripleFault => {
                warn!("triple fault, stopping CPU");
                RunExit::TripleFault
            }
            CpuExit::Internal(err) => RunExit::Internal(err.to_string()),
        }
    }

    /// Run until HLT, a fault cascade, or `max_insns` instructions.
    pub fn run(&mut self, max_insns: u64) -> RunExit {
        let mut last = RunExit::Continue;
        for _ in 0..max_insns {
            last = self.step();
            if last != RunExit::Continue {
                break;
            }
        }
        last
    }
}
