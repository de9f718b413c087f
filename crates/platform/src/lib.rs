//! Platform infrastructure shared by the machine front-end: the port-I/O
//! bus, the chipset oddments (A20, reset control), the interrupt-complex
//! facade, the platform timebase and the canonical PC wiring in
//! [`pc::PcPlatform`].

pub mod chipset;
pub mod clock;
pub mod devices;
pub mod interrupts;
pub mod io;
pub mod memory;
pub mod pc;

pub use chipset::{A20Gate, Chipset, ResetEvent};
pub use clock::Clock;
pub use io::{IoPortBus, PortIoDevice};
pub use pc::PcPlatform;
