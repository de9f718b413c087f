//! The PC interrupt-controller complex: dual 8259 PIC, local APIC and
//! IOAPIC device models.
//!
//! All three are pure state machines over their guest-visible register
//! protocols; wiring them to port/MMIO windows and to the CPU core is the
//! platform crate's job.

pub mod apic;
pub mod ioapic;
pub mod pic;

pub use apic::LocalApic;
pub use ioapic::IoApic;
pub use pic::DualPic;
