//! Fault taxonomy and CPU-exit conditions.
//!
//! Architectural faults travel as [`Exception`] values through `Result`s
//! inside one instruction and are resolved by the interrupt pipeline.
//! Host-level failures (emulator bugs, triple faults) are [`CpuExit`] and
//! stop the CPU; they are never visible to the guest.

use thiserror::Error;

/// An architectural exception, carrying its error code where one is defined.
///
/// `MemoryFault` is the odd one out: it is raised by test buses for accesses
/// outside their backing store. It is delivered as `#GP(0)`, matching the
/// "unmapped physical memory" policy of the engine when auto-allocation is
/// off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    DivideError,
    Debug,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss(u16),
    SegmentNotPresent(u16),
    StackSegment(u16),
    GeneralProtection(u16),
    PageFault { addr: u64, error_code: u32 },
    X87FloatingPoint,
    AlignmentCheck,
    MachineCheck,
    SimdFloatingPoint,
    MemoryFault,
}

impl Exception {
    /// `#GP(0)`, the most common permission failure.
    pub fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackSegment(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
            Exception::X87FloatingPoint => 16,
            Exception::AlignmentCheck => 17,
            Exception::MachineCheck => 18,
            Exception::SimdFloatingPoint => 19,
            Exception::MemoryFault => 13,
        }
    }

    /// The error code pushed by the delivery sequence, if this fault defines
    /// one.
    pub fn error_code(self) -> Option<u32> {
        match self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(sel) => Some(sel as u32),
            Exception::SegmentNotPresent(sel) => Some(sel as u32),
            Exception::StackSegment(sel) => Some(sel as u32),
            Exception::GeneralProtection(sel) => Some(sel as u32),
            Exception::PageFault { error_code, .. } => Some(error_code),
            Exception::AlignmentCheck => Some(0),
            Exception::MemoryFault => Some(0),
            _ => None,
        }
    }

    /// Faults whose re-fault during delivery escalates to `#DF` (the
    /// contributory class plus `#PF`).
    pub fn is_contributory(self) -> bool {
        matches!(
            self,
            Exception::DivideError
                | Exception::InvalidTss(_)
                | Exception::SegmentNotPresent(_)
                | Exception::StackSegment(_)
                | Exception::GeneralProtection(_)
                | Exception::PageFault { .. }
                | Exception::MemoryFault
        )
    }
}

/// A bug in the emulator itself, surfaced to the host loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("emulator internal error: {message}")]
pub struct InternalError {
    pub message: String,
}

impl InternalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Why the CPU stopped executing. Distinct from guest-visible faults by
/// construction: a guest can at most cause `TripleFault`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuExit {
    TripleFault,
    Internal(InternalError),
}

impl From<InternalError> for CpuExit {
    fn from(err: InternalError) -> Self {
        CpuExit::Internal(err)
    }
}
