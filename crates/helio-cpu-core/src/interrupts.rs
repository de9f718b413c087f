//! Pending-event bookkeeping and interrupt/exception delivery.
//!
//! Events enter through three doors: `INT n` (software), raised faults, and
//! external interrupt vectors injected by the platform. Delivery happens
//! only between instructions, walks the IVT or IDT, and performs ring
//! transitions with the documented stack switches. A fault raised *during*
//! delivery escalates to `#DF`, and a fault during `#DF` delivery is a
//! triple fault that stops the CPU.
//!
//! Delivery operates at selector level: it rewrites CS/SS selectors and the
//! instruction pointer without re-walking the GDT, mirroring how explicit
//! segment loads and far transfers own the descriptor checks.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use helio_x86::{gpr, Width};
use tracing::{debug, warn};

use crate::exceptions::{CpuExit, Exception};
use crate::mem::CpuBus;
use crate::segmentation::GateDescriptor;
use crate::stack;
use crate::state::{
    CpuMode, CpuState, FLAG_AC, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_ID, FLAG_IF, FLAG_IOPL_MASK,
    FLAG_NT, FLAG_OF, FLAG_PF, FLAG_RF, FLAG_SF, FLAG_TF, FLAG_VIF, FLAG_VIP, FLAG_ZF,
};

/// Source of an interrupt vector to the CPU core.
pub trait InterruptController {
    /// Acknowledge and return the highest-priority pending vector, if any.
    fn poll_interrupt(&mut self) -> Option<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    /// INT n / INT3 / INTO: gate DPL is checked against CPL.
    Software,
    /// Architectural fault raised by the engine.
    Fault,
    /// Hardware vector from the interrupt controller.
    External,
}

#[derive(Debug, Clone, Copy)]
struct Event {
    vector: u8,
    class: EventClass,
    error_code: Option<u32>,
    /// Instruction pointer pushed in the frame (faults: the faulting
    /// instruction; software ints: the following instruction).
    return_rip: u64,
    /// CR2 to load before delivery (`#PF` only).
    fault_addr: Option<u64>,
}

/// Vectors in the contributory class (plus `#PF`): a second one of these
/// while the first is being delivered means `#DF`.
fn contributory_vector(vector: u8) -> bool {
    matches!(vector, 0 | 10 | 11 | 12 | 13 | 14)
}

/// Events waiting for the next between-instructions window.
#[derive(Debug, Default)]
pub struct PendingEvents {
    event: Option<Event>,
    pub external_interrupts: VecDeque<u8>,
    interrupt_shadow: u8,
}

impl PendingEvents {
    pub fn raise_software_interrupt(&mut self, vector: u8, return_rip: u64) {
        self.event = Some(Event {
            vector,
            class: EventClass::Software,
            error_code: None,
            return_rip,
            fault_addr: None,
        });
    }

    /// Record an architectural fault. A contributory fault raised while
    /// another contributory fault is still pending becomes `#DF` on the
    /// spot.
    pub fn raise_exception_fault(&mut self, exc: Exception, return_rip: u64) {
        let escalate = matches!(
            self.event,
            Some(Event {
                class: EventClass::Fault,
                vector,
                ..
            }) if contributory_vector(vector)
        ) && exc.is_contributory();
        let event = if escalate {
            warn!(vector = exc.vector(), "contributory fault while one is pending, escalating to #DF");
            Event {
                vector: 8,
                class: EventClass::Fault,
                error_code: Some(0),
                return_rip,
                fault_addr: None,
            }
        } else {
            Event {
                vector: exc.vector(),
                class: EventClass::Fault,
                error_code: exc.error_code(),
                return_rip,
                fault_addr: match exc {
                    Exception::PageFault { addr, .. } => Some(addr),
                    _ => None,
                },
            }
        };
        self.event = Some(event);
    }

    pub fn inject_external_interrupt(&mut self, vector: u8) {
        self.external_interrupts.push_back(vector);
    }

    pub fn has_pending_event(&self) -> bool {
        self.event.is_some()
    }

    /// STI / MOV SS / POP SS window: block maskable-interrupt delivery
    /// until one more instruction has retired.
    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_shadow = 1;
    }

    /// CLI drops the window immediately along with IF.
    pub fn clear_interrupt_shadow(&mut self) {
        self.interrupt_shadow = 0;
    }

    pub fn interrupt_shadow_active(&self) -> bool {
        self.interrupt_shadow != 0
    }

    /// Age the interrupt shadow at an instruction boundary.
    pub fn retire_instruction(&mut self) {
        self.interrupt_shadow = self.interrupt_shadow.saturating_sub(1);
    }
}

/// The CPU core: architectural state plus pending-event machinery.
#[derive(Debug)]
pub struct CpuCore {
    pub state: CpuState,
    pub pending: PendingEvents,
}

impl Deref for CpuCore {
    type Target = CpuState;

    fn deref(&self) -> &CpuState {
        &self.state
    }
}

impl DerefMut for CpuCore {
    fn deref_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }
}

impl CpuCore {
    pub fn new(mode: CpuMode) -> Self {
        Self {
            state: CpuState::new(mode),
            pending: PendingEvents::default(),
        }
    }

    /// Deliver the pending software interrupt or fault, escalating through
    /// `#DF` to a triple fault when delivery itself keeps faulting.
    pub fn deliver_pending_event<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), CpuExit> {
        while let Some(event) = self.pending.event.take() {
            match deliver_event(&mut self.state, bus, &event) {
                Ok(()) => {}
                Err(nested) => {
                    if event.vector == 8 {
                        warn!("fault while delivering #DF: triple fault");
                        return Err(CpuExit::TripleFault);
                    }
                    debug!(
                        vector = event.vector,
                        nested = nested.vector(),
                        "fault during event delivery"
                    );
                    let escalated = if nested.is_contributory()
                        && event.class == EventClass::Fault
                        && contributory_vector(event.vector)
                    {
                        Event {
                            vector: 8,
                            class: EventClass::Fault,
                            error_code: Some(0),
                            return_rip: event.return_rip,
                            fault_addr: match nested {
                                Exception::PageFault { addr, .. } => Some(addr),
                                _ => None,
                            },
                        }
                    } else {
                        Event {
                            vector: nested.vector(),
                            class: EventClass::Fault,
                            error_code: nested.error_code(),
                            return_rip: event.return_rip,
                            fault_addr: match nested {
                                Exception::PageFault { addr, .. } => Some(addr),
                                _ => None,
                            },
                        }
                    };
                    self.pending.event = Some(escalated);
                }
            }
        }
        Ok(())
    }

    /// Deliver one queued external vector if IF is set and no interrupt
    /// shadow is active. A halted CPU wakes on delivery.
    pub fn deliver_external_interrupt<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), CpuExit> {
        if self.pending.interrupt_shadow_active() || !self.state.get_flag(FLAG_IF) {
            return Ok(());
        }
        let Some(vector) = self.pending.external_interrupts.pop_front() else {
            return Ok(());
        };
        self.state.halted = false;
        let event = Event {
            vector,
            class: EventClass::External,
            error_code: None,
            return_rip: self.state.rip(),
            fault_addr: None,
        };
        match deliver_event(&mut self.state, bus, &event) {
            Ok(()) => Ok(()),
            Err(nested) => {
                self.pending
                    .raise_exception_fault(nested, event.return_rip);
                self.deliver_pending_event(bus)
            }
        }
    }

    /// Between-instructions hook: if interrupts are accepted right now,
    /// deliver an already-queued vector, or else acknowledge one from the
    /// controller. The controller is not polled while IF=0 or the shadow is
    /// active, so vectors stay pending in the controller's own state.
    pub fn poll_and_deliver_external_interrupt<B: CpuBus>(
        &mut self,
        bus: &mut B,
        ctrl: &mut impl InterruptController,
    ) -> Result<(), CpuExit> {
        if self.pending.interrupt_shadow_active() || !self.state.get_flag(FLAG_IF) {
            return Ok(());
        }
        if self.pending.external_interrupts.is_empty() {
            if let Some(vector) = ctrl.poll_interrupt() {
                self.pending.inject_external_interrupt(vector);
            }
        }
        self.deliver_external_interrupt(bus)
    }

    /// IRET/IRETD/IRETQ at the current default operand width. Faults raised
    /// by the return path are delivered before this returns.
    pub fn iret<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), CpuExit> {
        let width = self.state.operand_width();
        match iret_inner(&mut self.state, bus, width) {
            Ok(()) => Ok(()),
            Err(exc) => {
                let rip = self.state.rip();
                self.pending.raise_exception_fault(exc, rip);
                self.deliver_pending_event(bus)
            }
        }
    }
}

#[inline]
fn is_canonical(addr: u64) -> bool {
    (addr as i64) << 16 >> 16 == addr as i64
}

fn deliver_event<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    event: &Event,
) -> Result<(), Exception> {
    if let Some(addr) = event.fault_addr {
        state.control.cr2 = addr;
    }
    match state.mode() {
        CpuMode::Real => deliver_real(state, bus, event),
        CpuMode::Protected => deliver_protected(state, bus, event),
        CpuMode::Compatibility | CpuMode::Long => deliver_long(state, bus, event),
    }
}

fn deliver_real<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    event: &Event,
) -> Result<(), Exception> {
    let entry = state
        .tables
        .idtr
        .base
        .wrapping_add(event.vector as u64 * 4);
    let offset = bus.read_u16(entry)?;
    let segment = bus.read_u16(entry.wrapping_add(2))?;

    let flags = state.rflags();
    let old_cs = state.segments.cs.selector as u64;
    stack::push(state, bus, Width::W16, flags)?;
    stack::push(state, bus, Width::W16, old_cs)?;
    stack::push(state, bus, Width::W16, event.return_rip)?;

    state.set_flag(FLAG_IF, false);
    state.set_flag(FLAG_TF, false);
    state.segments.cs.set_real_mode(segment);
    state.set_rip(offset as u64);
    debug!(vector = event.vector, cs = segment, ip = offset, "real-mode interrupt dispatched");
    Ok(())
}

fn idt_fault_code(event: &Event) -> u16 {
    let ext = (event.class != EventClass::Software) as u16;
    (event.vector as u16) << 3 | 2 | ext
}

fn deliver_protected<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    event: &Event,
) -> Result<(), Exception> {
    let offset = event.vector as u64 * 8;
    if offset + 7 > state.tables.idtr.limit as u64 {
        return Err(Exception::GeneralProtection(idt_fault_code(event)));
    }
    let raw = bus.read_u64(state.tables.idtr.base.wrapping_add(offset))?;
    let gate = GateDescriptor::parse32(raw);

    if !gate.is_interrupt_gate() && !gate.is_trap_gate() {
        return Err(Exception::GeneralProtection(idt_fault_code(event)));
    }
    if event.class == EventClass::Software && gate.dpl < state.cpl() {
        return Err(Exception::GeneralProtection(idt_fault_code(event)));
    }
    if !gate.present {
        return Err(Exception::SegmentNotPresent(idt_fault_code(event)));
    }

    let frame_width = if gate.is_16bit() { Width::W16 } else { Width::W32 };
    let new_cpl = (gate.selector & 0x3) as u8;
    let old_cpl = state.cpl();

    if new_cpl < old_cpl {
        // Inner-ring transfer: fetch the target ring's stack from the TSS
        // (32-bit layout: SS:ESP pairs from +4, 8 bytes per ring).
        let tss = &state.tables.tr;
        let slot = tss.base.wrapping_add(4 + 8 * new_cpl as u64);
        let new_sp = bus.read_u32(slot)? as u64;
        let new_ss = bus.read_u16(slot.wrapping_add(4))?;

        let old_ss = state.segments.ss.selector;
        let old_sp = state.read_gpr64(gpr::RSP) & state.stack_width().mask();

        state.segments.ss.selector = new_ss;
        state.write_gpr64(gpr::RSP, new_sp);
        debug!(vector = event.vector, new_ss, new_sp, "interrupt stack switch");

        stack::push(state, bus, frame_width, old_ss as u64)?;
        stack::push(state, bus, frame_width, old_sp)?;
    }

    let flags = state.rflags();
    let old_cs = state.segments.cs.selector as u64;
    stack::push(state, bus, frame_width, flags)?;
    stack::push(state, bus, frame_width, old_cs)?;
    stack::push(state, bus, frame_width, event.return_rip)?;
    if let Some(code) = event.error_code {
        stack::push(state, bus, frame_width, code as u64)?;
    }

    if gate.is_interrupt_gate() {
        state.set_flag(FLAG_IF, false);
    }
    state.set_flag(FLAG_TF, false);
    state.set_flag(FLAG_NT, false);
    state.set_flag(FLAG_RF, false);

    state.segments.cs.selector = gate.selector;
    state.set_rip(gate.offset & frame_width.mask());
    Ok(())
}

fn deliver_long<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    event: &Event,
) -> Result<(), Exception> {
    let offset = event.vector as u64 * 16;
    if offset + 15 > state.tables.idtr.limit as u64 {
        return Err(Exception::GeneralProtection(idt_fault_code(event)));
    }
    let low = bus.read_u64(state.tables.idtr.base.wrapping_add(offset))?;
    let high = bus.read_u64(state.tables.idtr.base.wrapping_add(offset + 8))?;
    let gate = GateDescriptor::parse64(low, high);

    if !gate.is_interrupt_gate() && !gate.is_trap_gate() {
        return Err(Exception::GeneralProtection(idt_fault_code(event)));
    }
    if event.class == EventClass::Software && gate.dpl < state.cpl() {
        return Err(Exception::GeneralProtection(idt_fault_code(event)));
    }
    if !gate.present {
        return Err(Exception::SegmentNotPresent(idt_fault_code(event)));
    }
    if !is_canonical(gate.offset) {
        return Err(Exception::gp0());
    }

    let new_cpl = (gate.selector & 0x3) as u8;
    let old_cpl = state.cpl();
    let ist = gate.param_count & 0x7;

    // 64-bit TSS: RSP0..RSP2 from +4, IST1..IST7 from +0x24.
    let target_rsp = if ist != 0 {
        let rsp = bus.read_u64(state.tables.tr.base.wrapping_add(0x24 + (ist as u64 - 1) * 8))?;
        if !is_canonical(rsp) {
            return Err(Exception::InvalidTss(0));
        }
        Some(rsp)
    } else if new_cpl < old_cpl {
        let rsp = bus.read_u64(state.tables.tr.base.wrapping_add(4 + new_cpl as u64 * 8))?;
        if !is_canonical(rsp) {
            return Err(Exception::InvalidTss(0));
        }
        Some(rsp)
    } else {
        None
    };

    let old_ss = state.segments.ss.selector;
    let old_rsp = state.read_gpr64(gpr::RSP);

    if let Some(rsp) = target_rsp {
        state.write_gpr64(gpr::RSP, rsp);
    }
    if new_cpl < old_cpl {
        // Inter-privilege interrupts in long mode load SS with null.
        state.segments.ss.selector = 0;
    }

    let flags = state.rflags();
    let old_cs = state.segments.cs.selector as u64;
    stack::push(state, bus, Width::W64, old_ss as u64)?;
    stack::push(state, bus, Width::W64, old_rsp)?;
    stack::push(state, bus, Width::W64, flags)?;
    stack::push(state, bus, Width::W64, old_cs)?;
    stack::push(state, bus, Width::W64, event.return_rip)?;
    if let Some(code) = event.error_code {
        stack::push(state, bus, Width::W64, code as u64)?;
    }

    if gate.is_interrupt_gate() {
        state.set_flag(FLAG_IF, false);
    }
    state.set_flag(FLAG_TF, false);
    state.set_flag(FLAG_NT, false);
    state.set_flag(FLAG_RF, false);

    state.segments.cs.selector = gate.selector;
    state.set_rip(gate.offset);
    state.update_mode();
    Ok(())
}

/// Flag bits an IRET/POPF at the current privilege may rewrite.
fn writable_flag_mask(state: &CpuState, width: Width) -> u64 {
    let mut mask = FLAG_CF
        | FLAG_PF
        | FLAG_AF
        | FLAG_ZF
        | FLAG_SF
        | FLAG_TF
        | FLAG_DF
        | FLAG_OF
        | FLAG_NT;
    if width != Width::W16 {
        mask |= FLAG_RF | FLAG_AC | FLAG_VIF | FLAG_VIP | FLAG_ID;
    }
    if state.cpl() == 0 {
        mask |= FLAG_IOPL_MASK;
    }
    if state.cpl() <= state.iopl() || !state.is_protected() {
        mask |= FLAG_IF;
    }
    mask
}

pub(crate) fn apply_flags(state: &mut CpuState, new_flags: u64, width: Width) {
    let mask = writable_flag_mask(state, width) & width.mask();
    let merged = (state.rflags() & !mask) | (new_flags & mask);
    state.set_rflags(merged);
}

/// The IRET family, parameterised by operand width.
pub(crate) fn iret_inner<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    width: Width,
) -> Result<(), Exception> {
    match state.mode() {
        CpuMode::Real => {
            let ip = stack::pop(state, bus, width)?;
            let cs = stack::pop(state, bus, width)? as u16;
            let flags = stack::pop(state, bus, width)?;
            apply_flags(state, flags, width);
            state.segments.cs.set_real_mode(cs);
            state.set_rip(ip & width.mask());
            Ok(())
        }
        CpuMode::Protected => {
            let old_cpl = state.cpl();
            let ip = stack::pop(state, bus, width)?;
            let cs = stack::pop(state, bus, width)? as u16;
            let flags = stack::pop(state, bus, width)?;
            let new_cpl = (cs & 0x3) as u8;
            if new_cpl < old_cpl {
                return Err(Exception::gp0());
            }

            if new_cpl > old_cpl {
                let sp = stack::pop(state, bus, width)?;
                let ss = stack::pop(state, bus, width)? as u16;
                apply_flags(state, flags, width);
                state.segments.cs.selector = cs;
                state.segments.ss.selector = ss;
                state.write_gpr64(gpr::RSP, sp & width.mask());
            } else {
                apply_flags(state, flags, width);
                state.segments.cs.selector = cs;
            }
            state.set_rip(ip & width.mask());
            Ok(())
        }
        CpuMode::Compatibility | CpuMode::Long => {
            let old_cpl = state.cpl();
            let ip = stack::pop(state, bus, Width::W64)?;
            let cs = stack::pop(state, bus, Width::W64)? as u16;
            let flags = stack::pop(state, bus, Width::W64)?;
            let sp = stack::pop(state, bus, Width::W64)?;
            let ss = stack::pop(state, bus, Width::W64)? as u16;

            let new_cpl = (cs & 0x3) as u8;
            if new_cpl < old_cpl {
                return Err(Exception::gp0());
            }
            if !is_canonical(ip) || !is_canonical(sp) {
                return Err(Exception::gp0());
            }

            apply_flags(state, flags, Width::W64);
            state.segments.cs.selector = cs;
            state.segments.ss.selector = ss;
            state.write_gpr64(gpr::RSP, sp);
            state.set_rip(ip);
            state.update_mode();
            Ok(())
        }
    }
}
