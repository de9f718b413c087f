use helio_cpu_core::interrupts::{CpuCore, InterruptController};
use helio_cpu_core::mem::{CpuBus, FlatTestBus};
use helio_cpu_core::state::{gpr, CpuMode, FLAG_IF, FLAG_IOPL_MASK, SEG_ACCESS_PRESENT};
use helio_cpu_core::{CpuExit, Exception};
use helio_x86::Register;
use pretty_assertions::{assert_eq, assert_ne};

fn write_idt_gate32(
    mem: &mut impl CpuBus,
    base: u64,
    vector: u8,
    selector: u16,
    offset: u32,
    type_attr: u8,
) {
    let addr = base + (vector as u64) * 8;
    mem.write_u16(addr, (offset & 0xFFFF) as u16).unwrap();
    mem.write_u16(addr + 2, selector).unwrap();
    mem.write_u8(addr + 4, 0).unwrap();
    mem.write_u8(addr + 5, type_attr).unwrap();
    mem.write_u16(addr + 6, (offset >> 16) as u16).unwrap();
}

fn write_idt_gate64(
    mem: &mut impl CpuBus,
    base: u64,
    vector: u8,
    selector: u16,
    offset: u64,
    ist: u8,
    type_attr: u8,
) {
    let addr = base + (vector as u64) * 16;
    mem.write_u16(addr, (offset & 0xFFFF) as u16).unwrap();
    mem.write_u16(addr + 2, selector).unwrap();
    mem.write_u8(addr + 4, ist & 0x7).unwrap();
    mem.write_u8(addr + 5, type_attr).unwrap();
    mem.write_u16(addr + 6, ((offset >> 16) & 0xFFFF) as u16)
        .unwrap();
    mem.write_u32(addr + 8, ((offset >> 32) & 0xFFFF_FFFF) as u32)
        .unwrap();
    mem.write_u32(addr + 12, 0).unwrap();
}

#[test]
fn int_real_mode_uses_ivt_and_pushes_frame() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x40000);

    // IVT[0x10] = 2222:1111
    mem.write_u16(0x10 * 4, 0x1111).unwrap();
    mem.write_u16(0x10 * 4 + 2, 0x2222).unwrap();

    let mut cpu = CpuCore::new(CpuMode::Real);
    cpu.state.write_reg(Register::CS, 0x1234);
    cpu.state.write_reg(Register::SS, 0x2000);
    cpu.state.write_reg(Register::SP, 0xFFFE);
    cpu.state.set_rflags(0x202);

    cpu.pending.raise_software_interrupt(0x10, 0x5678);
    cpu.deliver_pending_event(&mut mem)?;

    assert_eq!(cpu.state.segments.cs.selector, 0x2222);
    assert_eq!(cpu.state.rip(), 0x1111);
    assert_eq!(cpu.state.read_reg(Register::SP) as u16, 0xFFF8);
    assert_eq!(cpu.state.rflags() & FLAG_IF, 0, "IF cleared");

    let stack_base = 0x2000u64 << 4;
    assert_eq!(mem.read_u16(stack_base + 0xFFF8).unwrap(), 0x5678); // IP
    assert_eq!(mem.read_u16(stack_base + 0xFFFA).unwrap(), 0x1234); // CS
    assert_eq!(mem.read_u16(stack_base + 0xFFFC).unwrap(), 0x0202); // FLAGS

    Ok(())
}

#[test]
fn int_protected_mode_same_ring_pushes_eflags_cs_eip() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x10000);

    let idt_base = 0x1000;
    write_idt_gate32(&mut mem, idt_base, 0x80, 0x08, 0x2000, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x08;
    cpu.state.segments.ss.selector = 0x10;
    cpu.state.write_gpr32(gpr::RSP, 0x1000);
    cpu.state.set_rflags(0x202);

    cpu.pending.raise_software_interrupt(0x80, 0x1234);
    cpu.deliver_pending_event(&mut mem)?;

    assert_eq!(cpu.state.rip(), 0x2000);
    assert_eq!(cpu.state.read_gpr32(gpr::RSP), 0x0FF4);
    assert_eq!(cpu.state.rflags() & FLAG_IF, 0, "interrupt gate clears IF");

    assert_eq!(mem.read_u32(0x0FF4).unwrap(), 0x1234); // EIP
    assert_eq!(mem.read_u32(0x0FF8).unwrap(), 0x08); // CS
    assert_eq!(mem.read_u32(0x0FFC).unwrap(), 0x202); // EFLAGS

    Ok(())
}

#[test]
fn trap_gate_preserves_if() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x10000);

    let idt_base = 0x1000;
    write_idt_gate32(&mut mem, idt_base, 0x81, 0x08, 0x2000, 0x8F); // trap gate

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x08;
    cpu.state.segments.ss.selector = 0x10;
    cpu.state.write_gpr32(gpr::RSP, 0x1000);
    cpu.state.set_rflags(0x202);

    cpu.pending.raise_software_interrupt(0x81, 0x1234);
    cpu.deliver_pending_event(&mut mem)?;

    assert_ne!(cpu.state.rflags() & FLAG_IF, 0, "trap gate keeps IF");
    Ok(())
}

#[test]
fn software_int_through_low_dpl_gate_faults() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x10000);

    let idt_base = 0x1000;
    // INT 0x80 gate with DPL 0; invoked from CPL 3 it must #GP.
    write_idt_gate32(&mut mem, idt_base, 0x80, 0x08, 0x2000, 0x8E);
    // #GP handler, DPL 0, reachable because faults ignore gate DPL.
    write_idt_gate32(&mut mem, idt_base, 13, 0x08, 0x3000, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x1B; // CPL3
    cpu.state.segments.ss.selector = 0x23;
    cpu.state.write_gpr32(gpr::RSP, 0x1000);
    cpu.state.set_rflags(0x202);

    // Ring-0 stack for the #GP delivery.
    let tss_base = 0x8000u64;
    cpu.state.tables.tr.base = tss_base;
    cpu.state.tables.tr.limit = 0x67;
    cpu.state.tables.tr.access = SEG_ACCESS_PRESENT | 0x9;
    mem.write_u32(tss_base + 4, 0x9000).unwrap();
    mem.write_u16(tss_base + 8, 0x10).unwrap();

    cpu.pending.raise_software_interrupt(0x80, 0x1234);
    cpu.deliver_pending_event(&mut mem)?;

    assert_eq!(cpu.state.rip(), 0x3000, "redirected to #GP handler");
    assert_eq!(cpu.state.segments.cs.selector, 0x08);
    Ok(())
}

#[test]
fn int_protected_cpl3_to_cpl0_switches_stack_and_iret_returns() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x20000);

    let idt_base = 0x1000;
    write_idt_gate32(&mut mem, idt_base, 0x80, 0x08, 0x3000, 0xEE);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x1B; // CPL3
    cpu.state.segments.ss.selector = 0x23;
    cpu.state.write_gpr32(gpr::RSP, 0x8000);
    cpu.state.set_rflags(0x202);

    let tss_base = 0x18000u64;
    cpu.state.tables.tr.selector = 0x40;
    cpu.state.tables.tr.base = tss_base;
    cpu.state.tables.tr.limit = 0x67;
    cpu.state.tables.tr.access = SEG_ACCESS_PRESENT | 0x9;
    mem.write_u32(tss_base + 4, 0x9000).unwrap(); // ESP0
    mem.write_u16(tss_base + 8, 0x10).unwrap(); // SS0

    cpu.pending.raise_software_interrupt(0x80, 0x0040_0000);
    cpu.deliver_pending_event(&mut mem)?;

    assert_eq!(cpu.state.segments.cs.selector, 0x08);
    assert_eq!(cpu.state.segments.ss.selector, 0x10);
    assert_eq!(cpu.state.rip(), 0x3000);
    assert_eq!(cpu.state.read_gpr32(gpr::RSP), 0x8FEC);

    // New frame, top down: EIP, CS, EFLAGS, old ESP, old SS.
    assert_eq!(mem.read_u32(0x8FEC).unwrap(), 0x0040_0000);
    assert_eq!(mem.read_u32(0x8FF0).unwrap(), 0x1B);
    assert_eq!(mem.read_u32(0x8FF4).unwrap(), 0x202);
    assert_eq!(mem.read_u32(0x8FF8).unwrap(), 0x8000);
    assert_eq!(mem.read_u32(0x8FFC).unwrap(), 0x23);

    cpu.iret(&mut mem)?;

    assert_eq!(cpu.state.segments.cs.selector, 0x1B);
    assert_eq!(cpu.state.segments.ss.selector, 0x23);
    assert_eq!(cpu.state.rip(), 0x0040_0000);
    assert_eq!(cpu.state.read_gpr32(gpr::RSP), 0x8000);
    assert_ne!(cpu.state.rflags() & FLAG_IF, 0, "IF restored at ring 0");

    Ok(())
}

#[test]
fn page_fault_sets_cr2_and_pushes_error_code() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x20000);

    let idt_base = 0x1000;
    write_idt_gate32(&mut mem, idt_base, 14, 0x08, 0x4000, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x08;
    cpu.state.segments.ss.selector = 0x10;
    cpu.state.write_gpr32(gpr::RSP, 0x2000);
    cpu.state.set_rflags(0x202);

    cpu.pending.raise_exception_fault(
        Exception::PageFault {
            addr: 0xCAFE_BABE,
            error_code: 0xDEAD,
        },
        0x1234_5678,
    );
    cpu.deliver_pending_event(&mut mem)?;

    assert_eq!(cpu.state.control.cr2, 0xCAFE_BABE);
    assert_eq!(cpu.state.rip(), 0x4000);
    assert_eq!(cpu.state.read_gpr32(gpr::RSP), 0x1FF0);

    // Top down: error code, EIP, CS, EFLAGS.
    assert_eq!(mem.read_u32(0x1FF0).unwrap(), 0xDEAD);
    assert_eq!(mem.read_u32(0x1FF4).unwrap(), 0x1234_5678);
    assert_eq!(mem.read_u32(0x1FF8).unwrap(), 0x08);
    assert_eq!(mem.read_u32(0x1FFC).unwrap(), 0x202);

    Ok(())
}

/// Bus wrapper that fails the first N 32-bit writes with a write-intent
/// page fault, to force nested faults during delivery.
struct FailingWriteBus {
    inner: FlatTestBus,
    remaining_failures: usize,
}

impl FailingWriteBus {
    fn new(size: usize, failures: usize) -> Self {
        Self {
            inner: FlatTestBus::new(size),
            remaining_failures: failures,
        }
    }
}

impl CpuBus for FailingWriteBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Exception> {
        self.inner.read_u8(vaddr)
    }

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Exception> {
        self.inner.write_u8(vaddr, val)
    }

    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Exception> {
        if self.remaining_failures > 0 {
            self.remaining_failures -= 1;
            return Err(Exception::PageFault {
                addr: vaddr,
                error_code: 0x2,
            });
        }
        self.inner.write_u32(vaddr, val)
    }

    fn io_read(&mut self, port: u16, size: u32) -> Result<u64, Exception> {
        self.inner.io_read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u32, val: u64) -> Result<(), Exception> {
        self.inner.io_write(port, size, val)
    }
}

#[test]
fn fault_during_page_fault_delivery_escalates_to_double_fault() -> Result<(), CpuExit> {
    let mut mem = FailingWriteBus::new(0x20000, 1);

    let idt_base = 0x1000;
    write_idt_gate32(&mut mem, idt_base, 14, 0x08, 0x4000, 0x8E);
    write_idt_gate32(&mut mem, idt_base, 8, 0x08, 0x5000, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x08;
    cpu.state.segments.ss.selector = 0x10;
    cpu.state.write_gpr32(gpr::RSP, 0x2000);
    cpu.state.set_rflags(0x202);

    cpu.pending.raise_exception_fault(
        Exception::PageFault {
            addr: 0xCAFE_BABE,
            error_code: 0xDEAD,
        },
        0x1234,
    );
    cpu.deliver_pending_event(&mut mem)?;

    // CR2 reflects the nested fault raised while pushing the first frame.
    assert_eq!(cpu.state.control.cr2, 0x1FFC);
    assert_eq!(cpu.state.rip(), 0x5000);

    // #DF frame: error code 0, then EIP/CS/EFLAGS.
    assert_eq!(cpu.state.read_gpr32(gpr::RSP), 0x1FEC);
    assert_eq!(mem.inner.mem()[0x1FEC], 0);
    assert_eq!(mem.read_u32(0x1FF0).unwrap(), 0x1234);
    assert_eq!(mem.read_u32(0x1FF4).unwrap(), 0x08);
    assert_eq!(mem.read_u32(0x1FF8).unwrap(), 0x202);

    Ok(())
}

#[test]
fn fault_during_double_fault_delivery_is_a_triple_fault() {
    let mut mem = FailingWriteBus::new(0x20000, 2);

    let idt_base = 0x1000;
    write_idt_gate32(&mut mem, idt_base, 14, 0x08, 0x4000, 0x8E);
    write_idt_gate32(&mut mem, idt_base, 8, 0x08, 0x5000, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x08;
    cpu.state.segments.ss.selector = 0x10;
    cpu.state.write_gpr32(gpr::RSP, 0x2000);
    cpu.state.set_rflags(0x202);

    cpu.pending.raise_exception_fault(
        Exception::PageFault {
            addr: 0x1234,
            error_code: 0x2,
        },
        0x1234,
    );
    assert_eq!(
        cpu.deliver_pending_event(&mut mem),
        Err(CpuExit::TripleFault)
    );
}

#[test]
fn sti_shadow_blocks_immediate_delivery() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x20000);

    let idt_base = 0x1000;
    write_idt_gate32(&mut mem, idt_base, 0x20, 0x08, 0x5555, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x08;
    cpu.state.segments.ss.selector = 0x10;
    cpu.state.write_gpr32(gpr::RSP, 0x3000);
    cpu.state.set_rip(0x1111);
    cpu.state.set_rflags(0x202);

    cpu.pending.inhibit_interrupts_for_one_instruction();
    cpu.pending.inject_external_interrupt(0x20);

    cpu.deliver_external_interrupt(&mut mem)?;
    assert_eq!(cpu.state.rip(), 0x1111, "shadow blocks delivery");
    assert_eq!(cpu.pending.external_interrupts.len(), 1);

    cpu.pending.retire_instruction();
    cpu.deliver_external_interrupt(&mut mem)?;
    assert_eq!(cpu.state.rip(), 0x5555);
    assert!(cpu.pending.external_interrupts.is_empty());
    Ok(())
}

#[test]
fn cli_clears_shadow_immediately() {
    let mut cpu = CpuCore::new(CpuMode::Real);
    cpu.pending.inhibit_interrupts_for_one_instruction();
    assert!(cpu.pending.interrupt_shadow_active());
    cpu.pending.clear_interrupt_shadow();
    assert!(!cpu.pending.interrupt_shadow_active());
}

#[test]
fn delivery_wakes_halted_cpu() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x10000);

    let idt_base = 0x1000;
    write_idt_gate32(&mut mem, idt_base, 0x20, 0x08, 0x2000, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x08;
    cpu.state.segments.ss.selector = 0x10;
    cpu.state.write_gpr32(gpr::RSP, 0x1000);
    cpu.state.set_rflags(0x202);
    cpu.state.halted = true;

    cpu.pending.inject_external_interrupt(0x20);
    cpu.deliver_external_interrupt(&mut mem)?;

    assert!(!cpu.state.halted);
    assert_eq!(cpu.state.rip(), 0x2000);
    Ok(())
}

struct OneShotController(Option<u8>);

impl InterruptController for OneShotController {
    fn poll_interrupt(&mut self) -> Option<u8> {
        self.0.take()
    }
}

struct CountingController {
    vector: u8,
    polls: usize,
}

impl InterruptController for CountingController {
    fn poll_interrupt(&mut self) -> Option<u8> {
        self.polls += 1;
        Some(self.vector)
    }
}

#[test]
fn poll_uses_controller_only_when_interrupts_accepted() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x20000);

    // IF=0: controller must not be polled (the vector stays with it).
    let mut cpu = CpuCore::new(CpuMode::Real);
    cpu.state.set_rflags(0);
    let mut ctrl = CountingController {
        vector: 0x20,
        polls: 0,
    };
    cpu.poll_and_deliver_external_interrupt(&mut mem, &mut ctrl)?;
    assert_eq!(ctrl.polls, 0);
    assert!(cpu.pending.external_interrupts.is_empty());

    // Shadow active: same story.
    cpu.state.set_rflags(FLAG_IF);
    cpu.pending.inhibit_interrupts_for_one_instruction();
    cpu.poll_and_deliver_external_interrupt(&mut mem, &mut ctrl)?;
    assert_eq!(ctrl.polls, 0);

    Ok(())
}

#[test]
fn queued_vector_delivered_before_polling_controller() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x20000);

    let idt_base = 0x1000;
    write_idt_gate32(&mut mem, idt_base, 0x21, 0x08, 0x6666, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x08;
    cpu.state.segments.ss.selector = 0x10;
    cpu.state.write_gpr32(gpr::RSP, 0x3000);
    cpu.state.set_rip(0x1111);
    cpu.state.set_rflags(0x202);

    cpu.pending.inject_external_interrupt(0x21);
    let mut ctrl = CountingController {
        vector: 0x22,
        polls: 0,
    };
    cpu.poll_and_deliver_external_interrupt(&mut mem, &mut ctrl)?;

    assert_eq!(ctrl.polls, 0, "queued vector wins");
    assert_eq!(cpu.state.rip(), 0x6666);

    // An empty queue polls the controller.
    cpu.state.set_rip(0x1111);
    let mut one_shot = OneShotController(Some(0x21));
    cpu.poll_and_deliver_external_interrupt(&mut mem, &mut one_shot)?;
    assert_eq!(cpu.state.rip(), 0x6666);
    Ok(())
}

#[test]
fn long_mode_int_cpl3_to_cpl0_uses_rsp0_and_iretq_returns() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x40000);

    let idt_base = 0x1000;
    write_idt_gate64(&mut mem, idt_base, 0x80, 0x08, 0x5000, 0, 0xEE);

    let mut cpu = CpuCore::new(CpuMode::Long);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x0FFF;
    cpu.state.segments.cs.selector = 0x33; // CPL3
    cpu.state.segments.ss.selector = 0x2B;
    cpu.state.set_rip(0x4000_0000);
    cpu.state.write_gpr64(gpr::RSP, 0x7000);
    cpu.state.set_rflags(0x202);

    let tss_base = 0x10000u64;
    cpu.state.tables.tr.base = tss_base;
    cpu.state.tables.tr.limit = 0x67;
    cpu.state.tables.tr.access = SEG_ACCESS_PRESENT | 0x9;
    mem.write_u64(tss_base + 4, 0x9000).unwrap(); // RSP0

    cpu.pending.raise_software_interrupt(0x80, 0x4000_0010);
    cpu.deliver_pending_event(&mut mem)?;

    assert_eq!(cpu.state.segments.cs.selector, 0x08);
    assert_eq!(cpu.state.segments.ss.selector, 0, "null SS on ring change");
    assert_eq!(cpu.state.rip(), 0x5000);
    assert_eq!(cpu.state.read_gpr64(gpr::RSP), 0x9000 - 40);

    let frame = cpu.state.read_gpr64(gpr::RSP);
    assert_eq!(mem.read_u64(frame).unwrap(), 0x4000_0010); // RIP
    assert_eq!(mem.read_u64(frame + 8).unwrap(), 0x33); // CS
    assert_eq!(mem.read_u64(frame + 16).unwrap(), 0x202); // RFLAGS
    assert_eq!(mem.read_u64(frame + 24).unwrap(), 0x7000); // RSP
    assert_eq!(mem.read_u64(frame + 32).unwrap(), 0x2B); // SS

    cpu.iret(&mut mem)?;

    assert_eq!(cpu.state.segments.cs.selector, 0x33);
    assert_eq!(cpu.state.segments.ss.selector, 0x2B);
    assert_eq!(cpu.state.rip(), 0x4000_0010);
    assert_eq!(cpu.state.read_gpr64(gpr::RSP), 0x7000);
    Ok(())
}

#[test]
fn long_mode_ist_overrides_rsp0() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x40000);

    let idt_base = 0x1000;
    write_idt_gate64(&mut mem, idt_base, 0x81, 0x08, 0x6000, 1, 0xEE);

    let mut cpu = CpuCore::new(CpuMode::Long);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x0FFF;
    cpu.state.segments.cs.selector = 0x33;
    cpu.state.segments.ss.selector = 0x2B;
    cpu.state.set_rip(0x4000_0000);
    cpu.state.write_gpr64(gpr::RSP, 0x7000);
    cpu.state.set_rflags(0x202);

    let tss_base = 0x10000u64;
    cpu.state.tables.tr.base = tss_base;
    cpu.state.tables.tr.limit = 0x67;
    cpu.state.tables.tr.access = SEG_ACCESS_PRESENT | 0x9;
    mem.write_u64(tss_base + 4, 0x9000).unwrap(); // RSP0
    mem.write_u64(tss_base + 0x24, 0xA000).unwrap(); // IST1

    cpu.pending.raise_software_interrupt(0x81, 0x4000_0010);
    cpu.deliver_pending_event(&mut mem)?;

    assert_eq!(cpu.state.read_gpr64(gpr::RSP), 0xA000 - 40);

    cpu.iret(&mut mem)?;
    assert_eq!(cpu.state.rip(), 0x4000_0010);
    assert_eq!(cpu.state.read_gpr64(gpr::RSP), 0x7000);
    Ok(())
}

#[test]
fn non_canonical_rsp0_raises_invalid_tss() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x40000);

    let idt_base = 0x1000;
    write_idt_gate64(&mut mem, idt_base, 0x80, 0x08, 0x5000, 0, 0xEE);
    // #TS handler on IST1 so it can be delivered despite the bad RSP0.
    write_idt_gate64(&mut mem, idt_base, 10, 0x08, 0x6000, 1, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Long);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x0FFF;
    cpu.state.segments.cs.selector = 0x33;
    cpu.state.segments.ss.selector = 0x2B;
    cpu.state.set_rip(0x4000_0000);
    cpu.state.write_gpr64(gpr::RSP, 0x7000);
    cpu.state.set_rflags(0x202);

    let tss_base = 0x10000u64;
    cpu.state.tables.tr.base = tss_base;
    cpu.state.tables.tr.limit = 0x67;
    cpu.state.tables.tr.access = SEG_ACCESS_PRESENT | 0x9;
    mem.write_u64(tss_base + 4, 0x0001_0000_0000_0000).unwrap(); // non-canonical RSP0
    mem.write_u64(tss_base + 0x24, 0x9000).unwrap(); // IST1

    cpu.pending.raise_software_interrupt(0x80, 0x4000_0010);
    cpu.deliver_pending_event(&mut mem)?;

    assert_eq!(cpu.state.rip(), 0x6000);
    assert_eq!(cpu.state.segments.cs.selector, 0x08);

    // #TS frame on IST1: error code, RIP, CS, RFLAGS, RSP, SS.
    let frame = cpu.state.read_gpr64(gpr::RSP);
    assert_eq!(frame, 0x9000 - 48);
    assert_eq!(mem.read_u64(frame).unwrap(), 0); // error code
    assert_eq!(mem.read_u64(frame + 8).unwrap(), 0x4000_0010);
    Ok(())
}

#[test]
fn iretq_rejects_return_to_more_privileged_ring() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x40000);

    let idt_base = 0x1000;
    write_idt_gate64(&mut mem, idt_base, 0x80, 0x33, 0x5000, 0, 0xEE);
    write_idt_gate64(&mut mem, idt_base, 13, 0x08, 0x6000, 0, 0x8E);

    let mut cpu = CpuCore::new(CpuMode::Long);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x0FFF;
    cpu.state.segments.cs.selector = 0x33;
    cpu.state.segments.ss.selector = 0x2B;
    cpu.state.set_rip(0x4000_0000);
    cpu.state.write_gpr64(gpr::RSP, 0x7000);
    cpu.state.set_rflags(0x202);

    let tss_base = 0x10000u64;
    cpu.state.tables.tr.base = tss_base;
    cpu.state.tables.tr.limit = 0x67;
    cpu.state.tables.tr.access = SEG_ACCESS_PRESENT | 0x9;
    mem.write_u64(tss_base + 4, 0x9000).unwrap();

    cpu.pending.raise_software_interrupt(0x80, 0x4000_0010);
    cpu.deliver_pending_event(&mut mem)?;
    assert_eq!(cpu.state.rip(), 0x5000);

    // Corrupt the saved CS so IRETQ would climb from CPL3 to CPL0.
    let frame = cpu.state.read_gpr64(gpr::RSP);
    mem.write_u64(frame + 8, 0x08).unwrap();

    cpu.iret(&mut mem)?;
    assert_eq!(cpu.state.segments.cs.selector, 0x08);
    assert_eq!(cpu.state.rip(), 0x6000, "redirected to #GP handler");
    Ok(())
}

#[test]
fn iret_does_not_restore_iopl_from_user_frame() -> Result<(), CpuExit> {
    let mut mem = FlatTestBus::new(0x40000);

    let idt_base = 0x1000;
    // Gate keeps CPL3 so the IRET below runs unprivileged.
    write_idt_gate32(&mut mem, idt_base, 0x80, 0x1B, 0x5000, 0xEE);

    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.tables.idtr.base = idt_base;
    cpu.state.tables.idtr.limit = 0x7FF;
    cpu.state.segments.cs.selector = 0x1B;
    cpu.state.segments.ss.selector = 0x23;
    cpu.state.set_rip(0x4000_0000);
    cpu.state.write_gpr32(gpr::RSP, 0x7000);
    cpu.state.set_rflags(0x202); // IF=1, IOPL=0

    cpu.pending.raise_software_interrupt(0x80, 0x4000_0010);
    cpu.deliver_pending_event(&mut mem)?;

    // Doctor the saved EFLAGS to claim IOPL=3.
    let frame = cpu.state.read_gpr32(gpr::RSP) as u64;
    mem.write_u32(frame + 8, 0x202 | 3 << 12).unwrap();

    cpu.iret(&mut mem)?;

    assert_eq!(cpu.state.rip(), 0x4000_0010);
    assert_eq!(cpu.state.rflags() & FLAG_IOPL_MASK, 0);
    Ok(())
}
