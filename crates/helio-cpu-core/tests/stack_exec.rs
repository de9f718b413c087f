use helio_cpu_core::exec::step;
use helio_cpu_core::mem::{CpuBus, FlatTestBus};
use helio_cpu_core::state::{CpuMode, CpuState};
use helio_x86::Register;

fn exec_at(state: &mut CpuState, bus: &mut FlatTestBus, addr: u64, bytes: &[u8]) {
    bus.load(addr, bytes);
    state.set_rip(addr);
    step(state, bus).expect("step");
}

#[test]
fn push_pop_round_trips_through_memory() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.segments.ss.set_real_mode(0);
    state.write_reg(Register::SP, 0x1000);
    state.write_reg(Register::AX, 0xCAFE);

    exec_at(&mut state, &mut bus, 0, &[0x50]); // PUSH AX
    assert_eq!(state.read_reg(Register::SP), 0x0FFE);
    assert_eq!(bus.read_u16(0x0FFE).unwrap(), 0xCAFE);

    state.write_reg(Register::AX, 0);
    exec_at(&mut state, &mut bus, 1, &[0x58]); // POP AX
    assert_eq!(state.read_reg(Register::SP), 0x1000);
    assert_eq!(state.read_reg(Register::AX), 0xCAFE);
}

#[test]
fn push_sp_records_pre_decrement_value() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.segments.ss.set_real_mode(0);
    state.write_reg(Register::SP, 0x1000);

    exec_at(&mut state, &mut bus, 0, &[0x54]); // PUSH SP
    assert_eq!(bus.read_u16(0x0FFE).unwrap(), 0x1000);

    // Same property for the 32-bit stack.
    let mut state = CpuState::new(CpuMode::Protected);
    state.write_reg(Register::ESP, 0x2000);
    exec_at(&mut state, &mut bus, 0x10, &[0x54]); // PUSH ESP
    assert_eq!(bus.read_u32(0x1FFC).unwrap(), 0x2000);
}

#[test]
fn pusha_popa_is_identity_on_all_gprs() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.segments.ss.set_real_mode(0);

    let values = [
        (Register::AX, 0x1111u64),
        (Register::CX, 0x2222),
        (Register::DX, 0x3333),
        (Register::BX, 0x4444),
        (Register::BP, 0x6666),
        (Register::SI, 0x7777),
        (Register::DI, 0x8888),
    ];
    for (reg, value) in values {
        state.write_reg(reg, value);
    }
    state.write_reg(Register::SP, 0x1000);

    exec_at(&mut state, &mut bus, 0, &[0x60]); // PUSHA
    assert_eq!(state.read_reg(Register::SP), 0x1000 - 16);

    // Clobber everything, then POPA.
    for (reg, _) in values {
        state.write_reg(reg, 0xDEAD);
    }
    exec_at(&mut state, &mut bus, 1, &[0x61]); // POPA

    for (reg, value) in values {
        assert_eq!(state.read_reg(reg), value, "{reg:?}");
    }
    assert_eq!(state.read_reg(Register::SP), 0x1000);
}

#[test]
fn pusha_stores_original_sp_in_its_slot() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.segments.ss.set_real_mode(0);
    state.write_reg(Register::SP, 0x1000);

    exec_at(&mut state, &mut bus, 0, &[0x60]); // PUSHA
    // Slot order from the top: AX, CX, DX, BX, SP, BP, SI, DI.
    assert_eq!(bus.read_u16(0x1000 - 2 * 5).unwrap(), 0x1000);
}

#[test]
fn push_imm_sign_extends_byte_form() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.segments.ss.set_real_mode(0);
    state.write_reg(Register::SP, 0x1000);

    exec_at(&mut state, &mut bus, 0, &[0x6A, 0xFF]); // PUSH -1
    assert_eq!(bus.read_u16(0x0FFE).unwrap(), 0xFFFF);

    exec_at(&mut state, &mut bus, 2, &[0x68, 0x34, 0x12]); // PUSH 0x1234
    assert_eq!(bus.read_u16(0x0FFC).unwrap(), 0x1234);
}

#[test]
fn enter_leave_build_and_tear_down_frames() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.segments.ss.set_real_mode(0);
    state.write_reg(Register::SP, 0x1000);
    state.write_reg(Register::BP, 0x9999);

    exec_at(&mut state, &mut bus, 0, &[0xC8, 0x10, 0x00, 0x00]); // ENTER 16, 0
    assert_eq!(state.read_reg(Register::BP), 0x0FFE);
    assert_eq!(state.read_reg(Register::SP), 0x0FFE - 0x10);
    assert_eq!(bus.read_u16(0x0FFE).unwrap(), 0x9999);

    exec_at(&mut state, &mut bus, 4, &[0xC9]); // LEAVE
    assert_eq!(state.read_reg(Register::BP), 0x9999);
    assert_eq!(state.read_reg(Register::SP), 0x1000);
}

#[test]
fn long_mode_pushes_default_to_64_bit() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Long);
    state.write_reg(Register::RSP, 0x2000);
    state.write_reg(Register::RAX, 0x1122_3344_5566_7788);

    exec_at(&mut state, &mut bus, 0, &[0x50]); // PUSH RAX
    assert_eq!(state.read_reg(Register::RSP), 0x2000 - 8);
    assert_eq!(bus.read_u64(0x2000 - 8).unwrap(), 0x1122_3344_5566_7788);

    exec_at(&mut state, &mut bus, 1, &[0x5B]); // POP RBX
    assert_eq!(state.read_reg(Register::RBX), 0x1122_3344_5566_7788);
    assert_eq!(state.read_reg(Register::RSP), 0x2000);
}

#[test]
fn pushf_popf_keep_privileged_bits_at_cpl0() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.segments.ss.set_real_mode(0);
    state.write_reg(Register::SP, 0x1000);
    state.set_rflags(0x0246); // ZF, PF, IF

    exec_at(&mut state, &mut bus, 0, &[0x9C]); // PUSHF
    assert_eq!(bus.read_u16(0x0FFE).unwrap(), 0x0246);

    // Flip the pushed image and POPF it back.
    bus.write_u16(0x0FFE, 0x0002).unwrap();
    exec_at(&mut state, &mut bus, 1, &[0x9D]); // POPF
    assert_eq!(state.rflags() & 0xFFFF, 0x0002);
}
