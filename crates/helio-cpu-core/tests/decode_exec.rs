use helio_cpu_core::exec::{step, StepExit};
use helio_cpu_core::mem::{CpuBus, FlatTestBus};
use helio_cpu_core::state::{
    CpuMode, CpuState, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF,
};
use helio_x86::Register;

fn exec_at(state: &mut CpuState, bus: &mut FlatTestBus, addr: u64, bytes: &[u8]) -> StepExit {
    bus.load(addr, bytes);
    state.set_rip(addr);
    step(state, bus).expect("step")
}

#[test]
fn real_mode_add_ax_bx() {
    // ADD AX, BX with AX=0x1234, BX=0x0001 leaves AX=0x1235, IP=2.
    let mut bus = FlatTestBus::new(0x1000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.write_reg(Register::AX, 0x1234);
    state.write_reg(Register::BX, 0x0001);

    exec_at(&mut state, &mut bus, 0, &[0x01, 0xD8]);

    assert_eq!(state.read_reg(Register::AX), 0x1235);
    assert_eq!(state.rip(), 2);
    assert!(!state.get_flag(FLAG_ZF));
    assert!(!state.get_flag(FLAG_CF));
    assert!(!state.get_flag(FLAG_PF));
    assert!(!state.get_flag(FLAG_SF));
    assert!(!state.get_flag(FLAG_OF));
}

#[test]
fn conditional_branch_taken_and_not_taken() {
    let mut bus = FlatTestBus::new(0x1000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);

    // JE +5 with ZF=1 lands past the displacement.
    state.set_flag(FLAG_ZF, true);
    exec_at(&mut state, &mut bus, 0x100, &[0x74, 0x05]);
    assert_eq!(state.rip(), 0x107);

    // With ZF=0 it falls through.
    state.set_flag(FLAG_ZF, false);
    exec_at(&mut state, &mut bus, 0x100, &[0x74, 0x05]);
    assert_eq!(state.rip(), 0x102);
}

#[test]
fn inc_al_preserves_carry() {
    let mut bus = FlatTestBus::new(0x1000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.set_flag(FLAG_CF, true);
    state.write_reg(Register::AL, 0x0F);

    exec_at(&mut state, &mut bus, 0, &[0xFE, 0xC0]);

    assert_eq!(state.read_reg(Register::AL), 0x10);
    assert!(state.get_flag(FLAG_CF));
    assert!(state.get_flag(FLAG_AF));
    assert!(!state.get_flag(FLAG_OF));
    assert!(!state.get_flag(FLAG_ZF));
}

#[test]
fn each_step_consumes_exactly_one_instruction() {
    // A run of instructions with every displacement/immediate size in the
    // 16-bit map; IP must advance by the encoded length each time.
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.write_reg(Register::BX, 0x40);
    state.write_reg(Register::SI, 0x10);

    let program: &[(&[u8], u64)] = &[
        (&[0x90], 1),                               // NOP
        (&[0xB0, 0x12], 2),                         // MOV AL, imm8
        (&[0xB8, 0x34, 0x12], 3),                   // MOV AX, imm16
        (&[0x00, 0x00], 2),                         // ADD [BX+SI], AL
        (&[0x01, 0x40, 0x02], 3),                   // ADD [BX+SI+disp8], AX
        (&[0x01, 0x86, 0x00, 0x10], 4),             // ADD [BP+disp16], AX
        (&[0x81, 0x06, 0x00, 0x20, 0x34, 0x12], 6), // ADD [disp16], imm16
        (&[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12], 6), // MOV EAX, imm32 (0x66)
        (&[0x2E, 0xA0, 0x00, 0x30], 4),             // MOV AL, CS:[moffs16]
    ];

    let mut ip = 0x1000u64;
    for (bytes, len) in program {
        let exit = exec_at(&mut state, &mut bus, ip, bytes);
        assert!(matches!(
            exit,
            StepExit::Continue | StepExit::ContinueInhibitInterrupts
        ));
        assert_eq!(state.rip(), ip + len, "length of {bytes:02X?}");
        ip = state.rip();
    }
}

#[test]
fn operand_size_override_flips_width() {
    let mut bus = FlatTestBus::new(0x1000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.write_reg(Register::EAX, 0xAABB_CCDD);

    // 16-bit INC AX wraps within the word and leaves the high half alone.
    state.write_reg(Register::AX, 0xFFFF);
    exec_at(&mut state, &mut bus, 0, &[0x40]);
    assert_eq!(state.read_reg(Register::EAX), 0xAABB_0000);

    // 0x66-prefixed INC EAX works on the doubleword.
    state.write_reg(Register::EAX, 0x0000_FFFF);
    exec_at(&mut state, &mut bus, 0x10, &[0x66, 0x40]);
    assert_eq!(state.read_reg(Register::EAX), 0x0001_0000);
}

#[test]
fn segment_override_changes_source() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.segments.ds.set_real_mode(0x100); // base 0x1000
    state.segments.es.set_real_mode(0x200); // base 0x2000
    state.write_reg(Register::BX, 0x10);

    bus.write_u8(0x1010, 0x11).unwrap();
    bus.write_u8(0x2010, 0x22).unwrap();

    // MOV AL, [BX] defaults to DS.
    exec_at(&mut state, &mut bus, 0, &[0x8A, 0x07]);
    assert_eq!(state.read_reg(Register::AL), 0x11);

    // ES override redirects the same encoding.
    exec_at(&mut state, &mut bus, 0x10, &[0x26, 0x8A, 0x07]);
    assert_eq!(state.read_reg(Register::AL), 0x22);
}

#[test]
fn bp_based_addressing_defaults_to_stack_segment() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.segments.ss.set_real_mode(0x300); // base 0x3000
    state.segments.ds.set_real_mode(0x100);
    state.write_reg(Register::BP, 0x20);

    bus.write_u8(0x3028, 0x77).unwrap();

    // MOV AL, [BP+8]: implied SS.
    exec_at(&mut state, &mut bus, 0, &[0x8A, 0x46, 0x08]);
    assert_eq!(state.read_reg(Register::AL), 0x77);
}

#[test]
fn sib_scaled_index_addressing() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Protected);
    state.write_reg(Register::EBX, 0x1000);
    state.write_reg(Register::ECX, 0x40);

    bus.write_u32(0x1000 + 0x40 * 4 + 0x10, 0xCAFE_F00D).unwrap();

    // MOV EAX, [EBX + ECX*4 + 0x10]
    exec_at(&mut state, &mut bus, 0, &[0x8B, 0x44, 0x8B, 0x10]);
    assert_eq!(state.read_reg(Register::EAX), 0xCAFE_F00D);
}

#[test]
fn disp32_only_form_in_protected_mode() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Protected);
    bus.write_u32(0x4321, 0x1122_3344).unwrap();

    // MOV EAX, [disp32] (mod=00 rm=101)
    exec_at(&mut state, &mut bus, 0, &[0x8B, 0x05, 0x21, 0x43, 0x00, 0x00]);
    assert_eq!(state.read_reg(Register::EAX), 0x1122_3344);
}

#[test]
fn long_mode_rip_relative_addressing() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut state = CpuState::new(CpuMode::Long);

    // MOV EAX, [RIP+0x20] at 0x1000; instruction is 6 bytes.
    bus.write_u32(0x1000 + 6 + 0x20, 0x5566_7788).unwrap();
    exec_at(&mut state, &mut bus, 0x1000, &[0x8B, 0x05, 0x20, 0x00, 0x00, 0x00]);
    assert_eq!(state.read_reg(Register::EAX), 0x5566_7788);
}

#[test]
fn rex_prefixes_select_extended_registers() {
    let mut bus = FlatTestBus::new(0x1000);
    let mut state = CpuState::new(CpuMode::Long);

    // REX.W B8+r: MOV R8, imm64 (REX.B).
    exec_at(
        &mut state,
        &mut bus,
        0,
        &[0x49, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
    );
    assert_eq!(state.read_reg(Register::R8), 0x1122_3344_5566_7788);

    // MOV RAX, R8 (REX.W + REX.R on the reg field).
    exec_at(&mut state, &mut bus, 0x10, &[0x4C, 0x89, 0xC0]);
    assert_eq!(state.read_reg(Register::RAX), 0x1122_3344_5566_7788);
}

#[test]
fn rex_redirects_high_byte_codes() {
    let mut bus = FlatTestBus::new(0x1000);
    let mut state = CpuState::new(CpuMode::Long);
    state.write_reg(Register::RSP, 0x0000_0000_0000_AB00);
    state.write_reg(Register::RAX, 0x0000_0000_0000_CD00);

    // Without REX, 0x88 /r with reg=4 means AH.
    exec_at(&mut state, &mut bus, 0, &[0x88, 0xE3]); // MOV BL, AH
    assert_eq!(state.read_reg(Register::BL), 0xCD);

    // With REX, the same code means SPL.
    state.write_reg(Register::SPL, 0x5A);
    exec_at(&mut state, &mut bus, 0x10, &[0x40, 0x88, 0xE3]); // MOV BL, SPL
    assert_eq!(state.read_reg(Register::BL), 0x5A);
}

#[test]
fn unknown_opcode_is_invalid_opcode_fault() {
    let mut bus = FlatTestBus::new(0x100);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    bus.load(0, &[0x0F, 0xFF]);
    state.set_rip(0);

    assert_eq!(
        step(&mut state, &mut bus),
        Err(helio_cpu_core::Exception::InvalidOpcode)
    );
    assert_eq!(state.rip(), 0, "RIP stays at the faulting instruction");
}

#[test]
fn x87_escapes_decode_and_advance() {
    let mut bus = FlatTestBus::new(0x1000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);
    state.write_reg(Register::BX, 0x100);

    // FLD dword [BX] and FADD ST, ST(1): both skipped, lengths honoured.
    exec_at(&mut state, &mut bus, 0, &[0xD9, 0x07]);
    assert_eq!(state.rip(), 2);
    exec_at(&mut state, &mut bus, 0x10, &[0xD8, 0xC1]);
    assert_eq!(state.rip(), 0x12);
}

#[test]
fn mov_reg_imm_and_xchg() {
    let mut bus = FlatTestBus::new(0x1000);
    let mut state = CpuState::new(CpuMode::Real);
    state.segments.cs.set_real_mode(0);

    exec_at(&mut state, &mut bus, 0, &[0xBB, 0xFE, 0xCA]); // MOV BX, 0xCAFE
    exec_at(&mut state, &mut bus, 3, &[0xB8, 0x0D, 0xF0]); // MOV AX, 0xF00D
    exec_at(&mut state, &mut bus, 6, &[0x93]); // XCHG AX, BX

    assert_eq!(state.read_reg(Register::AX), 0xCAFE);
    assert_eq!(state.read_reg(Register::BX), 0xF00D);
}

#[test]
fn movzx_movsx_extend_correctly() {
    let mut bus = FlatTestBus::new(0x1000);
    let mut state = CpuState::new(CpuMode::Protected);
    state.write_reg(Register::BL, 0x80);

    exec_at(&mut state, &mut bus, 0, &[0x0F, 0xB6, 0xC3]); // MOVZX EAX, BL
    assert_eq!(state.read_reg(Register::EAX), 0x80);

    exec_at(&mut state, &mut bus, 0x10, &[0x0F, 0xBE, 0xC3]); // MOVSX EAX, BL
    assert_eq!(state.read_reg(Register::EAX), 0xFFFF_FF80);
}
