use helio_x86::{gpr, Register, RegisterView, SegReg, Width};

#[test]
fn width_masks_and_sign_bits() {
    assert_eq!(Width::W8.mask(), 0xFF);
    assert_eq!(Width::W16.mask(), 0xFFFF);
    assert_eq!(Width::W32.mask(), 0xFFFF_FFFF);
    assert_eq!(Width::W64.mask(), u64::MAX);

    assert_eq!(Width::W8.sign_bit(), 0x80);
    assert_eq!(Width::W64.sign_bit(), 1 << 63);

    assert_eq!(Width::W8.sign_extend(0x80), 0xFFFF_FFFF_FFFF_FF80);
    assert_eq!(Width::W32.sign_extend(0x7FFF_FFFF), 0x7FFF_FFFF);
}

#[test]
fn high_byte_codes_require_no_rex() {
    // Code 4 at 8 bits is AH without REX, SPL with REX.
    assert_eq!(
        Register::from_code(4, Width::W8, false),
        RegisterView::High8(0)
    );
    assert_eq!(
        Register::from_code(4, Width::W8, true),
        RegisterView::Low8(gpr::RSP)
    );
    assert_eq!(
        Register::from_code(7, Width::W8, false),
        RegisterView::High8(3)
    );
    assert_eq!(
        Register::from_code(7, Width::W8, true),
        RegisterView::Low8(gpr::RDI)
    );
}

#[test]
fn extended_codes_map_to_upper_slots() {
    assert_eq!(
        Register::from_code(12, Width::W32, true),
        RegisterView::Dword(gpr::R12)
    );
    assert_eq!(
        Register::from_code(15, Width::W64, true),
        RegisterView::Qword(gpr::R15)
    );
}

#[test]
fn named_views_agree_with_encoded_views() {
    assert_eq!(Register::AH.view(), Register::from_code(4, Width::W8, false));
    assert_eq!(Register::SPL.view(), Register::from_code(4, Width::W8, true));
    assert_eq!(Register::AX.view(), RegisterView::Word(gpr::RAX));
    assert_eq!(Register::R11D.view(), RegisterView::Dword(gpr::R11));
    assert_eq!(Register::GS.view(), RegisterView::Segment(SegReg::Gs));
}

#[test]
fn segment_codes_follow_encoding_order() {
    assert_eq!(SegReg::from_code(0), Some(SegReg::Es));
    assert_eq!(SegReg::from_code(1), Some(SegReg::Cs));
    assert_eq!(SegReg::from_code(5), Some(SegReg::Gs));
    assert_eq!(SegReg::from_code(6), None);
    assert_eq!(SegReg::from_code(7), None);
}

#[cfg(not(target_arch = "wasm32"))]
mod properties {
    use super::*;
    use proptest::prelude::*;

    fn widths() -> impl Strategy<Value = Width> {
        prop_oneof![
            Just(Width::W8),
            Just(Width::W16),
            Just(Width::W32),
            Just(Width::W64),
        ]
    }

    proptest! {
        #[test]
        fn encoded_views_always_land_in_a_valid_slot(code in 0u8..16, w in widths(), rex: bool) {
            let slot = match Register::from_code(code, w, rex) {
                RegisterView::Low8(s)
                | RegisterView::High8(s)
                | RegisterView::Word(s)
                | RegisterView::Dword(s)
                | RegisterView::Qword(s) => s,
                RegisterView::Segment(_) => unreachable!(),
            };
            prop_assert!(slot < 16);
        }

        #[test]
        fn sign_extension_preserves_the_masked_value(w in widths(), value: u64) {
            let masked = value & w.mask();
            prop_assert_eq!(w.sign_extend(masked) & w.mask(), masked);
        }
    }
}
