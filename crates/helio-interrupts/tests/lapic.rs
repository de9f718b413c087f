use helio_interrupts::apic::{LapicRegister, LvtTimerFlags};
use helio_interrupts::LocalApic;

const LVT_TIMER: u16 = LapicRegister::LvtTimer as u16;
const INIT_COUNT: u16 = LapicRegister::InitialCount as u16;
const CURR_COUNT: u16 = LapicRegister::CurrentCount as u16;
const DIV_CONF: u16 = LapicRegister::DivideConfig as u16;
const EOI: u16 = LapicRegister::Eoi as u16;

fn drain_timer(apic: &mut LocalApic, now_ns: u64) -> Vec<u8> {
    let mut fired = Vec::new();
    apic.advance_timer(now_ns, &mut |vector| fired.push(vector));
    fired
}

#[test]
fn queue_and_take_follow_highest_vector_priority() {
    let mut apic = LocalApic::new(0);
    apic.queue_vector(0x31);
    apic.queue_vector(0x80);
    apic.queue_vector(0x40);

    assert_eq!(apic.highest_pending(), Some(0x80));
    assert_eq!(apic.take_pending_vector(), Some(0x80));
    assert_eq!(apic.in_service(), Some(0x80));

    // Nothing else is offered while one vector is in service.
    assert_eq!(apic.highest_pending(), None);

    apic.end_of_interrupt();
    assert_eq!(apic.take_pending_vector(), Some(0x40));
    apic.end_of_interrupt();
    assert_eq!(apic.take_pending_vector(), Some(0x31));
    apic.end_of_interrupt();
    assert_eq!(apic.take_pending_vector(), None);
}

#[test]
fn duplicate_queue_while_pending_or_in_service_is_dropped() {
    let mut apic = LocalApic::new(0);
    apic.queue_vector(0x55);
    apic.queue_vector(0x55);
    assert_eq!(apic.take_pending_vector(), Some(0x55));
    assert_eq!(apic.highest_pending(), None, "second copy was merged");

    // While 0x55 is in service, another 0x55 is also dropped.
    apic.queue_vector(0x55);
    apic.end_of_interrupt();
    assert_eq!(apic.take_pending_vector(), None);
}

#[test]
fn irr_isr_words_visible_through_register_window() {
    let mut apic = LocalApic::new(0);
    apic.queue_vector(0x41); // word 2, bit 1

    assert_eq!(apic.mmio_read(0x200 + 2 * 0x10), 1 << 1);
    apic.take_pending_vector();
    assert_eq!(apic.mmio_read(0x200 + 2 * 0x10), 0);
    assert_eq!(apic.mmio_read(0x100 + 2 * 0x10), 1 << 1);

    apic.mmio_write(EOI, 0);
    assert_eq!(apic.mmio_read(0x100 + 2 * 0x10), 0);
}

#[test]
fn one_shot_timer_fires_exactly_once_after_count_ticks() {
    let mut apic = LocalApic::new(0);
    apic.mmio_write(DIV_CONF, 0b1011); // divide by 1: 1 tick per ns
    apic.mmio_write(LVT_TIMER, 0x40); // vector 0x40, unmasked, one-shot
    apic.mmio_write(INIT_COUNT, 1000);

    assert!(drain_timer(&mut apic, 999).is_empty());
    assert_eq!(apic.mmio_read(CURR_COUNT), 1);

    assert_eq!(drain_timer(&mut apic, 1000), vec![0x40]);
    assert_eq!(apic.mmio_read(CURR_COUNT), 0);

    // No further expirations, ever.
    assert!(drain_timer(&mut apic, 1_000_000).is_empty());
}

#[test]
fn divider_scales_tick_rate() {
    let mut apic = LocalApic::new(0);
    apic.mmio_write(DIV_CONF, 0b0001); // divide by 4
    apic.mmio_write(LVT_TIMER, 0x40);
    apic.mmio_write(INIT_COUNT, 100);

    assert!(drain_timer(&mut apic, 399).is_empty());
    assert_eq!(drain_timer(&mut apic, 400), vec![0x40]);
}

#[test]
fn fractional_ticks_accumulate_across_advances() {
    let mut apic = LocalApic::new(0);
    apic.mmio_write(DIV_CONF, 0b0000); // divide by 2
    apic.mmio_write(LVT_TIMER, 0x40);
    apic.mmio_write(INIT_COUNT, 2);

    // Four 1 ns advances = 2 ticks, despite each advance being sub-tick.
    assert!(drain_timer(&mut apic, 1).is_empty());
    assert!(drain_timer(&mut apic, 2).is_empty());
    assert!(drain_timer(&mut apic, 3).is_empty());
    assert_eq!(drain_timer(&mut apic, 4), vec![0x40]);
}

#[test]
fn periodic_timer_reloads_from_initial_count() {
    let mut apic = LocalApic::new(0);
    apic.mmio_write(DIV_CONF, 0b1011);
    apic.mmio_write(LVT_TIMER, 0x40 | LvtTimerFlags::PERIODIC.bits());
    apic.mmio_write(INIT_COUNT, 100);

    assert_eq!(drain_timer(&mut apic, 350), vec![0x40, 0x40, 0x40]);
    assert_eq!(apic.mmio_read(CURR_COUNT), 50);
}

#[test]
fn masked_lvt_timer_expires_silently() {
    let mut apic = LocalApic::new(0);
    apic.mmio_write(DIV_CONF, 0b1011);
    apic.mmio_write(LVT_TIMER, 0x40 | LvtTimerFlags::MASKED.bits());
    apic.mmio_write(INIT_COUNT, 10);

    assert!(drain_timer(&mut apic, 100).is_empty());
    assert_eq!(apic.mmio_read(CURR_COUNT), 0, "count still drains");
}

#[test]
fn writing_initial_count_rearms_the_timer() {
    let mut apic = LocalApic::new(0);
    apic.mmio_write(DIV_CONF, 0b1011);
    apic.mmio_write(LVT_TIMER, 0x40);
    apic.mmio_write(INIT_COUNT, 100);
    assert_eq!(drain_timer(&mut apic, 100), vec![0x40]);

    apic.mmio_write(INIT_COUNT, 50);
    assert_eq!(apic.mmio_read(CURR_COUNT), 50);
    assert_eq!(drain_timer(&mut apic, 150), vec![0x40]);
}

#[test]
fn svr_software_enable_bit_is_tracked() {
    let mut apic = LocalApic::new(0);
    assert!(!apic.software_enabled(), "SVR bit 8 is clear after reset");
    apic.mmio_write(LapicRegister::SpuriousVector as u16, 0x1FF);
    assert!(apic.software_enabled());
}

#[test]
fn id_and_version_registers() {
    let mut apic = LocalApic::new(3);
    assert_eq!(apic.mmio_read(0x20) >> 24, 3);
    assert_eq!(apic.mmio_read(0x30) & 0xFF, 0x14);
}
