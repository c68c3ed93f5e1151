//! Register personality and the init-firmware handshake.

mod common;

use common::*;
use ironsas_hba::mfi::{self, FrameCommand, MfiStatus};
use ironsas_hba::MemoryBus;

#[test]
fn fresh_controller_advertises_ready_and_limits() {
    let (ctrl, _mem, _bus, irq) = setup();

    let word = ctrl.mmio_read(mfi::reg::OMSG0);
    assert_eq!(word & mfi::FWSTATE_MASK, mfi::FirmwareState::Ready as u32);
    assert_eq!((word >> 16) & 0xff, 80); // default SGE limit
    assert_eq!(word & 0xffff, 8); // configured command slots
    assert_eq!(ctrl.mmio_read(mfi::reg::OSP0), word);

    assert_eq!(ctrl.mmio_read(mfi::reg::OSP1), 15);
    assert_eq!(ctrl.mmio_read(mfi::reg::OMSK), 0xffff_ffff);
    assert_eq!(ctrl.mmio_read(mfi::reg::OSTS), 0);
    assert_eq!(ctrl.mmio_read(mfi::reg::ODCR0), 0);
    assert_eq!(ctrl.mmio_read(mfi::reg::IDB), 0);
    assert!(!irq.level());
    assert!(!ctrl.reply_queue_configured());
}

#[test]
fn port_window_aliases_the_register_file() {
    let (ctrl, _mem, _bus, _irq) = setup();
    assert_eq!(ctrl.port_read(mfi::reg::OMSG0), ctrl.mmio_read(mfi::reg::OMSG0));
    assert_eq!(ctrl.port_read(0x100 + mfi::reg::OMSK), ctrl.mmio_read(mfi::reg::OMSK));
}

#[test]
fn init_firmware_enters_operational() {
    let (mut ctrl, mut mem, mut bus, _irq) = setup();
    init_firmware(&mut ctrl, &mut mem, &mut bus, 8, false);

    assert_eq!(ctrl.fw_state(), mfi::FirmwareState::Operational);
    assert!(ctrl.reply_queue_configured());
    let word = ctrl.mmio_read(mfi::reg::OMSG0);
    assert_eq!(word & mfi::FWSTATE_MASK, mfi::FirmwareState::Operational as u32);
    // The init frame's own completion is the first ring entry.
    assert_eq!(producer_index(&mem), 1);
    assert_eq!(reply_entry(&mem, 0, false), 0);
}

#[test]
fn init_rejects_a_ring_larger_than_the_slot_pool() {
    let (mut ctrl, mut mem, mut bus, _irq) = setup();

    let mut qinfo = [0u8; 32];
    qinfo[4..8].copy_from_slice(&9u32.to_le_bytes()); // 9 > 8 slots
    qinfo[8..12].copy_from_slice(&(RING_ADDR as u32).to_le_bytes());
    qinfo[16..20].copy_from_slice(&(CONSUMER_ADDR as u32).to_le_bytes());
    qinfo[24..28].copy_from_slice(&(PRODUCER_ADDR as u32).to_le_bytes());
    mem.write_physical(QINFO_ADDR, &qinfo).unwrap();

    GuestFrame::new(FrameCommand::Init)
        .context(0)
        .init_qinfo(QINFO_ADDR)
        .store(&mut mem, FRAME_ADDR);
    submit(&mut ctrl, &mut mem, &mut bus, FRAME_ADDR);

    assert_eq!(
        frame_cmd_status(&mem, FRAME_ADDR),
        MfiStatus::INVALID_PARAMETER.0
    );
    assert_eq!(ctrl.fw_state(), mfi::FirmwareState::Ready);
    assert!(!ctrl.reply_queue_configured());
}

#[test]
fn init_with_unmappable_queue_block() {
    let (mut ctrl, mut mem, mut bus, _irq) = setup();

    GuestFrame::new(FrameCommand::Init)
        .context(0)
        .init_qinfo(0x0010_0000) // beyond guest memory
        .store(&mut mem, FRAME_ADDR);
    submit(&mut ctrl, &mut mem, &mut bus, FRAME_ADDR);

    assert_eq!(
        frame_cmd_status(&mem, FRAME_ADDR),
        MfiStatus::MEMORY_NOT_AVAILABLE.0
    );
    assert_eq!(ctrl.fw_state(), mfi::FirmwareState::Ready);
}

#[test]
fn second_init_leaves_the_ring_untouched() {
    let (mut ctrl, mut mem, mut bus, _irq) = setup();
    init_firmware(&mut ctrl, &mut mem, &mut bus, 8, false);
    let producer_before = producer_index(&mem);

    // Point a second init at a different (valid) queue block; the adapter
    // keeps the configuration it already has.
    let mut qinfo = [0u8; 32];
    qinfo[4..8].copy_from_slice(&4u32.to_le_bytes());
    qinfo[8..12].copy_from_slice(&0x9000u32.to_le_bytes());
    qinfo[16..20].copy_from_slice(&(CONSUMER_ADDR as u32).to_le_bytes());
    qinfo[24..28].copy_from_slice(&(PRODUCER_ADDR as u32).to_le_bytes());
    mem.write_physical(QINFO_ADDR, &qinfo).unwrap();

    GuestFrame::new(FrameCommand::Init)
        .context(0x33)
        .init_qinfo(QINFO_ADDR)
        .store(&mut mem, FRAME_ADDR);
    submit(&mut ctrl, &mut mem, &mut bus, FRAME_ADDR);

    assert_eq!(frame_cmd_status(&mem, FRAME_ADDR), MfiStatus::OK.0);
    assert_eq!(ctrl.fw_state(), mfi::FirmwareState::Operational);
    // Its completion still lands on the original ring.
    assert_eq!(producer_index(&mem), producer_before + 1);
    assert_eq!(reply_entry(&mem, producer_before as u64, false), 0x33);
}

#[test]
fn unknown_frame_commands_complete_with_invalid_cmd() {
    let (mut ctrl, mut mem, mut bus, _irq) = setup();
    init_firmware(&mut ctrl, &mut mem, &mut bus, 8, false);

    let mut frame = [0u8; 64];
    frame[0] = 0x4f;
    mem.write_physical(FRAME_ADDR, &frame).unwrap();
    submit(&mut ctrl, &mut mem, &mut bus, FRAME_ADDR);

    assert_eq!(frame_cmd_status(&mem, FRAME_ADDR), MfiStatus::INVALID_CMD.0);
    assert_eq!(ctrl.busy_count(), 0);
}

#[test]
fn smp_and_stp_frames_are_unsupported() {
    let (mut ctrl, mut mem, mut bus, _irq) = setup();
    init_firmware(&mut ctrl, &mut mem, &mut bus, 8, false);

    for cmd in [FrameCommand::Smp, FrameCommand::Stp] {
        GuestFrame::new(cmd).context(1).store(&mut mem, FRAME_ADDR);
        submit(&mut ctrl, &mut mem, &mut bus, FRAME_ADDR);
        assert_eq!(frame_cmd_status(&mem, FRAME_ADDR), MfiStatus::INVALID_CMD.0);
    }
}

#[test]
fn split_queue_port_submission_carries_high_bits() {
    let (mut ctrl, mut mem, mut bus, _irq) = setup();
    init_firmware(&mut ctrl, &mut mem, &mut bus, 8, false);

    // A frame submitted through IQPL/IQPH with a zero high half behaves
    // like the 64-bit port.
    GuestFrame::new(FrameCommand::Dcmd)
        .context(0x66)
        .dcmd(0x0bad_0000)
        .store(&mut mem, FRAME_ADDR);
    ctrl.mmio_write(mfi::reg::IQPH, 0, &mut mem, &mut bus);
    ctrl.mmio_write(mfi::reg::IQPL, FRAME_ADDR | (1 << 1), &mut mem, &mut bus);

    assert_eq!(frame_cmd_status(&mem, FRAME_ADDR), MfiStatus::OK.0);
    assert_eq!(reply_entry(&mem, 1, false), 0x66);
}

#[test]
fn completion_interrupts_respect_the_mask() {
    let (mut ctrl, mut mem, mut bus, irq) = setup();
    init_firmware(&mut ctrl, &mut mem, &mut bus, 8, false);

    // Mask interrupts again, complete a command: ring advances, no line.
    ctrl.mmio_write(mfi::reg::OMSK, 0xffff_ffff, &mut mem, &mut bus);
    GuestFrame::new(FrameCommand::Dcmd)
        .context(0x31)
        .dcmd(0x0bad_0000)
        .store(&mut mem, FRAME_ADDR);
    submit(&mut ctrl, &mut mem, &mut bus, FRAME_ADDR);
    assert!(!irq.level());
    assert_eq!(reply_entry(&mem, 1, false), 0x31);
    assert_eq!(ctrl.mmio_read(mfi::reg::OSTS), 0);

    // Unmask and complete another: the line rises once.
    ctrl.mmio_write(mfi::reg::OMSK, 0, &mut mem, &mut bus);
    GuestFrame::new(FrameCommand::Dcmd)
        .context(0x32)
        .dcmd(0x0bad_0000)
        .store(&mut mem, FRAME_ADDR);
    submit(&mut ctrl, &mut mem, &mut bus, FRAME_ADDR);
    assert!(irq.level());
    assert_eq!(ctrl.mmio_read(mfi::reg::ODCR0), 1);
}
