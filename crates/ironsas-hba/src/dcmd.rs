//! Administrative direct commands.
//!
//! A DCMD carries a flat 32-bit opcode, a 12-byte mailbox and at most one
//! scatter-gather segment naming the response buffer. Dispatch is a closed
//! match over the opcode space; anything unknown falls through to a
//! permissive no-op that reports success, matching firmware behaviour in
//! the field (guests probe many opcodes speculatively).
//!
//! Response structures are built into plain byte buffers at the offsets
//! documented next to each builder. Multi-step handlers park their slot as
//! pending and resume from [`resume`] when the internal backend request
//! completes.

use tracing::{trace, warn};

use ironsas_mfi::{dcmd as opcode, dev_state, FramePayload, MfiStatus, SglFormat};

use crate::bus::MemoryBus;
use crate::controller::{MegaraidController, Outcome, MAX_LD};
use crate::scsi::{DeviceInfo, ScsiBus};
use crate::slots::DcmdStep;

const INQUIRY: u8 = 0x12;
const VPD_PAGE_DEVICE_ID: u8 = 0x83;

// Response buffer sizes.
const CTRL_INFO_SIZE: usize = 1024;
const PROPERTIES_SIZE: usize = 96;
const BIOS_DATA_SIZE: usize = 64;
const DEFAULTS_SIZE: usize = 128;
const EVENT_LOG_STATE_SIZE: usize = 20;
const EVENT_DETAIL_SIZE: usize = 128;
const PD_LIST_HEADER_SIZE: usize = 8;
const PD_ADDRESS_SIZE: usize = 24;
const LD_LIST_SIZE: usize = 8 + MAX_LD as usize * 16;
const PD_INFO_SIZE: usize = 512;
const LD_INFO_SIZE: usize = 512;
const CONFIG_MAX_SIZE: usize = 4096;

// Scratch layout for the multi-step device-info handlers.
const INQUIRY_DATA_SIZE: usize = 96;
const VPD_PAGE83_SIZE: usize = 64;
const PD_INFO_INQUIRY_OFFSET: usize = 32;
const PD_INFO_VPD_OFFSET: usize = 128;
const LD_INFO_VPD_OFFSET: usize = 192;

// PD list query type (mailbox word 0): everything visible.
const PD_QUERY_TYPE_ALL: u16 = 0;

// Logical-drive cache policy bits reported by the config reader.
const LD_CACHE_READ_AHEAD: u8 = 0x04;
const LD_CACHE_READ_ADAPTIVE: u8 = 0x08;

/// Per-device SAS address: the 0x1221 magic prefix present in real
/// hardware, with the device id folded in.
fn device_sas_addr(target_id: u8) -> u64 {
    (0x1221u64 << 48) | ((target_id as u64) << 24)
}

fn inquiry_cdb(page: u8, alloc_len: u16) -> [u8; 6] {
    let mut cdb = [0u8; 6];
    cdb[0] = INQUIRY;
    if page > 0 {
        cdb[1] = 0x1;
        cdb[2] = page;
    }
    cdb[3..5].copy_from_slice(&alloc_len.to_be_bytes());
    cdb
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_ascii(buf: &mut [u8], offset: usize, len: usize, text: &str) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(len);
    buf[offset..offset + n].copy_from_slice(&bytes[..n]);
}

/// Route one DCMD frame. The slot is already mapped; the destination
/// segment (if any) is resolved here before the handler runs.
pub(crate) fn dispatch(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
    bus: &mut dyn ScsiBus,
) -> Outcome {
    let Some(frame) = ctrl.slots.get(index).frame.clone() else {
        return Outcome::Complete(MfiStatus::INVALID_CMD);
    };
    let FramePayload::Dcmd {
        opcode: op, mbox, ..
    } = frame.payload
    else {
        return Outcome::Complete(MfiStatus::INVALID_CMD);
    };

    if let Err(status) = map_dcmd(ctrl, index) {
        return Outcome::Complete(status);
    }
    ctrl.slots.get_mut(index).dcmd_opcode = Some(op);
    trace!(index, opcode = op, desc = describe(op), "dcmd");

    match op {
        opcode::CTRL_GET_INFO => Outcome::Complete(ctrl_get_info(ctrl, index, mem, bus)),
        opcode::CTRL_GET_PROPERTIES => Outcome::Complete(get_properties(ctrl, index, mem)),
        opcode::CTRL_SET_PROPERTIES => Outcome::Complete(set_properties(ctrl, index, mem)),
        opcode::CTRL_EVENT_GETINFO => Outcome::Complete(event_log_state(ctrl, index, mem)),
        opcode::CTRL_EVENT_WAIT => event_wait(ctrl, index, &mbox),
        opcode::CTRL_SHUTDOWN => Outcome::Complete(shutdown(ctrl)),
        opcode::CTRL_GET_TIME => Outcome::Complete(get_fw_time(ctrl, index, mem)),
        opcode::CTRL_SET_TIME => Outcome::Complete(set_fw_time(index, &mbox)),
        opcode::CTRL_BIOS_DATA_GET => Outcome::Complete(bios_data(ctrl, index, mem)),
        opcode::CTRL_MFC_DEFAULTS_GET => Outcome::Complete(mfc_defaults(ctrl, index, mem)),
        opcode::CTRL_CACHE_FLUSH => {
            trace!(index, "cache flush");
            Outcome::Complete(MfiStatus::OK)
        }
        opcode::PD_GET_LIST => Outcome::Complete(pd_get_list(ctrl, index, mem, bus)),
        opcode::PD_LIST_QUERY => Outcome::Complete(pd_list_query(ctrl, index, &mbox, mem, bus)),
        opcode::PD_GET_INFO => pd_get_info(ctrl, index, &mbox, bus),
        opcode::LD_GET_LIST => Outcome::Complete(ld_get_list(ctrl, index, mem, bus)),
        opcode::LD_GET_INFO => ld_get_info(ctrl, index, &mbox, bus),
        opcode::CFG_READ => Outcome::Complete(cfg_read(ctrl, index, mem, bus)),
        opcode::CLUSTER_RESET_LD => Outcome::Complete(MfiStatus::INVALID_DCMD),
        opcode::CTRL_MFI_HOST_MEM_ALLOC
        | opcode::CTRL_ALARM_GET
        | opcode::CTRL_ALARM_ENABLE
        | opcode::CTRL_ALARM_DISABLE
        | opcode::CTRL_ALARM_SILENCE
        | opcode::CTRL_ALARM_TEST
        | opcode::CTRL_EVENT_CLEAR
        | opcode::CTRL_EVENT_GET
        | opcode::CTRL_EVENT_COUNT
        | opcode::HIBERNATE_STANDBY
        | opcode::CTRL_BIOS_DATA_SET
        | opcode::CTRL_FACTORY_DEFAULTS
        | opcode::CTRL_MFC_DEFAULTS_SET
        | opcode::PD_STATE_SET
        | opcode::PD_REBUILD
        | opcode::PD_BLINK
        | opcode::PD_UNBLINK
        | opcode::LD_GET_PROP
        | opcode::LD_SET_PROP
        | opcode::LD_DELETE
        | opcode::CFG_ADD
        | opcode::CFG_CLEAR
        | opcode::CFG_FOREIGN_READ
        | opcode::CFG_FOREIGN_IMPORT
        | opcode::BBU_STATUS
        | opcode::BBU_CAPACITY_INFO
        | opcode::BBU_DESIGN_INFO
        | opcode::BBU_PROP_GET
        | opcode::CLUSTER
        | opcode::CLUSTER_RESET_ALL => Outcome::Complete(dummy(ctrl, index, op)),
        _ => {
            trace!(index, opcode = op, "unhandled dcmd opcode");
            Outcome::Complete(dummy(ctrl, index, op))
        }
    }
}

/// Resolve the destination buffer. Zero segments is legal (no payload);
/// more than one is a protocol violation.
fn map_dcmd(ctrl: &mut MegaraidController, index: usize) -> Result<(), MfiStatus> {
    let (sge_count, format, sgl_offset) = {
        let slot = ctrl.slots.get(index);
        let Some(frame) = slot.frame.as_ref() else {
            return Err(MfiStatus::INVALID_CMD);
        };
        let FramePayload::Dcmd { sgl_offset, .. } = frame.payload else {
            return Err(MfiStatus::INVALID_CMD);
        };
        (
            frame.header.sge_count as usize,
            SglFormat::from_flags(frame.header.flags),
            sgl_offset,
        )
    };
    if sge_count == 0 {
        trace!(index, "dcmd without payload segment");
        let slot = ctrl.slots.get_mut(index);
        slot.dcmd_seg = None;
        slot.xfer_len = 0;
        return Ok(());
    }
    if sge_count > 1 {
        trace!(index, sge_count, "dcmd with more than one segment");
        return Err(MfiStatus::INVALID_PARAMETER);
    }
    let segment = {
        let slot = ctrl.slots.get(index);
        let window = slot.window.as_deref().unwrap_or(&[]);
        match ironsas_mfi::sgl::decode(window, sgl_offset, 1, format, 1) {
            Ok(segments) => segments[0],
            Err(err) => {
                trace!(index, %err, "dcmd segment rejected");
                return Err(MfiStatus::INVALID_PARAMETER);
            }
        }
    };
    let slot = ctrl.slots.get_mut(index);
    slot.dcmd_seg = Some(segment);
    slot.xfer_len = segment.len as usize;
    Ok(())
}

/// Write a finished response into the resolved destination. The residual
/// (destination bytes not used) is subtracted from the recorded transfer
/// size; a destination smaller than the response is a protocol violation.
fn fill(
    ctrl: &mut MegaraidController,
    index: usize,
    data: &[u8],
    mem: &mut dyn MemoryBus,
) -> MfiStatus {
    let Some(segment) = ctrl.slots.get(index).dcmd_seg else {
        trace!(index, "dcmd response with no destination segment");
        return MfiStatus::INVALID_PARAMETER;
    };
    if (segment.len as usize) < data.len() {
        trace!(
            index,
            have = segment.len,
            need = data.len(),
            "dcmd destination too small"
        );
        return MfiStatus::INVALID_PARAMETER;
    }
    if let Err(err) = mem.write_physical(segment.addr, data) {
        warn!(index, %err, "dcmd response write failed");
        return MfiStatus::MEMORY_NOT_AVAILABLE;
    }
    ctrl.slots.get_mut(index).xfer_len = data.len();
    MfiStatus::OK
}

fn dummy(ctrl: &mut MegaraidController, index: usize, op: u32) -> MfiStatus {
    trace!(
        index,
        opcode = op,
        xfer = ctrl.slots.get(index).xfer_len,
        "dcmd treated as no-op"
    );
    MfiStatus::OK
}

/// Count of logical drives visible to the guest.
fn logical_drive_count(ctrl: &MegaraidController, bus: &dyn ScsiBus) -> usize {
    if ctrl.cfg.use_jbod {
        0
    } else {
        bus.devices()
            .iter()
            .filter(|dev| dev.target_id < MAX_LD && dev.lun == 0)
            .count()
    }
}

/// Controller inventory. Layout (little-endian):
///   0 pci vendor u16, 2 device u16, 4 subvendor u16, 6 subdevice u16,
///   8 host interface type, 9 device interface type, 10 port count,
///   16 port addresses (8 x u64),
///   80 product name (80 ascii), 160 serial number (32 ascii),
///   192 package version (96 ascii), 288 firmware time u64,
///   296 max arms, 297 max spans, 298 max arrays u16, 300 max lds u16,
///   302 max cmds u16, 304 max sg elements u16, 308 max request size u32,
///   312 lds present u16, 314 pds present u16, 316 pd disks present u16,
///   320 hw present u32, 324 memory size u16, 326 nvram size u16,
///   328 flash size u16, 332 raid levels u32, 336 adapter ops u32,
///   340 ld ops u32, 344 controller properties (same layout as
///   CTRL_GET_PROPERTIES), 440 pd ops u32, 444 pd mix support u32,
///   448 max strips per io u16.
fn ctrl_get_info(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
    bus: &mut dyn ScsiBus,
) -> MfiStatus {
    let mut info = vec![0u8; CTRL_INFO_SIZE];

    put_u16(&mut info, 0, 0x1000); // LSI Logic
    put_u16(&mut info, 2, 0x0060); // SAS1078
    put_u16(&mut info, 4, 0x1000);
    put_u16(&mut info, 6, 0x1013);
    info[8] = 0x04; // PCIe host interface
    info[9] = 0x08; // SAS 3G device interface
    info[10] = 8; // the firmware only reports 8 device ports

    for (i, dev) in bus.devices().iter().take(8).enumerate() {
        put_u64(&mut info, 16 + i * 8, device_sas_addr(dev.target_id));
    }

    put_ascii(&mut info, 80, 80, "MegaRAID SAS 8708EM2");
    put_ascii(&mut info, 160, 32, &ctrl.cfg.hba_serial);
    put_ascii(&mut info, 192, 96, "1.70-ironsas");
    put_u64(&mut info, 288, ctrl.cfg.fw_time);

    info[296] = 32; // max arms per array
    info[297] = 8; // max spans
    put_u16(&mut info, 298, 128); // max arrays
    put_u16(&mut info, 300, MAX_LD as u16);
    put_u16(&mut info, 302, ctrl.cfg.max_cmds as u16);
    put_u16(&mut info, 304, ctrl.cfg.max_sge as u16);
    put_u32(&mut info, 308, ironsas_mfi::MAX_SECTORS);

    let lds = logical_drive_count(ctrl, bus) as u16;
    let pds = bus.devices().len() as u16;
    put_u16(&mut info, 312, lds);
    put_u16(&mut info, 314, pds);
    put_u16(&mut info, 316, pds);

    put_u32(&mut info, 320, 0x7); // nvram | memory | flash present
    put_u16(&mut info, 324, 512); // memory size, MB
    put_u16(&mut info, 326, 32); // nvram size, KB
    put_u16(&mut info, 328, 16); // flash size, MB
    put_u32(&mut info, 332, 0x1); // RAID level 0 only
    put_u32(&mut info, 336, 0x2e); // rebuild rate, diagnostics, mixed arrays
    put_u32(&mut info, 340, 0x1f); // ld ops: cache/access/io/write/read policy
    fill_properties(&mut info[344..344 + PROPERTIES_SIZE]);
    put_u32(&mut info, 440, 0x3); // pd ops: force online/offline
    put_u32(&mut info, 444, 0x7); // pd mix: sas, sata, ld
    put_u16(&mut info, 448, ctrl.cfg.max_sge as u16);

    fill(ctrl, index, &info, mem)
}

/// Controller properties. Layout (little-endian):
///   0 predictive-fail poll interval u16, 2 interrupt throttle count u16,
///   4 interrupt throttle timeout u16, 6 rebuild rate, 7 patrol read rate,
///   8 bgi rate, 9 cc rate, 10 recon rate, 11 cache flush interval,
///   12 spinup drive count, 13 spinup delay, 14 ecc bucket size,
///   16 ecc bucket leak rate u16, 18 expose enclosure devices.
fn fill_properties(buf: &mut [u8]) {
    put_u16(buf, 0, 300);
    put_u16(buf, 2, 16);
    put_u16(buf, 4, 50);
    buf[6] = 30;
    buf[7] = 30;
    buf[8] = 30;
    buf[9] = 30;
    buf[10] = 30;
    buf[11] = 4;
    buf[12] = 2;
    buf[13] = 6;
    buf[14] = 15;
    put_u16(buf, 16, 1440);
    buf[18] = 1;
}

fn get_properties(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
) -> MfiStatus {
    let mut props = vec![0u8; PROPERTIES_SIZE];
    fill_properties(&mut props);
    fill(ctrl, index, &props, mem)
}

/// Accepted and ignored; the adapter has no tunable properties.
fn set_properties(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
) -> MfiStatus {
    let Some(segment) = ctrl.slots.get(index).dcmd_seg else {
        return MfiStatus::INVALID_PARAMETER;
    };
    if (segment.len as usize) < PROPERTIES_SIZE {
        trace!(index, len = segment.len, "set-properties buffer too small");
        return MfiStatus::INVALID_PARAMETER;
    }
    let mut props = vec![0u8; PROPERTIES_SIZE];
    if mem.read_physical(segment.addr, &mut props).is_err() {
        return MfiStatus::MEMORY_NOT_AVAILABLE;
    }
    trace!(index, "set properties ignored");
    MfiStatus::OK
}

/// Event log state: newest/oldest/cleared/shutdown/boot sequence numbers,
/// five u32 cells.
fn event_log_state(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
) -> MfiStatus {
    let mut state = vec![0u8; EVENT_LOG_STATE_SIZE];
    put_u32(&mut state, 0, ctrl.event_count);
    put_u32(&mut state, 12, ctrl.shutdown_event);
    put_u32(&mut state, 16, ctrl.boot_event);
    fill(ctrl, index, &state, mem)
}

/// Park the frame until an event fires. The mailbox carries the sequence
/// number the guest has seen and a locale/class filter word. Event frames
/// do not count against the busy total.
fn event_wait(ctrl: &mut MegaraidController, index: usize, mbox: &[u8; 12]) -> Outcome {
    let Some(segment) = ctrl.slots.get(index).dcmd_seg else {
        return Outcome::Complete(MfiStatus::INVALID_PARAMETER);
    };
    if (segment.len as usize) < EVENT_DETAIL_SIZE {
        trace!(index, len = segment.len, "event-wait buffer too small");
        return Outcome::Complete(MfiStatus::INVALID_PARAMETER);
    }
    let seq = u32::from_le_bytes(mbox[0..4].try_into().unwrap());
    let filter = u32::from_le_bytes(mbox[4..8].try_into().unwrap());
    ctrl.event_count = seq;
    ctrl.event_locale = filter as u16;
    ctrl.event_class = (filter >> 24) as i8;
    ctrl.event_slot = Some(index);
    ctrl.busy = ctrl.busy.saturating_sub(1);
    ctrl.slots.get_mut(index).xfer_len = EVENT_DETAIL_SIZE;
    trace!(
        index,
        seq,
        locale = ctrl.event_locale,
        class = ctrl.event_class,
        "event wait parked"
    );
    Outcome::Pending
}

fn shutdown(ctrl: &mut MegaraidController) -> MfiStatus {
    ctrl.shutdown_event = ctrl.event_count;
    ctrl.fw_state = ironsas_mfi::FirmwareState::Ready;
    MfiStatus::OK
}

fn get_fw_time(ctrl: &mut MegaraidController, index: usize, mem: &mut dyn MemoryBus) -> MfiStatus {
    let time = ctrl.cfg.fw_time.to_le_bytes();
    fill(ctrl, index, &time, mem)
}

/// Setting the firmware time is not allowed; accepted and discarded.
fn set_fw_time(index: usize, mbox: &[u8; 12]) -> MfiStatus {
    let requested = u64::from_le_bytes(mbox[0..8].try_into().unwrap());
    trace!(index, requested, "set firmware time ignored");
    MfiStatus::OK
}

/// BIOS boot data. Layout: 0 boot target u16, 2 do-not-int13, 3 continue
/// on error, 4 verbose, 5 geometry, 6 expose all drives.
fn bios_data(ctrl: &mut MegaraidController, index: usize, mem: &mut dyn MemoryBus) -> MfiStatus {
    let mut data = vec![0u8; BIOS_DATA_SIZE];
    data[3] = 1;
    data[4] = 1;
    if ctrl.cfg.use_jbod {
        data[6] = 1;
    }
    fill(ctrl, index, &data, mem)
}

/// Manufacturing defaults. Layout: 0 sas address u64, 8 stripe size,
/// 9 flush time, 10 background rate, 11 allow mix in enclosure, 12 allow
/// mix in ld, 13 direct pd mapping, 14 bios enumerate lds, 15 disable
/// ctrl-r, 16 expose enclosure devices, 17 disable preboot cli,
/// 18 cluster disabled.
fn mfc_defaults(ctrl: &mut MegaraidController, index: usize, mem: &mut dyn MemoryBus) -> MfiStatus {
    let mut defaults = vec![0u8; DEFAULTS_SIZE];
    put_u64(&mut defaults, 0, ctrl.sas_addr);
    defaults[8] = 3;
    defaults[9] = 4;
    defaults[10] = 30;
    defaults[11] = 1;
    defaults[12] = 1;
    defaults[13] = 1;
    defaults[14] = 1;
    defaults[15] = 1;
    defaults[16] = 1;
    defaults[17] = 1;
    defaults[18] = 1;
    fill(ctrl, index, &defaults, mem)
}

/// Physical-device list. Layout: 0 used size u32, 4 entry count u32, then
/// 24-byte entries: device id u16, enclosure id u16, enclosure index,
/// slot number, scsi device type, connected port bitmap, sas address u64 x2.
fn pd_get_list(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
    bus: &mut dyn ScsiBus,
) -> MfiStatus {
    let Some(segment) = ctrl.slots.get(index).dcmd_seg else {
        return MfiStatus::INVALID_PARAMETER;
    };
    if (segment.len as usize) < PD_LIST_HEADER_SIZE + PD_ADDRESS_SIZE {
        trace!(index, len = segment.len, "pd list buffer too small");
        return MfiStatus::INVALID_PARAMETER;
    }
    let max_entries = ((segment.len as usize - PD_LIST_HEADER_SIZE) / PD_ADDRESS_SIZE)
        .min(MAX_LD as usize);

    let devices = bus.devices();
    let entries = devices.iter().take(max_entries);
    let count = entries.clone().count();
    let used = PD_LIST_HEADER_SIZE + count * PD_ADDRESS_SIZE;

    let mut list = vec![0u8; used];
    put_u32(&mut list, 0, used as u32);
    put_u32(&mut list, 4, count as u32);
    for (i, dev) in entries.enumerate() {
        let at = PD_LIST_HEADER_SIZE + i * PD_ADDRESS_SIZE;
        put_u16(&mut list, at, dev.target_id as u16);
        put_u16(&mut list, at + 2, 0xffff); // no enclosure
        list[at + 4] = 0;
        list[at + 5] = dev.target_id;
        list[at + 6] = dev.device_type;
        list[at + 7] = 0x1;
        put_u64(&mut list, at + 8, device_sas_addr(dev.target_id));
    }
    trace!(index, count, used, "pd list");
    fill(ctrl, index, &list, mem)
}

fn pd_list_query(
    ctrl: &mut MegaraidController,
    index: usize,
    mbox: &[u8; 12],
    mem: &mut dyn MemoryBus,
    bus: &mut dyn ScsiBus,
) -> MfiStatus {
    let query = u16::from_le_bytes(mbox[0..2].try_into().unwrap());
    trace!(index, query, "pd list query");
    if query == PD_QUERY_TYPE_ALL || ctrl.cfg.use_jbod {
        pd_get_list(ctrl, index, mem, bus)
    } else {
        MfiStatus::OK
    }
}

/// Logical-drive list. Layout: 0 drive count u32, 8 onwards 16-byte
/// entries: target id, lun, state, pad, capacity in blocks u64 at +8.
/// The buffer is always the full fixed-size table.
fn ld_get_list(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
    bus: &mut dyn ScsiBus,
) -> MfiStatus {
    let Some(segment) = ctrl.slots.get(index).dcmd_seg else {
        return MfiStatus::INVALID_PARAMETER;
    };
    if (segment.len as usize) < LD_LIST_SIZE {
        trace!(index, len = segment.len, "ld list buffer too small");
        return MfiStatus::INVALID_PARAMETER;
    }
    let mut list = vec![0u8; LD_LIST_SIZE];
    let mut count = 0usize;
    if !ctrl.cfg.use_jbod {
        for dev in bus.devices() {
            if dev.target_id >= MAX_LD || dev.lun != 0 || count >= MAX_LD as usize {
                continue;
            }
            let at = 8 + count * 16;
            list[at] = dev.target_id;
            list[at + 1] = dev.lun;
            list[at + 2] = dev_state::LD_OPTIMAL;
            put_u64(&mut list, at + 8, dev.capacity_blocks);
            count += 1;
        }
    }
    put_u32(&mut list, 0, count as u32);
    trace!(index, count, "ld list");
    fill(ctrl, index, &list, mem)
}

/// First step of PD_GET_INFO: standard INQUIRY through the backend.
fn pd_get_info(
    ctrl: &mut MegaraidController,
    index: usize,
    mbox: &[u8; 12],
    bus: &mut dyn ScsiBus,
) -> Outcome {
    let Some(segment) = ctrl.slots.get(index).dcmd_seg else {
        return Outcome::Complete(MfiStatus::INVALID_PARAMETER);
    };
    if (segment.len as usize) < PD_INFO_SIZE {
        return Outcome::Complete(MfiStatus::INVALID_PARAMETER);
    }
    let pd_id = u16::from_le_bytes(mbox[0..2].try_into().unwrap());
    let Some(device) = lookup_by_id(bus, pd_id) else {
        trace!(index, pd_id, "pd info: device not present");
        return Outcome::Complete(MfiStatus::DEVICE_NOT_FOUND);
    };
    trace!(index, pd_id, "pd info: standard inquiry");
    ctrl.slots.get_mut(index).scratch = Some(vec![0u8; PD_INFO_SIZE]);
    match submit_internal(
        ctrl,
        index,
        &device,
        0,
        INQUIRY_DATA_SIZE as u16,
        DcmdStep::PdInquiry,
        bus,
    ) {
        Ok(()) => Outcome::Pending,
        Err(status) => {
            let slot = ctrl.slots.get_mut(index);
            slot.scratch = None;
            slot.dcmd_step = DcmdStep::None;
            Outcome::Complete(status)
        }
    }
}

/// First (and only backend) step of LD_GET_INFO: VPD page 0x83 INQUIRY.
fn ld_get_info(
    ctrl: &mut MegaraidController,
    index: usize,
    mbox: &[u8; 12],
    bus: &mut dyn ScsiBus,
) -> Outcome {
    let Some(segment) = ctrl.slots.get(index).dcmd_seg else {
        return Outcome::Complete(MfiStatus::INVALID_PARAMETER);
    };
    if (segment.len as usize) < LD_INFO_SIZE {
        return Outcome::Complete(MfiStatus::INVALID_PARAMETER);
    }
    let ld_id = u16::from_le_bytes(mbox[0..2].try_into().unwrap());
    if ctrl.cfg.use_jbod || ld_id >= MAX_LD as u16 {
        return Outcome::Complete(MfiStatus::DEVICE_NOT_FOUND);
    }
    let Some(device) = bus.device_info(ld_id as u8, 0) else {
        trace!(index, ld_id, "ld info: device not present");
        return Outcome::Complete(MfiStatus::DEVICE_NOT_FOUND);
    };
    trace!(index, ld_id, "ld info: vpd inquiry");
    ctrl.slots.get_mut(index).scratch = Some(vec![0u8; LD_INFO_SIZE]);
    match submit_internal(
        ctrl,
        index,
        &device,
        VPD_PAGE_DEVICE_ID,
        VPD_PAGE83_SIZE as u16,
        DcmdStep::LdVpd,
        bus,
    ) {
        Ok(()) => Outcome::Pending,
        Err(status) => {
            let slot = ctrl.slots.get_mut(index);
            slot.scratch = None;
            slot.dcmd_step = DcmdStep::None;
            Outcome::Complete(status)
        }
    }
}

fn submit_internal(
    ctrl: &mut MegaraidController,
    index: usize,
    device: &DeviceInfo,
    page: u8,
    alloc_len: u16,
    step: DcmdStep,
    bus: &mut dyn ScsiBus,
) -> Result<(), MfiStatus> {
    let cdb = inquiry_cdb(page, alloc_len);
    let Some(request) = bus.new_request(device.target_id, device.lun, index as u32, &cdb, &[])
    else {
        trace!(index, "internal inquiry allocation failed");
        return Err(MfiStatus::FLASH_ALLOC_FAIL);
    };
    {
        let slot = ctrl.slots.get_mut(index);
        slot.request = Some(request);
        slot.dcmd_step = step;
    }
    if bus.enqueue(request) != 0 {
        bus.continue_request(request);
    }
    Ok(())
}

/// Copy data from an internal inquiry into the slot scratch buffer.
pub(crate) fn absorb_xfer(ctrl: &mut MegaraidController, index: usize, data: &[u8]) {
    let slot = ctrl.slots.get_mut(index);
    let (offset, cap) = match slot.dcmd_step {
        DcmdStep::PdInquiry => (PD_INFO_INQUIRY_OFFSET, INQUIRY_DATA_SIZE),
        DcmdStep::PdVpd => (PD_INFO_VPD_OFFSET, VPD_PAGE83_SIZE),
        DcmdStep::LdVpd => (LD_INFO_VPD_OFFSET, VPD_PAGE83_SIZE),
        DcmdStep::None => return,
    };
    if let Some(scratch) = slot.scratch.as_mut() {
        let n = data.len().min(cap);
        scratch[offset..offset + n].copy_from_slice(&data[..n]);
    }
}

/// Resume a parked multi-step DCMD after its internal request completed.
pub(crate) fn resume(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
    bus: &mut dyn ScsiBus,
) -> Outcome {
    match ctrl.slots.get(index).dcmd_step {
        DcmdStep::PdInquiry => {
            // Standard inquiry landed; fetch the device-identification page.
            let Some(device) = dcmd_target(ctrl, index, bus) else {
                return Outcome::Complete(MfiStatus::DEVICE_NOT_FOUND);
            };
            trace!(index, "pd info: vpd inquiry");
            match submit_internal(
                ctrl,
                index,
                &device,
                VPD_PAGE_DEVICE_ID,
                VPD_PAGE83_SIZE as u16,
                DcmdStep::PdVpd,
                bus,
            ) {
                Ok(()) => Outcome::Pending,
                Err(status) => Outcome::Complete(status),
            }
        }
        DcmdStep::PdVpd => Outcome::Complete(finish_pd_info(ctrl, index, mem, bus)),
        DcmdStep::LdVpd => Outcome::Complete(finish_ld_info(ctrl, index, mem, bus)),
        DcmdStep::None => Outcome::Complete(MfiStatus::INVALID_DCMD),
    }
}

/// The device a parked device-info DCMD is interrogating.
fn dcmd_target(
    ctrl: &MegaraidController,
    index: usize,
    bus: &dyn ScsiBus,
) -> Option<DeviceInfo> {
    let frame = ctrl.slots.get(index).frame.as_ref()?;
    let FramePayload::Dcmd { mbox, .. } = &frame.payload else {
        return None;
    };
    let id = u16::from_le_bytes(mbox[0..2].try_into().unwrap());
    lookup_by_id(bus, id)
}

fn lookup_by_id(bus: &dyn ScsiBus, id: u16) -> Option<DeviceInfo> {
    u8::try_from(id).ok().and_then(|t| bus.device_info(t, 0))
}

/// Physical-device info. Layout: 0 device id u16, 2 sequence u16,
/// 32 inquiry data (96 bytes), 128 vpd page 0x83 (64 bytes),
/// 192 firmware state u16, 194 connected port bitmap, 195 device speed,
/// 196 link speed, 200 raw size u64, 208 non-coerced size u64,
/// 216 coerced size u64, 224 enclosure id u16, 226 slot number,
/// 227 path count, 232 sas address u64. Sizes in blocks.
fn finish_pd_info(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
    bus: &mut dyn ScsiBus,
) -> MfiStatus {
    let Some(device) = dcmd_target(ctrl, index, bus) else {
        return MfiStatus::DEVICE_NOT_FOUND;
    };
    let Some(mut info) = ctrl.slots.get_mut(index).scratch.take() else {
        return MfiStatus::INVALID_DCMD;
    };
    ctrl.slots.get_mut(index).dcmd_step = DcmdStep::None;

    // Peripheral qualifier 0 means the device answered its inquiry.
    let present = info[PD_INFO_INQUIRY_OFFSET] >> 5 == 0;
    let fw_state = if present {
        if ctrl.cfg.use_jbod {
            dev_state::PD_SYSTEM
        } else {
            dev_state::PD_ONLINE
        }
    } else {
        dev_state::PD_OFFLINE
    };

    put_u16(&mut info, 0, device.target_id as u16);
    put_u16(&mut info, 192, fw_state as u16);
    info[194] = 0x1;
    info[195] = 1;
    info[196] = 1;
    put_u64(&mut info, 200, device.capacity_blocks);
    put_u64(&mut info, 208, device.capacity_blocks);
    put_u64(&mut info, 216, device.capacity_blocks);
    put_u16(&mut info, 224, 0xffff);
    info[226] = device.target_id;
    info[227] = 1;
    put_u64(&mut info, 232, device_sas_addr(device.target_id));

    fill(ctrl, index, &info, mem)
}

/// Logical-drive info. Layout: 0 target id, 1 state, 2 stripe size,
/// 3 drive count, 4 consistent flag, 8 capacity in blocks u64,
/// 16 span start u64, 24 span blocks u64, 32 span array ref u16,
/// 192 vpd page 0x83 (64 bytes).
fn finish_ld_info(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
    bus: &mut dyn ScsiBus,
) -> MfiStatus {
    let Some(device) = dcmd_target(ctrl, index, bus) else {
        return MfiStatus::DEVICE_NOT_FOUND;
    };
    let Some(mut info) = ctrl.slots.get_mut(index).scratch.take() else {
        return MfiStatus::INVALID_DCMD;
    };
    ctrl.slots.get_mut(index).dcmd_step = DcmdStep::None;

    info[0] = device.target_id;
    info[1] = dev_state::LD_OPTIMAL;
    info[2] = 3; // 64k stripes
    info[3] = 1;
    info[4] = 1;
    put_u64(&mut info, 8, device.capacity_blocks);
    put_u64(&mut info, 16, 0);
    put_u64(&mut info, 24, device.capacity_blocks);
    put_u16(&mut info, 32, device.target_id as u16);

    fill(ctrl, index, &info, mem)
}

/// RAID configuration dump: one array and one spanning logical drive per
/// device. Header: 0 total size u32, 4 array count u16, 6 array bytes u16,
/// 8 ld count u16, 10 ld bytes u16, 12 spares count u16, 14 spares bytes
/// u16. Arrays (64 bytes): 0 size in blocks u64, 8 drive count,
/// 10 array ref u16, 12 pd id u16, 14 pd sequence u16, 16 pd state,
/// 17 enclosure, 18 slot. LD configs (64 bytes): 0 target, 1 default cache
/// policy, 2 current cache policy, 3 state, 4 stripe size, 5 drive count,
/// 6 span depth, 7 consistent flag, 8 span start u64, 16 span blocks u64,
/// 24 span array ref u16.
fn cfg_read(
    ctrl: &mut MegaraidController,
    index: usize,
    mem: &mut dyn MemoryBus,
    bus: &mut dyn ScsiBus,
) -> MfiStatus {
    let Some(segment) = ctrl.slots.get(index).dcmd_seg else {
        return MfiStatus::INVALID_PARAMETER;
    };
    if segment.len as usize > CONFIG_MAX_SIZE {
        trace!(index, len = segment.len, "config buffer oversized");
        return MfiStatus::INVALID_PARAMETER;
    }

    const HEADER_SIZE: usize = 16;
    const ARRAY_SIZE: usize = 64;
    const LD_CONFIG_SIZE: usize = 64;

    let devices = bus.devices();
    let count = devices.len();
    let total = HEADER_SIZE + count * (ARRAY_SIZE + LD_CONFIG_SIZE);
    if total > CONFIG_MAX_SIZE {
        trace!(index, total, "config dump exceeds transport limit");
        return MfiStatus::INVALID_PARAMETER;
    }

    let mut config = vec![0u8; total];
    put_u32(&mut config, 0, total as u32);
    put_u16(&mut config, 4, count as u16);
    put_u16(&mut config, 6, (count * ARRAY_SIZE) as u16);
    put_u16(&mut config, 8, count as u16);
    put_u16(&mut config, 10, (count * LD_CONFIG_SIZE) as u16);
    put_u16(&mut config, 12, 0);
    put_u16(&mut config, 14, 16);

    let mut array_at = HEADER_SIZE;
    let mut ld_at = HEADER_SIZE + count * ARRAY_SIZE;
    for dev in &devices {
        put_u64(&mut config, array_at, dev.capacity_blocks);
        config[array_at + 8] = 1;
        put_u16(&mut config, array_at + 10, dev.target_id as u16);
        put_u16(&mut config, array_at + 12, dev.target_id as u16);
        put_u16(&mut config, array_at + 14, 0);
        config[array_at + 16] = dev_state::PD_ONLINE;
        config[array_at + 17] = 0xff;
        config[array_at + 18] = dev.target_id;
        array_at += ARRAY_SIZE;

        config[ld_at] = dev.target_id;
        config[ld_at + 1] = LD_CACHE_READ_AHEAD | LD_CACHE_READ_ADAPTIVE;
        config[ld_at + 2] = LD_CACHE_READ_AHEAD | LD_CACHE_READ_ADAPTIVE;
        config[ld_at + 3] = dev_state::LD_OPTIMAL;
        config[ld_at + 4] = 3;
        config[ld_at + 5] = 1;
        config[ld_at + 6] = 1;
        config[ld_at + 7] = 1;
        put_u64(&mut config, ld_at + 8, 0);
        put_u64(&mut config, ld_at + 16, dev.capacity_blocks);
        put_u16(&mut config, ld_at + 24, dev.target_id as u16);
        ld_at += LD_CONFIG_SIZE;
    }
    trace!(index, count, total, "config read");
    fill(ctrl, index, &config, mem)
}

pub(crate) fn describe(op: u32) -> &'static str {
    match op {
        opcode::CTRL_MFI_HOST_MEM_ALLOC => "CTRL_HOST_MEM_ALLOC",
        opcode::CTRL_GET_INFO => "CTRL_GET_INFO",
        opcode::CTRL_GET_PROPERTIES => "CTRL_GET_PROPERTIES",
        opcode::CTRL_SET_PROPERTIES => "CTRL_SET_PROPERTIES",
        opcode::CTRL_ALARM_GET => "CTRL_ALARM_GET",
        opcode::CTRL_ALARM_ENABLE => "CTRL_ALARM_ENABLE",
        opcode::CTRL_ALARM_DISABLE => "CTRL_ALARM_DISABLE",
        opcode::CTRL_ALARM_SILENCE => "CTRL_ALARM_SILENCE",
        opcode::CTRL_ALARM_TEST => "CTRL_ALARM_TEST",
        opcode::CTRL_EVENT_GETINFO => "CTRL_EVENT_GETINFO",
        opcode::CTRL_EVENT_CLEAR => "CTRL_EVENT_CLEAR",
        opcode::CTRL_EVENT_GET => "CTRL_EVENT_GET",
        opcode::CTRL_EVENT_COUNT => "CTRL_EVENT_COUNT",
        opcode::CTRL_EVENT_WAIT => "CTRL_EVENT_WAIT",
        opcode::CTRL_SHUTDOWN => "CTRL_SHUTDOWN",
        opcode::HIBERNATE_STANDBY => "CTRL_STANDBY",
        opcode::CTRL_GET_TIME => "CTRL_GET_TIME",
        opcode::CTRL_SET_TIME => "CTRL_SET_TIME",
        opcode::CTRL_BIOS_DATA_GET => "CTRL_BIOS_DATA_GET",
        opcode::CTRL_BIOS_DATA_SET => "CTRL_BIOS_DATA_SET",
        opcode::CTRL_FACTORY_DEFAULTS => "CTRL_FACTORY_DEFAULTS",
        opcode::CTRL_MFC_DEFAULTS_GET => "CTRL_MFC_DEFAULTS_GET",
        opcode::CTRL_MFC_DEFAULTS_SET => "CTRL_MFC_DEFAULTS_SET",
        opcode::CTRL_CACHE_FLUSH => "CTRL_CACHE_FLUSH",
        opcode::PD_GET_LIST => "PD_GET_LIST",
        opcode::PD_LIST_QUERY => "PD_LIST_QUERY",
        opcode::PD_GET_INFO => "PD_GET_INFO",
        opcode::PD_STATE_SET => "PD_STATE_SET",
        opcode::PD_REBUILD => "PD_REBUILD",
        opcode::PD_BLINK => "PD_BLINK",
        opcode::PD_UNBLINK => "PD_UNBLINK",
        opcode::LD_GET_LIST => "LD_GET_LIST",
        opcode::LD_GET_INFO => "LD_GET_INFO",
        opcode::LD_GET_PROP => "LD_GET_PROP",
        opcode::LD_SET_PROP => "LD_SET_PROP",
        opcode::LD_DELETE => "LD_DELETE",
        opcode::CFG_READ => "CFG_READ",
        opcode::CFG_ADD => "CFG_ADD",
        opcode::CFG_CLEAR => "CFG_CLEAR",
        opcode::CFG_FOREIGN_READ => "CFG_FOREIGN_READ",
        opcode::CFG_FOREIGN_IMPORT => "CFG_FOREIGN_IMPORT",
        opcode::BBU_STATUS => "BBU_STATUS",
        opcode::BBU_CAPACITY_INFO => "BBU_CAPACITY_INFO",
        opcode::BBU_DESIGN_INFO => "BBU_DESIGN_INFO",
        opcode::BBU_PROP_GET => "BBU_PROP_GET",
        opcode::CLUSTER => "CLUSTER",
        opcode::CLUSTER_RESET_ALL => "CLUSTER_RESET_ALL",
        opcode::CLUSTER_RESET_LD => "CLUSTER_RESET_LD",
        _ => "UNKNOWN",
    }
}
