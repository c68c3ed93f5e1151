//! Shared guest-memory layout, frame builders and a scripted backend for
//! the scenario tests.
#![allow(dead_code)] // each test binary uses a different subset

use ironsas_hba::mfi::{self, FrameCommand, FrameHeader, FRAME_WINDOW};
use ironsas_hba::{
    ControllerConfig, DeviceInfo, LatchIrqLine, MegaraidController, MemoryBus, RequestHandle,
    ScsiBus, VecMemory,
};

pub const FRAME_ADDR: u64 = 0x1000;
pub const FRAME_ADDR_2: u64 = 0x1800;
pub const QINFO_ADDR: u64 = 0x3000;
pub const RING_ADDR: u64 = 0x4000;
pub const CONSUMER_ADDR: u64 = 0x5000;
pub const PRODUCER_ADDR: u64 = 0x5010;
pub const DATA_ADDR: u64 = 0x6000;
pub const SENSE_ADDR: u64 = 0x7000;
pub const DEST_ADDR: u64 = 0x8000;

pub const GOOD: u8 = 0x00;
pub const CHECK_CONDITION: u8 = 0x02;

const READ_16: u8 = 0x88;
const WRITE_16: u8 = 0x8a;
const INQUIRY: u8 = 0x12;

/// One backend disk with a flat in-memory image.
pub struct FakeDisk {
    pub info: DeviceInfo,
    pub data: Vec<u8>,
}

impl FakeDisk {
    pub fn new(target_id: u8, blocks: u64, block_size: u32) -> Self {
        FakeDisk {
            info: DeviceInfo {
                target_id,
                lun: 0,
                device_type: 0,
                block_size,
                capacity_blocks: blocks,
            },
            data: vec![0u8; (blocks * block_size as u64) as usize],
        }
    }
}

/// A recorded backend request.
pub struct Request {
    pub target_id: u8,
    pub lun: u8,
    pub tag: u32,
    pub cdb: Vec<u8>,
    pub segments: Vec<mfi::SglSegment>,
    pub continued: u32,
    pub cancelled: bool,
}

/// Scripted SCSI backend: records every call, never completes anything on
/// its own. Tests move the data phase and then re-enter the controller
/// through its completion entry points.
pub struct FakeScsiBus {
    pub disks: Vec<FakeDisk>,
    pub requests: Vec<Request>,
    pub fail_alloc: bool,
}

impl FakeScsiBus {
    pub fn new(disks: Vec<FakeDisk>) -> Self {
        FakeScsiBus {
            disks,
            requests: Vec::new(),
            fail_alloc: false,
        }
    }

    pub fn single_disk(blocks: u64, block_size: u32) -> Self {
        Self::new(vec![FakeDisk::new(0, blocks, block_size)])
    }

    pub fn last(&self) -> &Request {
        self.requests.last().expect("a backend request was made")
    }

    fn disk(&mut self, target_id: u8) -> &mut FakeDisk {
        self.disks
            .iter_mut()
            .find(|d| d.info.target_id == target_id)
            .expect("request names a known disk")
    }

    /// Move the data phase of a READ_16/WRITE_16 request through the
    /// recorded scatter segments.
    pub fn execute_data_phase(&mut self, handle: usize, mem: &mut VecMemory) {
        let (target_id, cdb, segments) = {
            let req = &self.requests[handle];
            (req.target_id, req.cdb.clone(), req.segments.clone())
        };
        let lba = u64::from_be_bytes(cdb[2..10].try_into().unwrap());
        let blocks = u32::from_be_bytes(cdb[10..14].try_into().unwrap());
        let disk = self.disk(target_id);
        let offset = (lba * disk.info.block_size as u64) as usize;
        let len = (blocks * disk.info.block_size) as usize;
        match cdb[0] {
            READ_16 => {
                let mut remaining = &disk.data[offset..offset + len];
                for seg in &segments {
                    let n = (seg.len as usize).min(remaining.len());
                    mem.write_physical(seg.addr, &remaining[..n]).unwrap();
                    remaining = &remaining[n..];
                }
            }
            WRITE_16 => {
                let mut at = offset;
                for seg in &segments {
                    let mut buf = vec![0u8; seg.len as usize];
                    mem.read_physical(seg.addr, &mut buf).unwrap();
                    let n = buf.len().min(offset + len - at);
                    disk.data[at..at + n].copy_from_slice(&buf[..n]);
                    at += n;
                }
            }
            other => panic!("unexpected data-phase cdb {other:#04x}"),
        }
    }

    /// Response bytes for a recorded INQUIRY request.
    pub fn inquiry_response(&self, handle: usize) -> Vec<u8> {
        let req = &self.requests[handle];
        let alloc = u16::from_be_bytes(req.cdb[3..5].try_into().unwrap()) as usize;
        let mut data = vec![0u8; alloc];
        if req.cdb[1] & 0x1 != 0 {
            // VPD page: page code at byte 1, length at 2..4.
            data[1] = req.cdb[2];
            data[3] = 8;
            data[4..12].copy_from_slice(b"FAKEID00");
        } else {
            data[0] = 0x00; // direct access, connected
            if data.len() >= 16 {
                data[8..16].copy_from_slice(b"IRONSAS ");
            }
        }
        data
    }
}

impl ScsiBus for FakeScsiBus {
    fn device_info(&self, target_id: u8, lun: u8) -> Option<DeviceInfo> {
        self.disks
            .iter()
            .map(|d| d.info)
            .find(|info| info.target_id == target_id && info.lun == lun)
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.disks.iter().map(|d| d.info).collect()
    }

    fn new_request(
        &mut self,
        target_id: u8,
        lun: u8,
        tag: u32,
        cdb: &[u8],
        segments: &[mfi::SglSegment],
    ) -> Option<RequestHandle> {
        if self.fail_alloc {
            return None;
        }
        self.requests.push(Request {
            target_id,
            lun,
            tag,
            cdb: cdb.to_vec(),
            segments: segments.to_vec(),
            continued: 0,
            cancelled: false,
        });
        Some(RequestHandle(self.requests.len() as u64 - 1))
    }

    fn enqueue(&mut self, request: RequestHandle) -> i64 {
        let req = &self.requests[request.0 as usize];
        let block_size = self
            .device_info(req.target_id, req.lun)
            .map(|info| info.block_size)
            .unwrap_or(512);
        match req.cdb[0] {
            READ_16 => {
                let blocks = u32::from_be_bytes(req.cdb[10..14].try_into().unwrap());
                (blocks as i64) * block_size as i64
            }
            WRITE_16 => {
                let blocks = u32::from_be_bytes(req.cdb[10..14].try_into().unwrap());
                -((blocks as i64) * block_size as i64)
            }
            INQUIRY => u16::from_be_bytes(req.cdb[3..5].try_into().unwrap()) as i64,
            _ => 0,
        }
    }

    fn continue_request(&mut self, request: RequestHandle) {
        self.requests[request.0 as usize].continued += 1;
    }

    fn cancel(&mut self, request: RequestHandle) {
        self.requests[request.0 as usize].cancelled = true;
    }
}

/// Builder for guest MFI frames.
pub struct GuestFrame {
    bytes: Vec<u8>,
    command: u8,
}

impl GuestFrame {
    pub fn new(command: FrameCommand) -> Self {
        let mut bytes = vec![0u8; FRAME_WINDOW];
        bytes[0] = command as u8;
        GuestFrame {
            bytes,
            command: command as u8,
        }
    }

    pub fn context(mut self, context: u64) -> Self {
        self.bytes[8..16].copy_from_slice(&context.to_le_bytes());
        self
    }

    pub fn target(mut self, target_id: u8) -> Self {
        self.bytes[4] = target_id;
        self
    }

    pub fn lun(mut self, lun: u8) -> Self {
        self.bytes[5] = lun;
        self
    }

    pub fn cdb_len(mut self, len: u8) -> Self {
        self.bytes[6] = len;
        self
    }

    pub fn sense_len(mut self, len: u8) -> Self {
        self.bytes[1] = len;
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        let current = u16::from_le_bytes(self.bytes[16..18].try_into().unwrap());
        self.bytes[16..18].copy_from_slice(&(current | flags).to_le_bytes());
        self
    }

    pub fn data_len(mut self, len: u32) -> Self {
        self.bytes[20..24].copy_from_slice(&len.to_le_bytes());
        self
    }

    /// 32-bit sense pointer (both I/O and passthrough frames).
    pub fn sense_addr(mut self, addr: u32) -> Self {
        self.bytes[24..28].copy_from_slice(&addr.to_le_bytes());
        self
    }

    pub fn io_lba(mut self, lba: u64) -> Self {
        self.bytes[32..36].copy_from_slice(&((lba & 0xffff_ffff) as u32).to_le_bytes());
        self.bytes[36..40].copy_from_slice(&((lba >> 32) as u32).to_le_bytes());
        self
    }

    pub fn pass_cdb(mut self, cdb: &[u8]) -> Self {
        self.bytes[6] = cdb.len() as u8;
        self.bytes[32..32 + cdb.len()].copy_from_slice(cdb);
        self
    }

    pub fn dcmd(mut self, opcode: u32) -> Self {
        self.bytes[24..28].copy_from_slice(&opcode.to_le_bytes());
        self
    }

    /// Init-firmware frames: split pointer to the queue-init block.
    pub fn init_qinfo(mut self, addr: u64) -> Self {
        self.bytes[24..28].copy_from_slice(&((addr & 0xffff_ffff) as u32).to_le_bytes());
        self.bytes[28..32].copy_from_slice(&((addr >> 32) as u32).to_le_bytes());
        self
    }

    pub fn mbox(mut self, mbox: &[u8]) -> Self {
        self.bytes[28..28 + mbox.len()].copy_from_slice(mbox);
        self
    }

    pub fn abort(mut self, context: u64, addr: u64) -> Self {
        self.bytes[24..32].copy_from_slice(&context.to_le_bytes());
        self.bytes[32..36].copy_from_slice(&((addr & 0xffff_ffff) as u32).to_le_bytes());
        self.bytes[36..40].copy_from_slice(&((addr >> 32) as u32).to_le_bytes());
        self
    }

    /// Append 64-bit scatter descriptors at the command's SGL offset and
    /// set the matching header fields.
    pub fn sgl64(mut self, segments: &[(u64, u32)]) -> Self {
        let offset = match self.command {
            c if c == FrameCommand::LdScsi as u8 || c == FrameCommand::PdScsi as u8 => 48,
            _ => 40,
        };
        self.bytes[7] = segments.len() as u8;
        self = self.flags(mfi::FrameFlags::SGL64.bits());
        for (i, (addr, len)) in segments.iter().enumerate() {
            let at = offset + i * 12;
            self.bytes[at..at + 8].copy_from_slice(&addr.to_le_bytes());
            self.bytes[at + 8..at + 12].copy_from_slice(&len.to_le_bytes());
        }
        self
    }

    /// Lie about the descriptor count without providing descriptors.
    pub fn sge_count_raw(mut self, count: u8) -> Self {
        self.bytes[7] = count;
        self
    }

    pub fn store(&self, mem: &mut VecMemory, addr: u64) {
        mem.write_physical(addr, &self.bytes).unwrap();
    }
}

pub fn setup() -> (MegaraidController, VecMemory, FakeScsiBus, LatchIrqLine) {
    setup_with(FakeScsiBus::single_disk(1024, 512))
}

pub fn setup_with(bus: FakeScsiBus) -> (MegaraidController, VecMemory, FakeScsiBus, LatchIrqLine) {
    let irq = LatchIrqLine::default();
    let cfg = ControllerConfig {
        max_cmds: 8,
        ..ControllerConfig::default()
    };
    let ctrl = MegaraidController::new(cfg, Box::new(irq.clone()));
    let mem = VecMemory::new(0x20000);
    (ctrl, mem, bus, irq)
}

/// Submit a frame address through the 64-bit inbound queue port.
pub fn submit(
    ctrl: &mut MegaraidController,
    mem: &mut VecMemory,
    bus: &mut FakeScsiBus,
    frame_addr: u64,
) {
    ctrl.mmio_write(mfi::reg::IQP, frame_addr | (1 << 1), mem, bus);
}

/// Run the init-firmware handshake: build the queue-init block, submit the
/// INIT frame and unmask interrupts.
pub fn init_firmware(
    ctrl: &mut MegaraidController,
    mem: &mut VecMemory,
    bus: &mut FakeScsiBus,
    entries: u32,
    wide_context: bool,
) {
    let flags = if wide_context {
        mfi::QUEUE_FLAG_CONTEXT64
    } else {
        0
    };
    let mut qinfo = [0u8; 32];
    qinfo[0..4].copy_from_slice(&flags.to_le_bytes());
    qinfo[4..8].copy_from_slice(&entries.to_le_bytes());
    qinfo[8..12].copy_from_slice(&(RING_ADDR as u32).to_le_bytes());
    qinfo[16..20].copy_from_slice(&(CONSUMER_ADDR as u32).to_le_bytes());
    qinfo[24..28].copy_from_slice(&(PRODUCER_ADDR as u32).to_le_bytes());
    mem.write_physical(QINFO_ADDR, &qinfo).unwrap();

    let mut init = [0u8; 64];
    init[0] = FrameCommand::Init as u8;
    init[24..28].copy_from_slice(&(QINFO_ADDR as u32).to_le_bytes());
    mem.write_physical(FRAME_ADDR_2, &init).unwrap();
    // The window read covers the rest of the 1 KiB region as zeroes.

    submit(ctrl, mem, bus, FRAME_ADDR_2);
    assert_eq!(ctrl.fw_state(), mfi::FirmwareState::Operational);
    assert_eq!(frame_cmd_status(mem, FRAME_ADDR_2), 0);

    // Unmask interrupts.
    ctrl.mmio_write(mfi::reg::OMSK, 0, mem, bus);
}

/// Read reply-ring entry `index` (32- or 64-bit contexts).
pub fn reply_entry(mem: &VecMemory, index: u64, wide: bool) -> u64 {
    if wide {
        mem.read_u64(RING_ADDR + index * 8).unwrap()
    } else {
        mem.read_u32(RING_ADDR + index * 4).unwrap() as u64
    }
}

pub fn producer_index(mem: &VecMemory) -> u32 {
    mem.read_u32(PRODUCER_ADDR).unwrap()
}

pub fn frame_cmd_status(mem: &VecMemory, frame_addr: u64) -> u8 {
    let mut b = [0u8; 1];
    mem.read_physical(frame_addr + FrameHeader::CMD_STATUS_OFFSET, &mut b)
        .unwrap();
    b[0]
}

pub fn frame_scsi_status(mem: &VecMemory, frame_addr: u64) -> u8 {
    let mut b = [0u8; 1];
    mem.read_physical(frame_addr + FrameHeader::SCSI_STATUS_OFFSET, &mut b)
        .unwrap();
    b[0]
}
