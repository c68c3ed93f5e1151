//! MegaRAID Firmware Interface (MFI) wire protocol.
//!
//! Everything a guest driver and the emulated adapter agree on lives here:
//! the register file offsets, the inbound-doorbell and diag control bits,
//! the firmware-state word, frame headers and per-command payloads, the
//! completion status space, the DCMD opcode space and the three
//! scatter-gather descriptor formats.
//!
//! This crate is pure: it parses and encodes bytes and never touches guest
//! memory, interrupts or devices. All multi-byte fields are little-endian,
//! matching the firmware the protocol was lifted from.

use bitflags::bitflags;
use thiserror::Error;

pub mod sgl;

pub use sgl::{SglError, SglFormat, SglSegment};

/// Size of one MFI frame on the wire.
pub const FRAME_SIZE: usize = 64;

/// Every accepted frame maps a full 16-frame window: the header frame plus
/// up to 15 continuation frames carrying scatter-gather descriptors.
pub const FRAME_WINDOW: usize = FRAME_SIZE * 16;

/// Firmware limit on scatter-gather entries in a single command.
pub const MAX_SGE: usize = 128;

/// Firmware limit on concurrently outstanding frames.
pub const MAX_FRAMES: usize = 2048;

/// Default advertised scatter-gather entries per command.
pub const DEFAULT_SGE: u32 = 80;

/// Default advertised command slots (Windows drivers require >= 1000).
pub const DEFAULT_FRAMES: u32 = 1000;

/// Largest transfer, in sectors, a single request may name.
pub const MAX_SECTORS: u32 = 0xffff;

/// Writing this value to the outbound interrupt mask disables delivery.
pub const INTR_DISABLED_MASK: u32 = 0xffff_ffff;

/// Outbound interrupt status: reply-message pending, SAS1078 personality.
pub const OSTS_1078_REPLY: u32 = 0x8000_0000;

/// Register file offsets. Fixed by the protocol; drivers hardcode them.
pub mod reg {
    /// Inbound message registers.
    pub const IMSG0: u64 = 0x10;
    pub const IMSG1: u64 = 0x14;
    /// Outbound message registers. `OMSG0` mirrors the firmware state word.
    pub const OMSG0: u64 = 0x18;
    pub const OMSG1: u64 = 0x1c;
    /// Inbound doorbell: firmware-init control bits.
    pub const IDB: u64 = 0x20;
    /// Inbound interrupt status / mask.
    pub const ISTS: u64 = 0x24;
    pub const IMSK: u64 = 0x28;
    /// Outbound doorbell.
    pub const ODB: u64 = 0x2c;
    /// Outbound interrupt status.
    pub const OSTS: u64 = 0x30;
    /// Outbound interrupt mask.
    pub const OMSK: u64 = 0x34;
    /// Inbound queue port: a full frame address in one write.
    pub const IQP: u64 = 0x40;
    /// Outbound queue port (unused by this family).
    pub const OQP: u64 = 0x44;
    /// Outbound doorbell clear: guest interrupt acknowledge.
    pub const ODCR0: u64 = 0xa0;
    /// Outbound scratch pads. `OSP0` also mirrors the firmware state word.
    pub const OSP0: u64 = 0xb0;
    pub const OSP1: u64 = 0xb4;
    /// Inbound queue port, split submission: low half then high half.
    pub const IQPL: u64 = 0xc0;
    pub const IQPH: u64 = 0xc4;
    /// Host diagnostic register (adapter reset).
    pub const DIAG: u64 = 0xf8;
    /// Adapter-reset sequencer port.
    pub const SEQ: u64 = 0xfc;
}

bitflags! {
    /// Inbound doorbell control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DoorbellCtl: u32 {
        /// Abort every outstanding command.
        const ABORT = 0x0000_0001;
        /// Move the firmware to the ready state (soft reset).
        const READY = 0x0000_0002;
        /// Discard raw MFI frames.
        const MFIMODE = 0x0000_0004;
        const CLEAR_HANDSHAKE = 0x0000_0008;
        const HOTPLUG = 0x0000_0010;
        /// Stop the adapter: terminal fault until reset.
        const STOP_ADP = 0x0000_0020;
    }
}

bitflags! {
    /// Frame header flags. The SGL and sense-pointer widths are selected
    /// once per frame and apply to every descriptor in that frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u16 {
        const DONT_POST_IN_REPLY_QUEUE = 0x0001;
        /// Scatter-gather descriptors carry 64-bit addresses.
        const SGL64 = 0x0002;
        /// The sense buffer pointer is 64-bit.
        const SENSE64 = 0x0004;
        const DIR_WRITE = 0x0008;
        const DIR_READ = 0x0010;
        /// IEEE "skinny" scatter-gather descriptors.
        const IEEE_SGL = 0x0020;
    }
}

/// Diag register bit: a completed sequencer handshake enables writes.
pub const DIAG_WRITE_ENABLE: u32 = 0x0000_0080;
/// Diag register bit: perform an adapter reset (requires write enable).
pub const DIAG_RESET_ADP: u32 = 0x0000_0004;

/// Byte sequence written to [`reg::SEQ`] to arm the diag register.
pub const ADP_RESET_SEQ: [u8; 6] = [0x00, 0x04, 0x0b, 0x02, 0x07, 0x0d];

/// Firmware state, encoded in the high nibble of the state word that the
/// guest polls through [`reg::OMSG0`] / [`reg::OSP0`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FirmwareState {
    Undefined = 0x0000_0000,
    BbInit = 0x1000_0000,
    FwInit = 0x4000_0000,
    WaitHandshake = 0x6000_0000,
    /// State after any reset; accepts the init-firmware command.
    Ready = 0xb000_0000,
    /// Reply queue installed, full command processing enabled.
    Operational = 0xc000_0000,
    /// Terminal until an external reset.
    Fault = 0xf000_0000,
}

/// Mask selecting the state nibble of the firmware state word.
pub const FWSTATE_MASK: u32 = 0xf000_0000;

/// State-word bit advertising message-signalled interrupt support.
pub const FWSTATE_MSIX_SUPPORTED: u32 = 0x0400_0000;

impl FirmwareState {
    /// Pack the guest-visible state word: state nibble in the high bits,
    /// advertised SGE limit and command-slot count in the low bits.
    pub fn to_status_word(self, max_sge: u32, max_cmds: u32) -> u32 {
        (self as u32 & FWSTATE_MASK) | ((max_sge & 0xff) << 16) | (max_cmds & 0xffff)
    }
}

/// Completion status posted to a frame's `cmd_status` byte.
///
/// The numeric values are a driver compatibility surface; only the subset
/// the adapter actually reports gets a named constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfiStatus(pub u8);

impl MfiStatus {
    pub const OK: MfiStatus = MfiStatus(0x00);
    pub const INVALID_CMD: MfiStatus = MfiStatus(0x01);
    pub const INVALID_DCMD: MfiStatus = MfiStatus(0x02);
    pub const INVALID_PARAMETER: MfiStatus = MfiStatus(0x03);
    pub const INVALID_SEQUENCE_NUMBER: MfiStatus = MfiStatus(0x04);
    pub const ABORT_NOT_POSSIBLE: MfiStatus = MfiStatus(0x05);
    pub const DEVICE_NOT_FOUND: MfiStatus = MfiStatus(0x0c);
    pub const FLASH_ALLOC_FAIL: MfiStatus = MfiStatus(0x0e);
    pub const MEMORY_NOT_AVAILABLE: MfiStatus = MfiStatus(0x20);
    pub const SCSI_DONE_WITH_ERROR: MfiStatus = MfiStatus(0x2d);
    pub const SCSI_IO_FAILED: MfiStatus = MfiStatus(0x2e);
    pub const WRONG_STATE: MfiStatus = MfiStatus(0x32);
    /// Firmware-internal "still in flight" sentinel; never posted.
    pub const INVALID_STATUS: MfiStatus = MfiStatus(0xff);
}

/// SCSI status bytes the adapter writes back alongside [`MfiStatus`].
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
}

/// Command kind carried in the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameCommand {
    Init = 0x00,
    LdRead = 0x01,
    LdWrite = 0x02,
    LdScsi = 0x03,
    PdScsi = 0x04,
    Dcmd = 0x05,
    Abort = 0x06,
    Smp = 0x07,
    Stp = 0x08,
}

impl FrameCommand {
    pub fn from_u8(value: u8) -> Option<FrameCommand> {
        Some(match value {
            0x00 => FrameCommand::Init,
            0x01 => FrameCommand::LdRead,
            0x02 => FrameCommand::LdWrite,
            0x03 => FrameCommand::LdScsi,
            0x04 => FrameCommand::PdScsi,
            0x05 => FrameCommand::Dcmd,
            0x06 => FrameCommand::Abort,
            0x07 => FrameCommand::Smp,
            0x08 => FrameCommand::Stp,
            _ => return None,
        })
    }

    pub fn describe(self) -> &'static str {
        match self {
            FrameCommand::Init => "MFI init",
            FrameCommand::LdRead => "LD read",
            FrameCommand::LdWrite => "LD write",
            FrameCommand::LdScsi => "LD SCSI",
            FrameCommand::PdScsi => "PD SCSI",
            FrameCommand::Dcmd => "DCMD",
            FrameCommand::Abort => "abort",
            FrameCommand::Smp => "SMP",
            FrameCommand::Stp => "STP",
        }
    }
}

/// Errors from decoding a frame or queue-init block.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown frame command {0:#04x}")]
    UnknownCommand(u8),
}

/// The fixed 24-byte header shared by every frame kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: u8,
    pub sense_len: u8,
    pub cmd_status: u8,
    pub scsi_status: u8,
    pub target_id: u8,
    pub lun_id: u8,
    pub cdb_len: u8,
    pub sge_count: u8,
    pub context: u64,
    pub flags: FrameFlags,
    pub timeout: u16,
    pub data_len: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 24;

    /// Offsets of the fields the adapter writes back on completion.
    pub const SENSE_LEN_OFFSET: u64 = 1;
    pub const CMD_STATUS_OFFSET: u64 = 2;
    pub const SCSI_STATUS_OFFSET: u64 = 3;
    /// Offset of the 64-bit little-endian context.
    pub const CONTEXT_OFFSET: u64 = 8;

    pub fn parse(bytes: &[u8]) -> Result<FrameHeader, FrameDecodeError> {
        if bytes.len() < Self::SIZE {
            return Err(FrameDecodeError::Truncated {
                need: Self::SIZE,
                have: bytes.len(),
            });
        }
        Ok(FrameHeader {
            command: bytes[0],
            sense_len: bytes[1],
            cmd_status: bytes[2],
            scsi_status: bytes[3],
            target_id: bytes[4],
            lun_id: bytes[5],
            cdb_len: bytes[6],
            sge_count: bytes[7],
            context: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            flags: FrameFlags::from_bits_retain(u16::from_le_bytes(
                bytes[16..18].try_into().unwrap(),
            )),
            timeout: u16::from_le_bytes(bytes[18..20].try_into().unwrap()),
            data_len: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        })
    }
}

/// Command-specific payload, decoded once from the frame bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// Init-firmware: guest address of the queue-init block.
    Init { qinfo_addr: u64 },
    /// Logical-device read or write. `data_len` in the header counts blocks.
    Io {
        sense_addr: u64,
        lba: u64,
        sgl_offset: usize,
    },
    /// Raw CDB passthrough, logical or physical.
    Scsi {
        sense_addr: u64,
        cdb: [u8; 16],
        sgl_offset: usize,
    },
    /// Administrative direct command.
    Dcmd {
        opcode: u32,
        mbox: [u8; 12],
        sgl_offset: usize,
    },
    /// Cancel the frame mapped at `abort_addr` with matching context.
    Abort { abort_context: u64, abort_addr: u64 },
    /// Recognized but unimplemented kinds (SMP, STP).
    Unsupported,
}

/// A frame decoded from the first wire frame of a mapped window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: FrameCommand,
    pub header: FrameHeader,
    pub payload: FramePayload,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u64_pair(bytes: &[u8], lo: usize, hi: usize) -> u64 {
    (read_u32(bytes, lo) as u64) | ((read_u32(bytes, hi) as u64) << 32)
}

impl Frame {
    /// Offset of the first scatter-gather descriptor per frame kind.
    pub const IO_SGL_OFFSET: usize = 40;
    pub const PASS_SGL_OFFSET: usize = 48;
    pub const DCMD_SGL_OFFSET: usize = 40;

    /// Decode the header and payload from a mapped frame window.
    pub fn parse(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
        if bytes.len() < FRAME_SIZE {
            return Err(FrameDecodeError::Truncated {
                need: FRAME_SIZE,
                have: bytes.len(),
            });
        }
        let header = FrameHeader::parse(bytes)?;
        let command = FrameCommand::from_u8(header.command)
            .ok_or(FrameDecodeError::UnknownCommand(header.command))?;

        // The sense pointer is 32 or 64 bit wide, selected per frame.
        let sense_addr = if header.flags.contains(FrameFlags::SENSE64) {
            read_u64_pair(bytes, 24, 28)
        } else {
            read_u32(bytes, 24) as u64
        };

        let payload = match command {
            FrameCommand::Init => FramePayload::Init {
                qinfo_addr: read_u64_pair(bytes, 24, 28),
            },
            FrameCommand::LdRead | FrameCommand::LdWrite => FramePayload::Io {
                sense_addr,
                lba: read_u64_pair(bytes, 32, 36),
                sgl_offset: Self::IO_SGL_OFFSET,
            },
            FrameCommand::LdScsi | FrameCommand::PdScsi => FramePayload::Scsi {
                sense_addr,
                cdb: bytes[32..48].try_into().unwrap(),
                sgl_offset: Self::PASS_SGL_OFFSET,
            },
            FrameCommand::Dcmd => FramePayload::Dcmd {
                opcode: read_u32(bytes, 24),
                mbox: bytes[28..40].try_into().unwrap(),
                sgl_offset: Self::DCMD_SGL_OFFSET,
            },
            FrameCommand::Abort => FramePayload::Abort {
                abort_context: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
                abort_addr: read_u64_pair(bytes, 32, 36),
            },
            FrameCommand::Smp | FrameCommand::Stp => FramePayload::Unsupported,
        };

        Ok(Frame {
            command,
            header,
            payload,
        })
    }
}

/// Queue-init block referenced by the init-firmware command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitQueueInfo {
    pub flags: u32,
    pub rq_entries: u32,
    /// Guest base of the reply ring.
    pub rq_addr: u64,
    /// Guest address of the consumer index cell.
    pub ci_addr: u64,
    /// Guest address of the producer index cell.
    pub pi_addr: u64,
}

/// Queue-init flag: reply ring entries are 64-bit contexts.
pub const QUEUE_FLAG_CONTEXT64: u32 = 0x2;

impl InitQueueInfo {
    pub const SIZE: usize = 32;

    pub fn parse(bytes: &[u8]) -> Result<InitQueueInfo, FrameDecodeError> {
        if bytes.len() < Self::SIZE {
            return Err(FrameDecodeError::Truncated {
                need: Self::SIZE,
                have: bytes.len(),
            });
        }
        Ok(InitQueueInfo {
            flags: read_u32(bytes, 0),
            rq_entries: read_u32(bytes, 4),
            rq_addr: read_u64_pair(bytes, 8, 12),
            ci_addr: read_u64_pair(bytes, 16, 20),
            pi_addr: read_u64_pair(bytes, 24, 28),
        })
    }
}

/// Unpack a queue-port submission: bits 5.. carry the frame address,
/// bits 1..5 the count of frames in the batch.
pub fn queue_port_frame_addr(value: u64) -> u64 {
    value & !0x1f
}

pub fn queue_port_frame_count(value: u64) -> u16 {
    ((value >> 1) & 0xf) as u16
}

/// Direct-command opcode space. The high-order byte selects the family:
/// 0x01 controller, 0x02 physical device, 0x03 logical device,
/// 0x04 configuration, 0x05 battery backup, 0x08 cluster. The numeric
/// values are a compatibility surface shared with existing drivers.
pub mod dcmd {
    pub const CTRL_MFI_HOST_MEM_ALLOC: u32 = 0x0100_e100;
    pub const CTRL_GET_INFO: u32 = 0x0101_0000;
    pub const CTRL_GET_PROPERTIES: u32 = 0x0102_0100;
    pub const CTRL_SET_PROPERTIES: u32 = 0x0102_0200;
    pub const CTRL_ALARM_GET: u32 = 0x0103_0100;
    pub const CTRL_ALARM_ENABLE: u32 = 0x0103_0200;
    pub const CTRL_ALARM_DISABLE: u32 = 0x0103_0300;
    pub const CTRL_ALARM_SILENCE: u32 = 0x0103_0400;
    pub const CTRL_ALARM_TEST: u32 = 0x0103_0500;
    pub const CTRL_EVENT_GETINFO: u32 = 0x0104_0100;
    pub const CTRL_EVENT_CLEAR: u32 = 0x0104_0200;
    pub const CTRL_EVENT_GET: u32 = 0x0104_0300;
    pub const CTRL_EVENT_COUNT: u32 = 0x0104_0400;
    pub const CTRL_EVENT_WAIT: u32 = 0x0104_0500;
    pub const CTRL_SHUTDOWN: u32 = 0x0105_0000;
    pub const HIBERNATE_STANDBY: u32 = 0x0106_0000;
    pub const CTRL_GET_TIME: u32 = 0x0108_0101;
    pub const CTRL_SET_TIME: u32 = 0x0108_0102;
    pub const CTRL_BIOS_DATA_GET: u32 = 0x010c_0100;
    pub const CTRL_BIOS_DATA_SET: u32 = 0x010c_0200;
    pub const CTRL_FACTORY_DEFAULTS: u32 = 0x010d_0000;
    pub const CTRL_MFC_DEFAULTS_GET: u32 = 0x010e_0201;
    pub const CTRL_MFC_DEFAULTS_SET: u32 = 0x010e_0202;
    pub const CTRL_CACHE_FLUSH: u32 = 0x0110_1000;
    pub const PD_GET_LIST: u32 = 0x0201_0000;
    pub const PD_LIST_QUERY: u32 = 0x0201_0100;
    pub const PD_GET_INFO: u32 = 0x0202_0000;
    pub const PD_STATE_SET: u32 = 0x0203_0100;
    pub const PD_REBUILD: u32 = 0x0204_0100;
    pub const PD_BLINK: u32 = 0x0207_0100;
    pub const PD_UNBLINK: u32 = 0x0207_0200;
    pub const LD_GET_LIST: u32 = 0x0301_0000;
    pub const LD_GET_INFO: u32 = 0x0302_0000;
    pub const LD_GET_PROP: u32 = 0x0303_0000;
    pub const LD_SET_PROP: u32 = 0x0304_0000;
    pub const LD_DELETE: u32 = 0x0309_0000;
    pub const CFG_READ: u32 = 0x0401_0000;
    pub const CFG_ADD: u32 = 0x0402_0000;
    pub const CFG_CLEAR: u32 = 0x0403_0000;
    pub const CFG_FOREIGN_READ: u32 = 0x0406_0100;
    pub const CFG_FOREIGN_IMPORT: u32 = 0x0406_0400;
    pub const BBU_STATUS: u32 = 0x0501_0000;
    pub const BBU_CAPACITY_INFO: u32 = 0x0502_0000;
    pub const BBU_DESIGN_INFO: u32 = 0x0503_0000;
    pub const BBU_PROP_GET: u32 = 0x0505_0100;
    pub const CLUSTER: u32 = 0x0800_0000;
    pub const CLUSTER_RESET_ALL: u32 = 0x0801_0100;
    pub const CLUSTER_RESET_LD: u32 = 0x0801_0200;

    /// Opcode family selector (high-order byte).
    pub fn family(opcode: u32) -> u8 {
        (opcode >> 24) as u8
    }
}

/// Physical/logical device states reported by inventory DCMDs.
pub mod dev_state {
    pub const PD_UNCONFIGURED_GOOD: u8 = 0x00;
    pub const PD_SYSTEM: u8 = 0x40;
    pub const PD_ONLINE: u8 = 0x18;
    pub const PD_OFFLINE: u8 = 0x10;
    pub const LD_OFFLINE: u8 = 0x00;
    pub const LD_OPTIMAL: u8 = 0x03;
}
