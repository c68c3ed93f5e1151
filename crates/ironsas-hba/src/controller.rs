//! The MFI command engine: register file, frame orchestration, I/O and
//! passthrough paths, abort engine and firmware state machine.
//!
//! Everything here runs single-threaded: mutation happens either inside a
//! register-write handler or inside one of the completion entry points the
//! embedder calls when the backend has finished a request. "Pending" means a
//! slot stays occupied until a later entry point resumes it, not that
//! anything blocks.

use tracing::{debug, trace, warn};

use ironsas_mfi::{
    queue_port_frame_addr, queue_port_frame_count, reg, scsi_status, sgl, DoorbellCtl,
    FirmwareState, Frame, FrameCommand, FrameHeader, FramePayload, InitQueueInfo, MfiStatus,
    SglFormat, ADP_RESET_SEQ, DEFAULT_FRAMES, DEFAULT_SGE, DIAG_RESET_ADP, DIAG_WRITE_ENABLE,
    FWSTATE_MSIX_SUPPORTED, INTR_DISABLED_MASK, MAX_FRAMES, MAX_SGE, OSTS_1078_REPLY,
};

use crate::bus::{IrqLine, MemoryBus};
use crate::dcmd;
use crate::reply::ReplyQueue;
use crate::scsi::{DeviceInfo, ScsiBus};
use crate::slots::{AcquireError, DcmdStep, SlotTable};

/// Highest logical-device target id the adapter exposes.
pub const MAX_LD: u8 = 64;

const NAA_LOCALLY_ASSIGNED: u64 = 0x3;
const IEEE_COMPANY_LOCALLY_ASSIGNED: u64 = 0x52_5400;

const READ_16: u8 = 0x88;
const WRITE_16: u8 = 0x8a;

// Fixed-format sense keys/codes the adapter synthesizes locally.
const SENSE_KEY_HARDWARE_ERROR: u8 = 0x04;
const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
const ASC_INVALID_OPCODE: u8 = 0x20;
const ASC_INTERNAL_TARGET_FAILURE: u8 = 0x44;

/// Static adapter configuration, threaded into the constructor.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Advertised scatter-gather entries per command (clamped to 128).
    pub max_sge: u32,
    /// Command slots (clamped to the 2048 firmware limit).
    pub max_cmds: u32,
    /// SAS address; 0 synthesizes a locally-assigned one.
    pub sas_address: u64,
    pub hba_serial: String,
    /// Expose bus devices directly instead of logical drives.
    pub use_jbod: bool,
    /// BCD-packed firmware wall clock (sec:min:hour:day:month:year), as
    /// reported by the get-time DCMD.
    pub fw_time: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            max_sge: DEFAULT_SGE,
            max_cmds: DEFAULT_FRAMES,
            sas_address: 0,
            hba_serial: "IRONSAS123456".to_string(),
            use_jbod: false,
            // 1 Jan 2024, midnight.
            fw_time: 0x0000_0000_0100_07e8,
        }
    }
}

/// Outcome of routing one frame.
pub(crate) enum Outcome {
    Complete(MfiStatus),
    Pending,
}

pub struct MegaraidController {
    pub(crate) cfg: ControllerConfig,
    pub(crate) sas_addr: u64,
    pub(crate) fw_state: FirmwareState,
    intr_mask: u32,
    doorbell: u32,
    pub(crate) busy: u32,
    frame_hi: u32,
    adp_reset_pos: usize,
    diag: u32,
    pub(crate) event_count: u32,
    pub(crate) shutdown_event: u32,
    pub(crate) boot_event: u32,
    pub(crate) event_locale: u16,
    pub(crate) event_class: i8,
    pub(crate) event_slot: Option<usize>,
    pub(crate) reply: ReplyQueue,
    pub(crate) slots: SlotTable,
    irq: Box<dyn IrqLine>,
}

impl MegaraidController {
    pub fn new(mut cfg: ControllerConfig, irq: Box<dyn IrqLine>) -> Self {
        cfg.max_sge = cfg.max_sge.clamp(1, MAX_SGE as u32);
        cfg.max_cmds = cfg.max_cmds.clamp(1, MAX_FRAMES as u32);
        let sas_addr = if cfg.sas_address != 0 {
            cfg.sas_address
        } else {
            ((NAA_LOCALLY_ASSIGNED << 24) | IEEE_COMPANY_LOCALLY_ASSIGNED) << 36
        };
        let slots = SlotTable::new(cfg.max_cmds as usize);
        let mut ctrl = MegaraidController {
            cfg,
            sas_addr,
            fw_state: FirmwareState::Ready,
            intr_mask: INTR_DISABLED_MASK,
            doorbell: 0,
            busy: 0,
            frame_hi: 0,
            adp_reset_pos: 0,
            diag: 0,
            event_count: 0,
            shutdown_event: 0,
            boot_event: 0,
            event_locale: 0,
            event_class: 0,
            event_slot: None,
            reply: ReplyQueue::default(),
            slots,
            irq,
        };
        ctrl.reset_state();
        ctrl
    }

    pub fn fw_state(&self) -> FirmwareState {
        self.fw_state
    }

    pub fn busy_count(&self) -> u32 {
        self.busy
    }

    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    pub fn reply_queue_configured(&self) -> bool {
        self.reply.is_configured()
    }

    fn interrupts_enabled(&self) -> bool {
        self.intr_mask != INTR_DISABLED_MASK
    }

    /// Guest-visible firmware state word ([`reg::OMSG0`] / [`reg::OSP0`]).
    pub fn firmware_status_word(&self) -> u32 {
        let msix = if self.irq.msi_enabled() {
            FWSTATE_MSIX_SUPPORTED
        } else {
            0
        };
        msix | self.fw_state.to_status_word(self.cfg.max_sge, self.cfg.max_cmds)
    }

    /// MMIO register window (BAR0).
    pub fn mmio_read(&self, offset: u64) -> u32 {
        let value = match offset {
            reg::IDB => 0,
            reg::OMSG0 | reg::OSP0 => self.firmware_status_word(),
            reg::OSTS => {
                if self.interrupts_enabled() && self.doorbell != 0 {
                    OSTS_1078_REPLY | 1
                } else {
                    0
                }
            }
            reg::OMSK => self.intr_mask,
            reg::ODCR0 => self.doorbell,
            reg::OSP1 => 15,
            reg::DIAG => self.diag,
            _ => {
                trace!(offset, "read of unimplemented register");
                0
            }
        };
        trace!(offset, value, "mmio read");
        value
    }

    pub fn mmio_write(
        &mut self,
        offset: u64,
        value: u64,
        mem: &mut dyn MemoryBus,
        bus: &mut dyn ScsiBus,
    ) {
        trace!(offset, value, "mmio write");
        match offset {
            reg::IDB => {
                let ctl = DoorbellCtl::from_bits_truncate(value as u32);
                if ctl.contains(DoorbellCtl::ABORT) {
                    self.abort_all(bus);
                }
                if ctl.contains(DoorbellCtl::READY) {
                    self.soft_reset(bus);
                }
                if ctl.contains(DoorbellCtl::MFIMODE) {
                    // Discard raw MFI frames; nothing to flush here.
                }
                if ctl.contains(DoorbellCtl::STOP_ADP) {
                    warn!("guest stopped the adapter");
                    self.fw_state = FirmwareState::Fault;
                }
            }
            reg::OMSK => {
                self.intr_mask = value as u32;
                if !self.interrupts_enabled() && !self.irq.msi_enabled() {
                    self.irq.set_level(false);
                }
            }
            reg::ODCR0 => {
                self.doorbell = 0;
                if self.interrupts_enabled() {
                    if let Err(err) = self.reply.publish_producer(mem) {
                        warn!(%err, "producer index publish failed");
                    }
                    if !self.irq.msi_enabled() {
                        self.irq.set_level(false);
                    }
                }
            }
            reg::IQPH => {
                self.frame_hi = value as u32;
            }
            reg::IQPL | reg::IQP => {
                if offset == reg::IQP {
                    self.frame_hi = 0;
                }
                let frame_addr =
                    queue_port_frame_addr(value) | ((self.frame_hi as u64) << 32);
                let frame_count = queue_port_frame_count(value);
                self.frame_hi = 0;
                self.handle_frame(frame_addr, frame_count, mem, bus);
            }
            reg::SEQ => {
                // Magic sequence arming the diag register for an ADP reset.
                if ADP_RESET_SEQ[self.adp_reset_pos] == value as u8 {
                    self.adp_reset_pos += 1;
                    if self.adp_reset_pos == ADP_RESET_SEQ.len() {
                        self.adp_reset_pos = 0;
                        self.diag = DIAG_WRITE_ENABLE;
                    }
                } else {
                    self.adp_reset_pos = 0;
                    self.diag = 0;
                }
            }
            reg::DIAG => {
                if self.diag & DIAG_WRITE_ENABLE != 0 && value as u32 & DIAG_RESET_ADP != 0 {
                    debug!("adapter reset through the diag register");
                    self.soft_reset(bus);
                    self.adp_reset_pos = 0;
                    self.diag = 0;
                }
            }
            _ => {
                trace!(offset, value, "write to unimplemented register");
            }
        }
    }

    /// Port-I/O window: aliases the MMIO register file.
    pub fn port_read(&self, offset: u64) -> u32 {
        self.mmio_read(offset & 0xff)
    }

    pub fn port_write(
        &mut self,
        offset: u64,
        value: u64,
        mem: &mut dyn MemoryBus,
        bus: &mut dyn ScsiBus,
    ) {
        self.mmio_write(offset & 0xff, value, mem, bus);
    }

    /// Abort every outstanding command without touching the rest of the
    /// controller state (the abort-all doorbell bit).
    fn abort_all(&mut self, bus: &mut dyn ScsiBus) {
        debug!("abort-all doorbell");
        for index in 0..self.slots.len() {
            if let Some(request) = self.slots.get(index).request {
                bus.cancel(request);
            }
        }
        self.slots.reset_all();
        self.busy = 0;
        self.event_slot = None;
    }

    /// Soft reset: abort everything, release every slot, drop the reply
    /// queue and return to `Ready` with interrupts disabled.
    pub fn soft_reset(&mut self, bus: &mut dyn ScsiBus) {
        debug!(state = ?self.fw_state, "soft reset");
        for index in 0..self.slots.len() {
            if let Some(request) = self.slots.get(index).request {
                bus.cancel(request);
            }
        }
        self.slots.reset_all();
        self.reset_state();
    }

    fn reset_state(&mut self) {
        self.busy = 0;
        self.reply.clear();
        self.fw_state = FirmwareState::Ready;
        self.doorbell = 0;
        self.intr_mask = INTR_DISABLED_MASK;
        self.frame_hi = 0;
        self.event_slot = None;
        self.event_count += 1;
        self.boot_event = self.event_count;
        self.irq.set_level(false);
    }

    /// Entry point for a queue-port submission.
    fn handle_frame(
        &mut self,
        frame_addr: u64,
        frame_count: u16,
        mem: &mut dyn MemoryBus,
        bus: &mut dyn ScsiBus,
    ) {
        if self.fw_state == FirmwareState::Fault {
            warn!(frame_addr, "frame submitted while faulted, dropped");
            return;
        }
        // Always read the full 64-bit context; it is truncated at acquire
        // time if the reply queue uses narrow contexts.
        let context = match mem.read_u64(frame_addr + FrameHeader::CONTEXT_OFFSET) {
            Ok(context) => context,
            Err(err) => {
                warn!(frame_addr, %err, "frame header unreadable");
                self.event_count += 1;
                return;
            }
        };
        let wide = self.reply.wide_context();
        let posted_context = if wide { context } else { context & 0xffff_ffff };

        let (index, is_new) =
            match self
                .slots
                .acquire(frame_addr, context, frame_count, wide, mem)
            {
                Ok(accepted) => accepted,
                Err(AcquireError::Busy) => {
                    trace!(frame_addr, "all frame slots busy");
                    self.event_count += 1;
                    self.write_frame_status(
                        frame_addr,
                        MfiStatus::SCSI_DONE_WITH_ERROR,
                        Some(scsi_status::BUSY),
                        mem,
                    );
                    self.post_completion(posted_context, mem);
                    return;
                }
                Err(AcquireError::MapFailed) => {
                    self.event_count += 1;
                    self.write_frame_status(
                        frame_addr,
                        MfiStatus::MEMORY_NOT_AVAILABLE,
                        None,
                        mem,
                    );
                    self.post_completion(posted_context, mem);
                    return;
                }
            };
        if is_new {
            self.busy += 1;
        }

        let parsed = {
            let slot = self.slots.get(index);
            Frame::parse(slot.window.as_deref().unwrap_or(&[]))
        };
        let frame = match parsed {
            Ok(frame) => frame,
            Err(err) => {
                trace!(index, %err, "undecodable frame");
                self.event_count += 1;
                self.finalize_frame(index, frame_addr, posted_context, MfiStatus::INVALID_CMD, mem);
                return;
            }
        };
        trace!(
            index,
            cmd = frame.command.describe(),
            context,
            count = frame_count,
            "frame accepted"
        );
        self.slots.get_mut(index).frame = Some(frame.clone());

        let outcome = match frame.command {
            FrameCommand::Init => Outcome::Complete(self.init_firmware(index, mem)),
            FrameCommand::Dcmd => dcmd::dispatch(self, index, mem, bus),
            FrameCommand::Abort => Outcome::Complete(self.handle_abort(index, bus)),
            FrameCommand::LdRead | FrameCommand::LdWrite => self.handle_io(index, mem, bus),
            FrameCommand::LdScsi => self.handle_pass(index, true, mem, bus),
            FrameCommand::PdScsi => self.handle_pass(index, false, mem, bus),
            FrameCommand::Smp | FrameCommand::Stp => {
                trace!(index, cmd = frame.command.describe(), "unhandled frame command");
                self.event_count += 1;
                Outcome::Complete(MfiStatus::INVALID_CMD)
            }
        };
        match outcome {
            Outcome::Complete(status) => {
                self.finalize_frame(index, frame_addr, posted_context, status, mem)
            }
            Outcome::Pending => trace!(index, "frame pending on backend"),
        }
    }

    /// Install the reply queue described by an init-firmware frame.
    fn init_firmware(&mut self, index: usize, mem: &mut dyn MemoryBus) -> MfiStatus {
        let Some(frame) = self.slots.get(index).frame.clone() else {
            return MfiStatus::INVALID_CMD;
        };
        let FramePayload::Init { qinfo_addr } = frame.payload else {
            return MfiStatus::INVALID_CMD;
        };
        if self.reply.is_configured() {
            trace!(index, "init firmware: reply queue already configured");
            return MfiStatus::OK;
        }
        debug!(index, qinfo_addr, "init firmware");
        let mut block = [0u8; InitQueueInfo::SIZE];
        if mem.read_physical(qinfo_addr, &mut block).is_err() {
            trace!(index, qinfo_addr, "queue-init block map failed");
            self.event_count += 1;
            return MfiStatus::MEMORY_NOT_AVAILABLE;
        }
        let Ok(info) = InitQueueInfo::parse(&block) else {
            self.event_count += 1;
            return MfiStatus::MEMORY_NOT_AVAILABLE;
        };
        let entries = info.rq_entries & 0xffff;
        if entries == 0 || entries > self.cfg.max_cmds {
            trace!(index, entries, max = self.cfg.max_cmds, "queue size rejected");
            self.event_count += 1;
            return MfiStatus::INVALID_PARAMETER;
        }
        if self.reply.configure(&info, entries as u16, mem).is_err() {
            trace!(index, "queue descriptor cells unreadable");
            self.event_count += 1;
            return MfiStatus::MEMORY_NOT_AVAILABLE;
        }
        // Every previously mapped frame (including this one) is torn down;
        // the init frame completes through the direct status write path.
        self.slots.reset_all();
        self.busy = 0;
        self.fw_state = FirmwareState::Operational;
        MfiStatus::OK
    }

    /// Logical-device read/write: encode an internal READ_16/WRITE_16 and
    /// hand the decoded scatter list to the backend.
    fn handle_io(
        &mut self,
        index: usize,
        mem: &mut dyn MemoryBus,
        bus: &mut dyn ScsiBus,
    ) -> Outcome {
        let Some(frame) = self.slots.get(index).frame.clone() else {
            return Outcome::Complete(MfiStatus::INVALID_CMD);
        };
        let FramePayload::Io { lba, sgl_offset, .. } = frame.payload else {
            return Outcome::Complete(MfiStatus::INVALID_CMD);
        };
        let header = frame.header;
        let is_write = frame.command == FrameCommand::LdWrite;
        // For read/write frames the header transfer length counts blocks.
        let lba_count = header.data_len;

        let Some(device) = self.lookup_device(header.target_id, header.lun_id, true, bus) else {
            trace!(
                index,
                target = header.target_id,
                lun = header.lun_id,
                "io target not present"
            );
            return Outcome::Complete(MfiStatus::DEVICE_NOT_FOUND);
        };
        if header.cdb_len > 16 {
            trace!(index, cdb_len = header.cdb_len, "oversized cdb");
            return Outcome::Complete(self.fail_with_sense(
                index,
                SENSE_KEY_ILLEGAL_REQUEST,
                ASC_INVALID_OPCODE,
                0,
                scsi_status::CHECK_CONDITION,
                mem,
            ));
        }

        let xfer_len = lba_count as u64 * device.block_size as u64;
        if let Err(status) = self.map_transfer(index, sgl_offset, xfer_len, mem) {
            return Outcome::Complete(status);
        }

        let cdb = encode_rw16(lba, lba_count, is_write);
        trace!(
            index,
            lba,
            lba_count,
            is_write,
            xfer_len,
            "io request submitted"
        );
        self.submit_request(index, header.target_id, header.lun_id, &cdb, mem, bus)
    }

    /// Raw-CDB passthrough, logical or physical.
    fn handle_pass(
        &mut self,
        index: usize,
        is_logical: bool,
        mem: &mut dyn MemoryBus,
        bus: &mut dyn ScsiBus,
    ) -> Outcome {
        let Some(frame) = self.slots.get(index).frame.clone() else {
            return Outcome::Complete(MfiStatus::INVALID_CMD);
        };
        let FramePayload::Scsi { cdb, sgl_offset, .. } = frame.payload else {
            return Outcome::Complete(MfiStatus::INVALID_CMD);
        };
        let header = frame.header;

        if self
            .lookup_device(header.target_id, header.lun_id, is_logical, bus)
            .is_none()
        {
            trace!(
                index,
                target = header.target_id,
                lun = header.lun_id,
                is_logical,
                "scsi target not present"
            );
            return Outcome::Complete(MfiStatus::DEVICE_NOT_FOUND);
        }
        if header.cdb_len > 16 {
            trace!(index, cdb_len = header.cdb_len, "oversized cdb");
            return Outcome::Complete(self.fail_with_sense(
                index,
                SENSE_KEY_ILLEGAL_REQUEST,
                ASC_INVALID_OPCODE,
                0,
                scsi_status::CHECK_CONDITION,
                mem,
            ));
        }

        if let Err(status) = self.map_transfer(index, sgl_offset, header.data_len as u64, mem) {
            return Outcome::Complete(status);
        }

        let cdb_len = (header.cdb_len as usize).min(cdb.len());
        trace!(index, cdb_len, xfer = header.data_len, "passthrough submitted");
        let cdb = cdb[..cdb_len].to_vec();
        self.submit_request(index, header.target_id, header.lun_id, &cdb, mem, bus)
    }

    /// Decode the frame's scatter list and record the expected transfer.
    /// A decode failure synthesizes sense and fails the frame locally.
    fn map_transfer(
        &mut self,
        index: usize,
        sgl_offset: usize,
        xfer_len: u64,
        mem: &mut dyn MemoryBus,
    ) -> Result<(), MfiStatus> {
        let (segments, total) = {
            let slot = self.slots.get(index);
            let Some(frame) = slot.frame.as_ref() else {
                return Err(MfiStatus::INVALID_CMD);
            };
            let window = slot.window.as_deref().unwrap_or(&[]);
            let format = SglFormat::from_flags(frame.header.flags);
            match sgl::decode(
                window,
                sgl_offset,
                frame.header.sge_count as usize,
                format,
                self.cfg.max_sge as usize,
            ) {
                Ok(segments) => {
                    let total = sgl::total_len(&segments);
                    (segments, total)
                }
                Err(err) => {
                    trace!(index, %err, "scatter list rejected");
                    return Err(self.fail_with_sense(
                        index,
                        SENSE_KEY_HARDWARE_ERROR,
                        ASC_INTERNAL_TARGET_FAILURE,
                        0,
                        scsi_status::CHECK_CONDITION,
                        mem,
                    ));
                }
            }
        };
        // A length mismatch is diagnostic, not fatal.
        if total != xfer_len {
            trace!(index, total, xfer_len, "scatter list length mismatch");
        }
        let slot = self.slots.get_mut(index);
        slot.xfer_len = xfer_len as usize;
        slot.sgl = segments;
        Ok(())
    }

    /// Create and start the backend request for an accepted I/O frame.
    fn submit_request(
        &mut self,
        index: usize,
        target_id: u8,
        lun: u8,
        cdb: &[u8],
        mem: &mut dyn MemoryBus,
        bus: &mut dyn ScsiBus,
    ) -> Outcome {
        let segments = self.slots.get(index).sgl.clone();
        let Some(request) = bus.new_request(target_id, lun, index as u32, cdb, &segments) else {
            trace!(index, target_id, lun, "backend request allocation failed");
            return Outcome::Complete(self.fail_with_sense(
                index,
                0,
                0,
                0,
                scsi_status::BUSY,
                mem,
            ));
        };
        self.slots.get_mut(index).request = Some(request);

        let expected = bus.enqueue(request);
        if expected != 0 {
            let magnitude = expected.unsigned_abs() as usize;
            let slot = self.slots.get_mut(index);
            if magnitude > slot.xfer_len {
                trace!(index, magnitude, xfer = slot.xfer_len, "transfer overflow");
            } else if magnitude < slot.xfer_len {
                trace!(index, magnitude, xfer = slot.xfer_len, "transfer underflow");
                slot.xfer_len = magnitude;
            }
            bus.continue_request(request);
        }
        Outcome::Pending
    }

    /// Abort engine: cancel the frame mapped at the given address if its
    /// stored context matches.
    fn handle_abort(&mut self, index: usize, bus: &mut dyn ScsiBus) -> MfiStatus {
        let Some(frame) = self.slots.get(index).frame.clone() else {
            return MfiStatus::INVALID_CMD;
        };
        let FramePayload::Abort {
            abort_context,
            abort_addr,
        } = frame.payload
        else {
            return MfiStatus::INVALID_CMD;
        };
        self.event_count += 1;

        let Some(victim) = self.slots.lookup(abort_addr) else {
            // Nothing to abort: guests routinely race aborts against
            // completion, so this is success.
            trace!(index, abort_addr, "abort target not mapped");
            return MfiStatus::OK;
        };
        // Contexts are compared after the same truncation applied when the
        // target frame was accepted.
        let target_context = if self.reply.wide_context() {
            abort_context
        } else {
            abort_context & 0xffff_ffff
        };
        if self.slots.get(victim).context != target_context {
            trace!(
                index,
                victim,
                stored = self.slots.get(victim).context,
                requested = target_context,
                "abort context mismatch"
            );
            return MfiStatus::ABORT_NOT_POSSIBLE;
        }
        let is_dcmd = matches!(
            self.slots.get(victim).frame.as_ref().map(|f| f.command),
            Some(FrameCommand::Dcmd)
        );
        if is_dcmd {
            // Administrative frames are never abortable.
            trace!(index, victim, "abort targets a DCMD frame, ignored");
            return MfiStatus::OK;
        }
        trace!(index, victim, "aborting frame");
        if let Some(request) = self.slots.get(victim).request {
            bus.cancel(request);
        }
        self.slots.release(victim);
        self.busy = self.busy.saturating_sub(1);
        MfiStatus::OK
    }

    /// Backend data-ready callback. For regular I/O the backend already
    /// moved the bytes through the scatter list; internal DCMD inquiries
    /// deliver their payload here.
    pub fn on_xfer_ready(&mut self, tag: u32, data: &[u8], bus: &mut dyn ScsiBus) {
        let index = tag as usize;
        if index >= self.slots.len() {
            warn!(tag, "data ready for unknown slot");
            return;
        }
        let Some(request) = self.slots.get(index).request else {
            warn!(tag, "data ready for idle slot");
            return;
        };
        trace!(index, len = data.len(), "backend data ready");
        if self.slots.get(index).dcmd_step != DcmdStep::None {
            dcmd::absorb_xfer(self, index, data);
        }
        bus.continue_request(request);
    }

    /// Backend completion callback: finalize the waiting frame, or resume a
    /// multi-step DCMD.
    pub fn on_request_complete(
        &mut self,
        tag: u32,
        status: u8,
        residual: usize,
        sense: &[u8],
        mem: &mut dyn MemoryBus,
        bus: &mut dyn ScsiBus,
    ) {
        let index = tag as usize;
        if index >= self.slots.len() {
            warn!(tag, "completion for unknown slot");
            return;
        }
        if self.slots.get_mut(index).request.take().is_none() {
            warn!(tag, "completion for idle slot");
            return;
        }
        trace!(index, status, residual, "backend request complete");

        let frame_addr = self.slots.get(index).frame_addr.unwrap_or_default();
        let context = self.slots.get(index).context;

        if self.slots.get(index).dcmd_step != DcmdStep::None {
            match dcmd::resume(self, index, mem, bus) {
                Outcome::Complete(dcmd_status) => {
                    self.finalize_frame(index, frame_addr, context, dcmd_status, mem)
                }
                Outcome::Pending => {}
            }
            return;
        }

        let mut cmd_status = MfiStatus::OK;
        if status != scsi_status::GOOD {
            cmd_status = MfiStatus::SCSI_DONE_WITH_ERROR;
        }
        if status == scsi_status::CHECK_CONDITION {
            self.write_sense_bytes(index, sense, mem);
        }
        if let Err(err) = mem.write_u8(frame_addr + FrameHeader::SCSI_STATUS_OFFSET, status) {
            warn!(index, %err, "scsi status write-back failed");
        }
        let slot = self.slots.get_mut(index);
        slot.xfer_len = slot.xfer_len.saturating_sub(residual);
        self.finalize_frame(index, frame_addr, context, cmd_status, mem);
    }

    /// End a frame's lifecycle: free the slot, write the completion status
    /// into the guest frame and announce it on the reply queue.
    pub(crate) fn finalize_frame(
        &mut self,
        index: usize,
        frame_addr: u64,
        fallback_context: u64,
        status: MfiStatus,
        mem: &mut dyn MemoryBus,
    ) {
        let slot = self.slots.get(index);
        let context = if slot.frame_addr == Some(frame_addr) {
            let context = slot.context;
            self.slots.release(index);
            // Busy accounting settles before any reply or interrupt work.
            self.busy = self.busy.saturating_sub(1);
            context
        } else {
            // The handler tore the pool down underneath us (init firmware):
            // complete through the captured address and context.
            fallback_context
        };
        trace!(index, frame_addr, context, status = status.0, "frame complete");
        self.write_frame_status(frame_addr, status, None, mem);
        self.post_completion(context, mem);
    }

    fn write_frame_status(
        &mut self,
        frame_addr: u64,
        status: MfiStatus,
        scsi: Option<u8>,
        mem: &mut dyn MemoryBus,
    ) {
        if let Err(err) = mem.write_u8(frame_addr + FrameHeader::CMD_STATUS_OFFSET, status.0) {
            warn!(frame_addr, %err, "command status write-back failed");
        }
        if let Some(scsi) = scsi {
            if let Err(err) = mem.write_u8(frame_addr + FrameHeader::SCSI_STATUS_OFFSET, scsi) {
                warn!(frame_addr, %err, "scsi status write-back failed");
            }
        }
    }

    /// Post a completion context and signal the guest.
    fn post_completion(&mut self, context: u64, mem: &mut dyn MemoryBus) {
        if let Err(err) = self.reply.post(context, mem) {
            warn!(context, %err, "reply post failed");
        }
        if !self.interrupts_enabled() {
            trace!(context, "completion with interrupts masked");
            return;
        }
        if self.irq.msi_enabled() {
            self.irq.msi_notify(0);
        } else {
            self.doorbell += 1;
            if self.doorbell == 1 {
                self.irq.set_level(true);
            }
        }
    }

    fn lookup_device(
        &self,
        target_id: u8,
        lun: u8,
        is_logical: bool,
        bus: &dyn ScsiBus,
    ) -> Option<DeviceInfo> {
        if is_logical && (self.cfg.use_jbod || target_id >= MAX_LD || lun != 0) {
            return None;
        }
        bus.device_info(target_id, lun)
    }

    /// Synthesize fixed-format sense, write it through the frame's sense
    /// pointer and fail the frame with a device-level error status.
    fn fail_with_sense(
        &mut self,
        index: usize,
        key: u8,
        asc: u8,
        ascq: u8,
        scsi: u8,
        mem: &mut dyn MemoryBus,
    ) -> MfiStatus {
        let sense = fixed_sense(key, asc, ascq);
        self.write_sense_bytes(index, &sense, mem);
        if let Some(frame_addr) = self.slots.get(index).frame_addr {
            if let Err(err) = mem.write_u8(frame_addr + FrameHeader::SCSI_STATUS_OFFSET, scsi) {
                warn!(index, %err, "scsi status write-back failed");
            }
        }
        self.event_count += 1;
        MfiStatus::SCSI_DONE_WITH_ERROR
    }

    /// Copy sense bytes to the frame's sense buffer, capped at the length
    /// the frame asked for, and write back the accepted length.
    fn write_sense_bytes(&mut self, index: usize, sense: &[u8], mem: &mut dyn MemoryBus) {
        let slot = self.slots.get(index);
        let Some(frame) = slot.frame.as_ref() else {
            return;
        };
        let sense_addr = match frame.payload {
            FramePayload::Io { sense_addr, .. } | FramePayload::Scsi { sense_addr, .. } => {
                sense_addr
            }
            _ => return,
        };
        let len = (frame.header.sense_len as usize).min(sense.len());
        if len == 0 || sense_addr == 0 {
            return;
        }
        let frame_addr = slot.frame_addr.unwrap_or_default();
        if let Err(err) = mem.write_physical(sense_addr, &sense[..len]) {
            warn!(index, %err, "sense write failed");
            return;
        }
        if let Err(err) = mem.write_u8(frame_addr + FrameHeader::SENSE_LEN_OFFSET, len as u8) {
            warn!(index, %err, "sense length write-back failed");
        }
    }
}

/// 18-byte fixed-format sense block.
fn fixed_sense(key: u8, asc: u8, ascq: u8) -> [u8; 18] {
    let mut sense = [0u8; 18];
    sense[0] = 0xf0;
    sense[2] = key;
    sense[7] = 10;
    sense[12] = asc;
    sense[13] = ascq;
    sense
}

/// Encode an internal READ_16/WRITE_16 CDB from a block range.
fn encode_rw16(lba: u64, blocks: u32, is_write: bool) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = if is_write { WRITE_16 } else { READ_16 };
    cdb[2..10].copy_from_slice(&lba.to_be_bytes());
    cdb[10..14].copy_from_slice(&blocks.to_be_bytes());
    cdb
}
