//! Frame slot table: the fixed pool of command contexts.
//!
//! A slot is busy iff it holds a guest frame address; at most one busy slot
//! maps any given address at a time. Accepting a frame copies its full
//! fixed-size window out of guest memory, so later scatter-gather walks are
//! bounded by bytes the adapter actually owns.

use tracing::trace;

use ironsas_mfi::{Frame, FRAME_WINDOW};

use crate::bus::MemoryBus;
use crate::scsi::RequestHandle;

/// Progress of a multi-step DCMD parked on a slot between backend replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DcmdStep {
    #[default]
    None,
    /// PD get-info: standard INQUIRY outstanding.
    PdInquiry,
    /// PD get-info: VPD page 0x83 INQUIRY outstanding.
    PdVpd,
    /// LD get-info: VPD page 0x83 INQUIRY outstanding.
    LdVpd,
}

/// One command context.
#[derive(Debug, Default)]
pub struct CommandSlot {
    index: u32,
    pub frame_addr: Option<u64>,
    /// Copy of the mapped frame window; present iff busy.
    pub window: Option<Box<[u8]>>,
    /// Decoded view of the first wire frame, once routing has seen it.
    pub frame: Option<Frame>,
    /// Completion context, width-truncated at acquire time.
    pub context: u64,
    /// Frame count from the queue-port submission.
    pub count: u16,
    pub request: Option<RequestHandle>,
    pub dcmd_opcode: Option<u32>,
    pub dcmd_step: DcmdStep,
    /// Response under construction for a multi-step DCMD.
    pub scratch: Option<Vec<u8>>,
    /// Resolved destination for a single-SGE DCMD.
    pub dcmd_seg: Option<ironsas_mfi::SglSegment>,
    /// Decoded scatter list for an I/O or passthrough transfer.
    pub sgl: Vec<ironsas_mfi::SglSegment>,
    /// Bytes the current transfer is expected to move.
    pub xfer_len: usize,
}

impl CommandSlot {
    fn new(index: u32) -> Self {
        CommandSlot {
            index,
            context: u64::MAX,
            ..CommandSlot::default()
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_busy(&self) -> bool {
        self.frame_addr.is_some()
    }

    fn clear(&mut self) {
        *self = CommandSlot::new(self.index);
    }
}

/// Result of trying to accept a frame into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// Every slot is occupied. Normal backpressure; the guest retries.
    Busy,
    /// The frame window did not map in full.
    MapFailed,
}

pub struct SlotTable {
    slots: Vec<CommandSlot>,
}

impl SlotTable {
    pub fn new(count: usize) -> Self {
        SlotTable {
            slots: (0..count).map(|i| CommandSlot::new(i as u32)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> &CommandSlot {
        &self.slots[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut CommandSlot {
        &mut self.slots[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSlot> {
        self.slots.iter()
    }

    /// Find the busy slot currently mapping `frame_addr`.
    pub fn lookup(&self, frame_addr: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.frame_addr == Some(frame_addr))
    }

    /// Accept a frame: reuse the slot already mapping `frame_addr`
    /// (resubmission), or claim a free one and copy the frame window in.
    /// Returns the slot index and whether the frame is newly accepted.
    pub fn acquire(
        &mut self,
        frame_addr: u64,
        context: u64,
        count: u16,
        wide_context: bool,
        mem: &dyn MemoryBus,
    ) -> Result<(usize, bool), AcquireError> {
        if let Some(index) = self.lookup(frame_addr) {
            trace!(index, frame_addr, "frame resubmitted, reusing slot");
            self.slots[index].count = count;
            return Ok((index, false));
        }

        let index = self
            .slots
            .iter()
            .position(|slot| !slot.is_busy())
            .ok_or(AcquireError::Busy)?;

        let mut window = vec![0u8; FRAME_WINDOW].into_boxed_slice();
        if mem.read_physical(frame_addr, &mut window).is_err() {
            trace!(index, frame_addr, "frame window map failed");
            return Err(AcquireError::MapFailed);
        }

        let slot = &mut self.slots[index];
        slot.frame_addr = Some(frame_addr);
        slot.window = Some(window);
        slot.context = if wide_context {
            context
        } else {
            context & 0xffff_ffff
        };
        slot.count = count;
        trace!(index, frame_addr, context = slot.context, "frame accepted");
        Ok((index, true))
    }

    /// Release a slot: the index becomes reusable immediately.
    pub fn release(&mut self, index: usize) {
        trace!(index, "slot released");
        self.slots[index].clear();
    }

    /// Release every slot unconditionally. Used by soft reset and by the
    /// abort-all doorbell.
    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            if slot.is_busy() {
                slot.clear();
            }
        }
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_busy()).count()
    }
}
