//! Reply queue: the guest-memory ring used to announce completions.
//!
//! The ring holds 32- or 64-bit little-endian context values; separate
//! producer and consumer index cells live elsewhere in guest memory. The
//! adapter owns the producer side; the guest consumes.

use tracing::trace;

use ironsas_mfi::{InitQueueInfo, QUEUE_FLAG_CONTEXT64};

use crate::bus::{MemoryBus, MemoryError};

#[derive(Debug, Default)]
pub struct ReplyQueue {
    base: u64,
    capacity: u16,
    head: u16,
    consumer_addr: u64,
    producer_addr: u64,
    wide_context: bool,
}

impl ReplyQueue {
    pub fn is_configured(&self) -> bool {
        self.base != 0
    }

    pub fn wide_context(&self) -> bool {
        self.wide_context
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Install the ring described by an init-firmware queue block. The
    /// caller has already validated the entry count; the producer and
    /// consumer cells must resolve or configuration fails.
    pub fn configure(
        &mut self,
        info: &InitQueueInfo,
        capacity: u16,
        mem: &dyn MemoryBus,
    ) -> Result<(), MemoryError> {
        let producer = mem.read_u32(info.pi_addr)?;
        let consumer = mem.read_u32(info.ci_addr)?;
        self.base = info.rq_addr;
        self.capacity = capacity;
        self.head = (producer % capacity as u32) as u16;
        self.consumer_addr = info.ci_addr;
        self.producer_addr = info.pi_addr;
        self.wide_context = info.flags & QUEUE_FLAG_CONTEXT64 != 0;
        trace!(
            base = self.base,
            capacity,
            head = self.head,
            consumer,
            wide = self.wide_context,
            "reply queue configured"
        );
        Ok(())
    }

    /// Drop the configuration; posts become no-ops until the next init.
    pub fn clear(&mut self) {
        *self = ReplyQueue::default();
    }

    /// Post a completion context and publish the new producer index.
    /// Silently dropped while unconfigured (valid before initialization).
    pub fn post(&mut self, context: u64, mem: &mut dyn MemoryBus) -> Result<(), MemoryError> {
        if !self.is_configured() {
            trace!(context, "reply dropped, queue not configured");
            return Ok(());
        }
        if self.wide_context {
            let offset = self.head as u64 * 8;
            mem.write_u64(self.base + offset, context)?;
        } else {
            let offset = self.head as u64 * 4;
            mem.write_u32(self.base + offset, context as u32)?;
        }
        self.head = (self.head + 1) % self.capacity;
        self.publish_producer(mem)
    }

    /// Write the producer index to its guest-visible cell.
    pub fn publish_producer(&self, mem: &mut dyn MemoryBus) -> Result<(), MemoryError> {
        if !self.is_configured() {
            return Ok(());
        }
        mem.write_u32(self.producer_addr, self.head as u32)
    }
}
