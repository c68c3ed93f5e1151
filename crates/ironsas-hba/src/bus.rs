//! Guest-memory and interrupt seams.
//!
//! The adapter never owns guest memory or an interrupt controller; the
//! embedder supplies both through these traits. Accesses must tolerate
//! addresses that do not resolve: a failed access surfaces as a completion
//! status on the affected frame, never as a host-level fault.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Errors returned when the adapter cannot access guest memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("guest memory access out of bounds: addr={addr:#x} len={len}")]
    OutOfBounds { addr: u64, len: usize },
}

/// Guest physical memory access used for DMA.
pub trait MemoryBus {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError>;

    fn read_u32(&self, paddr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, paddr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&mut self, paddr: u64, val: u8) -> Result<(), MemoryError> {
        self.write_physical(paddr, &[val])
    }

    fn write_u32(&mut self, paddr: u64, val: u32) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }

    fn write_u64(&mut self, paddr: u64, val: u64) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }
}

/// Interrupt delivery: a level-triggered line, optionally backed by
/// message-signalled delivery. The default implementation is line-only.
pub trait IrqLine {
    fn set_level(&self, high: bool);

    fn msi_enabled(&self) -> bool {
        false
    }

    fn msi_notify(&self, vector: u16) {
        let _ = vector;
    }
}

/// RAM-backed [`MemoryBus`]. Useful as an embedder building block and as the
/// guest-memory double in tests.
pub struct VecMemory {
    buf: Vec<u8>,
}

impl VecMemory {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl MemoryBus for VecMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let start = usize::try_from(paddr).map_err(|_| MemoryError::OutOfBounds {
            addr: paddr,
            len: buf.len(),
        })?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.buf.len())
            .ok_or(MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            })?;
        buf.copy_from_slice(&self.buf[start..end]);
        Ok(())
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let start = usize::try_from(paddr).map_err(|_| MemoryError::OutOfBounds {
            addr: paddr,
            len: buf.len(),
        })?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.buf.len())
            .ok_or(MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            })?;
        self.buf[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Minimal [`IrqLine`] that latches the line level and can be shared with
/// the embedder or a test.
#[derive(Clone, Default)]
pub struct LatchIrqLine {
    level: Arc<AtomicBool>,
}

impl LatchIrqLine {
    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

impl IrqLine for LatchIrqLine {
    fn set_level(&self, high: bool) {
        self.level.store(high, Ordering::SeqCst);
    }
}
