//! LSI MegaRAID SAS host bus adapter (MFI command engine) emulation.
//!
//! This crate intentionally stays small and self-contained: the only
//! external inputs are guest physical memory (DMA), an interrupt line and a
//! backend SCSI execution layer, each supplied by the embedder through a
//! trait defined here.
//!
//! The command engine implements:
//! - the MFI register file (doorbells, interrupt mask/status, queue ports,
//!   the diag/sequencer adapter-reset handshake)
//! - the frame slot table with at-most-once-per-slot accounting
//! - init-firmware and the guest reply ring
//! - logical read/write, raw-CDB passthrough and frame abort
//! - the administrative DCMD space, including the multi-step
//!   device-info commands
//!
//! Everything is single-threaded and event-driven: "asynchronous" commands
//! leave their slot occupied until the embedder re-enters the controller
//! through [`MegaraidController::on_xfer_ready`] /
//! [`MegaraidController::on_request_complete`]. If the host environment is
//! itself multi-threaded, wrap each adapter instance in one lock; there is
//! no finer-grained locking worth having, nearly every operation touches
//! the slot table.

pub mod bus;
mod controller;
mod dcmd;
pub mod pci;
mod reply;
pub mod scsi;
pub mod slots;

pub use bus::{IrqLine, LatchIrqLine, MemoryBus, MemoryError, VecMemory};
pub use controller::{ControllerConfig, MegaraidController, MAX_LD};
pub use pci::MegaraidPciDevice;
pub use scsi::{DeviceInfo, RequestHandle, ScsiBus};

pub use ironsas_mfi as mfi;
