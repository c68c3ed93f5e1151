//! Minimal PCI identity for the adapter.
//!
//! A full PCI bus is out of scope for this crate; this wrapper provides
//! enough config space for enumeration plus the three register windows the
//! device exposes: MMIO registers (BAR0), a port-I/O alias (BAR2) and the
//! write-only queue window (BAR3).

use crate::bus::{IrqLine, MemoryBus};
use crate::controller::{ControllerConfig, MegaraidController};
use crate::scsi::ScsiBus;

const PCI_VENDOR_LSI: u16 = 0x1000;
const PCI_DEVICE_SAS1078: u16 = 0x0060;
const PCI_SUBSYSTEM_ID: u16 = 0x1013;

pub struct MegaraidPciDevice {
    pub controller: MegaraidController,
    config_space: [u8; 256],
}

impl MegaraidPciDevice {
    pub fn new(cfg: ControllerConfig, irq: Box<dyn IrqLine>) -> Self {
        let controller = MegaraidController::new(cfg, irq);
        let mut config_space = [0u8; 256];

        config_space[0x00..0x02].copy_from_slice(&PCI_VENDOR_LSI.to_le_bytes());
        config_space[0x02..0x04].copy_from_slice(&PCI_DEVICE_SAS1078.to_le_bytes());

        // Class code: Mass Storage (0x01), RAID (0x04).
        config_space[0x0a] = 0x04;
        config_space[0x0b] = 0x01;

        config_space[0x2c..0x2e].copy_from_slice(&PCI_VENDOR_LSI.to_le_bytes());
        config_space[0x2e..0x30].copy_from_slice(&PCI_SUBSYSTEM_ID.to_le_bytes());

        // INTx pin A, latency timer 0.
        config_space[0x3d] = 0x01;

        MegaraidPciDevice {
            controller,
            config_space,
        }
    }

    pub fn config_read_u32(&self, offset: u16) -> u32 {
        let off = offset as usize;
        if off + 4 > self.config_space.len() {
            return 0xffff_ffff;
        }
        u32::from_le_bytes(self.config_space[off..off + 4].try_into().unwrap())
    }

    /// BAR0: register file.
    pub fn mmio_len(&self) -> u64 {
        0x4000
    }

    /// BAR2: port-I/O alias of the register file.
    pub fn port_len(&self) -> u64 {
        256
    }

    /// BAR3: frame submission window; reads float high to zero.
    pub fn queue_len(&self) -> u64 {
        0x40000
    }

    pub fn mmio_read(&self, offset: u64) -> u32 {
        self.controller.mmio_read(offset)
    }

    pub fn mmio_write(
        &mut self,
        offset: u64,
        value: u64,
        mem: &mut dyn MemoryBus,
        bus: &mut dyn ScsiBus,
    ) {
        self.controller.mmio_write(offset, value, mem, bus);
    }

    pub fn queue_read(&self, _offset: u64) -> u64 {
        0
    }
}
