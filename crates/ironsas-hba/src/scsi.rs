//! Backend SCSI execution seam.
//!
//! The adapter turns accepted frames into backend requests and then waits:
//! the embedder drives the backend and re-enters the controller through
//! [`crate::MegaraidController::on_xfer_ready`] and
//! [`crate::MegaraidController::on_request_complete`] when the backend has
//! something to say. Command-set emulation (what a CDB actually does) lives
//! entirely behind this trait.

use ironsas_mfi::SglSegment;

/// Opaque handle to an outstanding backend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHandle(pub u64);

/// Inventory entry for one device on the backend bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub target_id: u8,
    pub lun: u8,
    /// SCSI peripheral device type byte (0x00 = direct access).
    pub device_type: u8,
    pub block_size: u32,
    pub capacity_blocks: u64,
}

/// The backend SCSI execution layer.
///
/// `tag` is the adapter-side slot index; it comes back unchanged on the
/// completion entry points so the adapter can find the waiting frame.
/// Requests created with a non-empty segment list transfer their data phase
/// directly to/from guest memory through those segments; requests created
/// with an empty list (the adapter's internal inquiries) surface their data
/// through `on_xfer_ready` instead.
///
/// After [`ScsiBus::cancel`] returns, no further events fire for that
/// request.
pub trait ScsiBus {
    fn device_info(&self, target_id: u8, lun: u8) -> Option<DeviceInfo>;

    /// Bus inventory, in stable order. Used by the inventory DCMDs.
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Create a request; `None` means the backend cannot allocate one right
    /// now (the frame completes with an error status, the guest retries).
    fn new_request(
        &mut self,
        target_id: u8,
        lun: u8,
        tag: u32,
        cdb: &[u8],
        segments: &[SglSegment],
    ) -> Option<RequestHandle>;

    /// Start processing. Positive: device-to-host bytes expected. Negative:
    /// host-to-device, magnitude is the byte count. Zero: no data phase.
    fn enqueue(&mut self, request: RequestHandle) -> i64;

    /// Resume a request after the adapter consumed a data-ready event.
    fn continue_request(&mut self, request: RequestHandle);

    /// Cancel an outstanding request.
    fn cancel(&mut self, request: RequestHandle);
}
