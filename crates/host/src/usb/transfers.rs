//! Transfer slots and completion handling
//!
//! Every open handle owns three transfers: control, bulk-OUT and bulk-IN.
//! A transfer is always in exactly one place, either parked in its
//! [`TransferSlot`] or owned by the platform. Callers take it out of the
//! slot (waiting for it to come back if it is in flight), fill it, and hand
//! it to the platform; the completion handler puts it back.
//!
//! The bulk-IN transfer is the exception: its handler decodes the status
//! bytes, delivers the payload and resubmits the same transfer, so it only
//! returns to its slot when polling stops.

use crate::usb::device::{DeviceEvent, DeviceInner, DeviceState};
use crate::usb::{lock, write};
use byteorder::{ByteOrder, LittleEndian};
use common::{CompletionHandler, Error, Result, Transfer, TransferStatus};
use protocol::{STATUS_LEN, parse_modem_status};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Size of a control setup packet
pub(crate) const SETUP_LEN: usize = 8;

/// Control transfer buffer: setup packet plus payload
pub(crate) const CONTROL_BUFFER_SIZE: usize = 64;

/// Largest data stage accepted by `send_control_request`
pub const MAX_CONTROL_PAYLOAD: usize = CONTROL_BUFFER_SIZE - SETUP_LEN;

/// How long a control request waits for the previous one to complete
pub(crate) const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close` waits for in-flight transfers to come back
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Home of a transfer while it is not owned by the platform
pub(crate) struct TransferSlot {
    name: &'static str,
    transfer: Mutex<Option<Box<Transfer>>>,
    returned: Condvar,
}

impl TransferSlot {
    pub(crate) fn new(name: &'static str, transfer: Box<Transfer>) -> Self {
        Self {
            name,
            transfer: Mutex::new(Some(transfer)),
            returned: Condvar::new(),
        }
    }

    /// Take the transfer, waiting up to `timeout` for it to be returned
    pub(crate) fn take(&self, timeout: Duration) -> Result<Box<Transfer>> {
        let guard = lock(&self.transfer);
        let (mut guard, _) = self
            .returned
            .wait_timeout_while(guard, timeout, |transfer| transfer.is_none())
            .unwrap_or_else(PoisonError::into_inner);

        guard.take().ok_or_else(|| {
            debug!("{} transfer still in flight after {:?}", self.name, timeout);
            Error::Timeout
        })
    }

    pub(crate) fn put(&self, transfer: Box<Transfer>) {
        *lock(&self.transfer) = Some(transfer);
        self.returned.notify_all();
    }

    /// Wait until the transfer is back in the slot
    pub(crate) fn wait_returned(&self, timeout: Duration) -> bool {
        let guard = lock(&self.transfer);
        let (guard, _) = self
            .returned
            .wait_timeout_while(guard, timeout, |transfer| transfer.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.is_some()
    }

    pub(crate) fn is_parked(&self) -> bool {
        lock(&self.transfer).is_some()
    }
}

/// Completion handler for control and bulk-OUT transfers
pub(crate) struct ReturnToSlot {
    slot: Arc<TransferSlot>,
}

impl ReturnToSlot {
    pub(crate) fn new(slot: Arc<TransferSlot>) -> Self {
        Self { slot }
    }
}

impl CompletionHandler for ReturnToSlot {
    fn on_complete(&self, transfer: Box<Transfer>) {
        if !transfer.status.is_success() {
            warn!(
                "{} transfer on endpoint {:#04x} failed: {:?}",
                self.slot.name, transfer.endpoint, transfer.status
            );
        } else if transfer.actual_length < transfer.num_bytes {
            debug!(
                "{} transfer short: {} of {} bytes",
                self.slot.name, transfer.actual_length, transfer.num_bytes
            );
        }
        self.slot.put(transfer);
    }
}

/// Completion handler for the bulk-IN poll
///
/// Holds the handle weakly so an abandoned handle does not keep itself
/// alive through its own in-flight transfer.
pub(crate) struct BulkInCompletion {
    device: Weak<DeviceInner>,
}

impl BulkInCompletion {
    pub(crate) fn new(device: Weak<DeviceInner>) -> Self {
        Self { device }
    }
}

impl CompletionHandler for BulkInCompletion {
    fn on_complete(&self, transfer: Box<Transfer>) {
        match self.device.upgrade() {
            Some(inner) => inner.handle_bulk_in(transfer),
            None => trace!("Dropping bulk-IN completion for a released handle"),
        }
    }
}

/// Write a little-endian setup packet into the start of `buffer`
pub(crate) fn write_setup(
    buffer: &mut [u8],
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) {
    buffer[0] = request_type;
    buffer[1] = request;
    LittleEndian::write_u16(&mut buffer[2..4], value);
    LittleEndian::write_u16(&mut buffer[4..6], index);
    LittleEndian::write_u16(&mut buffer[6..8], length);
}

/// Largest multiple of `max_packet_size` not above `requested`
pub(crate) fn align_to_packet(requested: usize, max_packet_size: u16) -> usize {
    let mps = usize::from(max_packet_size);
    if mps == 0 {
        return 0;
    }
    requested - requested % mps
}

impl DeviceInner {
    /// Submit the parked bulk-IN transfer
    pub(crate) fn start_polling(&self) -> Result<()> {
        let mut transfer = self.bulk_in.take(Duration::ZERO)?;
        transfer.num_bytes = transfer.capacity();
        transfer.actual_length = 0;
        transfer.status = TransferStatus::Completed;

        self.host
            .submit_transfer(self.device, transfer, self.in_done.clone())
            .map_err(|e| {
                self.bulk_in.put(e.transfer);
                Error::Host(e.error)
            })
    }

    /// Cancel the bulk-IN poll and wait for the transfer to come home
    ///
    /// The endpoint stays halted until the transfer is back, so a
    /// concurrent resubmission from the completion path is rejected rather
    /// than left in flight.
    pub(crate) fn stop_polling(&self) {
        let endpoint = self.info.bulk_in_endpoint;

        if let Err(e) = self.host.endpoint_halt(self.device, endpoint) {
            debug!("Handle {}: halt of {:#04x} failed: {}", self.id, endpoint, e);
        }
        if let Err(e) = self.host.endpoint_flush(self.device, endpoint) {
            debug!("Handle {}: flush of {:#04x} failed: {}", self.id, endpoint, e);
        }
        if !self.bulk_in.wait_returned(DRAIN_TIMEOUT) {
            warn!(
                "Handle {}: bulk-IN transfer not returned within {:?}",
                self.id, DRAIN_TIMEOUT
            );
        }
        if let Err(e) = self.host.endpoint_clear(self.device, endpoint) {
            debug!("Handle {}: clear of {:#04x} failed: {}", self.id, endpoint, e);
        }

        for slot in [&self.bulk_out, &self.control] {
            if !slot.wait_returned(DRAIN_TIMEOUT) {
                warn!("Handle {}: {} transfer still in flight", self.id, slot.name);
            }
        }
    }

    fn polling_stopped(&self) -> bool {
        matches!(
            *lock(&self.state),
            DeviceState::Closing | DeviceState::Destroyed
        )
    }

    /// Bulk-IN completion: decode, deliver, resubmit
    pub(crate) fn handle_bulk_in(self: &Arc<Self>, mut transfer: Box<Transfer>) {
        match transfer.status {
            TransferStatus::Completed if self.polling_stopped() => {
                trace!("Handle {}: dropping bulk-IN packet after close", self.id);
            }
            TransferStatus::Completed => self.deliver(&transfer),
            TransferStatus::NoDevice => {
                warn!("Handle {}: device gone, bulk-IN polling stopped", self.id);
                self.gone.store(true, Ordering::Release);
                self.bulk_in.put(transfer);
                return;
            }
            _ if self.polling_stopped() => {}
            status => {
                warn!("Handle {}: bulk-IN transfer failed: {:?}", self.id, status);
                self.emit(DeviceEvent::Error(status));
            }
        }

        if self.polling_stopped() {
            self.bulk_in.put(transfer);
            return;
        }

        transfer.num_bytes = transfer.capacity();
        transfer.actual_length = 0;
        transfer.status = TransferStatus::Completed;
        if let Err(e) = self
            .host
            .submit_transfer(self.device, transfer, self.in_done.clone())
        {
            if !self.polling_stopped() {
                error!("Handle {}: bulk-IN resubmit failed: {}", self.id, e.error);
            }
            self.bulk_in.put(e.transfer);
        }
    }

    fn deliver(self: &Arc<Self>, transfer: &Transfer) {
        let data = transfer.data();
        if data.len() < STATUS_LEN {
            trace!("Handle {}: runt bulk-IN packet ({} bytes)", self.id, data.len());
            return;
        }

        let status = parse_modem_status([data[0], data[1]]);
        let changed = {
            let mut cached = write(&self.modem_status);
            if *cached != status {
                *cached = status;
                true
            } else {
                false
            }
        };
        if changed {
            debug!("Handle {}: modem status {:?}", self.id, status);
            self.emit(DeviceEvent::ModemStatusChanged(status));
        }

        let payload = &data[STATUS_LEN..];
        if !payload.is_empty()
            && let Some(on_data) = &self.on_data
        {
            on_data(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_setup_packet_little_endian() {
        let mut buffer = [0u8; CONTROL_BUFFER_SIZE];
        write_setup(&mut buffer, 0x40, 3, 0x4138, 0x0102, 0);
        assert_eq!(&buffer[..SETUP_LEN], &[0x40, 3, 0x38, 0x41, 0x02, 0x01, 0, 0]);
    }

    #[test]
    fn test_align_to_packet() {
        assert_eq!(align_to_packet(512, 64), 512);
        assert_eq!(align_to_packet(500, 64), 448);
        assert_eq!(align_to_packet(63, 64), 0);
        assert_eq!(align_to_packet(1024, 512), 1024);
        assert_eq!(align_to_packet(100, 0), 0);
    }

    #[test]
    fn test_slot_take_times_out_while_in_flight() {
        let slot = TransferSlot::new("test", Transfer::allocate(0x02, 8).unwrap());
        let transfer = slot.take(Duration::ZERO).unwrap();
        assert!(!slot.is_parked());

        let err = slot.take(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());

        slot.put(transfer);
        assert!(slot.is_parked());
    }

    #[test]
    fn test_slot_take_wakes_on_return() {
        let slot = Arc::new(TransferSlot::new("test", Transfer::allocate(0x02, 8).unwrap()));
        let transfer = slot.take(Duration::ZERO).unwrap();

        let returner = {
            let slot = slot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ReturnToSlot::new(slot).on_complete(transfer);
            })
        };

        assert!(slot.take(Duration::from_secs(5)).is_ok());
        returner.join().unwrap();
    }

    #[test]
    fn test_wait_returned() {
        let slot = TransferSlot::new("test", Transfer::allocate(0x81, 8).unwrap());
        assert!(slot.wait_returned(Duration::ZERO));
        let _transfer = slot.take(Duration::ZERO).unwrap();
        assert!(!slot.wait_returned(Duration::from_millis(5)));
    }
}
