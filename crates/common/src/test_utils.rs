//! Test utilities for the FTDI host driver
//!
//! [`MockHost`] is a scripted, in-memory [`UsbHost`]. It records every
//! control request and bulk-OUT payload, completes OUT and control transfers
//! synchronously, and parks bulk-IN transfers until a test feeds them with
//! [`MockHost::complete_bulk_in`]. Completion handlers are always invoked
//! with the mock's internal lock released, so they may resubmit.

use crate::channel::{EventSink, HostEvent};
use crate::error::HostError;
use crate::platform::{
    ClientId, CompletionHandler, DeviceAddress, DeviceDescriptor, DeviceRef, SubmitError,
    Transfer, TransferStatus, UsbHost,
};
use byteorder::{ByteOrder, LittleEndian};
use protocol::{FTDI_VID, build_config_descriptor, pid};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// A device the mock can enumerate
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub address: DeviceAddress,
    pub descriptor: DeviceDescriptor,
    pub config: Vec<u8>,
}

impl MockDevice {
    pub fn new(address: DeviceAddress, vendor_id: u16, product_id: u16, config: Vec<u8>) -> Self {
        Self {
            address,
            descriptor: DeviceDescriptor {
                vendor_id,
                product_id,
                device_class: 0,
                max_packet_size0: 64,
                num_configurations: 1,
            },
            config,
        }
    }

    /// Single-interface full-speed FT232R on bus 1
    pub fn ft232r(address: u8) -> Self {
        Self::new(
            DeviceAddress::new(1, address),
            FTDI_VID,
            pid::FT232R,
            build_config_descriptor(&[(0x81, 0x02, 64)]),
        )
    }

    /// Quad-interface high-speed FT4232H on bus 1
    pub fn ft4232h(address: u8) -> Self {
        Self::new(
            DeviceAddress::new(1, address),
            FTDI_VID,
            pid::FT4232H,
            build_config_descriptor(&[
                (0x81, 0x02, 512),
                (0x83, 0x04, 512),
                (0x85, 0x06, 512),
                (0x87, 0x08, 512),
            ]),
        )
    }
}

/// A control request captured by [`MockHost`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedControl {
    pub device: DeviceRef,
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    pub data: Vec<u8>,
}

type Pending = (Box<Transfer>, Arc<dyn CompletionHandler>);

#[derive(Default)]
struct MockState {
    attached: HashMap<DeviceAddress, MockDevice>,
    open: HashMap<DeviceRef, DeviceAddress>,
    next_ref: u32,
    clients: HashMap<ClientId, EventSink>,
    next_client: u32,
    claimed: HashSet<(DeviceRef, u8)>,
    halted: HashSet<(DeviceRef, u8)>,
    gone: HashSet<DeviceRef>,
    pending_in: HashMap<(DeviceRef, u8), Pending>,
    held_out: Vec<Pending>,
    hold_out: bool,
    control_failure: Option<HostError>,
    flush_packet: Option<Vec<u8>>,
    controls: Vec<RecordedControl>,
    bulk_out: Vec<(DeviceRef, u8, Vec<u8>)>,
    closed: Vec<DeviceRef>,
}

impl MockState {
    fn check_open(&self, device: DeviceRef) -> Result<DeviceAddress, HostError> {
        let address = *self.open.get(&device).ok_or(HostError::InvalidParam)?;
        if self.gone.contains(&device) {
            return Err(HostError::NoDevice);
        }
        Ok(address)
    }

    fn device(&self, device: DeviceRef) -> Result<&MockDevice, HostError> {
        let address = self.check_open(device)?;
        self.attached.get(&address).ok_or(HostError::NoDevice)
    }

    fn sinks(&self) -> Vec<EventSink> {
        self.clients.values().cloned().collect()
    }
}

/// Scripted USB host platform
#[derive(Default)]
pub struct MockHost {
    state: Mutex<MockState>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = MockDevice>) -> Self {
        let host = Self::new();
        {
            let mut state = host.lock();
            for device in devices {
                state.attached.insert(device.address, device);
            }
        }
        host
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug in a device and notify registered clients
    pub fn attach(&self, device: MockDevice) {
        let address = device.address;
        let sinks = {
            let mut state = self.lock();
            state.attached.insert(address, device);
            state.sinks()
        };
        for sink in sinks {
            sink.try_send(HostEvent::NewDevice { address });
        }
    }

    /// Unplug a device
    ///
    /// Parked bulk-IN transfers on every open reference complete with
    /// `NoDevice`, then clients receive `DeviceGone` for each reference.
    pub fn detach(&self, address: DeviceAddress) {
        let (refs, pending, sinks) = {
            let mut state = self.lock();
            state.attached.remove(&address);
            let refs: Vec<DeviceRef> = state
                .open
                .iter()
                .filter(|(_, a)| **a == address)
                .map(|(r, _)| *r)
                .collect();
            let mut pending = Vec::new();
            for device in &refs {
                state.gone.insert(*device);
                let keys: Vec<_> = state
                    .pending_in
                    .keys()
                    .filter(|(d, _)| d == device)
                    .copied()
                    .collect();
                for key in keys {
                    pending.extend(state.pending_in.remove(&key));
                }
            }
            (refs, pending, state.sinks())
        };

        for (mut transfer, handler) in pending {
            transfer.status = TransferStatus::NoDevice;
            transfer.actual_length = 0;
            handler.on_complete(transfer);
        }
        for device in refs {
            for sink in &sinks {
                sink.try_send(HostEvent::DeviceGone { device });
            }
        }
    }

    /// Complete the parked bulk-IN transfer on `endpoint` with `data`
    ///
    /// `data` includes the two status bytes. Returns `false` if nothing was
    /// parked on that endpoint.
    pub fn complete_bulk_in(&self, endpoint: u8, data: &[u8]) -> bool {
        self.finish_bulk_in(endpoint, TransferStatus::Completed, data)
    }

    /// Fail the parked bulk-IN transfer on `endpoint` with `status`
    pub fn fail_bulk_in(&self, endpoint: u8, status: TransferStatus) -> bool {
        self.finish_bulk_in(endpoint, status, &[])
    }

    fn finish_bulk_in(&self, endpoint: u8, status: TransferStatus, data: &[u8]) -> bool {
        let pending = {
            let mut state = self.lock();
            let key = state
                .pending_in
                .keys()
                .find(|(_, ep)| *ep == endpoint)
                .copied();
            key.and_then(|key| state.pending_in.remove(&key))
        };

        let Some((mut transfer, handler)) = pending else {
            return false;
        };
        let len = data.len().min(transfer.num_bytes).min(transfer.capacity());
        transfer.buffer[..len].copy_from_slice(&data[..len]);
        transfer.actual_length = len;
        transfer.status = status;
        handler.on_complete(transfer);
        true
    }

    /// Park bulk-OUT transfers instead of completing them
    pub fn set_hold_out(&self, hold: bool) {
        self.lock().hold_out = hold;
    }

    /// Complete every parked bulk-OUT transfer; returns how many
    pub fn release_out(&self) -> usize {
        let held = std::mem::take(&mut self.lock().held_out);
        let count = held.len();
        for (mut transfer, handler) in held {
            transfer.actual_length = transfer.num_bytes;
            transfer.status = TransferStatus::Completed;
            handler.on_complete(transfer);
        }
        count
    }

    /// Complete the bulk-IN transfer drained by the next flush with `packet`
    /// instead of `Cancelled`, as when data lands just before the flush
    pub fn set_flush_packet(&self, packet: Option<Vec<u8>>) {
        self.lock().flush_packet = packet;
    }

    /// Make every control submission fail with `error`
    pub fn set_control_failure(&self, error: Option<HostError>) {
        self.lock().control_failure = error;
    }

    pub fn controls(&self) -> Vec<RecordedControl> {
        self.lock().controls.clone()
    }

    pub fn clear_controls(&self) {
        self.lock().controls.clear();
    }

    /// Payloads written to bulk-OUT endpoints, in submission order
    pub fn bulk_out(&self) -> Vec<Vec<u8>> {
        self.lock()
            .bulk_out
            .iter()
            .map(|(_, _, data)| data.clone())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    pub fn closed_devices(&self) -> Vec<DeviceRef> {
        self.lock().closed.clone()
    }

    pub fn claimed_count(&self) -> usize {
        self.lock().claimed.len()
    }

    pub fn pending_in_count(&self) -> usize {
        self.lock().pending_in.len()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }
}

impl UsbHost for MockHost {
    fn register_client(&self, events: EventSink) -> Result<ClientId, HostError> {
        let mut state = self.lock();
        state.next_client += 1;
        let client = ClientId(state.next_client);
        state.clients.insert(client, events);
        Ok(client)
    }

    fn deregister_client(&self, client: ClientId) -> Result<(), HostError> {
        self.lock()
            .clients
            .remove(&client)
            .map(|_| ())
            .ok_or(HostError::NotFound)
    }

    fn device_addresses(&self) -> Result<Vec<DeviceAddress>, HostError> {
        let mut addresses: Vec<_> = self.lock().attached.keys().copied().collect();
        addresses.sort();
        Ok(addresses)
    }

    fn open_device(&self, address: DeviceAddress) -> Result<DeviceRef, HostError> {
        let mut state = self.lock();
        if !state.attached.contains_key(&address) {
            return Err(HostError::NotFound);
        }
        state.next_ref += 1;
        let device = DeviceRef(state.next_ref);
        state.open.insert(device, address);
        Ok(device)
    }

    fn close_device(&self, device: DeviceRef) -> Result<(), HostError> {
        let mut state = self.lock();
        state.open.remove(&device).ok_or(HostError::InvalidParam)?;
        state.claimed.retain(|(d, _)| *d != device);
        state.halted.retain(|(d, _)| *d != device);
        state.closed.push(device);
        Ok(())
    }

    fn device_descriptor(&self, device: DeviceRef) -> Result<DeviceDescriptor, HostError> {
        Ok(self.lock().device(device)?.descriptor)
    }

    fn active_config_descriptor(&self, device: DeviceRef) -> Result<Vec<u8>, HostError> {
        Ok(self.lock().device(device)?.config.clone())
    }

    fn claim_interface(&self, device: DeviceRef, interface: u8) -> Result<(), HostError> {
        let mut state = self.lock();
        state.check_open(device)?;
        if !state.claimed.insert((device, interface)) {
            return Err(HostError::Busy);
        }
        Ok(())
    }

    fn release_interface(&self, device: DeviceRef, interface: u8) -> Result<(), HostError> {
        if self.lock().claimed.remove(&(device, interface)) {
            Ok(())
        } else {
            Err(HostError::InvalidParam)
        }
    }

    fn submit_transfer(
        &self,
        device: DeviceRef,
        mut transfer: Box<Transfer>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError> {
        {
            let mut state = self.lock();
            if let Err(error) = state.check_open(device) {
                return Err(SubmitError::new(error, transfer));
            }
            let key = (device, transfer.endpoint);
            if state.halted.contains(&key) {
                return Err(SubmitError::new(HostError::Pipe, transfer));
            }
            if transfer.num_bytes > transfer.capacity() {
                return Err(SubmitError::new(HostError::InvalidParam, transfer));
            }

            if transfer.is_in() {
                if state.pending_in.contains_key(&key) {
                    return Err(SubmitError::new(HostError::Busy, transfer));
                }
                state.pending_in.insert(key, (transfer, handler));
                return Ok(());
            }

            let payload = transfer.buffer[..transfer.num_bytes].to_vec();
            state.bulk_out.push((device, transfer.endpoint, payload));
            if state.hold_out {
                state.held_out.push((transfer, handler));
                return Ok(());
            }
        }

        transfer.actual_length = transfer.num_bytes;
        transfer.status = TransferStatus::Completed;
        handler.on_complete(transfer);
        Ok(())
    }

    fn submit_control(
        &self,
        device: DeviceRef,
        mut transfer: Box<Transfer>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError> {
        {
            let mut state = self.lock();
            if let Some(error) = state.control_failure.clone() {
                return Err(SubmitError::new(error, transfer));
            }
            if let Err(error) = state.check_open(device) {
                return Err(SubmitError::new(error, transfer));
            }
            if transfer.num_bytes < 8 || transfer.num_bytes > transfer.capacity() {
                return Err(SubmitError::new(HostError::InvalidParam, transfer));
            }

            let buf = &transfer.buffer;
            state.controls.push(RecordedControl {
                device,
                request_type: buf[0],
                request: buf[1],
                value: LittleEndian::read_u16(&buf[2..4]),
                index: LittleEndian::read_u16(&buf[4..6]),
                length: LittleEndian::read_u16(&buf[6..8]),
                data: buf[8..transfer.num_bytes].to_vec(),
            });
        }

        transfer.actual_length = transfer.num_bytes;
        transfer.status = TransferStatus::Completed;
        handler.on_complete(transfer);
        Ok(())
    }

    fn endpoint_halt(&self, device: DeviceRef, endpoint: u8) -> Result<(), HostError> {
        let mut state = self.lock();
        state.check_open(device)?;
        state.halted.insert((device, endpoint));
        Ok(())
    }

    fn endpoint_flush(&self, device: DeviceRef, endpoint: u8) -> Result<(), HostError> {
        let (pending, packet) = {
            let mut state = self.lock();
            state.check_open(device)?;
            let pending = state.pending_in.remove(&(device, endpoint));
            let packet = if pending.is_some() {
                state.flush_packet.take()
            } else {
                None
            };
            (pending, packet)
        };
        if let Some((mut transfer, handler)) = pending {
            match packet {
                Some(data) => {
                    let len = data.len().min(transfer.capacity());
                    transfer.buffer[..len].copy_from_slice(&data[..len]);
                    transfer.actual_length = len;
                    transfer.status = TransferStatus::Completed;
                }
                None => {
                    transfer.status = TransferStatus::Cancelled;
                    transfer.actual_length = 0;
                }
            }
            handler.on_complete(transfer);
        }
        Ok(())
    }

    fn endpoint_clear(&self, device: DeviceRef, endpoint: u8) -> Result<(), HostError> {
        let mut state = self.lock();
        state.check_open(device)?;
        state.halted.remove(&(device, endpoint));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::create_event_channel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(count: Arc<AtomicUsize>) -> Arc<dyn CompletionHandler> {
        Arc::new(move |_t: Box<Transfer>| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_open_unknown_address() {
        let host = MockHost::new();
        let err = host.open_device(DeviceAddress::new(1, 1)).unwrap_err();
        assert_eq!(err, HostError::NotFound);
    }

    #[test]
    fn test_flush_completes_with_late_packet() {
        let host = MockHost::with_devices([MockDevice::ft232r(2)]);
        let device = host.open_device(DeviceAddress::new(1, 2)).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler: Arc<dyn CompletionHandler> = Arc::new(move |t: Box<Transfer>| {
            sink.lock().unwrap().push((t.status, t.data().to_vec()));
        });

        let mut transfer = Transfer::allocate(0x81, 64).unwrap();
        transfer.num_bytes = 64;
        host.submit_transfer(device, transfer, handler).unwrap();

        host.set_flush_packet(Some(vec![0x01, 0x60, b'z']));
        host.endpoint_flush(device, 0x81).unwrap();
        assert_eq!(
            *received.lock().unwrap(),
            vec![(TransferStatus::Completed, vec![0x01, 0x60, b'z'])]
        );
        assert_eq!(host.pending_in_count(), 0);
    }

    #[test]
    fn test_control_recorded_and_completed() {
        let host = MockHost::with_devices([MockDevice::ft232r(2)]);
        let device = host.open_device(DeviceAddress::new(1, 2)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let mut transfer = Transfer::allocate(0, 64).unwrap();
        transfer.buffer[..8].copy_from_slice(&[0x40, 0x03, 0x1A, 0x00, 0x01, 0x00, 0x00, 0x00]);
        transfer.num_bytes = 8;
        host.submit_control(device, transfer, counting_handler(count.clone()))
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let controls = host.controls();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].request, 3);
        assert_eq!(controls[0].value, 0x001A);
        assert_eq!(controls[0].index, 1);
        assert!(controls[0].data.is_empty());
    }

    #[test]
    fn test_bulk_in_parked_until_fed() {
        let host = MockHost::with_devices([MockDevice::ft232r(2)]);
        let device = host.open_device(DeviceAddress::new(1, 2)).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        let mut transfer = Transfer::allocate(0x81, 64).unwrap();
        transfer.num_bytes = 64;
        host.submit_transfer(
            device,
            transfer,
            Arc::new(move |t: Box<Transfer>| sink.lock().unwrap().push(t.data().to_vec())),
        )
        .unwrap();
        assert_eq!(host.pending_in_count(), 1);

        assert!(host.complete_bulk_in(0x81, &[0x01, 0x60, b'h', b'i']));
        assert_eq!(*received.lock().unwrap(), vec![vec![0x01, 0x60, b'h', b'i']]);
        assert!(!host.complete_bulk_in(0x81, &[0x01, 0x60]));
    }

    #[test]
    fn test_flush_cancels_and_halt_rejects() {
        let host = MockHost::with_devices([MockDevice::ft232r(2)]);
        let device = host.open_device(DeviceAddress::new(1, 2)).unwrap();
        let status = Arc::new(Mutex::new(None));
        let sink = status.clone();

        let mut transfer = Transfer::allocate(0x81, 64).unwrap();
        transfer.num_bytes = 64;
        host.submit_transfer(
            device,
            transfer,
            Arc::new(move |t: Box<Transfer>| *sink.lock().unwrap() = Some(t.status)),
        )
        .unwrap();

        host.endpoint_halt(device, 0x81).unwrap();
        host.endpoint_flush(device, 0x81).unwrap();
        assert_eq!(*status.lock().unwrap(), Some(TransferStatus::Cancelled));

        let transfer = Transfer::allocate(0x81, 64).unwrap();
        let err = host
            .submit_transfer(device, transfer, counting_handler(Arc::default()))
            .unwrap_err();
        assert_eq!(err.error, HostError::Pipe);
        assert_eq!(err.transfer.endpoint, 0x81);
    }

    #[test]
    fn test_detach_notifies_clients() {
        let host = MockHost::with_devices([MockDevice::ft232r(2)]);
        let (sink, source) = create_event_channel(8);
        host.register_client(sink).unwrap();
        let device = host.open_device(DeviceAddress::new(1, 2)).unwrap();

        host.detach(DeviceAddress::new(1, 2));

        assert_eq!(source.try_recv(), Some(HostEvent::DeviceGone { device }));
        assert_eq!(
            host.device_descriptor(device).unwrap_err(),
            HostError::NoDevice
        );
    }

    #[test]
    fn test_double_claim_is_busy() {
        let host = MockHost::with_devices([MockDevice::ft4232h(3)]);
        let device = host.open_device(DeviceAddress::new(1, 3)).unwrap();
        host.claim_interface(device, 1).unwrap();
        assert_eq!(host.claim_interface(device, 1), Err(HostError::Busy));
        host.release_interface(device, 1).unwrap();
        assert_eq!(host.claimed_count(), 0);
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || true));
        assert!(!wait_until(Duration::from_millis(10), || false));
    }
}
