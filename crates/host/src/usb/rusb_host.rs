//! libusb platform backend
//!
//! Implements [`UsbHost`] on top of rusb. libusb's synchronous API is turned
//! into the asynchronous submit/complete model with one worker thread per
//! (device, endpoint): a submitted transfer is queued to its endpoint's
//! worker over an async-channel, executed there with the blocking rusb call,
//! and handed back through its completion handler on that thread.
//!
//! A dedicated thread runs `libusb_handle_events` so hot-plug callbacks fire.

use byteorder::{ByteOrder, LittleEndian};
use common::{
    ClientId, CompletionHandler, DeviceAddress, DeviceDescriptor, DeviceRef, Error, EventSink,
    HostError, HostEvent, SubmitError, Transfer, TransferStatus, UsbHost,
};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Read slice for bulk-IN; cancellation is noticed between slices
const READ_SLICE: Duration = Duration::from_millis(100);

/// Used when a transfer carries no timeout of its own
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval of the libusb event thread
const EVENT_POLL: Duration = Duration::from_millis(100);

const SETUP_LEN: usize = 8;

const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_TYPE_CONFIG: u16 = 0x02;
const CONFIG_HEADER_LEN: usize = 9;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map rusb::Error to the platform error type
pub fn map_rusb_error(err: rusb::Error) -> HostError {
    match err {
        rusb::Error::Timeout => HostError::Timeout,
        rusb::Error::Pipe => HostError::Pipe,
        rusb::Error::NoDevice => HostError::NoDevice,
        rusb::Error::NotFound => HostError::NotFound,
        rusb::Error::Busy => HostError::Busy,
        rusb::Error::Overflow => HostError::Overflow,
        rusb::Error::Io => HostError::Io,
        rusb::Error::InvalidParam => HostError::InvalidParam,
        rusb::Error::Access => HostError::Access,
        _ => HostError::Other(err.to_string()),
    }
}

/// Completion status for a failed rusb call
fn transfer_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        timeout
    }
}

struct Job {
    transfer: Box<Transfer>,
    handler: Arc<dyn CompletionHandler>,
}

/// Worker queue for one endpoint of one open device
struct EndpointQueue {
    jobs: async_channel::Sender<Job>,
    cancel: Arc<AtomicBool>,
}

/// A device opened through libusb
struct OpenDevice {
    address: DeviceAddress,
    device: Device<Context>,
    handle: RwLock<rusb::DeviceHandle<Context>>,
    gone: AtomicBool,
    closed: AtomicBool,
    halted: Mutex<HashSet<u8>>,
    queues: Mutex<HashMap<u8, EndpointQueue>>,
}

impl OpenDevice {
    fn check(&self) -> Result<(), HostError> {
        if self.gone.load(Ordering::Acquire) {
            return Err(HostError::NoDevice);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::InvalidParam);
        }
        Ok(())
    }

    fn cancel_all(&self) {
        for queue in lock(&self.queues).values() {
            queue.cancel.store(true, Ordering::Release);
        }
    }

    fn stop_status(&self, cancel: &AtomicBool) -> Option<TransferStatus> {
        stop_status(
            self.gone.load(Ordering::Acquire),
            self.closed.load(Ordering::Acquire),
            cancel.load(Ordering::Acquire),
        )
    }

    /// Blocking read, sliced so a flush or unplug ends it promptly
    fn read_bulk(&self, transfer: &mut Transfer, cancel: &AtomicBool) -> TransferStatus {
        let endpoint = transfer.endpoint;
        let len = transfer.num_bytes.min(transfer.capacity());
        let mut waited = Duration::ZERO;

        loop {
            if let Some(status) = self.stop_status(cancel) {
                return status;
            }
            let handle = self.handle.read().unwrap_or_else(PoisonError::into_inner);
            match handle.read_bulk(endpoint, &mut transfer.buffer[..len], READ_SLICE) {
                Ok(n) => {
                    transfer.actual_length = n;
                    return TransferStatus::Completed;
                }
                Err(rusb::Error::Timeout) => {
                    waited += READ_SLICE;
                    if !transfer.timeout.is_zero() && waited >= transfer.timeout {
                        return TransferStatus::TimedOut;
                    }
                }
                Err(e) => {
                    if e == rusb::Error::NoDevice {
                        self.gone.store(true, Ordering::Release);
                    }
                    trace!("Bulk IN {:#04x} failed: {}", endpoint, e);
                    return transfer_status(e);
                }
            }
        }
    }

    fn write_bulk(&self, transfer: &mut Transfer) -> TransferStatus {
        let len = transfer.num_bytes.min(transfer.capacity());
        let handle = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        match handle.write_bulk(
            transfer.endpoint,
            &transfer.buffer[..len],
            effective_timeout(transfer.timeout),
        ) {
            Ok(n) => {
                transfer.actual_length = n;
                TransferStatus::Completed
            }
            Err(e) => transfer_status(e),
        }
    }

    /// Execute a control transfer whose buffer starts with the setup packet
    fn control(&self, transfer: &mut Transfer) -> TransferStatus {
        let buffer = &mut transfer.buffer;
        let request_type = buffer[0];
        let request = buffer[1];
        let value = LittleEndian::read_u16(&buffer[2..4]);
        let index = LittleEndian::read_u16(&buffer[4..6]);
        let length = usize::from(LittleEndian::read_u16(&buffer[6..8]));
        let end = (SETUP_LEN + length).min(buffer.len());
        let timeout = effective_timeout(transfer.timeout);

        let handle = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        let result = if request_type & 0x80 != 0 {
            handle.read_control(
                request_type,
                request,
                value,
                index,
                &mut buffer[SETUP_LEN..end],
                timeout,
            )
        } else {
            handle.write_control(
                request_type,
                request,
                value,
                index,
                &buffer[SETUP_LEN..end],
                timeout,
            )
        };

        match result {
            Ok(n) => {
                transfer.actual_length = SETUP_LEN + n;
                TransferStatus::Completed
            }
            Err(e) => transfer_status(e),
        }
    }
}

/// State shared between the backend, its hot-plug callback and workers
#[derive(Default)]
struct Shared {
    clients: Mutex<HashMap<ClientId, EventSink>>,
    next_client: AtomicU32,
    devices: RwLock<HashMap<DeviceRef, Arc<OpenDevice>>>,
    next_ref: AtomicU32,
}

impl Shared {
    fn device(&self, device: DeviceRef) -> Result<Arc<OpenDevice>, HostError> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .cloned()
            .ok_or(HostError::InvalidParam)
    }

    fn broadcast(&self, event: HostEvent) {
        let sinks: Vec<EventSink> = lock(&self.clients).values().cloned().collect();
        for sink in sinks {
            sink.try_send(event);
        }
    }

    fn device_left(&self, address: DeviceAddress) {
        let refs: Vec<DeviceRef> = {
            let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
            devices
                .iter()
                .filter(|(_, open)| open.address == address)
                .map(|(device, open)| {
                    open.gone.store(true, Ordering::Release);
                    open.cancel_all();
                    *device
                })
                .collect()
        };
        for device in refs {
            self.broadcast(HostEvent::DeviceGone { device });
        }
    }
}

/// Forwards libusb hot-plug notifications to registered clients
struct HotplugForwarder {
    shared: Arc<Shared>,
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        let address = DeviceAddress::new(device.bus_number(), device.address());
        debug!("Hot-plug: device arrived at {}", address);
        self.shared.broadcast(HostEvent::NewDevice { address });
    }

    fn device_left(&mut self, device: Device<T>) {
        let address = DeviceAddress::new(device.bus_number(), device.address());
        debug!("Hot-plug: device left {}", address);
        self.shared.device_left(address);
    }
}

/// libusb-backed USB host platform
pub struct RusbHost {
    context: Context,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    registration: Mutex<Option<Registration<Context>>>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RusbHost {
    /// Create the libusb context, register for hot-plug and start the
    /// event thread
    pub fn new() -> common::Result<Self> {
        let context = Context::new().map_err(|e| Error::Host(map_rusb_error(e)))?;
        let shared = Arc::new(Shared::default());

        let registration = if rusb::has_hotplug() {
            let forwarder = HotplugForwarder {
                shared: shared.clone(),
            };
            match HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(forwarder))
            {
                Ok(registration) => Some(registration),
                Err(e) => {
                    warn!("Hot-plug registration failed: {}", e);
                    None
                }
            }
        } else {
            warn!("libusb has no hot-plug support on this platform");
            None
        };

        let running = Arc::new(AtomicBool::new(true));
        let event_thread = {
            let context = context.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("libusb-events".to_string())
                .spawn(move || run_events(&context, &running))
                .map_err(|e| {
                    error!("Failed to spawn libusb event thread: {}", e);
                    Error::NoMemory
                })?
        };

        info!("libusb host started (hot-plug: {})", registration.is_some());
        Ok(Self {
            context,
            shared,
            running,
            registration: Mutex::new(registration),
            event_thread: Mutex::new(Some(event_thread)),
        })
    }

    /// Enumerate attached devices without opening them
    pub fn list_devices(&self) -> Result<Vec<(DeviceAddress, DeviceDescriptor)>, HostError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut listed = Vec::new();
        for device in devices.iter() {
            let address = DeviceAddress::new(device.bus_number(), device.address());
            match device.device_descriptor() {
                Ok(desc) => listed.push((address, convert_descriptor(&desc))),
                Err(e) => debug!("No descriptor for {}: {}", address, e),
            }
        }
        listed.sort_by_key(|(address, _)| *address);
        Ok(listed)
    }

    fn find_device(&self, address: DeviceAddress) -> Result<Device<Context>, HostError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|d| d.bus_number() == address.bus && d.address() == address.address)
            .ok_or(HostError::NotFound)
    }

    fn enqueue(
        &self,
        device: DeviceRef,
        transfer: Box<Transfer>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError> {
        let open = match self.shared.device(device) {
            Ok(open) => open,
            Err(error) => return Err(SubmitError::new(error, transfer)),
        };
        if let Err(error) = open.check() {
            return Err(SubmitError::new(error, transfer));
        }
        let endpoint = transfer.endpoint;
        if lock(&open.halted).contains(&endpoint) {
            return Err(SubmitError::new(HostError::Pipe, transfer));
        }

        let mut queues = lock(&open.queues);
        if !queues.contains_key(&endpoint) {
            match spawn_endpoint_worker(&open, endpoint) {
                Ok(queue) => {
                    queues.insert(endpoint, queue);
                }
                Err(error) => return Err(SubmitError::new(error, transfer)),
            }
        }
        let Some(queue) = queues.get(&endpoint) else {
            return Err(SubmitError::new(HostError::InvalidParam, transfer));
        };

        queue
            .jobs
            .try_send(Job { transfer, handler })
            .map_err(|e| SubmitError::new(HostError::Busy, e.into_inner().transfer))
    }
}

impl Drop for RusbHost {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        // Deregister before the event thread stops so no callback is pending
        drop(lock(&self.registration).take());
        if let Some(thread) = lock(&self.event_thread).take()
            && thread.join().is_err()
        {
            error!("libusb event thread panicked");
        }
        debug!("libusb host stopped");
    }
}

fn run_events(context: &Context, running: &AtomicBool) {
    debug!("libusb event thread started");
    while running.load(Ordering::Acquire) {
        match context.handle_events(Some(EVENT_POLL)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("libusb event handling interrupted"),
            Err(e) => {
                warn!("Error handling libusb events: {}", e);
                std::thread::sleep(EVENT_POLL);
            }
        }
    }
    debug!("libusb event thread stopped");
}

fn spawn_endpoint_worker(open: &Arc<OpenDevice>, endpoint: u8) -> Result<EndpointQueue, HostError> {
    let (jobs, rx) = async_channel::unbounded::<Job>();
    let cancel = Arc::new(AtomicBool::new(false));

    let device = open.clone();
    let flag = cancel.clone();
    std::thread::Builder::new()
        .name(format!("usb-ep-{:02x}", endpoint))
        .spawn(move || {
            while let Ok(Job {
                mut transfer,
                handler,
            }) = rx.recv_blocking()
            {
                transfer.actual_length = 0;
                transfer.status = if endpoint == 0 {
                    device.control(&mut transfer)
                } else if transfer.is_in() {
                    device.read_bulk(&mut transfer, &flag)
                } else {
                    device.write_bulk(&mut transfer)
                };
                handler.on_complete(transfer);
            }
            trace!("Endpoint {:#04x} worker on {} stopped", endpoint, device.address);
        })
        .map_err(|e| HostError::Other(format!("failed to spawn endpoint worker: {}", e)))?;

    Ok(EndpointQueue { jobs, cancel })
}

fn convert_descriptor(desc: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        device_class: desc.class_code(),
        max_packet_size0: desc.max_packet_size(),
        num_configurations: desc.num_configurations(),
    }
}

impl UsbHost for RusbHost {
    fn register_client(&self, events: EventSink) -> Result<ClientId, HostError> {
        let client = ClientId(self.shared.next_client.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.shared.clients).insert(client, events);
        debug!("Registered event client {:?}", client);
        Ok(client)
    }

    fn deregister_client(&self, client: ClientId) -> Result<(), HostError> {
        lock(&self.shared.clients)
            .remove(&client)
            .map(|_| ())
            .ok_or(HostError::NotFound)
    }

    fn device_addresses(&self) -> Result<Vec<DeviceAddress>, HostError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        Ok(devices
            .iter()
            .map(|d| DeviceAddress::new(d.bus_number(), d.address()))
            .collect())
    }

    fn open_device(&self, address: DeviceAddress) -> Result<DeviceRef, HostError> {
        let device = self.find_device(address)?;
        let mut handle = device.open().map_err(map_rusb_error)?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            trace!("Kernel driver auto-detach unavailable on {}: {}", address, e);
        }

        let device_ref = DeviceRef(self.shared.next_ref.fetch_add(1, Ordering::Relaxed) + 1);
        let open = Arc::new(OpenDevice {
            address,
            device,
            handle: RwLock::new(handle),
            gone: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            halted: Mutex::new(HashSet::new()),
            queues: Mutex::new(HashMap::new()),
        });
        self.shared
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_ref, open);
        trace!("Opened {} as {:?}", address, device_ref);
        Ok(device_ref)
    }

    fn close_device(&self, device: DeviceRef) -> Result<(), HostError> {
        let open = self
            .shared
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device)
            .ok_or(HostError::InvalidParam)?;

        open.closed.store(true, Ordering::Release);
        open.cancel_all();
        // Workers exit once their queue closes; the handle closes with the
        // last reference
        lock(&open.queues).clear();
        trace!("Closed {:?} at {}", device, open.address);
        Ok(())
    }

    fn device_descriptor(&self, device: DeviceRef) -> Result<DeviceDescriptor, HostError> {
        let open = self.shared.device(device)?;
        let desc = open.device.device_descriptor().map_err(map_rusb_error)?;
        Ok(convert_descriptor(&desc))
    }

    fn active_config_descriptor(&self, device: DeviceRef) -> Result<Vec<u8>, HostError> {
        let open = self.shared.device(device)?;
        open.check()?;

        let handle = open.handle.read().unwrap_or_else(PoisonError::into_inner);
        let value = handle.active_configuration().map_err(map_rusb_error)?;
        let count = open
            .device
            .device_descriptor()
            .map_err(map_rusb_error)?
            .num_configurations();
        let index = (0..count)
            .find(|i| {
                open.device
                    .config_descriptor(*i)
                    .is_ok_and(|config| config.number() == value)
            })
            .ok_or(HostError::NotFound)?;

        let w_value = (DESCRIPTOR_TYPE_CONFIG << 8) | u16::from(index);
        let mut header = [0u8; CONFIG_HEADER_LEN];
        handle
            .read_control(
                rusb::request_type(
                    rusb::Direction::In,
                    rusb::RequestType::Standard,
                    rusb::Recipient::Device,
                ),
                REQUEST_GET_DESCRIPTOR,
                w_value,
                0,
                &mut header,
                DEFAULT_TIMEOUT,
            )
            .map_err(map_rusb_error)?;

        let total = usize::from(LittleEndian::read_u16(&header[2..4]));
        let mut raw = vec![0u8; total.max(CONFIG_HEADER_LEN)];
        let n = handle
            .read_control(
                rusb::request_type(
                    rusb::Direction::In,
                    rusb::RequestType::Standard,
                    rusb::Recipient::Device,
                ),
                REQUEST_GET_DESCRIPTOR,
                w_value,
                0,
                &mut raw,
                DEFAULT_TIMEOUT,
            )
            .map_err(map_rusb_error)?;
        raw.truncate(n);
        Ok(raw)
    }

    fn claim_interface(&self, device: DeviceRef, interface: u8) -> Result<(), HostError> {
        let open = self.shared.device(device)?;
        open.check()?;
        open.handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&self, device: DeviceRef, interface: u8) -> Result<(), HostError> {
        let open = self.shared.device(device)?;
        open.handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn submit_transfer(
        &self,
        device: DeviceRef,
        transfer: Box<Transfer>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError> {
        if transfer.endpoint == 0 || transfer.num_bytes > transfer.capacity() {
            return Err(SubmitError::new(HostError::InvalidParam, transfer));
        }
        self.enqueue(device, transfer, handler)
    }

    fn submit_control(
        &self,
        device: DeviceRef,
        transfer: Box<Transfer>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError> {
        if transfer.endpoint != 0
            || transfer.num_bytes < SETUP_LEN
            || transfer.num_bytes > transfer.capacity()
        {
            return Err(SubmitError::new(HostError::InvalidParam, transfer));
        }
        self.enqueue(device, transfer, handler)
    }

    fn endpoint_halt(&self, device: DeviceRef, endpoint: u8) -> Result<(), HostError> {
        let open = self.shared.device(device)?;
        lock(&open.halted).insert(endpoint);
        Ok(())
    }

    fn endpoint_flush(&self, device: DeviceRef, endpoint: u8) -> Result<(), HostError> {
        let open = self.shared.device(device)?;
        if let Some(queue) = lock(&open.queues).get(&endpoint) {
            queue.cancel.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn endpoint_clear(&self, device: DeviceRef, endpoint: u8) -> Result<(), HostError> {
        let open = self.shared.device(device)?;
        lock(&open.halted).remove(&endpoint);
        if let Some(queue) = lock(&open.queues).get(&endpoint) {
            queue.cancel.store(false, Ordering::Release);
        }
        open.check()?;
        open.handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }
}

/// Why a sliced read must end early, if it must
///
/// An unplugged device reports `NoDevice` so the completion path stops
/// polling; a halt, flush or close reports `Cancelled`.
fn stop_status(gone: bool, closed: bool, cancelled: bool) -> Option<TransferStatus> {
    if gone {
        Some(TransferStatus::NoDevice)
    } else if cancelled || closed {
        Some(TransferStatus::Cancelled)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_status() {
        assert_eq!(stop_status(false, false, false), None);
        assert_eq!(stop_status(false, false, true), Some(TransferStatus::Cancelled));
        assert_eq!(stop_status(false, true, false), Some(TransferStatus::Cancelled));
        // Unplug cancels every queue too; the device state wins
        assert_eq!(stop_status(true, false, true), Some(TransferStatus::NoDevice));
        assert_eq!(stop_status(true, true, true), Some(TransferStatus::NoDevice));
    }

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), HostError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), HostError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), HostError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Access), HostError::Access);
        assert!(matches!(
            map_rusb_error(rusb::Error::NotSupported),
            HostError::Other(_)
        ));
    }

    #[test]
    fn test_transfer_status_mapping() {
        assert_eq!(transfer_status(rusb::Error::Timeout), TransferStatus::TimedOut);
        assert_eq!(transfer_status(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(transfer_status(rusb::Error::NoDevice), TransferStatus::NoDevice);
        assert_eq!(transfer_status(rusb::Error::Io), TransferStatus::Error);
    }

    #[test]
    fn test_effective_timeout() {
        assert_eq!(effective_timeout(Duration::ZERO), DEFAULT_TIMEOUT);
        assert_eq!(
            effective_timeout(Duration::from_millis(250)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_host_creation() {
        // libusb may be unavailable in the test environment
        match RusbHost::new() {
            Ok(host) => {
                let addresses = host.device_addresses().unwrap_or_default();
                let listed = host.list_devices().unwrap_or_default();
                assert!(listed.len() <= addresses.len());
                assert_eq!(
                    host.close_device(DeviceRef(u32::MAX)),
                    Err(HostError::InvalidParam)
                );
            }
            Err(e) => eprintln!("libusb unavailable: {}", e),
        }
    }
}
