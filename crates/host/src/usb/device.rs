//! FTDI device handle
//!
//! A [`DeviceHandle`] is one open session on one interface of an FTDI chip:
//! the claimed interface, its three transfers, the control and transmit
//! locks, and the cached modem status. Handles are cheap to clone; all
//! clones refer to the same session and `close` ends it for all of them.

use crate::usb::manager::RegistryShared;
use crate::usb::transfers::{
    BulkInCompletion, CONTROL_BUFFER_SIZE, CONTROL_TIMEOUT, MAX_CONTROL_PAYLOAD, ReturnToSlot,
    SETUP_LEN, TransferSlot, align_to_packet, write_setup,
};
use crate::usb::{lock, read};
use common::{
    CompletionHandler, DeviceAddress, DeviceDescriptor, DeviceRef, Error, InvalidStateReason,
    Result, Transfer, TransferStatus, UsbHost,
};
use protocol::{
    ChipType, ControlRequest, DataBits, InterfaceInfo, ModemStatus, Parity,
    REQUEST_TYPE_VENDOR_OUT, ResetKind, StopBits, build_reset, build_set_baudrate,
    build_set_latency_timer, build_set_line_property, build_set_modem_control, classify_chip,
    resolve_interface,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default time `open` waits for a matching device
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default bulk-IN and bulk-OUT buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Latency timer programmed at open
pub const DEFAULT_LATENCY_MS: u8 = 16;

/// Interval between enumeration passes while `open` waits
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Called with the payload of every bulk-IN packet (status bytes stripped)
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Called for device events; receives the handle the event belongs to
pub type EventCallback = Arc<dyn Fn(&DeviceHandle, DeviceEvent) + Send + Sync>;

/// Asynchronous notifications for an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A bulk-IN transfer failed; polling continues
    Error(TransferStatus),
    /// The modem/line status bytes changed
    ModemStatusChanged(ModemStatus),
    /// The device was unplugged; the handle must still be closed
    Disconnected,
}

/// Lifecycle of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Created,
    Claimed,
    Polling,
    Closing,
    Destroyed,
}

/// Registry key of an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-device settings for `open`
#[derive(Clone)]
pub struct DeviceConfig {
    /// How long to wait for a matching device; zero waits forever
    pub connection_timeout: Duration,
    /// Bulk-IN buffer size, rounded down to the endpoint's max packet size
    pub in_buffer_size: usize,
    /// Bulk-OUT buffer size; also the largest single `transmit`
    pub out_buffer_size: usize,
    pub on_data: Option<DataCallback>,
    pub on_event: Option<EventCallback>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            in_buffer_size: DEFAULT_BUFFER_SIZE,
            out_buffer_size: DEFAULT_BUFFER_SIZE,
            on_data: None,
            on_event: None,
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("connection_timeout", &self.connection_timeout)
            .field("in_buffer_size", &self.in_buffer_size)
            .field("out_buffer_size", &self.out_buffer_size)
            .field("on_data", &self.on_data.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

impl DeviceConfig {
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_buffer_sizes(mut self, in_buffer_size: usize, out_buffer_size: usize) -> Self {
        self.in_buffer_size = in_buffer_size;
        self.out_buffer_size = out_buffer_size;
        self
    }

    pub fn with_data_callback(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    pub fn with_event_callback(
        mut self,
        f: impl Fn(&DeviceHandle, DeviceEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_event = Some(Arc::new(f));
        self
    }

    fn in_size(&self) -> usize {
        if self.in_buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.in_buffer_size
        }
    }

    fn out_size(&self) -> usize {
        if self.out_buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.out_buffer_size
        }
    }
}

pub(crate) struct DeviceInner {
    pub(crate) id: HandleId,
    pub(crate) host: Arc<dyn UsbHost>,
    /// Kept strong so a handle can still be closed after its
    /// `DriverRegistry` is dropped; `close` breaks the cycle
    pub(crate) registry: Arc<RegistryShared>,
    pub(crate) device: DeviceRef,
    pub(crate) address: DeviceAddress,
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,
    pub(crate) chip: ChipType,
    pub(crate) info: InterfaceInfo,
    pub(crate) state: Mutex<DeviceState>,
    /// Set once the platform reports the device unplugged
    pub(crate) gone: AtomicBool,
    pub(crate) control_lock: Mutex<()>,
    pub(crate) transmit_lock: Mutex<()>,
    pub(crate) control: Arc<TransferSlot>,
    pub(crate) bulk_out: Arc<TransferSlot>,
    pub(crate) bulk_in: Arc<TransferSlot>,
    pub(crate) control_done: Arc<dyn CompletionHandler>,
    pub(crate) out_done: Arc<dyn CompletionHandler>,
    pub(crate) in_done: Arc<dyn CompletionHandler>,
    pub(crate) out_capacity: usize,
    pub(crate) modem_status: RwLock<ModemStatus>,
    pub(crate) on_data: Option<DataCallback>,
    pub(crate) on_event: Option<EventCallback>,
}

impl DeviceInner {
    fn set_state(&self, state: DeviceState) {
        *lock(&self.state) = state;
    }

    pub(crate) fn emit(self: &Arc<Self>, event: DeviceEvent) {
        if let Some(on_event) = &self.on_event {
            let handle = DeviceHandle {
                inner: Arc::clone(self),
            };
            on_event(&handle, event);
        }
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// Whether this handle should be reused for a `vid`/`pid` search
    pub(crate) fn matches(&self, vid: u16, pid: u16) -> bool {
        id_matches(vid, pid, self.vendor_id, self.product_id)
    }
}

fn id_matches(vid: u16, pid: u16, vendor_id: u16, product_id: u16) -> bool {
    (vid == protocol::ANY_VID || vid == vendor_id) && (pid == protocol::ANY_PID || pid == product_id)
}

/// Handle to an open FTDI interface
#[derive(Clone)]
pub struct DeviceHandle {
    pub(crate) inner: Arc<DeviceInner>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("chip", &self.inner.chip)
            .field("interface", &self.inner.info.interface_number)
            .finish()
    }
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DeviceHandle {}

impl DeviceHandle {
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn chip_type(&self) -> ChipType {
        self.inner.chip
    }

    pub fn vendor_id(&self) -> u16 {
        self.inner.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.inner.product_id
    }

    pub fn interface_info(&self) -> InterfaceInfo {
        self.inner.info
    }

    pub fn address(&self) -> DeviceAddress {
        self.inner.address
    }

    /// Largest payload a single `transmit` accepts
    pub fn out_buffer_size(&self) -> usize {
        self.inner.out_capacity
    }

    pub fn state(&self) -> DeviceState {
        *lock(&self.inner.state)
    }

    /// Whether the platform has reported this device unplugged
    pub fn is_disconnected(&self) -> bool {
        self.inner.is_gone()
    }

    /// Last modem status received from the chip (no I/O)
    pub fn modem_status(&self) -> ModemStatus {
        *read(&self.inner.modem_status)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            DeviceState::Polling => Ok(()),
            _ => Err(Error::InvalidState(InvalidStateReason::DeviceClosed)),
        }
    }

    /// Send `data` on the bulk-OUT endpoint
    ///
    /// Waits up to `timeout` for the previous transmission to finish and
    /// returns once the platform has accepted the new one. Completion
    /// errors are logged, not reported.
    pub fn transmit(&self, data: &[u8], timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty transmit".to_string()));
        }
        if data.len() > self.inner.out_capacity {
            return Err(Error::InvalidArgument(format!(
                "transmit of {} bytes exceeds the {}-byte OUT buffer",
                data.len(),
                self.inner.out_capacity
            )));
        }

        let _tx = lock(&self.inner.transmit_lock);
        let mut transfer = self.inner.bulk_out.take(timeout)?;
        transfer.buffer[..data.len()].copy_from_slice(data);
        transfer.num_bytes = data.len();
        transfer.actual_length = 0;
        transfer.timeout = timeout;

        self.inner
            .host
            .submit_transfer(self.inner.device, transfer, self.inner.out_done.clone())
            .map_err(|e| {
                warn!("Handle {}: transmit submit failed: {}", self.inner.id, e.error);
                self.inner.bulk_out.put(e.transfer);
                Error::Host(e.error)
            })
    }

    /// Send a control request with an optional OUT data stage
    pub fn send_control_request(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        if data.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "control payload of {} bytes exceeds {}",
                data.len(),
                MAX_CONTROL_PAYLOAD
            )));
        }

        let _ctrl = lock(&self.inner.control_lock);
        let mut transfer = self.inner.control.take(CONTROL_TIMEOUT)?;
        // Bounded by MAX_CONTROL_PAYLOAD above
        let length = data.len() as u16;
        write_setup(&mut transfer.buffer, request_type, request, value, index, length);
        transfer.buffer[SETUP_LEN..SETUP_LEN + data.len()].copy_from_slice(data);
        transfer.num_bytes = SETUP_LEN + data.len();
        transfer.actual_length = 0;
        transfer.timeout = CONTROL_TIMEOUT;

        debug!(
            "Handle {}: control {:#04x}/{} value={:#06x} index={:#06x}",
            self.inner.id, request_type, request, value, index
        );
        self.inner
            .host
            .submit_control(self.inner.device, transfer, self.inner.control_done.clone())
            .map_err(|e| {
                self.inner.control.put(e.transfer);
                Error::Host(e.error)
            })
    }

    fn send_vendor_request(&self, req: ControlRequest) -> Result<()> {
        self.send_control_request(REQUEST_TYPE_VENDOR_OUT, req.request, req.value, req.index, &[])
    }

    pub fn set_baudrate(&self, baud: u32) -> Result<()> {
        let req = build_set_baudrate(baud, self.inner.chip)?;
        self.send_vendor_request(req)
    }

    pub fn set_line_property(
        &self,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
    ) -> Result<()> {
        self.send_vendor_request(build_set_line_property(data_bits, stop_bits, parity))
    }

    /// Drive DTR and RTS
    pub fn set_modem_control(&self, dtr: bool, rts: bool) -> Result<()> {
        self.send_vendor_request(build_set_modem_control(dtr, rts))
    }

    pub fn set_latency_timer(&self, latency_ms: u8) -> Result<()> {
        self.send_vendor_request(build_set_latency_timer(latency_ms)?)
    }

    /// Full SIO reset
    pub fn reset(&self) -> Result<()> {
        self.send_vendor_request(build_reset(ResetKind::Sio))
    }

    pub fn purge_rx_buffer(&self) -> Result<()> {
        self.send_vendor_request(build_reset(ResetKind::PurgeRx))
    }

    pub fn purge_tx_buffer(&self) -> Result<()> {
        self.send_vendor_request(build_reset(ResetKind::PurgeTx))
    }

    /// Best-effort initialization after open
    fn run_startup_sequence(&self) {
        if let Err(e) = self.reset() {
            warn!("Handle {}: reset failed: {}", self.inner.id, e);
        }
        if let Err(e) = self.set_latency_timer(DEFAULT_LATENCY_MS) {
            warn!("Handle {}: set latency failed: {}", self.inner.id, e);
        }
        if let Err(e) = self.set_modem_control(false, false) {
            warn!("Handle {}: clear DTR/RTS failed: {}", self.inner.id, e);
        }
    }

    /// Close the session
    ///
    /// Stops receive polling and waits for the in-flight transfer before
    /// releasing the interface. The platform device is closed once no other
    /// handle uses it. Closing a handle twice fails with `InvalidArgument`.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let registry = &inner.registry;

        let _guard = lock(&registry.open_close);
        if lock(&registry.devices).remove(&inner.id).is_none() {
            return Err(Error::InvalidArgument(format!(
                "handle {} is not open",
                inner.id
            )));
        }

        inner.set_state(DeviceState::Closing);
        inner.stop_polling();

        if let Err(e) = inner
            .host
            .release_interface(inner.device, inner.info.interface_number)
            && !inner.is_gone()
        {
            warn!("Handle {}: release interface failed: {}", inner.id, e);
        }

        let shared = lock(&registry.devices)
            .values()
            .any(|other| other.device == inner.device);
        if !shared && let Err(e) = inner.host.close_device(inner.device) {
            warn!("Handle {}: close device failed: {}", inner.id, e);
        }

        inner.set_state(DeviceState::Destroyed);
        info!(
            "Closed handle {} ({:04x}:{:04x} interface {})",
            inner.id, inner.vendor_id, inner.product_id, inner.info.interface_number
        );
        Ok(())
    }
}

/// A platform device matching the requested VID/PID
struct Candidate {
    device: DeviceRef,
    address: DeviceAddress,
    descriptor: DeviceDescriptor,
    /// Already opened by another handle
    shared: bool,
}

/// Find a device and open `interface_index` on it
pub(crate) fn open(
    registry: &Arc<RegistryShared>,
    vid: u16,
    pid: u16,
    interface_index: u8,
    config: DeviceConfig,
) -> Result<DeviceHandle> {
    let timeout = config.connection_timeout;
    // Zero waits forever, as does a timeout past the end of the clock
    let deadline = if timeout.is_zero() {
        None
    } else {
        Instant::now().checked_add(timeout)
    };

    loop {
        registry.ensure_running()?;
        {
            let _guard = lock(&registry.open_close);
            if let Some(candidate) = find_candidate(registry, vid, pid, interface_index) {
                return attach(registry, candidate, interface_index, &config);
            }
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            debug!(
                "No device {:04x}:{:04x} within {:?}",
                vid, pid, timeout
            );
            return Err(Error::Timeout);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn find_candidate(
    registry: &RegistryShared,
    vid: u16,
    pid: u16,
    interface_index: u8,
) -> Option<Candidate> {
    let host = &registry.host;

    // Other interfaces of an already-open chip reuse its platform device
    let open_addresses: HashSet<DeviceAddress> = {
        let devices = lock(&registry.devices);
        for inner in devices.values() {
            let taken = devices.values().any(|other| {
                other.device == inner.device && other.info.interface_number == interface_index
            });
            if !inner.is_gone() && !taken && inner.matches(vid, pid) {
                return Some(Candidate {
                    device: inner.device,
                    address: inner.address,
                    descriptor: DeviceDescriptor {
                        vendor_id: inner.vendor_id,
                        product_id: inner.product_id,
                        device_class: 0,
                        max_packet_size0: 0,
                        num_configurations: 1,
                    },
                    shared: true,
                });
            }
        }
        devices.values().map(|inner| inner.address).collect()
    };

    let addresses = match host.device_addresses() {
        Ok(addresses) => addresses,
        Err(e) => {
            warn!("Device enumeration failed: {}", e);
            return None;
        }
    };

    for address in addresses {
        if open_addresses.contains(&address) {
            continue;
        }
        let device = match host.open_device(address) {
            Ok(device) => device,
            Err(e) => {
                debug!("Skipping device {}: {}", address, e);
                continue;
            }
        };

        match host.device_descriptor(device) {
            Ok(descriptor)
                if id_matches(vid, pid, descriptor.vendor_id, descriptor.product_id) =>
            {
                return Some(Candidate {
                    device,
                    address,
                    descriptor,
                    shared: false,
                });
            }
            Ok(_) => {}
            Err(e) => debug!("No descriptor for device {}: {}", address, e),
        }

        if let Err(e) = host.close_device(device) {
            warn!("Failed to close probed device {}: {}", address, e);
        }
    }
    None
}

fn attach(
    registry: &Arc<RegistryShared>,
    candidate: Candidate,
    interface_index: u8,
    config: &DeviceConfig,
) -> Result<DeviceHandle> {
    let result = build_handle(registry, &candidate, interface_index, config);
    if result.is_err()
        && !candidate.shared
        && let Err(e) = registry.host.close_device(candidate.device)
    {
        warn!("Failed to close device {}: {}", candidate.address, e);
    }
    let handle = result?;

    handle.run_startup_sequence();
    info!(
        "Opened handle {}: {:?} {:04x}:{:04x} at {} interface {}",
        handle.id(),
        handle.chip_type(),
        handle.vendor_id(),
        handle.product_id(),
        candidate.address,
        interface_index
    );
    Ok(handle)
}

fn build_handle(
    registry: &Arc<RegistryShared>,
    candidate: &Candidate,
    interface_index: u8,
    config: &DeviceConfig,
) -> Result<DeviceHandle> {
    let host = &registry.host;
    let device = candidate.device;
    let chip = classify_chip(candidate.descriptor.product_id);

    let raw_config = host.active_config_descriptor(device)?;
    let info = resolve_interface(&raw_config, interface_index)?;

    let in_size = align_to_packet(config.in_size(), info.bulk_in_max_packet_size);
    if in_size == 0 {
        return Err(Error::InvalidArgument(format!(
            "IN buffer of {} bytes is smaller than the {}-byte max packet size",
            config.in_size(),
            info.bulk_in_max_packet_size
        )));
    }
    let out_size = config.out_size();

    let control = Arc::new(TransferSlot::new(
        "control",
        Transfer::allocate(0, CONTROL_BUFFER_SIZE)?,
    ));
    let bulk_out = Arc::new(TransferSlot::new(
        "bulk-out",
        Transfer::allocate(info.bulk_out_endpoint, out_size)?,
    ));
    let bulk_in = Arc::new(TransferSlot::new(
        "bulk-in",
        Transfer::allocate(info.bulk_in_endpoint, in_size)?,
    ));

    let id = registry.next_handle_id();
    let inner = Arc::new_cyclic(|weak: &Weak<DeviceInner>| DeviceInner {
        id,
        host: host.clone(),
        registry: Arc::clone(registry),
        device,
        address: candidate.address,
        vendor_id: candidate.descriptor.vendor_id,
        product_id: candidate.descriptor.product_id,
        chip,
        info,
        state: Mutex::new(DeviceState::Created),
        gone: AtomicBool::new(false),
        control_lock: Mutex::new(()),
        transmit_lock: Mutex::new(()),
        control_done: Arc::new(ReturnToSlot::new(control.clone())),
        out_done: Arc::new(ReturnToSlot::new(bulk_out.clone())),
        in_done: Arc::new(BulkInCompletion::new(weak.clone())),
        control,
        bulk_out,
        bulk_in,
        out_capacity: out_size,
        modem_status: RwLock::new(ModemStatus::default()),
        on_data: config.on_data.clone(),
        on_event: config.on_event.clone(),
    });

    host.claim_interface(device, info.interface_number)?;
    inner.set_state(DeviceState::Claimed);

    inner.set_state(DeviceState::Polling);
    if let Err(e) = inner.start_polling() {
        inner.set_state(DeviceState::Destroyed);
        if let Err(release) = host.release_interface(device, info.interface_number) {
            warn!("Failed to release interface {}: {}", info.interface_number, release);
        }
        return Err(e);
    }

    lock(&registry.devices).insert(id, inner.clone());
    Ok(DeviceHandle { inner })
}
