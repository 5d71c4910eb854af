//! USB host platform interface
//!
//! The driver never talks to a USB stack directly. Everything it needs from
//! the platform (enumeration, descriptors, interface claims, asynchronous
//! transfers and endpoint control) goes through [`UsbHost`].
//!
//! # Transfer ownership
//!
//! A [`Transfer`] is boxed and moved into the platform on submission. The
//! platform hands it back exactly once through the [`CompletionHandler`]
//! given at submit time, or returns it inside [`SubmitError`] if the
//! submission was rejected. Handlers may be invoked on any thread, including
//! synchronously from inside the submit call, so callers must not hold locks
//! a handler needs while submitting.

use crate::channel::EventSink;
use crate::error::{Error, HostError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Bus location of an attached device, as reported by enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    pub bus: u8,
    pub address: u8,
}

impl DeviceAddress {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Platform token for an opened device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceRef(pub u32);

/// Token identifying a registered event client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

/// The subset of the standard device descriptor the driver uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u8,
    pub max_packet_size0: u8,
    pub num_configurations: u8,
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    #[default]
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// An asynchronous transfer and its data buffer
///
/// For control transfers the buffer starts with the 8-byte setup packet and
/// `num_bytes` covers setup plus payload.
#[derive(Debug)]
pub struct Transfer {
    /// Endpoint address (bit 7 set for IN); 0 for control
    pub endpoint: u8,
    pub buffer: Vec<u8>,
    /// Bytes to send, or bytes requested for IN
    pub num_bytes: usize,
    /// Bytes actually transferred, set by the platform on completion
    pub actual_length: usize,
    pub status: TransferStatus,
    /// Zero means no timeout
    pub timeout: Duration,
}

impl Transfer {
    /// Allocate a zeroed transfer of `capacity` bytes
    ///
    /// Fails with [`Error::NoMemory`] instead of aborting when the allocator
    /// cannot satisfy the request.
    pub fn allocate(endpoint: u8, capacity: usize) -> Result<Box<Transfer>, Error> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(capacity)?;
        buffer.resize(capacity, 0);

        Ok(Box::new(Transfer {
            endpoint,
            buffer,
            num_bytes: 0,
            actual_length: 0,
            status: TransferStatus::Completed,
            timeout: Duration::ZERO,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_in(&self) -> bool {
        self.endpoint & 0x80 != 0
    }

    /// Transferred bytes, clamped to the buffer
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// Receives transfers back from the platform
pub trait CompletionHandler: Send + Sync {
    fn on_complete(&self, transfer: Box<Transfer>);
}

impl<F> CompletionHandler for F
where
    F: Fn(Box<Transfer>) + Send + Sync,
{
    fn on_complete(&self, transfer: Box<Transfer>) {
        self(transfer)
    }
}

/// A rejected submission; the transfer is handed back to the caller
pub struct SubmitError {
    pub error: HostError,
    pub transfer: Box<Transfer>,
}

impl SubmitError {
    pub fn new(error: HostError, transfer: Box<Transfer>) -> Self {
        Self { error, transfer }
    }
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("error", &self.error)
            .field("endpoint", &self.transfer.endpoint)
            .finish()
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "submit on endpoint {:#04x} failed: {}",
            self.transfer.endpoint, self.error
        )
    }
}

impl std::error::Error for SubmitError {}

/// USB host platform consumed by the driver
pub trait UsbHost: Send + Sync {
    /// Register for hot-plug events, delivered on `events`
    fn register_client(&self, events: EventSink) -> Result<ClientId, HostError>;

    fn deregister_client(&self, client: ClientId) -> Result<(), HostError>;

    /// Addresses of all currently attached devices
    fn device_addresses(&self) -> Result<Vec<DeviceAddress>, HostError>;

    fn open_device(&self, address: DeviceAddress) -> Result<DeviceRef, HostError>;

    fn close_device(&self, device: DeviceRef) -> Result<(), HostError>;

    fn device_descriptor(&self, device: DeviceRef) -> Result<DeviceDescriptor, HostError>;

    /// Raw bytes of the active configuration descriptor, sub-descriptors included
    fn active_config_descriptor(&self, device: DeviceRef) -> Result<Vec<u8>, HostError>;

    fn claim_interface(&self, device: DeviceRef, interface: u8) -> Result<(), HostError>;

    fn release_interface(&self, device: DeviceRef, interface: u8) -> Result<(), HostError>;

    /// Submit a bulk transfer on `transfer.endpoint`
    fn submit_transfer(
        &self,
        device: DeviceRef,
        transfer: Box<Transfer>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError>;

    /// Submit a control transfer on the default pipe
    fn submit_control(
        &self,
        device: DeviceRef,
        transfer: Box<Transfer>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), SubmitError>;

    /// Stop the endpoint from accepting new transfers
    fn endpoint_halt(&self, device: DeviceRef, endpoint: u8) -> Result<(), HostError>;

    /// Cancel every transfer queued on the endpoint
    fn endpoint_flush(&self, device: DeviceRef, endpoint: u8) -> Result<(), HostError>;

    /// Clear a halt condition
    fn endpoint_clear(&self, device: DeviceRef, endpoint: u8) -> Result<(), HostError>;
}
