//! Common infrastructure for the FTDI SIO host driver
//!
//! This crate provides the pieces shared between the driver and its
//! platform backends: the error taxonomy, the [`UsbHost`] platform trait and
//! its transfer types, the hot-plug event channel, and logging setup.
//!
//! The `test-utils` feature adds the scripted `MockHost` platform.

pub mod channel;
pub mod error;
pub mod logging;
pub mod platform;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{EventSink, EventSource, HostEvent, create_event_channel};
pub use error::{Error, HostError, InvalidStateReason, Result};
pub use logging::setup_logging;
pub use platform::{
    ClientId, CompletionHandler, DeviceAddress, DeviceDescriptor, DeviceRef, SubmitError,
    Transfer, TransferStatus, UsbHost,
};
