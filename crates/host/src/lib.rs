//! FTDI SIO USB host driver
//!
//! Drives FTDI USB-to-serial bridges (FT232R, FT232H, FT2232D, FT4232H,
//! FT230X) from the host side using the vendor SIO command set. The driver
//! is platform-independent: it consumes a [`common::UsbHost`] and ships a
//! libusb backend in [`usb::RusbHost`].
//!
//! # Example
//!
//! ```no_run
//! use host::usb::{DeviceConfig, DriverConfig, DriverRegistry, RusbHost};
//! use protocol::{DataBits, Parity, StopBits, FTDI_VID, ANY_PID};
//! use std::sync::Arc;
//!
//! # fn main() -> common::Result<()> {
//! let platform = Arc::new(RusbHost::new()?);
//! let driver = DriverRegistry::new(platform);
//! driver.install(DriverConfig::default())?;
//!
//! let config = DeviceConfig::default().with_data_callback(|bytes| {
//!     println!("received {} bytes", bytes.len());
//! });
//! let port = driver.open(FTDI_VID, ANY_PID, 0, config)?;
//! port.set_baudrate(115_200)?;
//! port.set_line_property(DataBits::Eight, StopBits::One, Parity::None)?;
//! port.transmit(b"hello", std::time::Duration::from_millis(100))?;
//!
//! port.close()?;
//! driver.uninstall()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod usb;

pub use usb::{DeviceConfig, DeviceEvent, DeviceHandle, DriverConfig, DriverRegistry};
