//! USB subsystem
//!
//! Implements the FTDI SIO driver on top of the [`common::UsbHost`] platform
//! trait:
//! - `device`: per-handle session, configuration and serial operations
//! - `transfers`: transfer slots, setup packets and the bulk-IN poll
//! - `manager`: the driver registry (install, uninstall, open-device list)
//! - `worker`: the registry's hot-plug event thread
//! - `rusb_host`: the libusb-backed platform used by the binary

pub mod device;
pub mod manager;
pub mod rusb_host;
pub mod transfers;
pub mod worker;

pub use device::{
    DataCallback, DeviceConfig, DeviceEvent, DeviceHandle, DeviceState, EventCallback, HandleId,
};
pub use manager::{DriverConfig, DriverRegistry, NewDeviceCallback};
pub use rusb_host::RusbHost;
pub use transfers::MAX_CONTROL_PAYLOAD;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock a mutex, recovering the data if a callback panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
