//! Driver registry
//!
//! [`DriverRegistry`] is the driver's context object. It owns the list of
//! open handles, the hot-plug event thread and the install state; every
//! device is opened through it.
//!
//! State machine: `Uninstalled -> Installed -> TearingDown -> Uninstalled`.

use crate::usb::device::{self, DeviceConfig, DeviceHandle, DeviceInner, HandleId};
use crate::usb::lock;
use crate::usb::worker::EventWorker;
use common::{Error, InvalidStateReason, Result, UsbHost, create_event_channel};
use protocol::FTDI_VID;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Called from the event thread when a device with the driver's vendor ID
/// is attached
pub type NewDeviceCallback = Arc<dyn Fn(u16, u16) + Send + Sync>;

/// Default stack size of the event thread
pub const DEFAULT_TASK_STACK_SIZE: usize = 64 * 1024;

/// Default depth of the hot-plug event queue
pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 32;

/// Driver-wide settings for `install`
#[derive(Clone)]
pub struct DriverConfig {
    /// Vendor ID that triggers `on_new_device`
    pub vendor_id: u16,
    pub task_stack_size: usize,
    pub event_queue_depth: usize,
    pub on_new_device: Option<NewDeviceCallback>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            vendor_id: FTDI_VID,
            task_stack_size: DEFAULT_TASK_STACK_SIZE,
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
            on_new_device: None,
        }
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("task_stack_size", &self.task_stack_size)
            .field("event_queue_depth", &self.event_queue_depth)
            .field("on_new_device", &self.on_new_device.is_some())
            .finish()
    }
}

impl DriverConfig {
    pub fn with_new_device_callback(mut self, f: impl Fn(u16, u16) + Send + Sync + 'static) -> Self {
        self.on_new_device = Some(Arc::new(f));
        self
    }
}

/// State shared by the registry, its event thread and every open handle
pub(crate) struct RegistryShared {
    pub(crate) host: Arc<dyn UsbHost>,
    pub(crate) config: DriverConfig,
    /// Open handles; never iterated without this lock
    pub(crate) devices: Mutex<HashMap<HandleId, Arc<DeviceInner>>>,
    /// Serializes open and close against each other
    pub(crate) open_close: Mutex<()>,
    pub(crate) tearing_down: AtomicBool,
    next_id: AtomicU32,
}

impl RegistryShared {
    pub(crate) fn new(host: Arc<dyn UsbHost>, config: DriverConfig) -> Self {
        Self {
            host,
            config,
            devices: Mutex::new(HashMap::new()),
            open_close: Mutex::new(()),
            tearing_down: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
        }
    }

    pub(crate) fn next_handle_id(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.tearing_down.load(Ordering::Acquire) {
            return Err(Error::InvalidState(InvalidStateReason::NotInstalled));
        }
        Ok(())
    }

    /// Handles open on `device`, collected under the lock
    pub(crate) fn handles_on(&self, device: common::DeviceRef) -> Vec<Arc<DeviceInner>> {
        lock(&self.devices)
            .values()
            .filter(|inner| inner.device == device)
            .cloned()
            .collect()
    }
}

struct Installed {
    shared: Arc<RegistryShared>,
    worker: EventWorker,
}

/// FTDI driver context
pub struct DriverRegistry {
    host: Arc<dyn UsbHost>,
    installed: Mutex<Option<Installed>>,
}

impl DriverRegistry {
    pub fn new(host: Arc<dyn UsbHost>) -> Self {
        Self {
            host,
            installed: Mutex::new(None),
        }
    }

    /// Register with the platform and start the event thread
    pub fn install(&self, config: DriverConfig) -> Result<()> {
        let mut installed = lock(&self.installed);
        if installed.is_some() {
            return Err(Error::InvalidState(InvalidStateReason::AlreadyInstalled));
        }

        let shared = Arc::new(RegistryShared::new(self.host.clone(), config));

        let (sink, source) = create_event_channel(shared.config.event_queue_depth);
        let client = self.host.register_client(sink)?;

        let worker = match EventWorker::spawn(shared.clone(), source, client) {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(e) = self.host.deregister_client(client) {
                    warn!("Failed to deregister client: {}", e);
                }
                return Err(e);
            }
        };

        info!("FTDI driver installed ({:?})", shared.config);
        *installed = Some(Installed { shared, worker });
        Ok(())
    }

    /// Stop the event thread and deregister from the platform
    ///
    /// Refused while any handle is open.
    pub fn uninstall(&self) -> Result<()> {
        let mut installed = lock(&self.installed);
        let Some(current) = installed.as_ref() else {
            return Err(Error::InvalidState(InvalidStateReason::NotInstalled));
        };

        {
            let _guard = lock(&current.shared.open_close);
            let open = lock(&current.shared.devices).len();
            if open > 0 {
                debug!("Uninstall refused: {} device(s) open", open);
                return Err(Error::InvalidState(InvalidStateReason::HasOpenDevices));
            }
            current.shared.tearing_down.store(true, Ordering::Release);
        }

        if let Some(Installed { worker, .. }) = installed.take() {
            worker.shutdown();
        }
        info!("FTDI driver uninstalled");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        lock(&self.installed).is_some()
    }

    pub fn open_device_count(&self) -> usize {
        lock(&self.installed)
            .as_ref()
            .map_or(0, |installed| lock(&installed.shared.devices).len())
    }

    /// Open interface `interface_index` of the first device matching
    /// `vid`/`pid` (0 matches any)
    ///
    /// Waits up to `config.connection_timeout` for the device to appear.
    pub fn open(
        &self,
        vid: u16,
        pid: u16,
        interface_index: u8,
        config: DeviceConfig,
    ) -> Result<DeviceHandle> {
        let shared = lock(&self.installed)
            .as_ref()
            .map(|installed| installed.shared.clone())
            .ok_or(Error::InvalidState(InvalidStateReason::NotInstalled))?;

        device::open(&shared, vid, pid, interface_index, config)
    }
}

impl Drop for DriverRegistry {
    fn drop(&mut self) {
        let installed = lock(&self.installed).take();
        if let Some(Installed { shared, worker }) = installed {
            let open = lock(&shared.devices).len();
            if open > 0 {
                warn!("Driver dropped with {} device(s) still open", open);
            }
            shared.tearing_down.store(true, Ordering::Release);
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::MockHost;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.vendor_id, 0x0403);
        assert_eq!(config.event_queue_depth, DEFAULT_EVENT_QUEUE_DEPTH);
        assert!(config.on_new_device.is_none());
    }

    #[test]
    fn test_install_state_machine() {
        let host = Arc::new(MockHost::new());
        let driver = DriverRegistry::new(host.clone());
        assert!(!driver.is_installed());

        assert!(matches!(
            driver.uninstall(),
            Err(Error::InvalidState(InvalidStateReason::NotInstalled))
        ));

        driver.install(DriverConfig::default()).unwrap();
        assert!(driver.is_installed());
        assert_eq!(host.client_count(), 1);

        assert!(matches!(
            driver.install(DriverConfig::default()),
            Err(Error::InvalidState(InvalidStateReason::AlreadyInstalled))
        ));

        driver.uninstall().unwrap();
        assert!(!driver.is_installed());
        assert_eq!(host.client_count(), 0);

        // A fresh install after teardown works
        driver.install(DriverConfig::default()).unwrap();
        driver.uninstall().unwrap();
    }

    #[test]
    fn test_open_requires_install() {
        let driver = DriverRegistry::new(Arc::new(MockHost::new()));
        let err = driver
            .open(FTDI_VID, 0, 0, DeviceConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState(InvalidStateReason::NotInstalled)
        ));
        assert_eq!(driver.open_device_count(), 0);
    }

    #[test]
    fn test_handle_ids_increase() {
        let shared = RegistryShared::new(Arc::new(MockHost::new()), DriverConfig::default());
        assert_eq!(shared.next_handle_id(), HandleId(1));
        assert_eq!(shared.next_handle_id(), HandleId(2));
        assert!(shared.ensure_running().is_ok());

        shared.tearing_down.store(true, Ordering::Release);
        assert!(shared.ensure_running().is_err());
    }
}
