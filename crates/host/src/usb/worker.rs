//! Registry event thread
//!
//! Dedicated thread that receives hot-plug events from the platform and
//! dispatches them against the registry. It blocks on the event channel
//! until teardown closes it, then deregisters from the platform and
//! acknowledges on a completion channel.

use crate::usb::device::DeviceEvent;
use crate::usb::manager::RegistryShared;
use common::{
    ClientId, DeviceAddress, DeviceRef, Error, EventSource, HostEvent, Result, UsbHost,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for the thread to acknowledge
const TEARDOWN_TIMEOUT: Duration = Duration::from_millis(100);

/// Handle to a running event thread
pub(crate) struct EventWorker {
    source: EventSource,
    done_rx: async_channel::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl EventWorker {
    /// Spawn the event thread
    ///
    /// Spawn failure is reported as `NoMemory`.
    pub(crate) fn spawn(
        shared: Arc<RegistryShared>,
        source: EventSource,
        client: ClientId,
    ) -> Result<Self> {
        let (done_tx, done_rx) = async_channel::bounded(1);
        let events = source.clone();
        let stack_size = shared.config.task_stack_size;

        let thread = std::thread::Builder::new()
            .name("ftdi-events".to_string())
            .stack_size(stack_size)
            .spawn(move || {
                run(&shared, &events);

                if let Err(e) = shared.host.deregister_client(client) {
                    warn!("Failed to deregister event client: {}", e);
                }
                let _ = done_tx.send_blocking(());
            })
            .map_err(|e| {
                error!("Failed to spawn event thread: {}", e);
                Error::NoMemory
            })?;

        Ok(Self {
            source,
            done_rx,
            thread: Some(thread),
        })
    }

    /// Signal teardown and wait briefly for the thread to finish
    pub(crate) fn shutdown(mut self) {
        self.source.close();

        let deadline = Instant::now() + TEARDOWN_TIMEOUT;
        let acknowledged = loop {
            if self.done_rx.try_recv().is_ok() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        match self.thread.take() {
            Some(thread) if acknowledged => {
                if thread.join().is_err() {
                    error!("Event thread panicked");
                }
            }
            _ => warn!("Event thread did not stop within {:?}", TEARDOWN_TIMEOUT),
        }
    }
}

/// Event loop; returns once the channel is closed
fn run(shared: &Arc<RegistryShared>, events: &EventSource) {
    info!("FTDI event thread started");

    while let Some(event) = events.recv() {
        if shared.ensure_running().is_err() {
            break;
        }
        match event {
            HostEvent::NewDevice { address } => handle_new_device(shared, address),
            HostEvent::DeviceGone { device } => handle_device_gone(shared, device),
        }
    }

    info!("FTDI event thread stopped");
}

fn handle_new_device(shared: &RegistryShared, address: DeviceAddress) {
    let host: &dyn UsbHost = shared.host.as_ref();
    let device = match host.open_device(address) {
        Ok(device) => device,
        Err(e) => {
            debug!("New device {} could not be opened: {}", address, e);
            return;
        }
    };

    match host.device_descriptor(device) {
        Ok(descriptor) if descriptor.vendor_id == shared.config.vendor_id => {
            info!(
                "FTDI device attached at {}: {:04x}:{:04x}",
                address, descriptor.vendor_id, descriptor.product_id
            );
            if let Some(on_new_device) = &shared.config.on_new_device {
                on_new_device(descriptor.vendor_id, descriptor.product_id);
            }
        }
        Ok(descriptor) => debug!(
            "Ignoring device {:04x}:{:04x} at {}",
            descriptor.vendor_id, descriptor.product_id, address
        ),
        Err(e) => warn!("No descriptor for new device {}: {}", address, e),
    }

    if let Err(e) = host.close_device(device) {
        warn!("Failed to close probed device {}: {}", address, e);
    }
}

fn handle_device_gone(shared: &RegistryShared, device: DeviceRef) {
    // Callbacks run after the registry lock is released so they may close
    let affected = shared.handles_on(device);
    if affected.is_empty() {
        debug!("Device gone with no open handles: {:?}", device);
        return;
    }

    for inner in affected {
        inner.gone.store(true, Ordering::Release);
        info!("Handle {} disconnected", inner.id);
        inner.emit(DeviceEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::manager::DriverConfig;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, MockDevice, MockHost, wait_until};
    use common::create_event_channel;
    use std::sync::Mutex;

    fn shared_with(host: Arc<MockHost>, config: DriverConfig) -> Arc<RegistryShared> {
        Arc::new(RegistryShared::new(host, config))
    }

    #[test]
    fn test_new_device_callback_filters_vendor() {
        let host = Arc::new(MockHost::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = DriverConfig::default()
            .with_new_device_callback(move |vid, pid| sink.lock().unwrap().push((vid, pid)));
        let shared = shared_with(host.clone(), config);

        let (events, source) = create_event_channel(8);
        let client = host.register_client(events).unwrap();
        let worker = EventWorker::spawn(shared, source, client).unwrap();

        host.attach(MockDevice::new(
            DeviceAddress::new(1, 5),
            0x1234,
            0x5678,
            Vec::new(),
        ));
        host.attach(MockDevice::ft232r(6));

        // Events are handled in order, so the foreign device was seen first
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !seen.lock().unwrap().is_empty()));
        assert_eq!(*seen.lock().unwrap(), vec![(0x0403, 0x6001)]);

        // Probe opens are always closed again
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || host.open_count() == 0));

        worker.shutdown();
        assert_eq!(host.client_count(), 0);
    }

    #[test]
    fn test_shutdown_without_events() {
        let host = Arc::new(MockHost::new());
        let shared = shared_with(host.clone(), DriverConfig::default());
        let (events, source) = create_event_channel(1);
        let client = host.register_client(events).unwrap();

        let worker = EventWorker::spawn(shared, source, client).unwrap();
        worker.shutdown();
        assert_eq!(host.client_count(), 0);
    }
}
