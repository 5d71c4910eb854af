//! Event channel between the USB host platform and the driver's event thread

use crate::platform::{DeviceAddress, DeviceRef};
use async_channel::{Receiver, Sender, TrySendError, bounded};

/// Hot-plug notifications from the USB host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// A device was attached at `address`
    NewDevice {
        address: DeviceAddress,
    },

    /// An opened device went away
    DeviceGone {
        device: DeviceRef,
    },
}

/// Platform side of the event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    event_tx: Sender<HostEvent>,
}

impl EventSink {
    /// Deliver an event, blocking while the queue is full
    pub fn send(&self, event: HostEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|_| crate::Error::InvalidState(crate::InvalidStateReason::NotInstalled))
    }

    /// Deliver an event without blocking
    ///
    /// Returns `false` if the queue is full or the receiver is gone.
    pub fn try_send(&self, event: HostEvent) -> bool {
        match self.event_tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!("Event queue full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Driver side of the event channel
#[derive(Debug, Clone)]
pub struct EventSource {
    event_rx: Receiver<HostEvent>,
}

impl EventSource {
    /// Wait for the next event (blocking)
    ///
    /// Returns `None` once the channel has been closed and drained.
    pub fn recv(&self) -> Option<HostEvent> {
        self.event_rx.recv_blocking().ok()
    }

    /// Receive an event from an async context
    pub async fn recv_async(&self) -> Option<HostEvent> {
        self.event_rx.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<HostEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Close the channel, waking any blocked receiver
    pub fn close(&self) -> bool {
        self.event_rx.close()
    }
}

/// Create the event channel with room for `depth` queued events
///
/// Returns (EventSink for the platform, EventSource for the driver)
pub fn create_event_channel(depth: usize) -> (EventSink, EventSource) {
    let (event_tx, event_rx) = bounded(depth.max(1));
    (EventSink { event_tx }, EventSource { event_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_delivery() {
        let (sink, source) = create_event_channel(4);
        let address = DeviceAddress::new(1, 4);

        let handle = std::thread::spawn(move || source.recv());
        sink.send(HostEvent::NewDevice { address }).unwrap();

        assert_eq!(handle.join().unwrap(), Some(HostEvent::NewDevice { address }));
    }

    #[test]
    fn test_close_wakes_receiver() {
        let (sink, source) = create_event_channel(4);
        let waiter = source.clone();

        let handle = std::thread::spawn(move || waiter.recv());
        std::thread::sleep(std::time::Duration::from_millis(20));
        source.close();

        assert_eq!(handle.join().unwrap(), None);
        assert!(sink.is_closed());
        assert!(!sink.try_send(HostEvent::DeviceGone { device: DeviceRef(1) }));
    }

    #[test]
    fn test_full_queue_drops() {
        let (sink, source) = create_event_channel(1);
        let gone = HostEvent::DeviceGone { device: DeviceRef(3) };

        assert!(sink.try_send(gone));
        assert!(!sink.try_send(gone));
        assert_eq!(source.try_recv(), Some(gone));
    }

    #[tokio::test]
    async fn test_async_receive() {
        let (sink, source) = create_event_channel(2);
        let gone = HostEvent::DeviceGone { device: DeviceRef(9) };
        assert!(sink.try_send(gone));
        assert_eq!(source.recv_async().await, Some(gone));
    }
}
