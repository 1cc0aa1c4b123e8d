//! Operator-facing event bus.
//!
//! Every domain-level occurrence inside the driver is translated into a
//! [`DriverEvent`] and broadcast here; an embedding shell subscribes once
//! and receives every subsequent event without being coupled to internal
//! component types.

use crate::identity::MachineIdentity;
use crate::state::{MachineState, StatusReport};
use tokio::sync::broadcast;

/// Why a streaming run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEndReason {
    Completed,
    UserInterrupted,
    PortError,
    StreamError,
    MachineError,
}

/// Every event the driver surfaces to an embedding shell.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    ScanStarted,
    PortFound(MachineIdentity),
    PortClosed,
    PortClosedWithError(String),
    MachineInitialized,
    DataSent(Vec<u8>),
    DataReceived(Vec<u8>),
    MessageReceived(String),
    StateChanged(MachineState),
    StatusReport(StatusReport),
    StreamingStarted,
    StreamingEnded(StreamEndReason, String),
    WireOn,
    WireOff,
    TemperatureChanged(f64),
}

impl std::fmt::Display for DriverEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverEvent::ScanStarted => write!(f, "scan started"),
            DriverEvent::PortFound(identity) => write!(f, "port found: {}", identity.name),
            DriverEvent::PortClosed => write!(f, "port closed"),
            DriverEvent::PortClosedWithError(reason) => write!(f, "port closed: {reason}"),
            DriverEvent::MachineInitialized => write!(f, "machine initialized"),
            DriverEvent::DataSent(bytes) => write!(f, "sent {} bytes", bytes.len()),
            DriverEvent::DataReceived(bytes) => write!(f, "received {} bytes", bytes.len()),
            DriverEvent::MessageReceived(msg) => write!(f, "message: {msg}"),
            DriverEvent::StateChanged(state) => write!(f, "state: {state}"),
            DriverEvent::StatusReport(_) => write!(f, "status report"),
            DriverEvent::StreamingStarted => write!(f, "streaming started"),
            DriverEvent::StreamingEnded(reason, description) => {
                write!(f, "streaming ended ({reason:?}): {description}")
            }
            DriverEvent::WireOn => write!(f, "wire on"),
            DriverEvent::WireOff => write!(f, "wire off"),
            DriverEvent::TemperatureChanged(value) => write!(f, "temperature: {value:.1}"),
        }
    }
}

/// Broadcast dispatcher for [`DriverEvent`]s.
pub struct EventDispatcher {
    tx: broadcast::Sender<DriverEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher with the given broadcast buffer size.
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to every current subscriber.
    ///
    /// Returns `Ok(0)` rather than an error when there are no subscribers -
    /// a driver with no listener attached is a normal, not exceptional, state.
    pub fn publish(&self, event: DriverEvent) -> usize {
        tracing::trace!(%event, "publishing driver event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Clone for EventDispatcher {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let dispatcher = EventDispatcher::new(16);
        assert_eq!(dispatcher.publish(DriverEvent::ScanStarted), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx1 = dispatcher.subscribe();
        let mut rx2 = dispatcher.subscribe();

        dispatcher.publish(DriverEvent::WireOn);

        assert!(matches!(rx1.recv().await.unwrap(), DriverEvent::WireOn));
        assert!(matches!(rx2.recv().await.unwrap(), DriverEvent::WireOn));
    }
}
