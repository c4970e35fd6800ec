//! Asynchronous events surfaced to callers.
//!
//! Every subscriber gets its own [`EventStream`] that starts at the moment
//! of subscription. Events are delivered in the order the dispatch loop
//! produced them; a subscriber that falls more than `event_capacity` events
//! behind skips the oldest ones.

use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::protocol::{ConnectionState, ProvisioningResult};

/// Events emitted by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// BLE scan started
    ScanStarted,
    /// A device advertisement was seen
    ScanResult {
        /// Device address
        address: String,
        /// Advertised name
        name: Option<String>,
        /// Signal strength in dBm
        rssi: Option<i16>,
    },
    /// BLE scan stopped
    ScanStopped,
    /// A connection attempt started
    Connecting {
        /// Target address
        address: String,
    },
    /// The session moved to a new state
    ConnectionStateChanged {
        /// New state
        state: ConnectionState,
    },
    /// The device reported the outcome of station provisioning
    ProvisioningResult(ProvisioningResult),
    /// Security negotiation failed; the session continues unencrypted
    SecurityWarning {
        /// What went wrong
        reason: String,
    },
    /// The device reported an error outside any command
    DeviceError {
        /// Device error code
        code: u8,
    },
    /// Application-defined bytes from the device
    CustomData {
        /// Payload
        data: Vec<u8>,
    },
    /// An inbound frame was dropped as corrupt
    FrameError {
        /// Decode error
        reason: String,
    },
}

/// Sending side shared by the dispatch loop
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Bus that buffers `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to current subscribers
    pub fn emit(&self, event: Event) {
        tracing::debug!(?event, "event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Subscribe from now on
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }
}

/// One subscriber's view of the event bus
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Next event, or `None` once the client is gone
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged, events dropped");
                },
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        stream::unfold(self, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
    }
}
