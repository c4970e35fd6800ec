//! Transport layer abstraction for Blufi.
//!
//! A transport moves raw frames between the client and one device. It knows
//! nothing about frame contents: writes go out as-is and inbound bytes come
//! back as [`TransportEvent::Notification`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          BlufiClient dispatch loop      │
//! │         (transport-agnostic)            │
//! └──────────────────┬──────────────────────┘
//!                    │
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │ MemoryTransport │ │  BleTransport   │
//! │ (simulated dev) │ │ (btleplug GATT) │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use blufi::sim::{SimHandle, SimulatedDevice};
//! use blufi::transport::MemoryTransport;
//!
//! let device = SimHandle::new(SimulatedDevice::new());
//! let transport = MemoryTransport::new(device.clone());
//! ```

#[cfg(feature = "ble")]
mod ble;
mod memory;

#[cfg(feature = "ble")]
pub use ble::{BleTransport, NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID};
pub use memory::MemoryTransport;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::Result;

/// Boxed future returned by transport operations
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A device advertisement during a scan
    Discovered {
        /// Device address
        address: String,
        /// Advertised name
        name: Option<String>,
        /// Signal strength in dBm
        rssi: Option<i16>,
    },
    /// Bytes notified by the connected device
    Notification(Vec<u8>),
    /// The link dropped without a local disconnect
    ConnectionLost,
}

/// Transport trait for pluggable link backends.
///
/// All methods are called from a single dispatch task, so implementations
/// need `Send` but not `Sync`.
pub trait Transport: Send + 'static {
    /// Get the transport name for logging.
    fn name(&self) -> &'static str;

    /// Largest single write the link accepts.
    fn max_write_len(&self) -> usize;

    /// Hand over the event receiver. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Start reporting advertisements as [`TransportEvent::Discovered`].
    fn start_scan(&mut self) -> TransportFuture<'_, ()>;

    /// Stop a running scan.
    fn stop_scan(&mut self) -> TransportFuture<'_, ()>;

    /// Connect to `address` and subscribe to notifications.
    fn connect<'a>(&'a mut self, address: &'a str) -> TransportFuture<'a, ()>;

    /// Drop the link. Safe to call when not connected.
    fn disconnect(&mut self) -> TransportFuture<'_, ()>;

    /// Write one frame.
    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> TransportFuture<'a, ()>;
}
