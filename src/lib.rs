//! # Blufi - BLE Wi-Fi Provisioning Client
//!
//! Client side of the Blufi protocol: a host talks to an embedded device over
//! Bluetooth Low Energy, agrees on session keys, and hands it the credentials
//! of the Wi-Fi network it should join.
//!
//! ## Features
//!
//! - **Frame codec**: typed frames with sequence numbers, CRC32 checksums and
//!   fragmentation down to the link's write size
//! - **Key negotiation**: X25519 exchange, HKDF-SHA256 derivation and
//!   ChaCha20-Poly1305 frame encryption
//! - **Async dispatch**: one task owns the session, so callers never race on
//!   sequence numbers or security state
//! - **Event stream**: scan results, connection changes and provisioning
//!   outcomes fan out to any number of subscribers
//! - **Simulated device**: the full device side in-process, for tests and
//!   for running the CLI without a radio
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                                   Device
//!    |                                        |
//!    |------ BLE connect -------------------->|
//!    |------ Negotiate (client key) --------->|
//!    |<----- Negotiate (device key) ----------|
//!    |====== SetSecurityMode (encrypted) ====>|
//!    |<===== Ack =============================|
//!    |                                        |
//!    |====== StaConfig (encrypted) ==========>|
//!    |<===== WifiConnectionState =============|
//!    |                                        |
//!    |------ CloseConnection ---------------->|
//! ```
//!
//! ### Connection States
//!
//! ```text
//!                connect()
//!  [Disconnected] ─────────> [Connecting] ──link up──> [Connected]
//!        ^                        │                        │  ^
//!        │     attempts exhausted │     negotiate_security()│  │ failure
//!        └────────────────────────┘                        v  │
//!        ^                                      [NegotiatingSecurity]
//!        │ disconnect() / link lost                        │
//!        └──────────────────────── [Ready] <───── ack ─────┘
//! ```
//!
//! ### Wire Format
//!
//! | Field    | Size     | Notes                                   |
//! |----------|----------|-----------------------------------------|
//! | type     | 1        | control/data class and subtype          |
//! | control  | 1        | encrypted, checksum, fragment, ... bits |
//! | sequence | 1        | per direction, wraps at 256             |
//! | length   | 1 or 2   | two bytes when the wide-length bit is set |
//! | body     | length   | ciphertext plus tag when encrypted      |
//! | checksum | 4        | CRC32, present when the checksum bit is set |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use blufi::{BlufiClient, Config, Event};
//! use blufi::sim::{SimHandle, SimulatedDevice};
//!
//! let device = SimHandle::new(SimulatedDevice::new());
//! let client = BlufiClient::simulated(device, Config::default())?;
//!
//! let mut events = client.events();
//! client.scan().await?;
//! while let Some(event) = events.recv().await {
//!     if let Event::ScanResult { address, .. } = event {
//!         client.connect(&address).await?;
//!         break;
//!     }
//! }
//!
//! client.negotiate_security().await?;
//! let result = client.configure_sta("home-wifi", "secret123").await?;
//! println!("joined: {}", result.success);
//! ```
//!
//! With the `ble` feature, `transport::BleTransport` drives a real adapter
//! through btleplug:
//!
//! ```rust,ignore
//! let transport = blufi::transport::BleTransport::new().await?;
//! let client = blufi::BlufiClient::new(transport, blufi::Config::load(None)?)?;
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: Frame encoding, checksums and fragmentation
//! - [`security`]: Key exchange, key derivation and frame encryption
//! - [`protocol`]: Commands, replies and the session state machine
//! - [`transport`]: Link abstraction, BLE and in-memory backends
//! - [`client`]: Async client handle and dispatch task
//! - [`events`]: Event types and the broadcast bus
//! - [`bridge`]: Named-operation callback interface
//! - [`sim`]: Simulated device
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod security;
pub mod sim;
pub mod transport;

// Re-exports for convenience
pub use bridge::{CallbackBridge, Operation};
pub use client::BlufiClient;
pub use codec::{Frame, FrameCodec};
pub use config::{ClientConfig, Config, ScanConfig};
pub use error::{BlufiError, Result};
pub use events::{Event, EventStream};
pub use protocol::{
    ConnectionState, DeviceStatus, DeviceVersion, OpMode, ProvisioningResult, SessionStats,
    WifiScanEntry,
};
pub use security::SecurityMode;
pub use transport::{MemoryTransport, Transport, TransportEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Highest protocol version this client speaks
pub const PROTOCOL_VERSION: &str = "1.3";
