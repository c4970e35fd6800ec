//! Blufi protocol session and command matching.
//!
//! # Message Flow
//!
//! ```text
//! Client                                  Device
//!    |                                       |
//!    |------ Negotiate (public key) -------->|  optional key exchange
//!    |<----- Negotiate (public key) ---------|
//!    |------ SetSecurityMode (encrypted) --->|
//!    |<----- Ack ----------------------------|  session Ready
//!    |                                       |
//!    |------ StaConfig (encrypted) --------->|  provisioning
//!    |<----- WifiConnectionState ------------|
//!    |                                       |
//!    |------ GetWifiList ------------------->|
//!    |<----- WifiList (CONTINUES) -----------|  multi-frame reply
//!    |<----- WifiList -----------------------|
//!    |                                       |
//!    |------ CloseConnection --------------->|
//! ```
//!
//! Replies carry the sequence number of the request they answer, so any
//! number of commands can be in flight.
//!
//! ## State Machine
//!
//! | State                 | Description                      | Valid Transitions               |
//! |-----------------------|----------------------------------|---------------------------------|
//! | `Disconnected`        | No link                          | → Connecting                    |
//! | `Connecting`          | Transport connect in progress    | → Connected, Disconnected       |
//! | `Connected`           | Link up, no encryption           | → NegotiatingSecurity, Disconnected |
//! | `NegotiatingSecurity` | Key exchange in flight           | → Ready, Connected, Disconnected |
//! | `Ready`               | Negotiated security context      | → NegotiatingSecurity, Disconnected |
//!
//! ## Command Preconditions
//!
//! | Command                    | Allowed in                         |
//! |----------------------------|------------------------------------|
//! | `GetWifiStatus`, `GetVersion`, `GetWifiList`, `CustomData` | any connected state |
//! | `Negotiate`                | `Connected`, `Ready`               |
//! | `ConfigureSta`             | `Ready` only (`SecurityRequired`)  |
//!
//! Anything sent while `Disconnected` or `Connecting` fails with
//! `Connection` before a frame is built.

mod command;
mod pending;
mod reply;
mod session;

pub use command::{
    negotiate_payload, parse_negotiate, Command, CommandKind, Reply, ReplyKind, StaCredentials,
    MAX_PASSWORD_LEN, MAX_SSID_LEN, NEGOTIATE_KEY_TAG,
};
pub use pending::{PendingCommand, PendingTable, Responder};
pub use reply::{
    Bssid, DeviceStatus, DeviceVersion, OpMode, ProvisioningResult, WifiScanEntry,
    STA_CONNECTED, STA_CONNECTING, STA_DISCONNECTED,
};
pub use session::{
    validate_address, ConnectionState, Inbound, Outgoing, Resolution, Session, SessionStats,
};
