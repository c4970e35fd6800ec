//! Callback-style bridge for hosts that speak in named operations.
//!
//! Host runtimes (plugin layers, FFI shims, scripting hosts) usually invoke
//! an operation by name with a positional argument list and expect exactly
//! one of two callbacks. [`Operation::parse`] maps that call set onto a
//! closed enum, so an unknown name never reaches the device, and
//! [`CallbackBridge`] runs it against a [`BlufiClient`] and reports the
//! outcome as JSON.
//!
//! | Name | Arguments | Success value |
//! |------|-----------|---------------|
//! | `events` | none | (subscription, see [`CallbackBridge::events`]) |
//! | `scan`, `stopScan` | none | `null` |
//! | `connect` | `[address]` | `null` |
//! | `negotiateSecurity` | none | `null` |
//! | `configureSta` | `[ssid, password]` | `{"success":..,"errorCode":..}` |
//! | `deviceStatus` | none | status object |
//! | `deviceVersion` | none | `{"major":..,"minor":..,"version":"1.3"}` |
//! | `deviceWifiScan` | none | `[{"ssid":..,"rssi":..}]` |
//! | `disconnect` | none | `null` |

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::client::BlufiClient;
use crate::error::{BlufiError, Result};
use crate::events::Event;

/// One caller-facing operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Subscribe to events
    Events,
    /// Start a BLE scan
    Scan,
    /// Stop the BLE scan
    StopScan,
    /// Connect to a device
    Connect {
        /// Device address
        address: String,
    },
    /// Run key negotiation
    NegotiateSecurity,
    /// Provision station credentials
    ConfigureSta {
        /// Network name
        ssid: String,
        /// Passphrase
        password: String,
    },
    /// Query Wi-Fi status
    DeviceStatus,
    /// Query firmware version
    DeviceVersion,
    /// Ask the device to scan for access points
    DeviceWifiScan,
    /// Close the link
    Disconnect,
}

fn string_arg(name: &str, args: &[Value], index: usize) -> Result<String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(BlufiError::InvalidArgument(format!(
            "{}: argument {} must be a string, got {}",
            name, index, other
        ))),
        None => Err(BlufiError::InvalidArgument(format!(
            "{}: missing argument {}",
            name, index
        ))),
    }
}

impl Operation {
    /// Map a named call onto an operation
    pub fn parse(name: &str, args: &[Value]) -> Result<Self> {
        Ok(match name {
            "events" => Self::Events,
            "scan" => Self::Scan,
            "stopScan" => Self::StopScan,
            "connect" => Self::Connect {
                address: string_arg(name, args, 0)?,
            },
            "negotiateSecurity" => Self::NegotiateSecurity,
            "configureSta" => Self::ConfigureSta {
                ssid: string_arg(name, args, 0)?,
                password: string_arg(name, args, 1)?,
            },
            "deviceStatus" => Self::DeviceStatus,
            "deviceVersion" => Self::DeviceVersion,
            "deviceWifiScan" => Self::DeviceWifiScan,
            "disconnect" => Self::Disconnect,
            other => {
                return Err(BlufiError::InvalidArgument(format!(
                    "unknown operation '{}'",
                    other
                )))
            },
        })
    }

    /// Name as used by [`parse`](Self::parse)
    pub fn name(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Scan => "scan",
            Self::StopScan => "stopScan",
            Self::Connect { .. } => "connect",
            Self::NegotiateSecurity => "negotiateSecurity",
            Self::ConfigureSta { .. } => "configureSta",
            Self::DeviceStatus => "deviceStatus",
            Self::DeviceVersion => "deviceVersion",
            Self::DeviceWifiScan => "deviceWifiScan",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Runs operations against a client and reports through callbacks
#[derive(Debug, Clone)]
pub struct CallbackBridge {
    client: BlufiClient,
}

impl CallbackBridge {
    /// Bridge for `client`
    pub fn new(client: BlufiClient) -> Self {
        Self { client }
    }

    /// Underlying client
    pub fn client(&self) -> &BlufiClient {
        &self.client
    }

    /// Run an operation and return its JSON result
    pub async fn execute(&self, op: Operation) -> Result<Value> {
        tracing::debug!(operation = op.name(), "bridge call");
        let client = &self.client;
        Ok(match op {
            Operation::Events => {
                return Err(BlufiError::InvalidArgument(
                    "events is a subscription, not a call".to_string(),
                ))
            },
            Operation::Scan => {
                client.scan().await?;
                Value::Null
            },
            Operation::StopScan => {
                client.stop_scan().await?;
                Value::Null
            },
            Operation::Connect { address } => {
                client.connect(&address).await?;
                Value::Null
            },
            Operation::NegotiateSecurity => {
                client.negotiate_security().await?;
                Value::Null
            },
            Operation::ConfigureSta { ssid, password } => {
                serde_json::to_value(client.configure_sta(&ssid, &password).await?)?
            },
            Operation::DeviceStatus => serde_json::to_value(client.device_status().await?)?,
            Operation::DeviceVersion => {
                let version = client.device_version().await?;
                json!({
                    "major": version.major,
                    "minor": version.minor,
                    "version": version.to_string(),
                })
            },
            Operation::DeviceWifiScan => serde_json::to_value(client.device_wifi_scan().await?)?,
            Operation::Disconnect => {
                client.disconnect().await?;
                Value::Null
            },
        })
    }

    /// Run an operation and call exactly one of `success` or `fail`
    pub async fn invoke<S, F>(&self, op: Operation, success: S, fail: F)
    where
        S: FnOnce(Value),
        F: FnOnce(String),
    {
        let name = op.name();
        match self.execute(op).await {
            Ok(value) => success(value),
            Err(e) => {
                tracing::debug!(operation = name, error = %e, "bridge call failed");
                fail(e.to_string());
            },
        }
    }

    /// Parse a named call and invoke it; a bad name or argument goes to `fail`
    pub async fn call<S, F>(&self, name: &str, args: &[Value], success: S, fail: F)
    where
        S: FnOnce(Value),
        F: FnOnce(String),
    {
        match Operation::parse(name, args) {
            Ok(op) => self.invoke(op, success, fail).await,
            Err(e) => fail(e.to_string()),
        }
    }

    /// Forward every event as JSON until the client goes away.
    ///
    /// Dropped frames are reported through `on_error`; everything else
    /// through `on_event`.
    pub fn events<E, R>(&self, mut on_event: E, mut on_error: R) -> JoinHandle<()>
    where
        E: FnMut(Value) + Send + 'static,
        R: FnMut(String) + Send + 'static,
    {
        let mut events = self.client.events();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Event::FrameError { reason } = &event {
                    on_error(reason.clone());
                    continue;
                }
                match serde_json::to_value(&event) {
                    Ok(value) => on_event(value),
                    Err(e) => on_error(e.to_string()),
                }
            }
        })
    }
}
