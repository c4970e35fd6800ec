//! BLE transport over btleplug.
//!
//! Blufi devices expose one GATT service with a write characteristic for
//! client frames and a notify characteristic for device frames.

use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Transport, TransportEvent, TransportFuture};
use crate::error::{BlufiError, Result};

/// Blufi GATT service
pub const SERVICE_UUID: Uuid = uuid_from_u16(0xFFFF);

/// Client-to-device characteristic
pub const WRITE_CHAR_UUID: Uuid = uuid_from_u16(0xFF01);

/// Device-to-client characteristic
pub const NOTIFY_CHAR_UUID: Uuid = uuid_from_u16(0xFF02);

/// Largest write handed to the stack; longer values use long writes.
const MAX_WRITE_LEN: usize = 512;

fn ble_error(context: &str, err: btleplug::Error) -> BlufiError {
    BlufiError::Connection(format!("{}: {}", context, err))
}

struct Link {
    peripheral: Peripheral,
    write_char: Characteristic,
    notifications: JoinHandle<()>,
}

/// Transport backed by the first Bluetooth adapter
pub struct BleTransport {
    adapter: Adapter,
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    central_events: Option<JoinHandle<()>>,
    linked: watch::Sender<Option<PeripheralId>>,
    link: Option<Link>,
}

impl BleTransport {
    /// Open the default adapter
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| ble_error("bluetooth manager", e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ble_error("list adapters", e))?
            .into_iter()
            .next()
            .ok_or_else(|| BlufiError::Connection("no Bluetooth adapter found".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            adapter,
            tx,
            rx: Some(rx),
            central_events: None,
            linked: watch::channel(None).0,
            link: None,
        })
    }

    /// Forward adapter events for the lifetime of the transport.
    async fn watch_adapter(&mut self) -> Result<()> {
        if self.central_events.is_some() {
            return Ok(());
        }
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| ble_error("adapter events", e))?;
        let adapter = self.adapter.clone();
        let tx = self.tx.clone();
        let linked = self.linked.subscribe();

        self.central_events = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if let Some(discovered) = describe(&adapter, &id).await {
                            if tx.send(discovered).is_err() {
                                break;
                            }
                        }
                    },
                    CentralEvent::DeviceDisconnected(id) => {
                        if linked.borrow().as_ref() == Some(&id) {
                            tracing::warn!(?id, "BLE link lost");
                            let _ = tx.send(TransportEvent::ConnectionLost);
                        }
                    },
                    _ => {},
                }
            }
        }));
        Ok(())
    }

    async fn find(&self, address: &str) -> Result<Peripheral> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| ble_error("list peripherals", e))?;
        peripherals
            .into_iter()
            .find(|p| {
                p.address().to_string().eq_ignore_ascii_case(address)
                    || p.id().to_string().eq_ignore_ascii_case(address)
            })
            .ok_or_else(|| {
                BlufiError::Connection(format!("device {} not found, scan first", address))
            })
    }

    async fn open(&mut self, address: &str) -> Result<()> {
        if self.link.is_some() {
            return Err(BlufiError::Connection("already connected".to_string()));
        }
        self.watch_adapter().await?;
        let peripheral = self.find(address).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| ble_error("connect", e))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| ble_error("discover services", e))?;

        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == WRITE_CHAR_UUID && c.service_uuid == SERVICE_UUID)
            .cloned()
            .ok_or_else(|| BlufiError::Connection("Blufi write characteristic not found".to_string()))?;
        let notify_char = characteristics
            .iter()
            .find(|c| c.uuid == NOTIFY_CHAR_UUID && c.service_uuid == SERVICE_UUID)
            .cloned()
            .ok_or_else(|| {
                BlufiError::Connection("Blufi notify characteristic not found".to_string())
            })?;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| ble_error("subscribe", e))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| ble_error("notifications", e))?;

        let tx = self.tx.clone();
        let notifications = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != NOTIFY_CHAR_UUID {
                    continue;
                }
                if tx
                    .send(TransportEvent::Notification(notification.value))
                    .is_err()
                {
                    break;
                }
            }
        });

        tracing::info!(address, "BLE link up");
        self.linked.send_replace(Some(peripheral.id()));
        self.link = Some(Link {
            peripheral,
            write_char,
            notifications,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        self.linked.send_replace(None);
        link.notifications.abort();
        link.peripheral
            .disconnect()
            .await
            .map_err(|e| ble_error("disconnect", e))
    }
}

async fn describe(adapter: &Adapter, id: &PeripheralId) -> Option<TransportEvent> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    Some(TransportEvent::Discovered {
        address: peripheral.address().to_string(),
        name: properties.local_name,
        rssi: properties.rssi,
    })
}

impl Transport for BleTransport {
    fn name(&self) -> &'static str {
        "ble"
    }

    fn max_write_len(&self) -> usize {
        MAX_WRITE_LEN
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rx.take()
    }

    fn start_scan(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.watch_adapter().await?;
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(|e| ble_error("start scan", e))
        })
    }

    fn stop_scan(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.adapter
                .stop_scan()
                .await
                .map_err(|e| ble_error("stop scan", e))
        })
    }

    fn connect<'a>(&'a mut self, address: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(self.open(address))
    }

    fn disconnect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(self.close())
    }

    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let link = self
                .link
                .as_ref()
                .ok_or_else(|| BlufiError::Connection("not connected".to_string()))?;
            tracing::trace!(len = bytes.len(), "BLE write");
            link.peripheral
                .write(&link.write_char, bytes, WriteType::WithResponse)
                .await
                .map_err(|e| ble_error("write", e))
        })
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(task) = self.central_events.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            link.notifications.abort();
        }
    }
}
