//! In-process transport wired to a simulated device.
//!
//! Writes are handed to the device synchronously and its replies come back
//! through the same event channel a radio backend would use.

use std::future;

use tokio::sync::mpsc;

use super::{Transport, TransportEvent, TransportFuture};
use crate::error::{BlufiError, Result};
use crate::sim::SimHandle;

/// Write size reported by default
pub const DEFAULT_WRITE_LEN: usize = 512;

/// Transport backed by a [`SimHandle`]
#[derive(Debug)]
pub struct MemoryTransport {
    device: SimHandle,
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    connected: bool,
    scanning: bool,
    max_write_len: usize,
}

impl MemoryTransport {
    /// Create a transport for `device`
    pub fn new(device: SimHandle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            device,
            tx,
            rx: Some(rx),
            connected: false,
            scanning: false,
            max_write_len: DEFAULT_WRITE_LEN,
        }
    }

    /// Report a smaller write size, forcing fragmentation
    pub fn with_write_len(mut self, max_write_len: usize) -> Self {
        self.max_write_len = max_write_len;
        self
    }

    /// The simulated device
    pub fn device(&self) -> &SimHandle {
        &self.device
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn scan(&mut self) -> Result<()> {
        self.scanning = true;
        let device = self.device.lock();
        let _ = self.tx.send(TransportEvent::Discovered {
            address: device.address().to_string(),
            name: Some(device.name().to_string()),
            rssi: Some(device.rssi()),
        });
        Ok(())
    }

    fn open(&mut self, address: &str) -> Result<()> {
        if self.connected {
            return Err(BlufiError::Connection("already connected".to_string()));
        }
        let mut device = self.device.lock();
        if !device.address().eq_ignore_ascii_case(address) {
            return Err(BlufiError::Connection(format!("no device at {}", address)));
        }
        if !device.accept_connection() {
            return Err(BlufiError::Connection(
                "device refused the connection".to_string(),
            ));
        }
        device.attach(self.tx.clone());
        self.connected = true;
        tracing::debug!(address, "memory link up");
        Ok(())
    }

    fn close(&mut self) {
        if self.connected {
            self.device.lock().detach();
            self.connected = false;
            tracing::debug!("memory link down");
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(BlufiError::Connection("not connected".to_string()));
        }
        if bytes.len() > self.max_write_len {
            return Err(BlufiError::Connection(format!(
                "write of {} bytes exceeds link limit of {}",
                bytes.len(),
                self.max_write_len
            )));
        }

        let mut device = self.device.lock();
        if !device.is_attached() {
            self.connected = false;
            return Err(BlufiError::Connection("link lost".to_string()));
        }
        for reply in device.receive(bytes) {
            if self.tx.send(TransportEvent::Notification(reply)).is_err() {
                tracing::debug!("notification dropped, no receiver");
            }
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rx.take()
    }

    fn start_scan(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(future::ready(self.scan()))
    }

    fn stop_scan(&mut self) -> TransportFuture<'_, ()> {
        self.scanning = false;
        Box::pin(future::ready(Ok(())))
    }

    fn connect<'a>(&'a mut self, address: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(future::ready(self.open(address)))
    }

    fn disconnect(&mut self) -> TransportFuture<'_, ()> {
        self.close();
        Box::pin(future::ready(Ok(())))
    }

    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(future::ready(self.send(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecLimits, ControlSubtype, Decoded, Frame, FrameCodec};
    use crate::sim::{SimulatedDevice, DEFAULT_ADDRESS};

    #[tokio::test]
    async fn test_scan_reports_device() {
        let mut transport = MemoryTransport::new(SimHandle::new(SimulatedDevice::new()));
        let mut events = transport.take_events().unwrap();
        assert!(transport.take_events().is_none());

        transport.start_scan().await.unwrap();
        assert!(transport.is_scanning());
        match events.recv().await.unwrap() {
            TransportEvent::Discovered { address, name, .. } => {
                assert_eq!(address, DEFAULT_ADDRESS);
                assert_eq!(name.as_deref(), Some("BLUFI_DEVICE"));
            },
            other => panic!("unexpected event {:?}", other),
        }
        transport.stop_scan().await.unwrap();
        assert!(!transport.is_scanning());
    }

    #[tokio::test]
    async fn test_connect_checks_address() {
        let mut transport = MemoryTransport::new(SimHandle::new(SimulatedDevice::new()));
        assert!(matches!(
            transport.connect("11:22:33:44:55:66").await,
            Err(BlufiError::Connection(_))
        ));
        transport.connect("aa:bb:cc:dd:ee:ff").await.unwrap();
        assert!(transport.device().lock().is_attached());
        assert!(transport.connect(DEFAULT_ADDRESS).await.is_err());

        transport.disconnect().await.unwrap();
        assert!(!transport.device().lock().is_attached());
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let handle = SimHandle::new(SimulatedDevice::new());
        handle.lock().refuse_connections(1);
        let mut transport = MemoryTransport::new(handle);

        assert!(transport.connect(DEFAULT_ADDRESS).await.is_err());
        transport.connect(DEFAULT_ADDRESS).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_round_trip() {
        let mut transport = MemoryTransport::new(SimHandle::new(SimulatedDevice::new()));
        let mut events = transport.take_events().unwrap();
        assert!(transport.write(&[0; 8]).await.is_err());

        transport.connect(DEFAULT_ADDRESS).await.unwrap();
        let mut codec = FrameCodec::client(CodecLimits::default());
        let request = codec
            .encode(Frame::control(ControlSubtype::GetVersion, Vec::new()), None)
            .unwrap();
        transport.write(&request.frames[0]).await.unwrap();

        let TransportEvent::Notification(bytes) = events.recv().await.unwrap() else {
            panic!("expected a notification");
        };
        match codec.decode(&bytes, None).unwrap() {
            Decoded::Message(frame) => assert_eq!(frame.reply_to, Some(request.sequence)),
            Decoded::Fragment { .. } => panic!("unexpected fragment"),
        }
    }

    #[tokio::test]
    async fn test_write_after_drop_link_fails() {
        let handle = SimHandle::new(SimulatedDevice::new());
        let mut transport = MemoryTransport::new(handle.clone());
        let mut events = transport.take_events().unwrap();
        transport.connect(DEFAULT_ADDRESS).await.unwrap();

        assert!(handle.drop_link());
        assert_eq!(events.recv().await, Some(TransportEvent::ConnectionLost));
        assert!(matches!(
            transport.write(&[0; 8]).await,
            Err(BlufiError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let mut transport =
            MemoryTransport::new(SimHandle::new(SimulatedDevice::new())).with_write_len(64);
        transport.connect(DEFAULT_ADDRESS).await.unwrap();
        assert!(transport.write(&[0; 65]).await.is_err());
    }
}
