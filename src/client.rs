//! Async Blufi client.
//!
//! [`BlufiClient`] is a cheap, cloneable handle. Every call becomes a
//! request on a bounded queue consumed by one dispatch task, which owns the
//! [`Session`] and the transport. That task is the only writer of session
//! state: it interleaves caller requests, transport events and command
//! deadlines in arrival order.
//!
//! ```text
//! callers ──Request──▶ ┌────────────────────┐ ──write──▶ Transport
//!                      │   dispatch task    │
//! Transport ──event──▶ │ (Session, pending) │ ──Event──▶ EventBus ──▶ subscribers
//!                      └────────────────────┘
//!                         ▲ deadline timer
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use blufi::{BlufiClient, Config};
//! use blufi::sim::{SimHandle, SimulatedDevice};
//!
//! let client = BlufiClient::simulated(SimHandle::new(SimulatedDevice::new()), Config::default())?;
//! client.connect("AA:BB:CC:DD:EE:FF").await?;
//! client.negotiate_security().await?;
//! let result = client.configure_sta("home-wifi", "secret123").await?;
//! assert!(result.success);
//! client.disconnect().await?;
//! ```

use std::collections::VecDeque;
use std::future;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};

use crate::config::Config;
use crate::error::{BlufiError, Result};
use crate::events::{Event, EventBus, EventStream};
use crate::protocol::{
    Command, CommandKind, ConnectionState, DeviceStatus, DeviceVersion, Inbound,
    ProvisioningResult, Reply, Resolution, Responder, Session, SessionStats, StaCredentials,
    WifiScanEntry,
};
use crate::sim::SimHandle;
use crate::transport::{MemoryTransport, Transport, TransportEvent};

enum Request {
    Scan(oneshot::Sender<Result<()>>),
    StopScan(oneshot::Sender<Result<()>>),
    Connect {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Negotiate(oneshot::Sender<Result<()>>),
    Command {
        command: Command,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Disconnect(oneshot::Sender<Result<()>>),
    Stats(oneshot::Sender<SessionStats>),
}

/// Handle to a running Blufi session
#[derive(Debug, Clone)]
pub struct BlufiClient {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    events: EventBus,
}

impl BlufiClient {
    /// Start a dispatch task driving `transport`.
    ///
    /// Must be called from within a Tokio runtime. The task stops, closing
    /// the link, once every handle has been dropped.
    pub fn new<T: Transport>(mut transport: T, config: Config) -> Result<Self> {
        config.validate()?;
        let transport_events = transport.take_events().ok_or_else(|| {
            BlufiError::Protocol("transport events are already in use".to_string())
        })?;

        let mut limits = config.client.codec_limits();
        limits.max_frame_size = limits.max_frame_size.min(transport.max_write_len());
        let session = Session::with_limits(&config.client, limits);

        let (requests, request_rx) = mpsc::channel(config.client.request_queue);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let events = EventBus::new(config.client.event_capacity);

        let dispatcher = Dispatcher {
            transport,
            session,
            config,
            events: events.clone(),
            state: state_tx,
            scanning: false,
            deferred: VecDeque::new(),
        };
        tokio::spawn(dispatcher.run(request_rx, transport_events));

        Ok(Self {
            requests,
            state,
            events,
        })
    }

    /// Client wired to an in-process simulated device
    pub fn simulated(device: SimHandle, config: Config) -> Result<Self> {
        Self::new(MemoryTransport::new(device), config)
    }

    async fn call<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Request) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| BlufiError::SessionClosed)?;
        rx.await.map_err(|_| BlufiError::SessionClosed)
    }

    async fn command(&self, command: Command) -> Result<Reply> {
        self.call(|reply| Request::Command { command, reply }).await?
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to events from now on
    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Start a BLE scan; results arrive as [`Event::ScanResult`]
    pub async fn scan(&self) -> Result<()> {
        self.call(Request::Scan).await?
    }

    /// Stop a running scan
    pub async fn stop_scan(&self) -> Result<()> {
        self.call(Request::StopScan).await?
    }

    /// Connect to a device, retrying the transport connect as configured
    pub async fn connect(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.call(|reply| Request::Connect { address, reply }).await?
    }

    /// Run key negotiation.
    ///
    /// On failure the session stays connected without encryption and a
    /// [`Event::SecurityWarning`] is emitted.
    pub async fn negotiate_security(&self) -> Result<()> {
        self.call(Request::Negotiate).await?
    }

    /// Provision station credentials. Requires a negotiated session.
    pub async fn configure_sta(&self, ssid: &str, password: &str) -> Result<ProvisioningResult> {
        let credentials = StaCredentials::new(ssid, password)?;
        match self.command(Command::ConfigureSta(credentials)).await? {
            Reply::Status(status) => Ok(ProvisioningResult::from(&status)),
            other => Err(unexpected(CommandKind::ConfigureSta, &other)),
        }
    }

    /// Query the device's Wi-Fi status
    pub async fn device_status(&self) -> Result<DeviceStatus> {
        match self.command(Command::GetWifiStatus).await? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected(CommandKind::GetWifiStatus, &other)),
        }
    }

    /// Query the firmware version
    pub async fn device_version(&self) -> Result<DeviceVersion> {
        match self.command(Command::GetVersion).await? {
            Reply::Version(version) => Ok(version),
            other => Err(unexpected(CommandKind::GetVersion, &other)),
        }
    }

    /// Ask the device for the access points it can see
    pub async fn device_wifi_scan(&self) -> Result<Vec<WifiScanEntry>> {
        match self.command(Command::GetWifiList).await? {
            Reply::WifiList(list) => Ok(list),
            other => Err(unexpected(CommandKind::GetWifiList, &other)),
        }
    }

    /// Send application-defined bytes. Resolves once written.
    pub async fn send_custom_data(&self, data: impl Into<Bytes>) -> Result<()> {
        self.command(Command::CustomData(data.into())).await.map(|_| ())
    }

    /// Close the link. Always succeeds.
    pub async fn disconnect(&self) -> Result<()> {
        self.call(Request::Disconnect).await?
    }

    /// Session statistics
    pub async fn stats(&self) -> Result<SessionStats> {
        self.call(Request::Stats).await
    }
}

fn unexpected(kind: CommandKind, reply: &Reply) -> BlufiError {
    BlufiError::Protocol(format!("unexpected reply to {}: {:?}", kind.name(), reply))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

struct Dispatcher<T> {
    transport: T,
    session: Session,
    config: Config,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
    scanning: bool,
    /// Commands held back while a negotiation is running
    deferred: VecDeque<(Command, oneshot::Sender<Result<Reply>>)>,
}

impl<T: Transport> Dispatcher<T> {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        tracing::info!(
            transport = self.transport.name(),
            session = self.session.id(),
            frame_size = self.session.limits().max_frame_size,
            "dispatcher started"
        );

        loop {
            let deadline = self.session.next_deadline();
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(event) = transport_events.recv() => self.on_transport_event(event).await,
                () = sleep_until(deadline) => self.expire().await,
            }
            self.flush_deferred().await;
        }

        self.disconnect().await;
        tracing::info!(session = self.session.id(), "dispatcher stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Scan(reply) => {
                let result = self.scan().await;
                let _ = reply.send(result);
            },
            Request::StopScan(reply) => {
                let result = self.stop_scan().await;
                let _ = reply.send(result);
            },
            Request::Connect { address, reply } => {
                let result = self.connect(address).await;
                let _ = reply.send(result);
            },
            Request::Negotiate(reply) => match self.session.begin_negotiation() {
                Ok(command) => {
                    self.publish_state();
                    self.send_command(&command, Responder::Negotiation(reply))
                        .await;
                },
                Err(e) => {
                    let _ = reply.send(Err(e));
                },
            },
            Request::Command { command, reply } => {
                if self.session.waits_for_negotiation(command.kind()) {
                    tracing::debug!(
                        command = command.kind().name(),
                        "holding command until negotiation finishes"
                    );
                    self.deferred.push_back((command, reply));
                } else {
                    self.send_command(&command, Responder::Caller(reply)).await;
                }
            },
            Request::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(Ok(()));
            },
            Request::Stats(reply) => {
                let _ = reply.send(self.session.stats());
            },
        }
    }

    fn publish_state(&self) {
        let state = self.session.state();
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.events.emit(Event::ConnectionStateChanged { state });
        }
    }

    async fn scan(&mut self) -> Result<()> {
        if self.scanning {
            return Ok(());
        }
        self.transport.start_scan().await?;
        self.scanning = true;
        tracing::info!(transport = self.transport.name(), "scan started");
        self.events.emit(Event::ScanStarted);
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if !self.scanning {
            return Ok(());
        }
        self.scanning = false;
        self.transport.stop_scan().await?;
        tracing::info!("scan stopped");
        self.events.emit(Event::ScanStopped);
        Ok(())
    }

    async fn connect(&mut self, address: String) -> Result<()> {
        self.session.begin_connect(&address)?;
        if let Err(e) = self.stop_scan().await {
            tracing::warn!(error = %e, "could not stop scan before connecting");
        }
        self.events.emit(Event::Connecting {
            address: address.clone(),
        });
        self.publish_state();

        let client = &self.config.client;
        let attempts = client.connect_retries + 1;
        let connect_timeout = client.connect_timeout();
        let retry_delay = client.connect_retry_delay();

        let mut last_error = BlufiError::Connection("no connection attempt made".to_string());
        for attempt in 1..=attempts {
            match time::timeout(connect_timeout, self.transport.connect(&address)).await {
                Ok(Ok(())) => {
                    self.session.connect_succeeded()?;
                    self.publish_state();
                    return Ok(());
                },
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    let _ = self.transport.disconnect().await;
                    last_error = BlufiError::Connection(format!(
                        "connect to {} timed out after {:?}",
                        address, connect_timeout
                    ));
                },
            }
            tracing::warn!(attempt, attempts, error = %last_error, "connect attempt failed");
            if attempt < attempts {
                time::sleep(retry_delay).await;
            }
        }

        self.session.connect_failed();
        self.publish_state();
        Err(last_error)
    }

    async fn disconnect(&mut self) {
        if self.session.state().is_connected() {
            if let Ok(outgoing) = self.session.prepare(&Command::CloseConnection) {
                for frame in &outgoing.frames {
                    if self.transport.write(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.teardown().await;
    }

    async fn flush_deferred(&mut self) {
        while self.session.state() != ConnectionState::NegotiatingSecurity {
            let Some((command, reply)) = self.deferred.pop_front() else {
                break;
            };
            self.send_command(&command, Responder::Caller(reply)).await;
        }
    }

    async fn teardown(&mut self) {
        for (_, reply) in self.deferred.drain(..) {
            let _ = reply.send(Err(BlufiError::SessionClosed));
        }
        self.session.close();
        if let Err(e) = self.transport.disconnect().await {
            tracing::debug!(error = %e, "transport disconnect failed");
        }
        self.publish_state();
    }

    async fn send_command(&mut self, command: &Command, responder: Responder) {
        let outgoing = match self.session.prepare(command) {
            Ok(outgoing) => outgoing,
            Err(e) => return self.fail(responder, e),
        };

        for frame in &outgoing.frames {
            if let Err(e) = self.transport.write(frame).await {
                tracing::warn!(command = outgoing.kind.name(), error = %e, "write failed");
                return self.fail(responder, e);
            }
        }

        match self.session.register(&outgoing, responder) {
            Ok(None) => {},
            Ok(Some(Responder::Caller(tx))) => {
                let _ = tx.send(Ok(Reply::Ack));
            },
            Ok(Some(Responder::Negotiation(tx))) => {
                let _ = tx.send(Ok(()));
            },
            Err(e) => {
                tracing::warn!(
                    command = outgoing.kind.name(),
                    seq = outgoing.sequence,
                    error = %e,
                    "could not track command reply"
                );
                if outgoing.kind.is_negotiation() {
                    self.session.negotiation_failed();
                    self.publish_state();
                    self.events.emit(Event::SecurityWarning {
                        reason: e.to_string(),
                    });
                }
            },
        }
    }

    fn fail(&mut self, responder: Responder, err: BlufiError) {
        match responder {
            Responder::Caller(tx) => {
                let _ = tx.send(Err(err));
            },
            Responder::Negotiation(tx) => self.abort_negotiation(err, tx),
        }
    }

    fn abort_negotiation(&mut self, err: BlufiError, tx: oneshot::Sender<Result<()>>) {
        self.session.negotiation_failed();
        self.publish_state();
        self.events.emit(Event::SecurityWarning {
            reason: err.to_string(),
        });
        let _ = tx.send(Err(err));
    }

    async fn continue_negotiation(&mut self, result: Result<Reply>, tx: oneshot::Sender<Result<()>>) {
        match result {
            Ok(Reply::PublicKey(device_key)) => match self.session.complete_negotiation(device_key) {
                Ok(set_mode) => {
                    self.send_command(&set_mode, Responder::Negotiation(tx))
                        .await;
                },
                Err(e) => self.abort_negotiation(e, tx),
            },
            Ok(Reply::Ack) => {
                self.session.negotiation_succeeded();
                self.publish_state();
                let _ = tx.send(Ok(()));
            },
            Ok(other) => self.abort_negotiation(
                BlufiError::NegotiationFailed(format!("unexpected reply {:?}", other)),
                tx,
            ),
            Err(e) => self.abort_negotiation(e, tx),
        }
    }

    async fn resolve(&mut self, resolution: Resolution) {
        let Resolution {
            sequence,
            pending,
            result,
        } = resolution;
        tracing::debug!(
            seq = sequence,
            command = pending.kind.name(),
            ok = result.is_ok(),
            "command resolved"
        );

        match pending.responder {
            Responder::Caller(tx) => {
                if pending.kind == CommandKind::ConfigureSta {
                    if let Ok(Reply::Status(status)) = &result {
                        self.events
                            .emit(Event::ProvisioningResult(ProvisioningResult::from(status)));
                    }
                }
                if tx.send(result).is_err() {
                    tracing::debug!(seq = sequence, "caller went away before the reply");
                }
            },
            Responder::Negotiation(tx) => self.continue_negotiation(result, tx).await,
        }
    }

    async fn expire(&mut self) {
        for resolution in self.session.expire(Instant::now()) {
            self.resolve(resolution).await;
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered {
                address,
                name,
                rssi,
            } => {
                if self.scanning && self.config.scan.accepts(name.as_deref()) {
                    self.events.emit(Event::ScanResult {
                        address,
                        name,
                        rssi,
                    });
                }
            },
            TransportEvent::Notification(bytes) => {
                for inbound in self.session.handle_inbound(&bytes) {
                    self.on_inbound(inbound).await;
                }
            },
            TransportEvent::ConnectionLost => {
                if self.session.state() != ConnectionState::Disconnected {
                    tracing::warn!(session = self.session.id(), "connection lost");
                    self.teardown().await;
                }
            },
        }
    }

    async fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Resolved(resolution) => self.resolve(resolution).await,
            Inbound::Event(event) => self.events.emit(event),
            Inbound::CloseRequested => {
                tracing::info!(session = self.session.id(), "device closed the connection");
                self.teardown().await;
            },
            Inbound::Write(frames) => {
                for frame in &frames {
                    if let Err(e) = self.transport.write(frame).await {
                        tracing::warn!(error = %e, "could not send acknowledgement");
                        break;
                    }
                }
            },
            Inbound::Dropped(err) => self.events.emit(Event::FrameError {
                reason: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedDevice, DEFAULT_ADDRESS};

    fn client() -> (BlufiClient, SimHandle) {
        let device = SimHandle::new(SimulatedDevice::new());
        let client = BlufiClient::simulated(device.clone(), Config::default()).unwrap();
        (client, device)
    }

    #[tokio::test]
    async fn test_status_without_connection_is_connection_error() {
        let (client, _) = client();
        assert!(matches!(
            client.device_status().await,
            Err(BlufiError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_publishes_states() {
        let (client, _) = client();
        let mut events = client.events();
        client.connect(DEFAULT_ADDRESS).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        assert_eq!(
            events.recv().await,
            Some(Event::Connecting {
                address: DEFAULT_ADDRESS.to_string()
            })
        );
        assert_eq!(
            events.recv().await,
            Some(Event::ConnectionStateChanged {
                state: ConnectionState::Connecting
            })
        );
        assert_eq!(
            events.recv().await,
            Some(Event::ConnectionStateChanged {
                state: ConnectionState::Connected
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_address_leaves_transport_alone() {
        let (client, device) = client();
        // One refusal per attempt: the first real connect uses them all up.
        device.lock().refuse_connections(3);
        assert!(matches!(
            client.connect("").await,
            Err(BlufiError::Connection(_))
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.connect(DEFAULT_ADDRESS).await,
            Err(BlufiError::Connection(_))
        ));
        client.connect(DEFAULT_ADDRESS).await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_data_round_trip() {
        let (client, _) = client();
        client.connect(DEFAULT_ADDRESS).await.unwrap();
        let mut events = client.events();
        client.send_custom_data(&b"ping"[..]).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(Event::CustomData {
                data: b"ping".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_stats_track_commands() {
        let (client, _) = client();
        client.connect(DEFAULT_ADDRESS).await.unwrap();
        client.device_version().await.unwrap();
        let stats = client.stats().await.unwrap();
        assert_eq!(stats.state, ConnectionState::Connected);
        assert_eq!(stats.commands_completed, 1);
        assert_eq!(stats.address.as_deref(), Some(DEFAULT_ADDRESS));
    }
}
