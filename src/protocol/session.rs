//! Blufi session state machine.
//!
//! [`Session`] is synchronous: it turns commands into wire frames and wire
//! frames into resolutions and events, but never touches the transport.
//! The client's dispatch loop owns it, which serializes every state change
//! against inbound frame processing.

use std::fmt;
use std::time::{Duration, Instant as StdInstant};

use serde::Serialize;
use tokio::time::Instant;

use super::command::{Command, CommandKind, Reply};
use super::pending::{PendingCommand, PendingTable, Responder};
use super::reply::{DeviceStatus, ProvisioningResult};
use crate::codec::{
    CodecLimits, ControlSubtype, DataSubtype, Decoded, Frame, FrameCodec, FrameKind, FrameType,
};
use crate::config::ClientConfig;
use crate::error::{BlufiError, Result};
use crate::events::Event;
use crate::security::{FrameProtection, PublicKey, SecurityMode, SecuritySession};

/// Longest accepted device address
const MAX_ADDRESS_LEN: usize = 64;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Transport connect in progress
    Connecting,
    /// Link up, frames unencrypted
    Connected,
    /// Key exchange in flight
    NegotiatingSecurity,
    /// Link up with a negotiated security context
    Ready,
}

impl ConnectionState {
    /// Whether frames can be exchanged
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::NegotiatingSecurity | Self::Ready
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::NegotiatingSecurity => "negotiatingSecurity",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Check a device address before handing it to the transport.
///
/// Accepts MAC addresses and the UUID identifiers some platforms use.
pub fn validate_address(address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(BlufiError::Connection("device address is empty".to_string()));
    }
    if address.len() > MAX_ADDRESS_LEN
        || !address
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '-')
    {
        return Err(BlufiError::Connection(format!(
            "invalid device address '{}'",
            address
        )));
    }
    Ok(())
}

/// Frames ready to write for one command
#[derive(Debug)]
pub struct Outgoing {
    /// Sequence number the reply will refer to
    pub sequence: u8,
    /// Wire frames in send order
    pub frames: Vec<Vec<u8>>,
    /// Command that was encoded
    pub kind: CommandKind,
    /// Reply deadline
    pub timeout: Duration,
}

impl Outgoing {
    /// Whether the device answers this command
    pub fn expects_reply(&self) -> bool {
        self.kind.reply().is_some()
    }
}

/// A pending command that reached its outcome
#[derive(Debug)]
pub struct Resolution {
    /// Request sequence number
    pub sequence: u8,
    /// The removed pending entry
    pub pending: PendingCommand,
    /// Outcome to deliver
    pub result: Result<Reply>,
}

/// What the dispatch loop must do after an inbound frame
#[derive(Debug)]
pub enum Inbound {
    /// Deliver a command outcome
    Resolved(Resolution),
    /// Publish an event
    Event(Event),
    /// The device asked to close the link
    CloseRequested,
    /// Write these frames (acknowledgements)
    Write(Vec<Vec<u8>>),
    /// The frame was dropped
    Dropped(BlufiError),
}

/// Session statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Session ID
    pub session_id: String,
    /// Current state
    pub state: ConnectionState,
    /// Connected device
    pub address: Option<String>,
    /// Wire frames written
    pub frames_sent: u64,
    /// Wire frames received
    pub frames_received: u64,
    /// Inbound frames dropped as corrupt
    pub frames_dropped: u64,
    /// Commands sent
    pub commands_sent: u64,
    /// Commands resolved with a reply
    pub commands_completed: u64,
    /// Commands resolved with an error
    pub commands_failed: u64,
    /// Completed key exchanges
    pub negotiations: u32,
    /// Seconds since the link came up
    pub uptime_secs: u64,
}

/// Client side of one Blufi link
#[derive(Debug)]
pub struct Session {
    id: String,
    state: ConnectionState,
    address: Option<String>,
    codec: FrameCodec,
    security: SecuritySession,
    mode: SecurityMode,
    pending: PendingTable,
    command_timeout: Duration,
    negotiation_timeout: Duration,
    connected_at: Option<StdInstant>,
    negotiations: u32,
    frames_sent: u64,
    frames_received: u64,
    frames_dropped: u64,
    commands_sent: u64,
    commands_completed: u64,
    commands_failed: u64,
}

impl Session {
    /// Create a disconnected session
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_limits(config, config.codec_limits())
    }

    /// Create a session with explicit frame limits
    pub fn with_limits(config: &ClientConfig, limits: CodecLimits) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: ConnectionState::Disconnected,
            address: None,
            codec: FrameCodec::client(limits),
            security: SecuritySession::new(),
            mode: config.security_mode,
            pending: PendingTable::new(),
            command_timeout: config.command_timeout(),
            negotiation_timeout: config.negotiation_timeout(),
            connected_at: None,
            negotiations: 0,
            frames_sent: 0,
            frames_received: 0,
            frames_dropped: 0,
            commands_sent: 0,
            commands_completed: 0,
            commands_failed: 0,
        }
    }

    /// Session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connected (or connecting) device address
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Whether a security context is installed
    pub fn is_secure(&self) -> bool {
        self.security.is_negotiated()
    }

    /// Number of commands waiting for a reply
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// Size limits in use
    pub fn limits(&self) -> CodecLimits {
        self.codec.limits()
    }

    /// Disconnected → Connecting
    pub fn begin_connect(&mut self, address: &str) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(BlufiError::Connection(format!(
                "cannot connect while {}",
                self.state
            )));
        }
        validate_address(address)?;
        self.address = Some(address.to_string());
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Connecting → Connected
    pub fn connect_succeeded(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connecting {
            return Err(BlufiError::Protocol(format!(
                "connect completed while {}",
                self.state
            )));
        }
        self.codec.reset();
        self.security.reset();
        self.connected_at = Some(StdInstant::now());
        self.state = ConnectionState::Connected;
        tracing::info!(session = %self.id, address = ?self.address, "connected");
        Ok(())
    }

    /// Connecting → Disconnected
    pub fn connect_failed(&mut self) {
        self.address = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Any state → Disconnected.
    ///
    /// Fails every pending command with `SessionClosed` and drops all key
    /// material. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Disconnected && self.pending.is_empty() {
            return;
        }
        self.pending.fail_all(|| BlufiError::SessionClosed);
        self.security.reset();
        self.codec.reset();
        self.address = None;
        self.connected_at = None;
        self.state = ConnectionState::Disconnected;
        tracing::info!(session = %self.id, "session closed");
    }

    /// Connected | Ready → NegotiatingSecurity.
    ///
    /// Returns the Negotiate command carrying a fresh public key. An
    /// existing context stays active until the exchange completes.
    pub fn begin_negotiation(&mut self) -> Result<Command> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Ready => {},
            ConnectionState::NegotiatingSecurity => {
                return Err(BlufiError::Protocol(
                    "security negotiation already in progress".to_string(),
                ));
            },
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(BlufiError::Connection("not connected".to_string()));
            },
        }
        let public = self.security.begin_negotiation();
        self.state = ConnectionState::NegotiatingSecurity;
        tracing::debug!(session = %self.id, "negotiation started");
        Ok(Command::Negotiate(public))
    }

    /// Install the context derived from the device's key and return the
    /// SetSecurityMode command that finishes negotiation.
    pub fn complete_negotiation(&mut self, device_key: PublicKey) -> Result<Command> {
        if self.state != ConnectionState::NegotiatingSecurity {
            return Err(BlufiError::Protocol(format!(
                "negotiation reply while {}",
                self.state
            )));
        }
        self.security.complete_negotiation(device_key)?;
        self.negotiations += 1;
        Ok(Command::SetSecurityMode(self.mode))
    }

    /// NegotiatingSecurity → Ready
    pub fn negotiation_succeeded(&mut self) {
        if self.state == ConnectionState::NegotiatingSecurity && self.security.is_negotiated() {
            self.state = ConnectionState::Ready;
            tracing::info!(session = %self.id, mode = self.mode.to_byte(), "session secured");
        }
    }

    /// NegotiatingSecurity → Connected, unencrypted
    pub fn negotiation_failed(&mut self) {
        if self.state != ConnectionState::NegotiatingSecurity {
            return;
        }
        self.security.reset();
        self.state = ConnectionState::Connected;
        tracing::warn!(session = %self.id, "negotiation failed, continuing without encryption");
    }

    /// Whether `kind` has to wait for the running negotiation to finish.
    ///
    /// Once the device answers Negotiate it only accepts frames under the
    /// new keys, so nothing else may be encoded until the exchange settles.
    /// CloseConnection is best-effort and is sent regardless.
    pub fn waits_for_negotiation(&self, kind: CommandKind) -> bool {
        self.state == ConnectionState::NegotiatingSecurity
            && !kind.is_negotiation()
            && !matches!(kind, CommandKind::ConfigureSta | CommandKind::CloseConnection)
    }

    fn check_allowed(&self, kind: CommandKind) -> Result<()> {
        if !self.state.is_connected() {
            return Err(BlufiError::Connection(format!(
                "cannot send {} while {}",
                kind.name(),
                self.state
            )));
        }
        match kind {
            CommandKind::ConfigureSta if self.state != ConnectionState::Ready => {
                Err(BlufiError::SecurityRequired {
                    operation: kind.name(),
                })
            },
            CommandKind::Negotiate if self.state != ConnectionState::NegotiatingSecurity => Err(
                BlufiError::Protocol("negotiate sent outside negotiation".to_string()),
            ),
            CommandKind::SetSecurityMode if !self.security.is_negotiated() => {
                Err(BlufiError::NegotiationIncomplete)
            },
            _ if self.waits_for_negotiation(kind) => Err(BlufiError::Protocol(format!(
                "cannot send {} during security negotiation",
                kind.name()
            ))),
            _ => Ok(()),
        }
    }

    fn protection(&self, frame_type: FrameType) -> FrameProtection {
        if self.security.is_negotiated() {
            self.mode.for_frame(frame_type)
        } else {
            FrameProtection::CHECKSUM_ONLY
        }
    }

    /// Encode a command.
    ///
    /// Nothing is consumed on error: the sequence counter only advances when
    /// frames are produced.
    pub fn prepare(&mut self, command: &Command) -> Result<Outgoing> {
        let kind = command.kind();
        self.check_allowed(kind)?;

        let sequence = self.codec.next_sequence();
        if kind.reply().is_some() && self.pending.contains(sequence) {
            return Err(BlufiError::Protocol(format!(
                "sequence {} still has a pending command",
                sequence
            )));
        }

        let frame_kind = kind.frame_kind();
        let mut protection = self.protection(frame_kind.frame_type);
        if kind.always_encrypted() {
            protection = FrameProtection::FULL;
        }
        let frame =
            Frame::new(frame_kind, command.payload()).protected(protection.encrypt, protection.checksum);

        let encoded = self.codec.encode(frame, self.security.context_mut().ok())?;
        self.frames_sent += encoded.frames.len() as u64;
        self.commands_sent += 1;
        tracing::debug!(
            session = %self.id,
            command = kind.name(),
            seq = encoded.sequence,
            frames = encoded.frames.len(),
            encrypted = protection.encrypt,
            "command encoded"
        );

        Ok(Outgoing {
            sequence: encoded.sequence,
            frames: encoded.frames,
            kind,
            timeout: if kind.is_negotiation() {
                self.negotiation_timeout
            } else {
                self.command_timeout
            },
        })
    }

    /// Record a written command as waiting for its reply.
    ///
    /// Commands without a reply are not tracked; their responder is handed
    /// back for the caller to complete.
    pub fn register(&mut self, outgoing: &Outgoing, responder: Responder) -> Result<Option<Responder>> {
        let Some(reply) = outgoing.kind.reply() else {
            return Ok(Some(responder));
        };
        let pending = PendingCommand::new(outgoing.kind, reply, outgoing.timeout, responder);
        self.pending.insert(outgoing.sequence, pending)?;
        Ok(None)
    }

    fn encode_control(&mut self, subtype: ControlSubtype, reply_to: u8) -> Result<Vec<Vec<u8>>> {
        let protection = self.protection(FrameType::Control);
        let frame = Frame::control(subtype, Vec::new())
            .reply_to(reply_to)
            .protected(protection.encrypt, protection.checksum);
        let encoded = self.codec.encode(frame, self.security.context_mut().ok())?;
        self.frames_sent += encoded.frames.len() as u64;
        Ok(encoded.frames)
    }

    /// Process one notification from the device
    pub fn handle_inbound(&mut self, bytes: &[u8]) -> Vec<Inbound> {
        self.frames_received += 1;
        tracing::trace!(len = bytes.len(), bytes = ?bytes, "inbound frame");

        let decoded = match self.codec.decode(bytes, self.security.context_mut().ok()) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.frames_dropped += 1;
                tracing::warn!(session = %self.id, error = %e, "dropping inbound frame");
                return vec![Inbound::Dropped(e)];
            },
        };
        let frame = match decoded {
            Decoded::Message(frame) => frame,
            Decoded::Fragment { received, remaining } => {
                tracing::trace!(received, remaining, "fragment buffered");
                return Vec::new();
            },
        };
        tracing::debug!(
            session = %self.id,
            kind = %frame.kind(),
            seq = frame.sequence,
            reply_to = ?frame.reply_to,
            len = frame.payload.len(),
            "frame received"
        );

        let mut out = Vec::new();
        if frame.require_ack {
            match self.encode_control(ControlSubtype::Ack, frame.sequence) {
                Ok(frames) => out.push(Inbound::Write(frames)),
                Err(e) => tracing::warn!(error = %e, "could not acknowledge frame"),
            }
        }

        match frame.reply_to {
            Some(seq) if self.pending.contains(seq) => out.extend(self.resolve(seq, frame)),
            _ => out.extend(self.unsolicited(frame)),
        }
        out
    }

    fn resolve(&mut self, seq: u8, frame: Frame) -> Option<Inbound> {
        let max_message = self.codec.limits().max_message_size;
        let pending = self.pending.get_mut(seq)?;

        let result = if frame.kind() == FrameKind::data(DataSubtype::Error) {
            Err(BlufiError::DeviceError {
                code: frame.payload.first().copied().unwrap_or_default(),
            })
        } else if frame.kind() != pending.expected() {
            Err(BlufiError::Protocol(format!(
                "expected {} in reply to {}, got {}",
                pending.expected(),
                pending.kind.name(),
                frame.kind()
            )))
        } else if frame.continues {
            pending.accumulate(&frame.payload);
            if pending.accumulated() <= max_message {
                return None;
            }
            Err(BlufiError::MalformedFrame(format!(
                "continued reply exceeds {} bytes",
                max_message
            )))
        } else {
            pending.finish(&frame.payload)
        };

        let pending = self.pending.take(seq)?;
        if result.is_ok() {
            self.commands_completed += 1;
        } else {
            self.commands_failed += 1;
        }
        Some(Inbound::Resolved(Resolution {
            sequence: seq,
            pending,
            result,
        }))
    }

    fn unsolicited(&mut self, frame: Frame) -> Option<Inbound> {
        match frame.frame_type {
            FrameType::Data => match frame.data_subtype() {
                Some(DataSubtype::WifiConnectionState) => {
                    match DeviceStatus::from_bytes(&frame.payload) {
                        Ok(status) => Some(Inbound::Event(Event::ProvisioningResult(
                            ProvisioningResult::from(&status),
                        ))),
                        Err(e) => {
                            self.frames_dropped += 1;
                            Some(Inbound::Dropped(e))
                        },
                    }
                },
                Some(DataSubtype::Error) => Some(Inbound::Event(Event::DeviceError {
                    code: frame.payload.first().copied().unwrap_or_default(),
                })),
                Some(DataSubtype::CustomData) => Some(Inbound::Event(Event::CustomData {
                    data: frame.payload.to_vec(),
                })),
                _ => {
                    tracing::debug!(kind = %frame.kind(), "ignoring unsolicited data frame");
                    None
                },
            },
            FrameType::Control => match frame.control_subtype() {
                Some(ControlSubtype::CloseConnection) => Some(Inbound::CloseRequested),
                _ => {
                    tracing::debug!(kind = %frame.kind(), "ignoring unsolicited control frame");
                    None
                },
            },
        }
    }

    /// Remove and fail every command whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<Resolution> {
        let expired = self.pending.expire(now);
        self.commands_failed += expired.len() as u64;
        expired
            .into_iter()
            .map(|(sequence, pending)| {
                tracing::warn!(
                    session = %self.id,
                    seq = sequence,
                    command = pending.kind.name(),
                    "command timed out"
                );
                let result = Err(pending.timeout_error());
                Resolution {
                    sequence,
                    pending,
                    result,
                }
            })
            .collect()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    /// Get session statistics
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.clone(),
            state: self.state,
            address: self.address.clone(),
            frames_sent: self.frames_sent,
            frames_received: self.frames_received,
            frames_dropped: self.frames_dropped,
            commands_sent: self.commands_sent,
            commands_completed: self.commands_completed,
            commands_failed: self.commands_failed,
            negotiations: self.negotiations,
            uptime_secs: self
                .connected_at
                .map(|t| t.elapsed().as_secs())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::StaCredentials;
    use crate::sim::SimulatedDevice;
    use tokio::sync::oneshot;

    fn connected(device: &SimulatedDevice) -> Session {
        let mut session = Session::new(&ClientConfig::default());
        session.begin_connect(device.address()).unwrap();
        session.connect_succeeded().unwrap();
        session
    }

    /// Send a command through the device and feed every reply back.
    fn exchange(
        session: &mut Session,
        device: &mut SimulatedDevice,
        command: &Command,
    ) -> (oneshot::Receiver<Result<Reply>>, Vec<Inbound>) {
        let (tx, rx) = oneshot::channel();
        let outgoing = session.prepare(command).unwrap();
        let mut replies = Vec::new();
        for bytes in &outgoing.frames {
            replies.extend(device.receive(bytes));
        }
        if let Some(Responder::Caller(tx)) = session.register(&outgoing, Responder::Caller(tx)).unwrap() {
            let _ = tx.send(Ok(Reply::Ack));
        }
        let mut inbound = Vec::new();
        for bytes in replies {
            inbound.extend(session.handle_inbound(&bytes));
        }
        (rx, inbound)
    }

    fn deliver(inbound: Vec<Inbound>) -> Vec<Inbound> {
        let mut rest = Vec::new();
        for item in inbound {
            match item {
                Inbound::Resolved(resolution) => match resolution.pending.responder {
                    Responder::Caller(tx) => {
                        let _ = tx.send(resolution.result);
                    },
                    Responder::Negotiation(_) => {},
                },
                other => rest.push(other),
            }
        }
        rest
    }

    fn negotiate(session: &mut Session, device: &mut SimulatedDevice) {
        let negotiate = session.begin_negotiation().unwrap();
        let (_rx, inbound) = exchange(session, device, &negotiate);
        let key = inbound
            .into_iter()
            .find_map(|i| match i {
                Inbound::Resolved(Resolution {
                    result: Ok(Reply::PublicKey(pk)),
                    ..
                }) => Some(pk),
                _ => None,
            })
            .unwrap();
        let set_mode = session.complete_negotiation(key).unwrap();
        let (_rx, inbound) = exchange(session, device, &set_mode);
        assert!(inbound.iter().any(|i| matches!(
            i,
            Inbound::Resolved(Resolution {
                result: Ok(Reply::Ack),
                ..
            })
        )));
        session.negotiation_succeeded();
    }

    #[test]
    fn test_connect_transitions() {
        let mut session = Session::new(&ClientConfig::default());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(
            session.begin_connect(""),
            Err(BlufiError::Connection(_))
        ));
        assert!(matches!(
            session.begin_connect("not an address"),
            Err(BlufiError::Connection(_))
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.begin_connect("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(session.begin_connect("AA:BB:CC:DD:EE:FF").is_err());
        session.connect_failed();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.address(), None);
    }

    #[test]
    fn test_commands_need_connection() {
        let mut session = Session::new(&ClientConfig::default());
        assert!(matches!(
            session.prepare(&Command::GetWifiStatus),
            Err(BlufiError::Connection(_))
        ));
        assert!(matches!(
            session.begin_negotiation(),
            Err(BlufiError::Connection(_))
        ));
    }

    #[test]
    fn test_configure_sta_requires_security() {
        let device = SimulatedDevice::new();
        let mut session = connected(&device);
        let creds = StaCredentials::new("home-wifi", "secret123").unwrap();

        let before = session.stats().frames_sent;
        assert!(matches!(
            session.prepare(&Command::ConfigureSta(creds)),
            Err(BlufiError::SecurityRequired {
                operation: "configure_sta"
            })
        ));
        assert_eq!(session.stats().frames_sent, before);
        assert_eq!(session.codec.next_sequence(), 0);
    }

    #[tokio::test]
    async fn test_status_without_security() {
        let mut device = SimulatedDevice::new();
        let mut session = connected(&device);

        let (rx, inbound) = exchange(&mut session, &mut device, &Command::GetWifiStatus);
        assert!(deliver(inbound).is_empty());
        match rx.await.unwrap().unwrap() {
            Reply::Status(status) => assert!(!status.is_sta_connected()),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(session.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_negotiation_then_provision() {
        let mut device = SimulatedDevice::new();
        let mut session = connected(&device);
        negotiate(&mut session, &mut device);
        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(session.is_secure());

        let creds = StaCredentials::new("home-wifi", "secret123").unwrap();
        let (rx, inbound) = exchange(&mut session, &mut device, &Command::ConfigureSta(creds));
        deliver(inbound);
        match rx.await.unwrap().unwrap() {
            Reply::Status(status) => {
                assert!(status.is_sta_connected());
                assert!(ProvisioningResult::from(&status).success);
            },
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_renegotiation_from_ready() {
        let mut device = SimulatedDevice::new();
        let mut session = connected(&device);
        negotiate(&mut session, &mut device);
        negotiate(&mut session, &mut device);
        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(session.stats().negotiations, 2);

        let (rx, inbound) = exchange(&mut session, &mut device, &Command::GetVersion);
        deliver(inbound);
        assert!(matches!(rx.await.unwrap(), Ok(Reply::Version(_))));
    }

    #[tokio::test]
    async fn test_commands_held_during_renegotiation() {
        let mut device = SimulatedDevice::new();
        let mut session = connected(&device);
        negotiate(&mut session, &mut device);

        let negotiate = session.begin_negotiation().unwrap();
        let (_rx, inbound) = exchange(&mut session, &mut device, &negotiate);
        let key = inbound
            .into_iter()
            .find_map(|i| match i {
                Inbound::Resolved(Resolution {
                    result: Ok(Reply::PublicKey(pk)),
                    ..
                }) => Some(pk),
                _ => None,
            })
            .unwrap();

        // The device already holds the new keys at this point.
        assert!(session.waits_for_negotiation(CommandKind::GetVersion));
        assert!(!session.waits_for_negotiation(CommandKind::SetSecurityMode));
        let sent = session.stats().frames_sent;
        assert!(matches!(
            session.prepare(&Command::GetVersion),
            Err(BlufiError::Protocol(_))
        ));
        assert_eq!(session.stats().frames_sent, sent);

        let set_mode = session.complete_negotiation(key).unwrap();
        let (_rx, inbound) = exchange(&mut session, &mut device, &set_mode);
        assert!(!inbound.is_empty());
        session.negotiation_succeeded();
        assert!(!session.waits_for_negotiation(CommandKind::GetVersion));

        let (rx, inbound) = exchange(&mut session, &mut device, &Command::GetVersion);
        deliver(inbound);
        assert!(matches!(rx.await.unwrap(), Ok(Reply::Version(_))));
    }

    #[test]
    fn test_negotiation_failure_returns_to_connected() {
        let device = SimulatedDevice::new();
        let mut session = connected(&device);
        session.begin_negotiation().unwrap();
        assert!(matches!(
            session.begin_negotiation(),
            Err(BlufiError::Protocol(_))
        ));
        session.negotiation_failed();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(!session.is_secure());
    }

    #[tokio::test]
    async fn test_wifi_list_accumulates_continued_replies() {
        let mut device = SimulatedDevice::new();
        let mut session = connected(&device);

        let (rx, inbound) = exchange(&mut session, &mut device, &Command::GetWifiList);
        deliver(inbound);
        match rx.await.unwrap().unwrap() {
            Reply::WifiList(list) => assert_eq!(list.len(), device.networks().len()),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let mut device = SimulatedDevice::new();
        device.drop_replies_to(CommandKind::GetVersion);
        let mut session = connected(&device);

        let (rx, inbound) = exchange(&mut session, &mut device, &Command::GetVersion);
        assert!(inbound.is_empty());
        assert_eq!(session.pending_commands(), 1);

        session.close();
        session.close();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(rx.await.unwrap(), Err(BlufiError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_expire_removes_entry() {
        let mut device = SimulatedDevice::new();
        device.drop_replies_to(CommandKind::GetWifiStatus);
        let mut session = connected(&device);

        let (_rx, _) = exchange(&mut session, &mut device, &Command::GetWifiStatus);
        let deadline = session.next_deadline().unwrap();
        assert!(session.expire(deadline - Duration::from_millis(1)).is_empty());

        let expired = session.expire(deadline);
        assert_eq!(expired.len(), 1);
        assert!(matches!(
            expired[0].result,
            Err(BlufiError::CommandTimeout {
                command: "device_status",
                ..
            })
        ));
        assert_eq!(session.pending_commands(), 0);
        assert_eq!(session.next_deadline(), None);
    }

    #[tokio::test]
    async fn test_unusable_reply_fails_command_at_once() {
        let mut device = SimulatedDevice::new();
        let mut session = connected(&device);

        let track = |session: &mut Session, command: &Command| {
            let (tx, rx) = oneshot::channel();
            let outgoing = session.prepare(command).unwrap();
            assert!(session.register(&outgoing, Responder::Caller(tx)).unwrap().is_none());
            (outgoing.sequence, rx)
        };
        let (version_seq, version_rx) = track(&mut session, &Command::GetVersion);
        let (status_seq, status_rx) = track(&mut session, &Command::GetWifiStatus);
        assert_eq!(session.pending_commands(), 2);

        // A version body one byte short
        let frames = device.encode_unsolicited(
            Frame::data(DataSubtype::Version, vec![1]).reply_to(version_seq),
        );
        let rest = deliver(session.handle_inbound(&frames[0]));
        assert!(rest.is_empty());
        assert!(matches!(
            version_rx.await.unwrap(),
            Err(BlufiError::MalformedFrame(_))
        ));

        // A well-formed reply of the wrong kind
        let frames = device.encode_unsolicited(
            Frame::data(DataSubtype::Version, vec![1, 3]).reply_to(status_seq),
        );
        deliver(session.handle_inbound(&frames[0]));
        assert!(matches!(status_rx.await.unwrap(), Err(BlufiError::Protocol(_))));

        assert_eq!(session.pending_commands(), 0);
        assert_eq!(session.next_deadline(), None);
        let stats = session.stats();
        assert_eq!(stats.commands_failed, 2);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[tokio::test]
    async fn test_register_collision_fails_caller() {
        let mut session = connected(&SimulatedDevice::new());
        let outgoing = session.prepare(&Command::GetVersion).unwrap();

        let (first, _first_rx) = oneshot::channel();
        assert!(session.register(&outgoing, Responder::Caller(first)).unwrap().is_none());

        let (second, second_rx) = oneshot::channel();
        let err = session
            .register(&outgoing, Responder::Caller(second))
            .unwrap_err();
        assert!(err.to_string().contains("already has a pending command"));
        assert!(matches!(second_rx.await.unwrap(), Err(BlufiError::Protocol(_))));
        assert_eq!(session.pending_commands(), 1);
    }

    #[test]
    fn test_corrupt_frame_is_dropped() {
        let mut session = connected(&SimulatedDevice::new());
        let inbound = session.handle_inbound(&[0x01, 0x06]);
        assert!(matches!(
            inbound.as_slice(),
            [Inbound::Dropped(BlufiError::MalformedFrame(_))]
        ));
        assert_eq!(session.stats().frames_dropped, 1);
    }

    #[test]
    fn test_unsolicited_frames_become_events() {
        let mut device = SimulatedDevice::new();
        let mut session = connected(&device);

        let frames = device.encode_unsolicited(Frame::data(DataSubtype::CustomData, &b"hello"[..]));
        let inbound: Vec<Inbound> = frames
            .iter()
            .flat_map(|bytes| session.handle_inbound(bytes))
            .collect();
        assert!(matches!(
            inbound.as_slice(),
            [Inbound::Event(Event::CustomData { data })] if data == b"hello"
        ));

        let frames = device.encode_unsolicited(Frame::control(ControlSubtype::CloseConnection, Vec::new()));
        let inbound = session.handle_inbound(&frames[0]);
        assert!(matches!(inbound.as_slice(), [Inbound::CloseRequested]));
    }

    #[tokio::test]
    async fn test_sequence_wrap_keeps_matching() {
        let mut device = SimulatedDevice::new();
        let mut session = connected(&device);

        for _ in 0..300 {
            let (rx, inbound) = exchange(&mut session, &mut device, &Command::GetVersion);
            deliver(inbound);
            assert!(matches!(rx.await.unwrap(), Ok(Reply::Version(_))));
        }
        assert_eq!(session.stats().commands_completed, 300);
    }
}
