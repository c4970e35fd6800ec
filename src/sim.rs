//! Simulated Blufi device.
//!
//! Speaks the device side of the protocol with the same codec and security
//! session the client uses: key negotiation, security mode selection, status,
//! version and Wi-Fi list queries, station provisioning against a table of
//! known networks, and custom data echo. Test hooks can drop replies,
//! corrupt frames, refuse connections, inject unsolicited frames and cut
//! the link.
//!
//! ```rust,ignore
//! use blufi::sim::{SimHandle, SimulatedDevice};
//!
//! let device = SimHandle::new(SimulatedDevice::new().with_network("lab", "hunter22", -40));
//! device.lock().drop_replies_to(CommandKind::GetVersion);
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::codec::{
    CodecLimits, ControlSubtype, DataSubtype, Decoded, Frame, FrameCodec, FrameKind, FrameType,
};
use crate::protocol::{
    negotiate_payload, parse_negotiate, Bssid, CommandKind, DeviceStatus, DeviceVersion, OpMode,
    StaCredentials, WifiScanEntry, STA_CONNECTED, STA_DISCONNECTED,
};
use crate::security::{FrameProtection, SecurityMode, SecuritySession};
use crate::transport::TransportEvent;

/// Address the default device answers on
pub const DEFAULT_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

/// Advertised name of the default device
pub const DEFAULT_NAME: &str = "BLUFI_DEVICE";

/// Connection end reason: no access point with that SSID
pub const REASON_NO_AP_FOUND: u8 = 201;

/// Connection end reason: wrong passphrase
pub const REASON_AUTH_FAIL: u8 = 202;

/// Error code: secret sent without encryption
pub const ERROR_NOT_SECURED: u8 = 0x04;

/// Error code: request body could not be parsed
pub const ERROR_DATA_FORMAT: u8 = 0x09;

const LIST_ENTRIES_PER_FRAME: usize = 2;

/// A network the device can join
#[derive(Debug, Clone)]
pub struct SimNetwork {
    /// Network name
    pub ssid: String,
    /// Passphrase
    pub password: String,
    /// Signal strength seen by the device
    pub rssi: i8,
}

/// Device side of a Blufi link
#[derive(Debug)]
pub struct SimulatedDevice {
    address: String,
    name: String,
    rssi: i16,
    version: DeviceVersion,
    networks: Vec<SimNetwork>,
    status: DeviceStatus,
    codec: FrameCodec,
    security: SecuritySession,
    mode: Option<SecurityMode>,
    link: Option<mpsc::UnboundedSender<TransportEvent>>,
    refuse: u32,
    silenced: HashSet<FrameKind>,
    corrupt_next: bool,
    received: Vec<Frame>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Device with one known network, `home-wifi` / `secret123`
    pub fn new() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            name: DEFAULT_NAME.to_string(),
            rssi: -52,
            version: DeviceVersion { major: 1, minor: 3 },
            networks: vec![
                SimNetwork {
                    ssid: "home-wifi".to_string(),
                    password: "secret123".to_string(),
                    rssi: -45,
                },
                SimNetwork {
                    ssid: "office".to_string(),
                    password: "correct horse".to_string(),
                    rssi: -67,
                },
                SimNetwork {
                    ssid: "guest".to_string(),
                    password: String::new(),
                    rssi: -80,
                },
            ],
            status: DeviceStatus {
                op_mode: OpMode::Sta,
                sta_conn_status: STA_DISCONNECTED,
                ..Default::default()
            },
            codec: FrameCodec::device(CodecLimits::default()),
            security: SecuritySession::new(),
            mode: None,
            link: None,
            refuse: 0,
            silenced: HashSet::new(),
            corrupt_next: false,
            received: Vec::new(),
        }
    }

    /// Answer on a different address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Advertise a different name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a joinable network
    pub fn with_network(mut self, ssid: impl Into<String>, password: impl Into<String>, rssi: i8) -> Self {
        self.networks.push(SimNetwork {
            ssid: ssid.into(),
            password: password.into(),
            rssi,
        });
        self
    }

    /// Report a different firmware version
    pub fn with_version(mut self, major: u8, minor: u8) -> Self {
        self.version = DeviceVersion { major, minor };
        self
    }

    /// Use a different frame size for replies
    pub fn with_frame_size(mut self, max_frame_size: usize) -> Self {
        self.codec = FrameCodec::device(CodecLimits {
            max_frame_size,
            ..CodecLimits::default()
        });
        self
    }

    /// Device address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertised name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised signal strength
    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    /// Known networks
    pub fn networks(&self) -> &[SimNetwork] {
        &self.networks
    }

    /// Current status record
    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    /// Security mode selected by the client, if any
    pub fn security_mode(&self) -> Option<SecurityMode> {
        self.mode
    }

    /// Whether a security context is installed
    pub fn is_secured(&self) -> bool {
        self.security.is_negotiated()
    }

    /// Every complete frame received, decrypted
    pub fn received_frames(&self) -> &[Frame] {
        &self.received
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connections(&mut self, count: u32) {
        self.refuse = count;
    }

    /// Swallow every request of this kind without replying
    pub fn drop_replies_to(&mut self, kind: CommandKind) {
        self.silenced.insert(kind.frame_kind());
    }

    /// Answer requests of this kind again
    pub fn restore_replies_to(&mut self, kind: CommandKind) {
        self.silenced.remove(&kind.frame_kind());
    }

    /// Flip the last byte of the next reply frame
    pub fn corrupt_next_reply(&mut self) {
        self.corrupt_next = true;
    }

    /// Consume one refusal, if any are queued
    pub fn accept_connection(&mut self) -> bool {
        if self.refuse > 0 {
            self.refuse -= 1;
            return false;
        }
        true
    }

    /// Bind to a transport link
    pub fn attach(&mut self, link: mpsc::UnboundedSender<TransportEvent>) {
        self.link = Some(link);
    }

    /// Unbind from the link and forget all link state
    pub fn detach(&mut self) {
        self.link = None;
        self.codec.reset();
        self.security.reset();
        self.mode = None;
    }

    /// Whether a transport link is bound
    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Send frames over the link as notifications
    pub fn notify(&self, frames: Vec<Vec<u8>>) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        frames
            .into_iter()
            .all(|bytes| link.send(TransportEvent::Notification(bytes)).is_ok())
    }

    fn protection(&self, frame_type: FrameType) -> FrameProtection {
        match self.mode {
            Some(mode) if self.security.is_negotiated() => mode.for_frame(frame_type),
            _ => FrameProtection::CHECKSUM_ONLY,
        }
    }

    fn encode_all(&mut self, frames: Vec<Frame>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for frame in frames {
            let protection = self.protection(frame.frame_type);
            let frame = frame.protected(protection.encrypt, protection.checksum);
            match self.codec.encode(frame, self.security.context_mut().ok()) {
                Ok(encoded) => out.extend(encoded.frames),
                Err(e) => tracing::warn!(error = %e, "device could not encode reply"),
            }
        }
        if self.corrupt_next {
            if let Some(byte) = out.first_mut().and_then(|frame| frame.last_mut()) {
                *byte ^= 0xFF;
                self.corrupt_next = false;
            }
        }
        out
    }

    /// Encode a frame the device sends on its own
    pub fn encode_unsolicited(&mut self, frame: Frame) -> Vec<Vec<u8>> {
        self.encode_all(vec![frame])
    }

    /// Process one frame written by the client and return the reply frames
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let frame = match self.codec.decode(bytes, self.security.context_mut().ok()) {
            Ok(Decoded::Message(frame)) => frame,
            Ok(Decoded::Fragment { .. }) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "device dropped frame");
                return Vec::new();
            },
        };
        tracing::debug!(kind = %frame.kind(), seq = frame.sequence, "device received frame");
        self.received.push(frame.clone());

        let mut replies = Vec::new();
        if frame.require_ack {
            replies.push(Frame::control(ControlSubtype::Ack, Vec::new()).reply_to(frame.sequence));
        }
        if self.silenced.contains(&frame.kind()) {
            return self.encode_all(replies);
        }

        if frame.data_subtype() == Some(DataSubtype::Negotiate) {
            return self.negotiate(&frame, replies);
        }
        match frame.frame_type {
            FrameType::Control => self.handle_control(&frame, &mut replies),
            FrameType::Data => self.handle_data(&frame, &mut replies),
        }
        self.encode_all(replies)
    }

    // The reply goes out under the old context; the new one applies from
    // the next frame on.
    fn negotiate(&mut self, frame: &Frame, mut replies: Vec<Frame>) -> Vec<Vec<u8>> {
        let client_key = match parse_negotiate(&frame.payload) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "device rejected negotiation");
                replies.push(error_reply(frame.sequence, ERROR_DATA_FORMAT));
                return self.encode_all(replies);
            },
        };

        let public = self.security.begin_negotiation();
        replies.push(
            Frame::data(DataSubtype::Negotiate, negotiate_payload(&public)).reply_to(frame.sequence),
        );
        let encoded = self.encode_all(replies);
        if let Err(e) = self.security.complete_negotiation(client_key) {
            tracing::warn!(error = %e, "device failed to derive keys");
        }
        encoded
    }

    fn handle_control(&mut self, frame: &Frame, replies: &mut Vec<Frame>) {
        let seq = frame.sequence;
        match frame.control_subtype() {
            Some(ControlSubtype::SetSecurityMode) => {
                if !frame.encrypted {
                    replies.push(error_reply(seq, ERROR_NOT_SECURED));
                    return;
                }
                match frame.payload.first() {
                    Some(&byte) => {
                        self.mode = Some(SecurityMode::from_byte(byte));
                        replies.push(Frame::control(ControlSubtype::Ack, Vec::new()).reply_to(seq));
                    },
                    None => replies.push(error_reply(seq, ERROR_DATA_FORMAT)),
                }
            },
            Some(ControlSubtype::SetOpMode) => {
                if let Some(mode) = frame.payload.first().copied().and_then(OpMode::from_byte) {
                    self.status.op_mode = mode;
                }
            },
            Some(ControlSubtype::GetWifiStatus) => replies.push(self.status_reply(seq)),
            Some(ControlSubtype::GetVersion) => replies.push(
                Frame::data(DataSubtype::Version, self.version.to_bytes().to_vec()).reply_to(seq),
            ),
            Some(ControlSubtype::GetWifiList) => replies.extend(self.wifi_list(seq)),
            Some(ControlSubtype::CloseConnection) => {
                tracing::debug!("client closed the connection");
            },
            _ => {},
        }
    }

    fn handle_data(&mut self, frame: &Frame, replies: &mut Vec<Frame>) {
        let seq = frame.sequence;
        match frame.data_subtype() {
            Some(DataSubtype::StaConfig) => {
                if !frame.encrypted {
                    replies.push(error_reply(seq, ERROR_NOT_SECURED));
                    return;
                }
                match StaCredentials::from_bytes(&frame.payload) {
                    Ok((_, credentials)) => {
                        self.provision(&credentials);
                        replies.push(self.status_reply(seq));
                    },
                    Err(_) => replies.push(error_reply(seq, ERROR_DATA_FORMAT)),
                }
            },
            Some(DataSubtype::CustomData) => {
                replies.push(Frame::data(DataSubtype::CustomData, frame.payload.clone()));
            },
            _ => {},
        }
    }

    fn provision(&mut self, credentials: &StaCredentials) {
        let mut status = DeviceStatus {
            op_mode: OpMode::Sta,
            sta_conn_status: STA_DISCONNECTED,
            sta_ssid: Some(credentials.ssid.clone()),
            ..Default::default()
        };
        match self
            .networks
            .iter()
            .enumerate()
            .find(|(_, n)| n.ssid == credentials.ssid)
        {
            Some((index, network)) if network.password == credentials.password => {
                status.sta_conn_status = STA_CONNECTED;
                status.sta_bssid = Some(Bssid([0x24, 0x0A, 0xC4, 0x00, 0x00, index as u8]));
                status.rssi = Some(network.rssi);
            },
            Some(_) => status.conn_end_reason = Some(REASON_AUTH_FAIL),
            None => status.conn_end_reason = Some(REASON_NO_AP_FOUND),
        }
        tracing::info!(
            ssid = %credentials.ssid,
            connected = status.is_sta_connected(),
            "device provisioned"
        );
        self.status = status;
    }

    fn status_reply(&self, seq: u8) -> Frame {
        Frame::data(DataSubtype::WifiConnectionState, self.status.to_bytes()).reply_to(seq)
    }

    fn wifi_list(&self, seq: u8) -> Vec<Frame> {
        let chunks: Vec<Vec<u8>> = self
            .networks
            .chunks(LIST_ENTRIES_PER_FRAME)
            .map(|chunk| {
                let mut body = Vec::new();
                for network in chunk {
                    WifiScanEntry {
                        ssid: network.ssid.clone(),
                        rssi: network.rssi,
                    }
                    .write_to(&mut body);
                }
                body
            })
            .collect();

        if chunks.is_empty() {
            return vec![Frame::data(DataSubtype::WifiList, Vec::new()).reply_to(seq)];
        }
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, body)| {
                Frame::data(DataSubtype::WifiList, body)
                    .reply_to(seq)
                    .continued(i < last)
            })
            .collect()
    }
}

fn error_reply(seq: u8, code: u8) -> Frame {
    Frame::data(DataSubtype::Error, vec![code]).reply_to(seq)
}

/// Shared handle to a simulated device
#[derive(Debug, Clone, Default)]
pub struct SimHandle {
    device: Arc<Mutex<SimulatedDevice>>,
}

impl SimHandle {
    /// Share `device`
    pub fn new(device: SimulatedDevice) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
        }
    }

    /// Lock the device
    pub fn lock(&self) -> MutexGuard<'_, SimulatedDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send an unsolicited frame to the connected client
    pub fn inject(&self, frame: Frame) -> bool {
        let mut device = self.lock();
        let frames = device.encode_unsolicited(frame);
        device.notify(frames)
    }

    /// Drop the link as if the device went out of range
    pub fn drop_link(&self) -> bool {
        let mut device = self.lock();
        let sent = device
            .link
            .as_ref()
            .is_some_and(|link| link.send(TransportEvent::ConnectionLost).is_ok());
        device.detach();
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use crate::security::PublicKey;

    struct Client {
        codec: FrameCodec,
        security: SecuritySession,
    }

    impl Client {
        fn new() -> Self {
            Self {
                codec: FrameCodec::client(CodecLimits::default()),
                security: SecuritySession::new(),
            }
        }

        fn send(&mut self, device: &mut SimulatedDevice, frame: Frame) -> Vec<Frame> {
            let encoded = self
                .codec
                .encode(frame, self.security.context_mut().ok())
                .unwrap();
            let mut replies = Vec::new();
            for bytes in encoded.frames {
                for reply in device.receive(&bytes) {
                    if let Decoded::Message(frame) =
                        self.codec.decode(&reply, self.security.context_mut().ok()).unwrap()
                    {
                        replies.push(frame);
                    }
                }
            }
            replies
        }

        fn negotiate(&mut self, device: &mut SimulatedDevice) {
            let public = self.security.begin_negotiation();
            let encrypt = self.security.is_negotiated();
            let replies = self.send(
                device,
                Frame::data(DataSubtype::Negotiate, negotiate_payload(&public))
                    .protected(encrypt, true),
            );
            let key: PublicKey = parse_negotiate(&replies[0].payload).unwrap();
            self.security.complete_negotiation(key).unwrap();

            let set_mode = Command::SetSecurityMode(SecurityMode::default());
            let replies = self.send(
                device,
                Frame::control(ControlSubtype::SetSecurityMode, set_mode.payload())
                    .protected(true, true),
            );
            assert_eq!(replies[0].control_subtype(), Some(ControlSubtype::Ack));
        }
    }

    fn sta_config(ssid: &str, password: &str) -> Frame {
        Frame::data(
            DataSubtype::StaConfig,
            StaCredentials::new(ssid, password).unwrap().to_bytes(),
        )
    }

    #[test]
    fn test_negotiation_installs_mode() {
        let mut device = SimulatedDevice::new();
        let mut client = Client::new();
        client.negotiate(&mut device);
        assert!(device.is_secured());
        assert_eq!(device.security_mode(), Some(SecurityMode::default()));
    }

    #[test]
    fn test_plaintext_credentials_rejected() {
        let mut device = SimulatedDevice::new();
        let mut client = Client::new();
        let replies = client.send(&mut device, sta_config("home-wifi", "secret123"));
        assert_eq!(replies[0].data_subtype(), Some(DataSubtype::Error));
        assert_eq!(replies[0].payload.as_ref(), &[ERROR_NOT_SECURED]);
        assert!(!device.status().is_sta_connected());
    }

    #[test]
    fn test_provisioning_outcomes() {
        let mut device = SimulatedDevice::new();
        let mut client = Client::new();
        client.negotiate(&mut device);

        let replies = client.send(&mut device, sta_config("home-wifi", "wrong").protected(true, true));
        let status = DeviceStatus::from_bytes(&replies[0].payload).unwrap();
        assert_eq!(status.conn_end_reason, Some(REASON_AUTH_FAIL));

        let replies = client.send(&mut device, sta_config("nowhere", "x").protected(true, true));
        let status = DeviceStatus::from_bytes(&replies[0].payload).unwrap();
        assert_eq!(status.conn_end_reason, Some(REASON_NO_AP_FOUND));

        let replies =
            client.send(&mut device, sta_config("home-wifi", "secret123").protected(true, true));
        assert!(replies[0].encrypted);
        let status = DeviceStatus::from_bytes(&replies[0].payload).unwrap();
        assert!(status.is_sta_connected());
        assert_eq!(status.sta_ssid.as_deref(), Some("home-wifi"));
    }

    #[test]
    fn test_wifi_list_is_continued() {
        let mut device = SimulatedDevice::new();
        let mut client = Client::new();
        let replies = client.send(
            &mut device,
            Frame::control(ControlSubtype::GetWifiList, Vec::new()),
        );
        assert_eq!(replies.len(), 2);
        assert!(replies[0].continues);
        assert!(!replies[1].continues);
        assert!(replies.iter().all(|f| f.reply_to == Some(0)));
    }

    #[test]
    fn test_silenced_and_corrupt_replies() {
        let mut device = SimulatedDevice::new();
        device.drop_replies_to(CommandKind::GetVersion);
        let mut client = Client::new();
        let version = || Frame::control(ControlSubtype::GetVersion, Vec::new());
        assert!(client.send(&mut device, version()).is_empty());

        device.restore_replies_to(CommandKind::GetVersion);
        device.corrupt_next_reply();
        let encoded = client.codec.encode(version(), None).unwrap();
        let reply = device.receive(&encoded.frames[0]);
        assert!(client.codec.decode(&reply[0], None).is_err());

        assert_eq!(client.send(&mut device, version()).len(), 1);
        assert_eq!(device.received_frames().len(), 3);
    }

    #[test]
    fn test_custom_data_echo_is_unsolicited() {
        let mut device = SimulatedDevice::new();
        let mut client = Client::new();
        let replies = client.send(&mut device, Frame::data(DataSubtype::CustomData, &b"ping"[..]));
        assert_eq!(replies[0].payload.as_ref(), b"ping");
        assert_eq!(replies[0].reply_to, None);
    }

    #[tokio::test]
    async fn test_handle_inject_and_drop_link() {
        let handle = SimHandle::new(SimulatedDevice::new());
        assert!(!handle.inject(Frame::data(DataSubtype::CustomData, &b"x"[..])));

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.lock().attach(tx);
        assert!(handle.inject(Frame::data(DataSubtype::CustomData, &b"x"[..])));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Notification(_))));

        assert!(handle.drop_link());
        assert_eq!(rx.recv().await, Some(TransportEvent::ConnectionLost));
        assert!(!handle.lock().is_attached());
    }
}
