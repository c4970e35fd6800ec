//! Closed set of commands the client sends, and the replies they expect.

use std::fmt;

use bytes::Bytes;

use super::reply::{DeviceStatus, DeviceVersion, OpMode, WifiScanEntry};
use crate::codec::{ControlSubtype, DataSubtype, FrameKind};
use crate::error::{BlufiError, Result};
use crate::security::{PublicKey, SecurityMode, PUBLIC_KEY_SIZE};

/// Tag byte in front of the public key in Negotiate frames
pub const NEGOTIATE_KEY_TAG: u8 = 0x01;

/// Longest SSID accepted by the device
pub const MAX_SSID_LEN: usize = 32;

/// Longest WPA passphrase accepted by the device
pub const MAX_PASSWORD_LEN: usize = 64;

/// Negotiate frame body for `key`
pub fn negotiate_payload(key: &PublicKey) -> Bytes {
    let mut buf = Vec::with_capacity(1 + PUBLIC_KEY_SIZE);
    buf.push(NEGOTIATE_KEY_TAG);
    buf.extend_from_slice(key.as_bytes());
    Bytes::from(buf)
}

/// Parse a Negotiate frame body
pub fn parse_negotiate(body: &[u8]) -> Result<PublicKey> {
    match body.split_first() {
        Some((&NEGOTIATE_KEY_TAG, key)) => PublicKey::from_slice(key)
            .map_err(|e| BlufiError::NegotiationFailed(e.to_string())),
        Some((tag, _)) => Err(BlufiError::NegotiationFailed(format!(
            "unknown negotiation tag {:#04x}",
            tag
        ))),
        None => Err(BlufiError::NegotiationFailed(
            "empty negotiation frame".to_string(),
        )),
    }
}

/// Station credentials, carried only in encrypted StaConfig frames.
///
/// ```text
/// [op_mode:1][ssid_len:1][ssid][password_len:1][password]
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct StaCredentials {
    /// Network name
    pub ssid: String,
    /// Passphrase
    pub password: String,
}

impl StaCredentials {
    /// Validate and build credentials
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let ssid = ssid.into();
        let password = password.into();
        if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
            return Err(BlufiError::InvalidArgument(format!(
                "SSID must be 1 to {} bytes",
                MAX_SSID_LEN
            )));
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(BlufiError::InvalidArgument(format!(
                "password must be at most {} bytes",
                MAX_PASSWORD_LEN
            )));
        }
        Ok(Self { ssid, password })
    }

    /// StaConfig body (station mode)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(3 + self.ssid.len() + self.password.len());
        buf.push(OpMode::Sta.to_byte());
        buf.push(self.ssid.len() as u8);
        buf.extend_from_slice(self.ssid.as_bytes());
        buf.push(self.password.len() as u8);
        buf.extend_from_slice(self.password.as_bytes());
        Bytes::from(buf)
    }

    /// Parse a StaConfig body
    pub fn from_bytes(body: &[u8]) -> Result<(OpMode, Self)> {
        let malformed = || BlufiError::MalformedFrame("truncated station config".to_string());

        let (&mode, rest) = body.split_first().ok_or_else(malformed)?;
        let op_mode = OpMode::from_byte(mode)
            .ok_or_else(|| BlufiError::MalformedFrame(format!("unknown op mode {}", mode)))?;

        let (&ssid_len, rest) = rest.split_first().ok_or_else(malformed)?;
        let ssid_len = usize::from(ssid_len);
        if rest.len() < ssid_len {
            return Err(malformed());
        }
        let (ssid, rest) = rest.split_at(ssid_len);

        let (&pw_len, rest) = rest.split_first().ok_or_else(malformed)?;
        if rest.len() != usize::from(pw_len) {
            return Err(malformed());
        }

        Ok((
            op_mode,
            Self {
                ssid: String::from_utf8_lossy(ssid).into_owned(),
                password: String::from_utf8_lossy(rest).into_owned(),
            },
        ))
    }
}

impl fmt::Debug for StaCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Commands sent to the device
#[derive(Debug, Clone)]
pub enum Command {
    /// Offer our public key
    Negotiate(PublicKey),
    /// Select frame protection after key exchange
    SetSecurityMode(SecurityMode),
    /// Query Wi-Fi status
    GetWifiStatus,
    /// Query firmware version
    GetVersion,
    /// Ask the device to scan for access points
    GetWifiList,
    /// Provision station credentials
    ConfigureSta(StaCredentials),
    /// Application-defined bytes
    CustomData(Bytes),
    /// Ask the device to drop the link
    CloseConnection,
}

/// Payload-free tag of a [`Command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CommandKind {
    Negotiate,
    SetSecurityMode,
    GetWifiStatus,
    GetVersion,
    GetWifiList,
    ConfigureSta,
    CustomData,
    CloseConnection,
}

impl CommandKind {
    /// Name used in errors and logs
    pub fn name(self) -> &'static str {
        match self {
            Self::Negotiate => "negotiate",
            Self::SetSecurityMode => "set_security_mode",
            Self::GetWifiStatus => "device_status",
            Self::GetVersion => "device_version",
            Self::GetWifiList => "device_wifi_scan",
            Self::ConfigureSta => "configure_sta",
            Self::CustomData => "custom_data",
            Self::CloseConnection => "close_connection",
        }
    }

    /// Frame type and subtype of the request
    pub fn frame_kind(self) -> FrameKind {
        match self {
            Self::Negotiate => FrameKind::data(DataSubtype::Negotiate),
            Self::SetSecurityMode => FrameKind::control(ControlSubtype::SetSecurityMode),
            Self::GetWifiStatus => FrameKind::control(ControlSubtype::GetWifiStatus),
            Self::GetVersion => FrameKind::control(ControlSubtype::GetVersion),
            Self::GetWifiList => FrameKind::control(ControlSubtype::GetWifiList),
            Self::ConfigureSta => FrameKind::data(DataSubtype::StaConfig),
            Self::CustomData => FrameKind::data(DataSubtype::CustomData),
            Self::CloseConnection => FrameKind::control(ControlSubtype::CloseConnection),
        }
    }

    /// Reply the device sends, if any
    pub fn reply(self) -> Option<ReplyKind> {
        match self {
            Self::Negotiate => Some(ReplyKind::PublicKey),
            Self::SetSecurityMode => Some(ReplyKind::Ack),
            Self::GetWifiStatus | Self::ConfigureSta => Some(ReplyKind::Status),
            Self::GetVersion => Some(ReplyKind::Version),
            Self::GetWifiList => Some(ReplyKind::WifiList),
            Self::CustomData | Self::CloseConnection => None,
        }
    }

    /// Frames that must be encrypted whatever the security mode says
    pub fn always_encrypted(self) -> bool {
        matches!(self, Self::SetSecurityMode | Self::ConfigureSta)
    }

    /// Part of key negotiation (uses the negotiation timeout)
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Negotiate | Self::SetSecurityMode)
    }
}

impl Command {
    /// Payload-free tag
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Negotiate(_) => CommandKind::Negotiate,
            Self::SetSecurityMode(_) => CommandKind::SetSecurityMode,
            Self::GetWifiStatus => CommandKind::GetWifiStatus,
            Self::GetVersion => CommandKind::GetVersion,
            Self::GetWifiList => CommandKind::GetWifiList,
            Self::ConfigureSta(_) => CommandKind::ConfigureSta,
            Self::CustomData(_) => CommandKind::CustomData,
            Self::CloseConnection => CommandKind::CloseConnection,
        }
    }

    /// Frame payload
    pub fn payload(&self) -> Bytes {
        match self {
            Self::Negotiate(key) => negotiate_payload(key),
            Self::SetSecurityMode(mode) => Bytes::copy_from_slice(&[mode.to_byte()]),
            Self::ConfigureSta(credentials) => credentials.to_bytes(),
            Self::CustomData(data) => data.clone(),
            Self::GetWifiStatus | Self::GetVersion | Self::GetWifiList | Self::CloseConnection => {
                Bytes::new()
            },
        }
    }
}

/// Shape of the reply a command waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Control Ack
    Ack,
    /// Negotiate data frame with the device key
    PublicKey,
    /// WifiConnectionState data frame
    Status,
    /// Version data frame
    Version,
    /// WifiList data frames, possibly continued
    WifiList,
}

impl ReplyKind {
    /// Frame type and subtype of the reply
    pub fn frame_kind(self) -> FrameKind {
        match self {
            Self::Ack => FrameKind::control(ControlSubtype::Ack),
            Self::PublicKey => FrameKind::data(DataSubtype::Negotiate),
            Self::Status => FrameKind::data(DataSubtype::WifiConnectionState),
            Self::Version => FrameKind::data(DataSubtype::Version),
            Self::WifiList => FrameKind::data(DataSubtype::WifiList),
        }
    }

    /// Parse the accumulated reply body
    pub fn parse(self, body: &[u8]) -> Result<Reply> {
        Ok(match self {
            Self::Ack => Reply::Ack,
            Self::PublicKey => Reply::PublicKey(parse_negotiate(body)?),
            Self::Status => Reply::Status(DeviceStatus::from_bytes(body)?),
            Self::Version => Reply::Version(DeviceVersion::from_bytes(body)?),
            Self::WifiList => Reply::WifiList(WifiScanEntry::parse_list(body)?),
        })
    }
}

/// Parsed reply
#[derive(Debug, Clone)]
pub enum Reply {
    /// Request acknowledged
    Ack,
    /// Device public key
    PublicKey(PublicKey),
    /// Device status
    Status(DeviceStatus),
    /// Firmware version
    Version(DeviceVersion),
    /// Access points seen by the device
    WifiList(Vec<WifiScanEntry>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::KeyExchange;

    #[test]
    fn test_negotiate_payload_roundtrip() {
        let pk = *KeyExchange::new().public_key();
        let body = negotiate_payload(&pk);
        assert_eq!(body.len(), 33);
        assert_eq!(body[0], NEGOTIATE_KEY_TAG);
        assert_eq!(parse_negotiate(&body).unwrap(), pk);

        assert!(parse_negotiate(&[]).is_err());
        assert!(parse_negotiate(&[0x02; 33]).is_err());
        assert!(parse_negotiate(&body[..20]).is_err());
    }

    #[test]
    fn test_credentials_roundtrip() {
        let creds = StaCredentials::new("home-wifi", "secret123").unwrap();
        let (mode, parsed) = StaCredentials::from_bytes(&creds.to_bytes()).unwrap();
        assert_eq!(mode, OpMode::Sta);
        assert_eq!(parsed, creds);
        assert!(!format!("{:?}", creds).contains("secret123"));
    }

    #[test]
    fn test_credentials_validation() {
        assert!(StaCredentials::new("", "pw").is_err());
        assert!(StaCredentials::new("x".repeat(33), "pw").is_err());
        assert!(StaCredentials::new("ssid", "p".repeat(65)).is_err());
        assert!(StaCredentials::new("open-network", "").is_ok());
    }

    #[test]
    fn test_credentials_truncated() {
        let body = StaCredentials::new("home-wifi", "secret123").unwrap().to_bytes();
        assert!(StaCredentials::from_bytes(&body[..body.len() - 1]).is_err());
        assert!(StaCredentials::from_bytes(&body[..1]).is_err());
    }

    #[test]
    fn test_command_shapes() {
        let creds = StaCredentials::new("a", "b").unwrap();
        let cmd = Command::ConfigureSta(creds);
        assert_eq!(cmd.kind(), CommandKind::ConfigureSta);
        assert!(cmd.kind().always_encrypted());
        assert_eq!(cmd.kind().reply(), Some(ReplyKind::Status));
        assert_eq!(
            cmd.kind().frame_kind(),
            FrameKind::data(DataSubtype::StaConfig)
        );

        assert_eq!(CommandKind::CloseConnection.reply(), None);
        assert!(Command::GetVersion.payload().is_empty());
        assert_eq!(
            Command::SetSecurityMode(SecurityMode::default()).payload().as_ref(),
            &[0x33]
        );
    }

    #[test]
    fn test_reply_parse() {
        assert!(matches!(
            ReplyKind::Version.parse(&[2, 0]).unwrap(),
            Reply::Version(DeviceVersion { major: 2, minor: 0 })
        ));
        assert!(ReplyKind::Status.parse(&[]).is_err());
    }
}
