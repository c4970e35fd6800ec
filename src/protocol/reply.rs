//! Reply payloads sent by the device.
//!
//! # WifiConnectionState
//!
//! ```text
//! [op_mode:1][sta_conn_status:1][softap_conn_count:1] { [subtype:1][len:1][value:len] }*
//! ```
//!
//! The TLV types reuse the data subtypes (StaBssid, StaSsid, SoftApSsid ...).
//!
//! # WifiList
//!
//! ```text
//! { [len:1][rssi:1 (i8)][ssid:len-1] }*
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::DataSubtype;
use crate::error::{BlufiError, Result};

/// Station connection status reported as connected
pub const STA_CONNECTED: u8 = 0;
/// Station connection status reported as failed or disconnected
pub const STA_DISCONNECTED: u8 = 1;
/// Station connection status reported while still connecting
pub const STA_CONNECTING: u8 = 2;

/// Device Wi-Fi operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpMode {
    /// Radio off
    #[default]
    Null,
    /// Station
    Sta,
    /// Soft access point
    SoftAp,
    /// Station and soft access point
    StaSoftAp,
}

impl OpMode {
    /// Wire value
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Sta => 1,
            Self::SoftAp => 2,
            Self::StaSoftAp => 3,
        }
    }

    /// Decode the wire value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Null),
            1 => Some(Self::Sta),
            2 => Some(Self::SoftAp),
            3 => Some(Self::StaSoftAp),
            _ => None,
        }
    }
}

/// 6-byte BSSID, shown as `aa:bb:cc:dd:ee:ff`
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bssid(pub [u8; 6]);

impl fmt::Display for Bssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for Bssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bssid({})", self)
    }
}

impl Serialize for Bssid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Full device status, as reported in a WifiConnectionState frame
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Operating mode
    pub op_mode: OpMode,
    /// Station connection status (0 connected, 1 failed, 2 connecting)
    pub sta_conn_status: u8,
    /// Stations connected to the soft AP
    pub softap_conn_count: u8,
    /// BSSID of the AP the station joined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sta_bssid: Option<Bssid>,
    /// SSID the station joined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sta_ssid: Option<String>,
    /// Soft AP SSID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub softap_ssid: Option<String>,
    /// Soft AP channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub softap_channel: Option<u8>,
    /// Soft AP connection limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub softap_max_conn: Option<u8>,
    /// Station RSSI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i8>,
    /// Station connection retry limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_conn_retry: Option<u8>,
    /// Reason the last station connection ended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_end_reason: Option<u8>,
}

impl DeviceStatus {
    /// Parse a WifiConnectionState body
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        if body.len() < 3 {
            return Err(BlufiError::MalformedFrame(format!(
                "status body too short: {} bytes",
                body.len()
            )));
        }

        let op_mode = OpMode::from_byte(body[0])
            .ok_or_else(|| BlufiError::MalformedFrame(format!("unknown op mode {}", body[0])))?;
        let mut status = DeviceStatus {
            op_mode,
            sta_conn_status: body[1],
            softap_conn_count: body[2],
            ..Default::default()
        };

        let mut pos = 3;
        while pos < body.len() {
            if pos + 2 > body.len() {
                return Err(BlufiError::MalformedFrame("truncated status field".to_string()));
            }
            let tag = body[pos];
            let len = usize::from(body[pos + 1]);
            pos += 2;
            if pos + len > body.len() {
                return Err(BlufiError::MalformedFrame(format!(
                    "status field {} truncated",
                    tag
                )));
            }
            let value = &body[pos..pos + len];
            pos += len;

            match DataSubtype::from_byte(tag) {
                Some(DataSubtype::StaBssid) => {
                    let bytes: [u8; 6] = value.try_into().map_err(|_| {
                        BlufiError::MalformedFrame(format!("BSSID of {} bytes", value.len()))
                    })?;
                    status.sta_bssid = Some(Bssid(bytes));
                },
                Some(DataSubtype::StaSsid) => {
                    status.sta_ssid = Some(String::from_utf8_lossy(value).into_owned());
                },
                Some(DataSubtype::SoftApSsid) => {
                    status.softap_ssid = Some(String::from_utf8_lossy(value).into_owned());
                },
                Some(DataSubtype::SoftApChannel) => status.softap_channel = first(value)?,
                Some(DataSubtype::SoftApMaxConnections) => status.softap_max_conn = first(value)?,
                Some(DataSubtype::StaConnRssi) => status.rssi = first(value)?.map(|b| b as i8),
                Some(DataSubtype::StaMaxConnRetry) => status.max_conn_retry = first(value)?,
                Some(DataSubtype::StaConnEndReason) => status.conn_end_reason = first(value)?,
                _ => tracing::trace!(tag, len, "ignoring status field"),
            }
        }

        Ok(status)
    }

    /// Encode as a WifiConnectionState body
    pub fn to_bytes(&self) -> Vec<u8> {
        fn field(buf: &mut Vec<u8>, tag: DataSubtype, value: &[u8]) {
            let len = value.len().min(usize::from(u8::MAX));
            buf.push(tag as u8);
            buf.push(len as u8);
            buf.extend_from_slice(&value[..len]);
        }

        let mut buf = vec![self.op_mode.to_byte(), self.sta_conn_status, self.softap_conn_count];

        if let Some(bssid) = &self.sta_bssid {
            field(&mut buf, DataSubtype::StaBssid, &bssid.0);
        }
        if let Some(ssid) = &self.sta_ssid {
            field(&mut buf, DataSubtype::StaSsid, ssid.as_bytes());
        }
        if let Some(ssid) = &self.softap_ssid {
            field(&mut buf, DataSubtype::SoftApSsid, ssid.as_bytes());
        }
        if let Some(channel) = self.softap_channel {
            field(&mut buf, DataSubtype::SoftApChannel, &[channel]);
        }
        if let Some(max) = self.softap_max_conn {
            field(&mut buf, DataSubtype::SoftApMaxConnections, &[max]);
        }
        if let Some(rssi) = self.rssi {
            field(&mut buf, DataSubtype::StaConnRssi, &[rssi as u8]);
        }
        if let Some(retry) = self.max_conn_retry {
            field(&mut buf, DataSubtype::StaMaxConnRetry, &[retry]);
        }
        if let Some(reason) = self.conn_end_reason {
            field(&mut buf, DataSubtype::StaConnEndReason, &[reason]);
        }
        buf
    }

    /// Whether the station is connected
    pub fn is_sta_connected(&self) -> bool {
        self.sta_conn_status == STA_CONNECTED
    }
}

fn first(value: &[u8]) -> Result<Option<u8>> {
    match value {
        [b] => Ok(Some(*b)),
        _ => Err(BlufiError::MalformedFrame(format!(
            "expected 1-byte status field, got {}",
            value.len()
        ))),
    }
}

/// Outcome of a station provisioning attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningResult {
    /// Station connected
    pub success: bool,
    /// End reason, or the raw status byte, when the station did not connect
    pub error_code: Option<u8>,
}

impl From<&DeviceStatus> for ProvisioningResult {
    fn from(status: &DeviceStatus) -> Self {
        if status.is_sta_connected() {
            Self {
                success: true,
                error_code: None,
            }
        } else {
            Self {
                success: false,
                error_code: Some(status.conn_end_reason.unwrap_or(status.sta_conn_status)),
            }
        }
    }
}

/// Firmware protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl DeviceVersion {
    /// Parse a Version body
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        match body {
            [major, minor] => Ok(Self {
                major: *major,
                minor: *minor,
            }),
            _ => Err(BlufiError::MalformedFrame(format!(
                "version body of {} bytes",
                body.len()
            ))),
        }
    }

    /// Encode as a Version body
    pub fn to_bytes(&self) -> [u8; 2] {
        [self.major, self.minor]
    }
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// One access point seen by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiScanEntry {
    /// Network name
    pub ssid: String,
    /// Signal strength in dBm
    pub rssi: i8,
}

impl WifiScanEntry {
    /// Parse a WifiList body (possibly several concatenated messages)
    pub fn parse_list(body: &[u8]) -> Result<Vec<Self>> {
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < body.len() {
            let len = usize::from(body[pos]);
            if len == 0 {
                return Err(BlufiError::MalformedFrame(
                    "empty wifi list entry".to_string(),
                ));
            }
            if pos + 1 + len > body.len() {
                return Err(BlufiError::MalformedFrame(
                    "truncated wifi list entry".to_string(),
                ));
            }
            let rssi = body[pos + 1] as i8;
            let ssid = String::from_utf8_lossy(&body[pos + 2..pos + 1 + len]).into_owned();
            entries.push(Self { ssid, rssi });
            pos += 1 + len;
        }
        Ok(entries)
    }

    /// Append this entry in WifiList form
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let ssid = &self.ssid.as_bytes()[..self.ssid.len().min(usize::from(u8::MAX) - 1)];
        buf.push((ssid.len() + 1) as u8);
        buf.push(self.rssi as u8);
        buf.extend_from_slice(ssid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_with_fields() {
        let status = DeviceStatus {
            op_mode: OpMode::Sta,
            sta_conn_status: STA_CONNECTED,
            softap_conn_count: 0,
            sta_bssid: Some(Bssid([0x24, 0x0a, 0xc4, 0x00, 0x00, 0x01])),
            sta_ssid: Some("home-wifi".to_string()),
            rssi: Some(-48),
            max_conn_retry: Some(5),
            ..Default::default()
        };
        let parsed = DeviceStatus::from_bytes(&status.to_bytes()).unwrap();
        assert_eq!(parsed, status);
        assert!(parsed.is_sta_connected());
    }

    #[test]
    fn test_status_unknown_field_ignored() {
        let body = [1, 0, 0, 0x3F, 2, 0xAA, 0xBB, DataSubtype::SoftApChannel as u8, 1, 6];
        let status = DeviceStatus::from_bytes(&body).unwrap();
        assert_eq!(status.softap_channel, Some(6));
    }

    #[test]
    fn test_status_truncated() {
        assert!(DeviceStatus::from_bytes(&[1, 0]).is_err());
        assert!(DeviceStatus::from_bytes(&[1, 0, 0, DataSubtype::StaSsid as u8, 9, b'a']).is_err());
        assert!(DeviceStatus::from_bytes(&[9, 0, 0]).is_err());
    }

    #[test]
    fn test_status_json() {
        let status = DeviceStatus {
            op_mode: OpMode::StaSoftAp,
            sta_bssid: Some(Bssid([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["opMode"], "staSoftAp");
        assert_eq!(json["staBssid"], "aa:bb:cc:dd:ee:ff");
        assert!(json.get("staSsid").is_none());
    }

    #[test]
    fn test_provisioning_result() {
        let ok = DeviceStatus::default();
        assert_eq!(
            ProvisioningResult::from(&ok),
            ProvisioningResult {
                success: true,
                error_code: None
            }
        );

        let failed = DeviceStatus {
            sta_conn_status: STA_DISCONNECTED,
            conn_end_reason: Some(202),
            ..Default::default()
        };
        let result = ProvisioningResult::from(&failed);
        assert!(!result.success);
        assert_eq!(result.error_code, Some(202));

        let connecting = DeviceStatus {
            sta_conn_status: STA_CONNECTING,
            ..Default::default()
        };
        assert_eq!(ProvisioningResult::from(&connecting).error_code, Some(STA_CONNECTING));
    }

    #[test]
    fn test_version() {
        let v = DeviceVersion::from_bytes(&[1, 3]).unwrap();
        assert_eq!(v.to_string(), "1.3");
        assert!(DeviceVersion::from_bytes(&[1]).is_err());
    }

    #[test]
    fn test_wifi_list() {
        let entries = vec![
            WifiScanEntry {
                ssid: "home-wifi".to_string(),
                rssi: -40,
            },
            WifiScanEntry {
                ssid: "cafe".to_string(),
                rssi: -82,
            },
        ];
        let mut buf = Vec::new();
        for e in &entries {
            e.write_to(&mut buf);
        }
        assert_eq!(buf[0], 10);
        assert_eq!(WifiScanEntry::parse_list(&buf).unwrap(), entries);
        assert!(WifiScanEntry::parse_list(&buf[..buf.len() - 1]).is_err());
        assert!(WifiScanEntry::parse_list(&[0]).is_err());
    }
}
