//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files (`~/.config/blufi/config.toml` by default)
//! - Environment variables (`BLUFI_*`)
//! - CLI arguments (for the `blufi` binary)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecLimits, DEFAULT_FRAME_SIZE, DEFAULT_MESSAGE_SIZE, MIN_FRAME_SIZE};
use crate::error::{BlufiError, Result};
use crate::security::SecurityMode;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Session and command settings
    #[serde(default)]
    pub client: ClientConfig,

    /// BLE scan settings
    #[serde(default)]
    pub scan: ScanConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| BlufiError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| BlufiError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("blufi").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let client = &mut config.client;

        if let Some(v) = env_parse("BLUFI_COMMAND_TIMEOUT_MS") {
            client.command_timeout_ms = v;
        }
        if let Some(v) = env_parse("BLUFI_NEGOTIATION_TIMEOUT_MS") {
            client.negotiation_timeout_ms = v;
        }
        if let Some(v) = env_parse("BLUFI_CONNECT_TIMEOUT_MS") {
            client.connect_timeout_ms = v;
        }
        if let Some(v) = env_parse("BLUFI_CONNECT_RETRIES") {
            client.connect_retries = v;
        }
        if let Some(v) = env_parse("BLUFI_CONNECT_RETRY_DELAY_MS") {
            client.connect_retry_delay_ms = v;
        }
        if let Some(v) = env_parse("BLUFI_MAX_FRAME_SIZE") {
            client.max_frame_size = v;
        }
        if let Some(v) = env_parse("BLUFI_MAX_MESSAGE_SIZE") {
            client.max_message_size = v;
        }

        if let Some(v) = env_parse("BLUFI_SCAN_DURATION_SECS") {
            config.scan.duration_secs = v;
        }
        if let Ok(prefix) = std::env::var("BLUFI_SCAN_NAME_PREFIX") {
            config.scan.name_prefix = Some(prefix);
        }

        config
    }

    /// File (explicit path, else the default path if it exists), then
    /// environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(path)?,
                _ => Self::default(),
            },
        };
        let config = base.merge(Self::from_env());
        config.validate()?;
        Ok(config)
    }

    /// Merge with another config (other takes precedence where it differs
    /// from the defaults)
    pub fn merge(self, other: Self) -> Self {
        let d = ClientConfig::default();
        let (a, b) = (self.client, other.client);
        let client = ClientConfig {
            command_timeout_ms: pick(a.command_timeout_ms, b.command_timeout_ms, d.command_timeout_ms),
            negotiation_timeout_ms: pick(
                a.negotiation_timeout_ms,
                b.negotiation_timeout_ms,
                d.negotiation_timeout_ms,
            ),
            connect_timeout_ms: pick(a.connect_timeout_ms, b.connect_timeout_ms, d.connect_timeout_ms),
            connect_retries: pick(a.connect_retries, b.connect_retries, d.connect_retries),
            connect_retry_delay_ms: pick(
                a.connect_retry_delay_ms,
                b.connect_retry_delay_ms,
                d.connect_retry_delay_ms,
            ),
            max_frame_size: pick(a.max_frame_size, b.max_frame_size, d.max_frame_size),
            max_message_size: pick(a.max_message_size, b.max_message_size, d.max_message_size),
            event_capacity: pick(a.event_capacity, b.event_capacity, d.event_capacity),
            request_queue: pick(a.request_queue, b.request_queue, d.request_queue),
            security_mode: pick(a.security_mode, b.security_mode, d.security_mode),
        };

        let ds = ScanConfig::default();
        let scan = ScanConfig {
            duration_secs: pick(self.scan.duration_secs, other.scan.duration_secs, ds.duration_secs),
            name_prefix: other.scan.name_prefix.or(self.scan.name_prefix),
        };

        Self { client, scan }
    }

    /// Reject values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        if self.scan.duration_secs == 0 {
            return Err(BlufiError::Config("scan.duration_secs must be positive".to_string()));
        }
        Ok(())
    }
}

fn pick<T: PartialEq>(base: T, other: T, default: T) -> T {
    if other != default {
        other
    } else {
        base
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        },
    }
}

/// Session and command configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for a command's complete reply
    pub command_timeout_ms: u64,

    /// Deadline for each negotiation step
    pub negotiation_timeout_ms: u64,

    /// Deadline for one transport connect attempt
    pub connect_timeout_ms: u64,

    /// Extra transport connect attempts after the first
    pub connect_retries: u32,

    /// Pause between connect attempts
    pub connect_retry_delay_ms: u64,

    /// Largest wire frame (bounded by the transport's write limit)
    pub max_frame_size: usize,

    /// Largest reassembled message
    pub max_message_size: usize,

    /// Events buffered per subscriber before it lags
    pub event_capacity: usize,

    /// Requests queued for the dispatch loop
    pub request_queue: usize,

    /// Frame protection requested after key exchange
    pub security_mode: SecurityMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            negotiation_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            connect_retries: 2,
            connect_retry_delay_ms: 500,
            max_frame_size: DEFAULT_FRAME_SIZE,
            max_message_size: DEFAULT_MESSAGE_SIZE,
            event_capacity: 256,
            request_queue: 64,
            security_mode: SecurityMode::default(),
        }
    }
}

impl ClientConfig {
    /// Command deadline
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Negotiation step deadline
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Connect attempt deadline
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Pause between connect attempts
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    /// Codec limits
    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
        }
    }

    /// Reject values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 || self.negotiation_timeout_ms == 0 {
            return Err(BlufiError::Config("timeouts must be positive".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(BlufiError::Config("connect_timeout_ms must be positive".to_string()));
        }
        if self.max_frame_size < MIN_FRAME_SIZE || self.max_frame_size > usize::from(u16::MAX) {
            return Err(BlufiError::Config(format!(
                "max_frame_size must be between {} and {}",
                MIN_FRAME_SIZE,
                u16::MAX
            )));
        }
        // Fragmented messages carry their total length in a u16.
        if self.max_message_size == 0 || self.max_message_size > usize::from(u16::MAX) {
            return Err(BlufiError::Config(format!(
                "max_message_size must be between 1 and {}",
                u16::MAX
            )));
        }
        if self.event_capacity == 0 || self.request_queue == 0 {
            return Err(BlufiError::Config(
                "event_capacity and request_queue must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// BLE scan configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// How long the CLI scans before stopping
    pub duration_secs: u64,

    /// Only report devices whose name starts with this prefix
    pub name_prefix: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            duration_secs: 5,
            name_prefix: None,
        }
    }
}

impl ScanConfig {
    /// Scan duration
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Whether a device name passes the prefix filter
    pub fn accepts(&self, name: Option<&str>) -> bool {
        match (&self.name_prefix, name) {
            (None, _) => true,
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.max_frame_size, 128);
        assert_eq!(config.client.connect_retries, 2);
        assert_eq!(config.scan.duration_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[client]
command_timeout_ms = 2500
max_frame_size = 64

[client.security_mode.control]
checksum = true
encrypt = false

[scan]
name_prefix = "BLUFI"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.client.command_timeout_ms, 2500);
        assert_eq!(config.client.max_frame_size, 64);
        assert_eq!(config.client.connect_retries, 2);
        assert!(!config.client.security_mode.control.encrypt);
        assert!(config.client.security_mode.data.encrypt);
        assert_eq!(config.scan.name_prefix.as_deref(), Some("BLUFI"));
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            Config::from_file("/nonexistent/blufi.toml"),
            Err(BlufiError::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "client = 3").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(BlufiError::Config(_))
        ));
    }

    #[test]
    fn test_merge_prefers_non_default() {
        let mut base = Config::default();
        base.client.command_timeout_ms = 3000;
        base.scan.name_prefix = Some("ESP".to_string());

        let mut over = Config::default();
        over.client.connect_retries = 5;

        let merged = base.merge(over);
        assert_eq!(merged.client.command_timeout_ms, 3000);
        assert_eq!(merged.client.connect_retries, 5);
        assert_eq!(merged.scan.name_prefix.as_deref(), Some("ESP"));
    }

    #[test]
    fn test_validate_rejects_small_frames() {
        let mut config = Config::default();
        config.client.max_frame_size = 20;
        assert!(matches!(config.validate(), Err(BlufiError::Config(_))));

        let mut config = Config::default();
        config.client.command_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_message_size_fits_fragment_length() {
        let mut config = Config::default();
        config.client.max_message_size = usize::from(u16::MAX) + 1;
        assert!(matches!(config.validate(), Err(BlufiError::Config(_))));

        config.client.max_message_size = usize::from(u16::MAX);
        config.validate().unwrap();

        // The largest accepted message still splits.
        let mut codec = crate::codec::FrameCodec::client(config.client.codec_limits());
        let frame = crate::codec::Frame::data(
            crate::codec::DataSubtype::CustomData,
            vec![0x5a; usize::from(u16::MAX)],
        );
        let encoded = codec.encode(frame, None).unwrap();
        assert!(encoded.frames.len() > 1);
    }

    #[test]
    fn test_scan_filter() {
        let scan = ScanConfig {
            name_prefix: Some("BLUFI".to_string()),
            ..Default::default()
        };
        assert!(scan.accepts(Some("BLUFI_DEVICE")));
        assert!(!scan.accepts(Some("other")));
        assert!(!scan.accepts(None));
        assert!(ScanConfig::default().accepts(None));
    }
}
